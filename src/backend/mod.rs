//! Backend drivers and selection
//!
//! A [`Backend`] knows how to turn a [`StreamConfig`] into a running
//! [`Driver`] on one family of native APIs. The [`BackendSelector`] tries
//! backends in preference order and falls back on failure.

#[cfg(feature = "desktop")]
pub mod desktop;
pub mod native;
pub mod queue;
pub mod selector;
pub mod simulated;
pub mod streaming;

#[cfg(feature = "desktop")]
pub use desktop::{CpalHost, DesktopBackend};
pub use native::{HostCapabilities, NativeFault, NativeHost};
pub use queue::QueueBackend;
pub use selector::BackendSelector;
pub use simulated::SimulatedHost;
pub use streaming::StreamingBackend;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::audio::format::StreamFormat;
use crate::config::{SchedulingPolicy, StreamConfig};
use crate::dispatch::{DispatchCore, DispatchState};
use crate::error::{NativeError, OpenError};
use crate::event::EventSink;
use native::{FaultCallback, NativeStream};

/// Family a backend belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Modern low-latency streaming API with a combined duplex callback
    Streaming,
    /// Legacy buffer-queue API with independent capture and render callbacks
    Queue,
    /// Desktop audio through cpal
    Desktop,
}

/// Everything a driver needs from the stream that owns it
#[derive(Clone)]
pub struct DriverContext {
    pub core: Arc<DispatchCore>,
    /// Fatal faults go here; the stream routes them to recovery
    pub faults: FaultCallback,
    pub events: EventSink,
    pub policy: SchedulingPolicy,
}

impl DriverContext {
    pub fn with_policy(&self, policy: SchedulingPolicy) -> Self {
        Self {
            policy,
            ..self.clone()
        }
    }
}

/// What a driver actually got from the hardware
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedStream {
    pub backend: String,
    pub capture: Option<StreamFormat>,
    pub render: Option<StreamFormat>,
    /// Frames per hardware callback
    pub period_frames: usize,
    pub buffer_frames: usize,
    pub policy: SchedulingPolicy,
}

impl NegotiatedStream {
    pub fn input_enabled(&self) -> bool {
        self.capture.is_some()
    }
}

/// One native backend family
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> HostCapabilities;

    /// Reject configurations this backend cannot serve before touching hardware
    fn accepts(&self, config: &StreamConfig) -> Result<(), OpenError>;

    fn open(&self, config: &StreamConfig, ctx: &DriverContext) -> Result<Box<dyn Driver>, OpenError>;
}

/// An open stream on one backend. Owns its native streams; dropping it
/// stops and releases them.
pub trait Driver: Send {
    fn negotiated(&self) -> &NegotiatedStream;

    fn start(&mut self) -> Result<(), OpenError>;

    /// Stop callbacks; blocks until the hardware has quiesced
    fn stop(&mut self);

    /// Grow or shrink hardware buffering; returns the size applied
    fn set_buffer_size_hint(&mut self, frames: usize) -> usize;

    fn close(mut self: Box<Self>) {
        self.stop();
    }
}

/// The native streams behind one driver and the dispatcher they feed.
///
/// Capture starts before render so the first render callback can find
/// input; render stops first so nothing pulls from a stopped capture.
pub(crate) struct DriverStreams {
    pub render: Option<Box<dyn NativeStream>>,
    pub capture: Option<Box<dyn NativeStream>>,
    /// Raised on every start so the audio side drops stale input
    pub restart_flags: Vec<Arc<AtomicBool>>,
    pub core: Arc<DispatchCore>,
    running: bool,
}

impl DriverStreams {
    pub fn new(
        render: Option<Box<dyn NativeStream>>,
        capture: Option<Box<dyn NativeStream>>,
        restart_flags: Vec<Arc<AtomicBool>>,
        core: Arc<DispatchCore>,
    ) -> Self {
        Self {
            render,
            capture,
            restart_flags,
            core,
            running: false,
        }
    }

    /// The stream whose buffer size drivers report and tune
    pub fn primary(&self) -> Option<&dyn NativeStream> {
        self.render.as_deref().or(self.capture.as_deref())
    }

    fn start_native(&mut self) -> Result<(), NativeError> {
        if let Some(capture) = self.capture.as_mut() {
            capture.start()?;
        }
        if let Some(render) = self.render.as_mut() {
            render.start()?;
        }
        Ok(())
    }

    fn stop_native(&mut self) {
        if let Some(render) = self.render.as_mut() {
            render.stop();
        }
        if let Some(capture) = self.capture.as_mut() {
            capture.stop();
        }
    }

    pub fn start(&mut self, backend: &str, buffer_frames: usize) -> Result<(), OpenError> {
        if self.running {
            return Ok(());
        }
        self.core.set_state(DispatchState::Starting);
        for flag in &self.restart_flags {
            flag.store(true, Ordering::Release);
        }
        if let Err(err) = self.start_native() {
            warn!("{}: start failed: {}", backend, err);
            self.stop_native();
            self.core.set_state(DispatchState::Idle);
            return Err(err.into());
        }
        self.core.set_buffer_frames(buffer_frames);
        self.core.set_state(DispatchState::Running);
        self.running = true;
        debug!("{}: started", backend);
        Ok(())
    }

    pub fn stop(&mut self, backend: &str) {
        if !self.running {
            return;
        }
        self.core.set_state(DispatchState::Stopping);
        self.stop_native();
        self.core.set_state(DispatchState::Idle);
        self.running = false;
        debug!("{}: stopped", backend);
    }
}
