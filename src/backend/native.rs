//! The seam between drivers and a native audio API
//!
//! A [`NativeHost`] opens single-direction hardware streams and calls back
//! on its own real-time threads. Drivers compose one or two of these into a
//! duplex stream. Implementations: [`SimulatedHost`](super::simulated::SimulatedHost)
//! and, with the `desktop` feature, [`CpalHost`](super::desktop::CpalHost).

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio::buffer::FrameSource;
use crate::audio::format::StreamFormat;
use crate::config::RoleHint;
use crate::constants::MAX_CONSECUTIVE_BUFFER_ERRORS;
use crate::error::NativeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Capture,
    Render,
}

/// What a driver asks the host for
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub direction: Direction,
    pub format: StreamFormat,
    /// Frames per hardware callback
    pub period_frames: usize,
    /// Ceiling for later buffer growth
    pub max_buffer_frames: usize,
    pub role: RoleHint,
    pub device_id: Option<String>,
    /// Ask for the exclusive/low-latency path where the API has one
    pub low_latency: bool,
}

/// Conditions a native stream reports asynchronously
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeFault {
    /// Device unplugged or otherwise gone
    Disconnected,
    /// Routing or format changed underneath the stream
    Invalidated,
    /// A transient buffer error; only repeated ones are fatal
    BufferError,
}

impl NativeFault {
    pub fn is_fatal(self) -> bool {
        !matches!(self, NativeFault::BufferError)
    }
}

impl std::fmt::Display for NativeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            NativeFault::Disconnected => "device disconnected",
            NativeFault::Invalidated => "stream invalidated",
            NativeFault::BufferError => "buffer error",
        };
        f.write_str(text)
    }
}

/// Buffer state a render callback may inspect and adjust.
///
/// All fields are atomics so the host, the callback and control threads can
/// share it without locks.
#[derive(Debug)]
pub struct StreamTuning {
    xruns: AtomicU64,
    buffer_frames: AtomicUsize,
    burst_frames: usize,
    max_frames: usize,
}

impl StreamTuning {
    pub fn new(burst_frames: usize, buffer_frames: usize, max_frames: usize) -> Self {
        let burst_frames = burst_frames.max(1);
        let max_frames = max_frames.max(burst_frames);
        Self {
            xruns: AtomicU64::new(0),
            buffer_frames: AtomicUsize::new(buffer_frames.clamp(burst_frames, max_frames)),
            burst_frames,
            max_frames,
        }
    }

    /// Underruns/overruns the hardware has reported since open
    pub fn xrun_count(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    pub fn record_xruns(&self, count: u64) {
        self.xruns.fetch_add(count, Ordering::Relaxed);
    }

    /// Frames per hardware callback
    pub fn burst_frames(&self) -> usize {
        self.burst_frames
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Current hardware buffer size in frames
    pub fn buffer_frames(&self) -> usize {
        self.buffer_frames.load(Ordering::Relaxed)
    }

    /// Request a new buffer size; returns the size actually applied.
    pub fn set_buffer_frames(&self, frames: usize) -> usize {
        let applied = frames.clamp(self.burst_frames, self.max_frames);
        self.buffer_frames.store(applied, Ordering::Relaxed);
        applied
    }
}

/// Fills one hardware output buffer (interleaved, negotiated format)
pub type RenderCallback = Box<dyn FnMut(&mut [f32], &StreamTuning) + Send>;

/// Receives one hardware input buffer (interleaved, negotiated format)
pub type CaptureCallback = Box<dyn FnMut(&[f32]) + Send>;

/// Builds the render callback once the host knows the negotiated format
pub type RenderFactory = Box<dyn FnOnce(StreamFormat) -> RenderCallback + Send>;

/// Builds the capture callback once the host knows the negotiated format
pub type CaptureFactory = Box<dyn FnOnce(StreamFormat) -> CaptureCallback + Send>;

/// Receives asynchronous stream faults. May be called on any thread,
/// including a hardware callback thread, so it must not block.
pub type FaultCallback = Arc<dyn Fn(NativeFault) + Send + Sync>;

/// An open hardware stream in one direction.
///
/// Dropping it releases the native resources and must not return while a
/// callback is still running.
pub trait NativeStream: Send {
    /// Format the hardware actually runs at
    fn format(&self) -> StreamFormat;

    fn tuning(&self) -> &StreamTuning;

    fn start(&mut self) -> Result<(), NativeError>;

    /// Stop callbacks. Blocks until no callback is in flight.
    fn stop(&mut self);
}

/// Non-blocking pull access to a capture stream, used from inside a render
/// callback on hosts that support it.
pub trait CaptureReader: FrameSource + Send {}

impl<T: FrameSource + Send> CaptureReader for T {}

/// Static facts about a host, queried once and cached by the selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostCapabilities {
    /// A low-latency streaming path exists (the modern backend family)
    pub low_latency_streaming: bool,
    /// Capture can be read non-blockingly from a render callback
    pub pull_capture: bool,
    /// Hardware callbacks on this host should not run application code
    pub prefers_worker_thread: bool,
}

/// A native audio API
pub trait NativeHost: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> HostCapabilities;

    fn open_render(
        &self,
        request: &StreamRequest,
        callback: RenderFactory,
        faults: FaultCallback,
    ) -> Result<Box<dyn NativeStream>, NativeError>;

    fn open_capture(
        &self,
        request: &StreamRequest,
        callback: CaptureFactory,
        faults: FaultCallback,
    ) -> Result<Box<dyn NativeStream>, NativeError>;

    /// Open capture for pull access. Hosts without `pull_capture` return
    /// `NativeError::Unsupported`.
    fn open_capture_reader(
        &self,
        request: &StreamRequest,
        faults: FaultCallback,
    ) -> Result<(Box<dyn NativeStream>, Box<dyn CaptureReader>), NativeError>;
}

/// Filters native faults before they reach recovery: fatal faults pass
/// straight through, buffer errors only once more than
/// `MAX_CONSECUTIVE_BUFFER_ERRORS` arrive without a healthy callback between.
pub struct FaultMonitor {
    consecutive: AtomicU32,
    sink: FaultCallback,
}

impl FaultMonitor {
    pub fn new(sink: FaultCallback) -> Arc<Self> {
        Arc::new(Self {
            consecutive: AtomicU32::new(0),
            sink,
        })
    }

    pub fn report(&self, fault: NativeFault) {
        if fault.is_fatal() {
            (self.sink)(fault);
            return;
        }
        let count = self.consecutive.load(Ordering::Relaxed) + 1;
        if count > MAX_CONSECUTIVE_BUFFER_ERRORS {
            self.consecutive.store(0, Ordering::Relaxed);
            (self.sink)(NativeFault::Invalidated);
        } else {
            self.consecutive.store(count, Ordering::Relaxed);
        }
    }

    /// Called from callbacks that completed normally
    #[inline]
    pub fn healthy(&self) {
        if self.consecutive.load(Ordering::Relaxed) != 0 {
            self.consecutive.store(0, Ordering::Relaxed);
        }
    }

    /// A fault callback for one native stream feeding this monitor
    pub fn callback(self: &Arc<Self>) -> FaultCallback {
        let monitor = self.clone();
        Arc::new(move |fault| monitor.report(fault))
    }
}
