//! Duplex dispatcher
//!
//! [`DispatchCore`] is the single processing entry point. Drivers call it
//! from hardware callbacks (or a worker thread) once per logical buffer,
//! whatever topology assembled the input and output for that buffer.
//!
//! Topologies:
//! - output only: render callback -> [`RenderPath`] -> processor
//! - input only: capture callback -> [`CapturePath`] -> processor
//! - combined: one render callback pulls capture and processes both
//! - split: capture callback -> [`SplitCapture`] -> bridge -> [`SplitRender`]
//!   -> processor, invoked from the render side only

mod path;
mod split;

pub use path::{CapturePath, RenderPath};
pub use split::{Pull, SplitCapture, SplitRender};

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::audio::processor::{CallbackScope, ProcessorSlot, SampleBuffer};
use crate::config::StreamConfig;
use crate::event::ControlEvent;

/// Dispatcher state. Only `Running` lets audio through to the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatchState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl DispatchState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DispatchState::Starting,
            2 => DispatchState::Running,
            3 => DispatchState::Stopping,
            _ => DispatchState::Idle,
        }
    }
}

/// Snapshot of stream health counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Dispatcher invocations from hardware or worker threads
    pub callbacks: u64,
    /// Buffers handed to the processor
    pub processed: u64,
    /// Buffers the processor reported as silent
    pub silent: u64,
    /// Buffers replaced by silence because input or output was not ready
    pub dropouts: u64,
    /// Captured frames dropped because the bridge was full
    pub overruns: u64,
    /// Successful recovery reopens
    pub restarts: u64,
    /// Current hardware buffer size in frames
    pub buffer_frames: usize,
    /// Background suspends requested by the power policy
    pub suspend_requests: u64,
    /// Frames of uninterrupted silence so far
    pub silence_frames: u64,
}

#[derive(Default)]
struct StatsCounters {
    callbacks: AtomicU64,
    processed: AtomicU64,
    silent: AtomicU64,
    dropouts: AtomicU64,
    overruns: AtomicU64,
    restarts: AtomicU64,
    buffer_frames: AtomicUsize,
    suspend_requests: AtomicU64,
}

/// Frames of continuous "no audio" from the processor.
///
/// Written only by the thread running the processor, with plain atomic
/// loads and stores.
#[derive(Debug, Default)]
pub struct SilenceCounter {
    frames: AtomicU64,
}

impl SilenceCounter {
    /// Add `frames` and return the new total
    pub fn add(&self, frames: usize) -> u64 {
        let total = self.frames.load(Ordering::Relaxed) + frames as u64;
        self.frames.store(total, Ordering::Relaxed);
        total
    }

    pub fn reset(&self) {
        self.frames.store(0, Ordering::Relaxed);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

/// Per-stream dispatch state shared by every driver the stream opens
pub struct DispatchCore {
    state: AtomicU8,
    processor: ProcessorSlot,
    sample_rate: u32,
    channels: usize,
    power_saving: bool,
    foreground: AtomicBool,
    suspend_pending: AtomicBool,
    silence: SilenceCounter,
    stats: StatsCounters,
    control: Sender<ControlEvent>,
}

impl DispatchCore {
    pub(crate) fn new(config: &StreamConfig, processor: ProcessorSlot, control: Sender<ControlEvent>) -> Self {
        Self {
            state: AtomicU8::new(DispatchState::Idle as u8),
            processor,
            sample_rate: config.sample_rate,
            channels: config.channels as usize,
            power_saving: config.power_saving,
            foreground: AtomicBool::new(true),
            suspend_pending: AtomicBool::new(false),
            silence: SilenceCounter::default(),
            stats: StatsCounters::default(),
            control,
        }
    }

    pub fn state(&self) -> DispatchState {
        DispatchState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: DispatchState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Run the processor for one logical buffer.
    ///
    /// `output` is zeroed when the processor reports no audio, when the
    /// dispatcher is not running, or when the processor is unavailable.
    /// Returns whether audible output was produced.
    pub fn process(&self, input: Option<&[f32]>, mut output: Option<&mut [f32]>, frames: usize) -> bool {
        self.stats.callbacks.fetch_add(1, Ordering::Relaxed);
        if self.state() != DispatchState::Running {
            silence(output);
            return false;
        }

        let _scope = CallbackScope::enter();
        let produced = {
            let Some(mut processor) = self.processor.try_lock() else {
                self.stats.dropouts.fetch_add(1, Ordering::Relaxed);
                silence(output);
                return false;
            };
            let mut buffer = SampleBuffer::new(input, output.as_deref_mut(), self.channels);
            processor.process(&mut buffer, frames, self.sample_rate)
        };

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        if !produced {
            self.stats.silent.fetch_add(1, Ordering::Relaxed);
            silence(output);
        }
        self.track_silence(produced, frames);
        produced
    }

    /// Substitute silence for a buffer whose input or output was not ready
    pub fn dropout(&self, output: Option<&mut [f32]>) {
        self.stats.callbacks.fetch_add(1, Ordering::Relaxed);
        silence(output);
        if self.state() == DispatchState::Running {
            self.stats.dropouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn track_silence(&self, produced: bool, frames: usize) {
        if produced {
            if self.silence.frames() != 0 {
                self.silence.reset();
            }
            return;
        }

        let total = self.silence.add(frames);
        if total < u64::from(self.sample_rate)
            || !self.power_saving
            || self.foreground.load(Ordering::Relaxed)
            || self.suspend_pending.load(Ordering::Relaxed)
        {
            return;
        }

        self.silence.reset();
        self.suspend_pending.store(true, Ordering::Relaxed);
        self.stats.suspend_requests.fetch_add(1, Ordering::Relaxed);
        if self.control.try_send(ControlEvent::SuspendRequested).is_err() {
            // Retry on the next silent buffer.
            self.suspend_pending.store(false, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::Relaxed);
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::Relaxed)
    }

    /// Called with hardware stopped, before it starts again
    pub(crate) fn rearm_power_policy(&self) {
        self.silence.reset();
        self.suspend_pending.store(false, Ordering::Relaxed);
    }

    pub(crate) fn record_overrun(&self, frames: usize) {
        self.stats.overruns.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self) {
        self.stats.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_buffer_frames(&self, frames: usize) {
        self.stats.buffer_frames.store(frames, Ordering::Relaxed);
    }

    /// A driver grew its hardware buffer from an audio thread
    pub(crate) fn notify_buffer_resized(&self, frames: usize) {
        self.set_buffer_frames(frames);
        let _ = self.control.try_send(ControlEvent::BufferResized(frames));
    }

    pub fn stats(&self) -> StreamStats {
        let s = &self.stats;
        StreamStats {
            callbacks: s.callbacks.load(Ordering::Relaxed),
            processed: s.processed.load(Ordering::Relaxed),
            silent: s.silent.load(Ordering::Relaxed),
            dropouts: s.dropouts.load(Ordering::Relaxed),
            overruns: s.overruns.load(Ordering::Relaxed),
            restarts: s.restarts.load(Ordering::Relaxed),
            buffer_frames: s.buffer_frames.load(Ordering::Relaxed),
            suspend_requests: s.suspend_requests.load(Ordering::Relaxed),
            silence_frames: self.silence.frames(),
        }
    }
}

#[inline]
fn silence(output: Option<&mut [f32]>) {
    if let Some(out) = output {
        out.fill(0.0);
    }
}
