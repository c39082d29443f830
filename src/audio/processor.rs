//! The processing callback contract
//!
//! Applications implement [`AudioProcessor`] (or pass a closure). The
//! dispatcher calls it exactly once per logical buffer from the audio thread.

use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::Arc;

/// Interleaved buffers handed to the processor for one logical period.
///
/// `input` is present when capture is enabled and `output` when render is
/// enabled. Both hold `frames * channels` samples.
pub struct SampleBuffer<'a> {
    pub input: Option<&'a [f32]>,
    pub output: Option<&'a mut [f32]>,
    pub channels: usize,
}

impl<'a> SampleBuffer<'a> {
    pub fn new(input: Option<&'a [f32]>, output: Option<&'a mut [f32]>, channels: usize) -> Self {
        Self {
            input,
            output,
            channels,
        }
    }

    /// Zero the output buffer, if any
    pub fn silence(&mut self) {
        if let Some(out) = self.output.as_deref_mut() {
            out.fill(0.0);
        }
    }

    /// Copy input to output over the overlapping length
    pub fn pass_through(&mut self) {
        if let (Some(input), Some(out)) = (self.input, self.output.as_deref_mut()) {
            let n = input.len().min(out.len());
            out[..n].copy_from_slice(&input[..n]);
        }
    }
}

/// Application-side audio processing.
///
/// Returns `true` when the output now holds audible audio (or, for
/// capture-only streams, the input was meaningfully consumed). Returning
/// `false` asks the caller to output silence in its place. Implementations
/// must finish within one period and must not call back into a
/// [`StreamHandle`](crate::stream::StreamHandle).
pub trait AudioProcessor: Send {
    fn process(&mut self, buffer: &mut SampleBuffer<'_>, frames: usize, sample_rate: u32) -> bool;
}

impl<F> AudioProcessor for F
where
    F: FnMut(&mut SampleBuffer<'_>, usize, u32) -> bool + Send,
{
    fn process(&mut self, buffer: &mut SampleBuffer<'_>, frames: usize, sample_rate: u32) -> bool {
        self(buffer, frames, sample_rate)
    }
}

/// Processor shared between successive drivers of one stream.
///
/// Only one driver is live at a time, so the audio thread takes the lock
/// with `try_lock` and never waits; the lock only exists so a processor can
/// outlive a driver torn down by recovery.
pub type ProcessorSlot = Arc<Mutex<Box<dyn AudioProcessor>>>;

pub fn processor_slot(processor: impl AudioProcessor + 'static) -> ProcessorSlot {
    Arc::new(Mutex::new(Box::new(processor)))
}

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a real-time callback while alive.
pub(crate) struct CallbackScope {
    previous: bool,
}

impl CallbackScope {
    pub(crate) fn enter() -> Self {
        let previous = IN_CALLBACK.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        let previous = self.previous;
        IN_CALLBACK.with(|flag| flag.set(previous));
    }
}

/// Whether the calling thread is inside a real-time processing callback
pub fn in_audio_callback() -> bool {
    IN_CALLBACK.with(|flag| flag.get())
}
