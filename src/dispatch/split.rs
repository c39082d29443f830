//! Split topology: capture and render driven by independent callbacks

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{CapturePath, DispatchCore};
use crate::audio::buffer::{BridgeProducer, FrameSource};
use crate::audio::format::StreamFormat;
use crate::constants::{DEFAULT_LATENCY_PERIODS, UNDERRUN_REFILL_PERIODS};

/// Capture side: converts to the application format and feeds the bridge
pub struct SplitCapture {
    path: CapturePath,
    producer: BridgeProducer<f32>,
    core: Arc<DispatchCore>,
}

impl SplitCapture {
    pub fn new(
        producer: BridgeProducer<f32>,
        native: StreamFormat,
        app: StreamFormat,
        chunk_frames: usize,
        core: Arc<DispatchCore>,
    ) -> Self {
        Self {
            path: CapturePath::new(native, app, chunk_frames),
            producer,
            core,
        }
    }

    /// Accept one hardware input buffer
    pub fn push(&mut self, input: &[f32]) {
        let producer = &mut self.producer;
        let core = &self.core;
        self.path.capture(input, |frames, count| {
            let written = producer.write(frames);
            if written < count {
                core.record_overrun(count - written);
            }
        });
    }
}

/// Result of one render-side pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Ready,
    Underrun,
}

/// Render side of the bridge with underrun hysteresis.
///
/// After an underrun nothing is read until `refill_frames` are buffered
/// (1.5 periods, or the latency target if larger), so a single late capture
/// does not turn into a run of alternating dropouts. Backlog beyond the
/// latency bound is discarded oldest-first. The first pull after a restart
/// keeps only the newest buffer's worth of input.
pub struct SplitRender<S: FrameSource> {
    source: S,
    channels: usize,
    refill_frames: usize,
    latency_bound: usize,
    refilling: bool,
    restart: Arc<AtomicBool>,
}

impl<S: FrameSource> SplitRender<S> {
    pub fn new(source: S, channels: usize, period: usize, latency_target: Option<usize>) -> Self {
        let (num, den) = UNDERRUN_REFILL_PERIODS;
        let refill_frames = (period * num / den).max(latency_target.unwrap_or(0)).max(1);
        let latency_bound = latency_target
            .unwrap_or(period * DEFAULT_LATENCY_PERIODS)
            .max(refill_frames);
        Self {
            source,
            channels,
            refill_frames,
            latency_bound,
            refilling: false,
            restart: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Set from a control thread when the stream (re)starts
    pub fn restart_flag(&self) -> Arc<AtomicBool> {
        self.restart.clone()
    }

    pub fn refill_frames(&self) -> usize {
        self.refill_frames
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fill `out` with the next `out.len() / channels` frames.
    pub fn pull(&mut self, out: &mut [f32]) -> Pull {
        let frames = out.len() / self.channels;

        if self.restart.swap(false, Ordering::AcqRel) {
            let stale = self.source.available().saturating_sub(frames);
            self.source.skip(stale);
            self.refilling = false;
        }

        let available = self.source.available();
        if self.refilling {
            if available < self.refill_frames.max(frames) {
                return Pull::Underrun;
            }
            self.refilling = false;
        }
        if available < frames {
            self.refilling = true;
            return Pull::Underrun;
        }

        if available - frames > self.latency_bound {
            self.source.skip(available - frames - self.refill_frames);
        }

        if self.source.read_into(out) {
            Pull::Ready
        } else {
            Pull::Underrun
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::bridge;
    use crate::config::StreamConfig;
    use crate::dispatch::tests::core_with;
    use crate::dispatch::DispatchState;
    use crate::SampleBuffer;

    fn ramp(start: usize, frames: usize) -> Vec<f32> {
        (start..start + frames).map(|i| i as f32).collect()
    }

    #[test]
    fn test_underrun_then_hysteresis() {
        let (mut tx, rx) = bridge::<f32>(1024, 1);
        let mut render = SplitRender::new(rx, 1, 100, None);
        let mut out = vec![0.0f32; 100];

        tx.write(&ramp(0, 100));
        assert_eq!(render.pull(&mut out), Pull::Ready);
        assert_eq!(out[0], 0.0);

        // Starved: underrun, then one period is not enough to resume.
        assert_eq!(render.pull(&mut out), Pull::Underrun);
        tx.write(&ramp(100, 100));
        assert_eq!(render.pull(&mut out), Pull::Underrun);

        tx.write(&ramp(200, 50));
        assert_eq!(render.pull(&mut out), Pull::Ready);
        assert_eq!(out[0], 100.0);
        assert_eq!(out[99], 199.0);
    }

    #[test]
    fn test_restart_keeps_newest_period() {
        let (mut tx, rx) = bridge::<f32>(1024, 1);
        let mut render = SplitRender::new(rx, 1, 64, None);
        tx.write(&ramp(0, 300));

        let mut out = vec![0.0f32; 64];
        assert_eq!(render.pull(&mut out), Pull::Ready);
        assert_eq!(out[0], 236.0);

        tx.write(&ramp(300, 100));
        render.restart_flag().store(true, Ordering::Release);
        assert_eq!(render.pull(&mut out), Pull::Ready);
        assert_eq!(out[0], 336.0);
    }

    #[test]
    fn test_excess_backlog_trimmed_oldest_first() {
        let (mut tx, rx) = bridge::<f32>(4096, 1);
        let mut render = SplitRender::new(rx, 1, 100, Some(200));
        let mut out = vec![0.0f32; 100];
        assert_eq!(render.pull(&mut out), Pull::Underrun);

        tx.write(&ramp(0, 1000));
        assert_eq!(render.pull(&mut out), Pull::Ready);
        // 1000 buffered, bound 200: keep refill (200) after this read.
        assert_eq!(out[0], 700.0);
        assert_eq!(render.source().available(), 200);
    }

    #[test]
    fn test_split_capture_counts_overrun() {
        let config = StreamConfig::new(48_000, 4).with_channels(1);
        let (core, _rx) = core_with(&config, |_: &mut SampleBuffer<'_>, _: usize, _: u32| true);
        let core = Arc::new(core);
        core.set_state(DispatchState::Running);

        let format = StreamFormat::new(48_000, 1);
        let (tx, rx) = bridge::<f32>(8, 1);
        let mut capture = SplitCapture::new(tx, format, format, 64, core.clone());
        capture.push(&ramp(0, 6));
        capture.push(&ramp(6, 6));
        assert_eq!(rx.available(), 8);
        assert_eq!(core.stats().overruns, 4);
    }

    #[test]
    fn test_split_capture_converts_channels() {
        let config = StreamConfig::new(48_000, 4).with_channels(2);
        let (core, _rx) = core_with(&config, |_: &mut SampleBuffer<'_>, _: usize, _: u32| true);
        let (tx, mut rx) = bridge::<f32>(16, 2);
        let mut capture = SplitCapture::new(
            tx,
            StreamFormat::new(48_000, 1),
            StreamFormat::new(48_000, 2),
            64,
            Arc::new(core),
        );
        capture.push(&[0.1, 0.2]);
        let mut out = [0.0f32; 4];
        assert!(rx.read_into(&mut out));
        assert_eq!(out, [0.1, 0.1, 0.2, 0.2]);
    }
}
