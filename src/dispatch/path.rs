//! Format adaptation between hardware callbacks and the processor

use crate::audio::format::{FormatAdapter, StreamFormat};

/// Capture direction: hardware format to application format.
pub struct CapturePath {
    adapter: Option<FormatAdapter>,
    native_channels: usize,
    app_channels: usize,
    chunk_frames: usize,
    scratch: Box<[f32]>,
}

impl CapturePath {
    /// `chunk_frames` bounds how many hardware frames are converted per step.
    pub fn new(native: StreamFormat, app: StreamFormat, chunk_frames: usize) -> Self {
        let chunk_frames = chunk_frames.max(1);
        let adapter = (native != app).then(|| FormatAdapter::new(native, app, chunk_frames));
        let scratch_frames = adapter
            .as_ref()
            .map(|a| a.max_output_frames(chunk_frames))
            .unwrap_or(0);
        Self {
            adapter,
            native_channels: native.channels as usize,
            app_channels: app.channels as usize,
            chunk_frames,
            scratch: vec![0.0; scratch_frames * app.channels as usize].into_boxed_slice(),
        }
    }

    pub fn is_converting(&self) -> bool {
        self.adapter.is_some()
    }

    /// Hand `input` to `consume` in application format, chunk by chunk.
    pub fn capture(&mut self, input: &[f32], mut consume: impl FnMut(&[f32], usize)) {
        let native_ch = self.native_channels;
        match self.adapter.as_mut() {
            None => {
                for chunk in input.chunks(self.chunk_frames * native_ch) {
                    consume(chunk, chunk.len() / native_ch);
                }
            }
            Some(adapter) => {
                for chunk in input.chunks(self.chunk_frames * native_ch) {
                    let frames = chunk.len() / native_ch;
                    let produced = adapter.convert(chunk, frames, &mut self.scratch);
                    if produced > 0 {
                        consume(&self.scratch[..produced * self.app_channels], produced);
                    }
                }
            }
        }
    }
}

/// Render direction: application format to hardware format.
///
/// Without conversion the processor runs at the hardware's cadence (at
/// most `period` frames at a time). With conversion it always renders
/// whole periods and the converted surplus waits in `pending` for the next
/// hardware callback.
pub struct RenderPath {
    adapter: Option<FormatAdapter>,
    native_channels: usize,
    period: usize,
    app: Box<[f32]>,
    pending: Box<[f32]>,
    pending_offset: usize,
    pending_frames: usize,
}

impl RenderPath {
    pub fn new(app: StreamFormat, native: StreamFormat, period: usize) -> Self {
        let period = period.max(1);
        let adapter = (native != app).then(|| FormatAdapter::new(app, native, period));
        let pending_frames = adapter.as_ref().map(|a| a.max_output_frames(period)).unwrap_or(0);
        Self {
            app: vec![0.0; if adapter.is_some() { period * app.channels as usize } else { 0 }].into_boxed_slice(),
            pending: vec![0.0; pending_frames * native.channels as usize].into_boxed_slice(),
            adapter,
            native_channels: native.channels as usize,
            period,
            pending_offset: 0,
            pending_frames: 0,
        }
    }

    pub fn is_converting(&self) -> bool {
        self.adapter.is_some()
    }

    /// Fill the hardware buffer `out`, asking `produce` for application
    /// frames as needed.
    pub fn render(&mut self, out: &mut [f32], mut produce: impl FnMut(&mut [f32], usize)) {
        let ch = self.native_channels;
        let Some(adapter) = self.adapter.as_mut() else {
            for chunk in out.chunks_mut(self.period * ch) {
                let frames = chunk.len() / ch;
                produce(chunk, frames);
            }
            return;
        };

        let needed = out.len() / ch;
        let mut written = 0;
        while written < needed {
            if self.pending_frames == 0 {
                produce(&mut self.app, self.period);
                self.pending_frames = adapter.convert(&self.app, self.period, &mut self.pending);
                self.pending_offset = 0;
                continue;
            }
            let n = self.pending_frames.min(needed - written);
            let from = self.pending_offset * ch;
            out[written * ch..(written + n) * ch].copy_from_slice(&self.pending[from..from + n * ch]);
            self.pending_offset += n;
            self.pending_frames -= n;
            written += n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_path_direct_chunks_by_period() {
        let f = StreamFormat::new(48_000, 2);
        let mut path = RenderPath::new(f, f, 128);
        let mut out = vec![0.0f32; 300 * 2];
        let mut calls = Vec::new();
        path.render(&mut out, |buf, frames| {
            buf.fill(1.0);
            calls.push(frames);
        });
        assert_eq!(calls, vec![128, 128, 44]);
        assert!(out.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_render_path_upmixes_and_carries_surplus() {
        let app = StreamFormat::new(48_000, 1);
        let native = StreamFormat::new(48_000, 2);
        let mut path = RenderPath::new(app, native, 100);
        let mut next = 0.0f32;
        let mut produce = |buf: &mut [f32], frames: usize| {
            for s in buf[..frames].iter_mut() {
                *s = next;
                next += 1.0;
            }
        };

        let mut out = vec![0.0f32; 60 * 2];
        path.render(&mut out, &mut produce);
        assert_eq!(&out[..4], &[0.0, 0.0, 1.0, 1.0]);

        // The remaining 40 converted frames come out first next time.
        path.render(&mut out, &mut produce);
        assert_eq!(&out[..2], &[60.0, 60.0]);
        assert_eq!(&out[78..82], &[99.0, 99.0, 100.0, 100.0]);
    }

    #[test]
    fn test_render_path_resamples_to_native_rate() {
        let app = StreamFormat::new(48_000, 2);
        let native = StreamFormat::new(44_100, 2);
        let mut path = RenderPath::new(app, native, 480);
        let mut produced = 0usize;
        let mut out = vec![0.0f32; 441 * 2];
        for _ in 0..10 {
            path.render(&mut out, |buf, frames| {
                buf.fill(0.25);
                produced += frames;
            });
        }
        // 4410 native frames need ~4800 application frames.
        assert!((4800..=5280).contains(&produced));
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_capture_path_downmixes() {
        let mut path = CapturePath::new(StreamFormat::new(48_000, 2), StreamFormat::new(48_000, 1), 2);
        let mut seen = Vec::new();
        path.capture(&[0.0, 1.0, 1.0, 1.0, 0.5, 0.5], |buf, frames| {
            seen.extend_from_slice(buf);
            assert_eq!(buf.len(), frames);
        });
        assert_eq!(seen, vec![0.5, 1.0, 0.5]);
    }

    #[test]
    fn test_capture_path_passthrough() {
        let f = StreamFormat::new(48_000, 1);
        let mut path = CapturePath::new(f, f, 4);
        assert!(!path.is_converting());
        let mut total = 0;
        path.capture(&[0.0; 10], |_, frames| total += frames);
        assert_eq!(total, 10);
    }
}
