//! Sample format, channel and sample-rate adaptation
//!
//! Used when the format a device actually negotiated differs from the one
//! the application asked for. All processing entry points work on caller
//! buffers and scratch allocated up front, so they are safe on the audio
//! thread.

/// Rate and channel layout of an interleaved stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Hz / {} ch", self.sample_rate, self.channels)
    }
}

/// Converts an f32 sample in [-1.0, 1.0] to i16, clamping out-of-range input.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Converts an i16 sample to f32 in [-1.0, 1.0).
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Converts a slice of i16 samples into an f32 slice of the same length.
pub fn i16_slice_to_f32(input: &[i16], output: &mut [f32]) {
    for (out, &s) in output.iter_mut().zip(input) {
        *out = i16_to_f32(s);
    }
}

/// Converts a slice of f32 samples into an i16 slice of the same length.
pub fn f32_slice_to_i16(input: &[f32], output: &mut [i16]) {
    for (out, &s) in output.iter_mut().zip(input) {
        *out = f32_to_i16(s);
    }
}

/// Up/down-mix `frames` interleaved frames from `in_ch` to `out_ch` channels.
///
/// Mono to stereo duplicates, stereo to mono averages. Otherwise the
/// overlapping channels are copied; extra output channels are zeroed and
/// extra input channels are dropped.
pub fn convert_channels(input: &[f32], in_ch: usize, output: &mut [f32], out_ch: usize, frames: usize) {
    debug_assert!(input.len() >= frames * in_ch);
    debug_assert!(output.len() >= frames * out_ch);

    match (in_ch, out_ch) {
        (a, b) if a == b => output[..frames * a].copy_from_slice(&input[..frames * a]),
        (1, 2) => {
            for (frame, &s) in output.chunks_exact_mut(2).zip(input).take(frames) {
                frame[0] = s;
                frame[1] = s;
            }
        }
        (2, 1) => {
            for (out, pair) in output.iter_mut().zip(input.chunks_exact(2)).take(frames) {
                *out = (pair[0] + pair[1]) * 0.5;
            }
        }
        _ => {
            let shared = in_ch.min(out_ch);
            for (out, inp) in output
                .chunks_exact_mut(out_ch)
                .zip(input.chunks_exact(in_ch))
                .take(frames)
            {
                out[..shared].copy_from_slice(&inp[..shared]);
                out[shared..].fill(0.0);
            }
        }
    }
}

/// Streaming linear-interpolation resampler.
///
/// The clock is an exact rational: after `n` input frames in total the
/// resampler has emitted `floor(n * out_rate / in_rate)` frames, with the
/// remainder carried into the next call. Output frame `j` sits at input
/// position `j * in_rate / out_rate` and is interpolated between the two
/// input frames bracketing that position one frame back, which keeps the
/// whole thing causal at the cost of one input frame of latency.
pub struct LinearResampler {
    in_rate: u64,
    out_rate: u64,
    channels: usize,
    consumed: u64,
    produced: u64,
    /// Last `history_frames` input frames, indexed by absolute frame % len
    history: Box<[f32]>,
    history_frames: u64,
}

impl LinearResampler {
    pub fn new(in_rate: u32, out_rate: u32, channels: usize) -> Self {
        Self::with_history(in_rate, out_rate, channels, 0)
    }

    /// A resampler that can carry `pending_frames` input frames' worth of
    /// undelivered output into the next call.
    pub fn with_history(in_rate: u32, out_rate: u32, channels: usize, pending_frames: usize) -> Self {
        assert!(in_rate > 0 && out_rate > 0 && channels > 0);
        let in_rate = u64::from(in_rate);
        let out_rate = u64::from(out_rate);
        let history_frames = in_rate.div_ceil(out_rate) + 2 + pending_frames as u64;
        Self {
            in_rate,
            out_rate,
            channels,
            consumed: 0,
            produced: 0,
            history: vec![0.0; history_frames as usize * channels].into_boxed_slice(),
            history_frames,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_passthrough(&self) -> bool {
        self.in_rate == self.out_rate
    }

    /// Frames the next call with `input_frames` of input will produce.
    pub fn output_frames_for(&self, input_frames: usize) -> usize {
        (self.target(self.consumed + input_frames as u64) - self.produced) as usize
    }

    /// Upper bound on output frames for any single call of `input_frames`.
    pub fn max_output_frames(&self, input_frames: usize) -> usize {
        ((input_frames as u64 * self.out_rate).div_ceil(self.in_rate) + 1) as usize
    }

    fn target(&self, consumed: u64) -> u64 {
        ((u128::from(consumed) * u128::from(self.out_rate)) / u128::from(self.in_rate)) as u64
    }

    fn sample(&self, input: &[f32], frame: i128, channel: usize) -> f32 {
        if frame < 0 {
            return 0.0;
        }
        let frame = frame as u64;
        if frame >= self.consumed {
            input[(frame - self.consumed) as usize * self.channels + channel]
        } else {
            debug_assert!(self.consumed - frame <= self.history_frames);
            self.history[(frame % self.history_frames) as usize * self.channels + channel]
        }
    }

    /// Resample interleaved `input` into `output`; returns frames written.
    ///
    /// If `output` is too small, the frames that did not fit are emitted by
    /// the next call instead. Deferred frames whose input has already left
    /// the history are dropped, never interpolated from stale slots. At
    /// equal rates this is a plain copy and frames that do not fit are
    /// dropped.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        let ch = self.channels;
        let in_frames = input.len() / ch;

        if self.is_passthrough() {
            let n = in_frames.min(output.len() / ch);
            output[..n * ch].copy_from_slice(&input[..n * ch]);
            self.remember(input, in_frames);
            self.consumed += in_frames as u64;
            self.produced = self.consumed;
            return n;
        }

        self.produced = self.produced.max(self.first_reachable());
        let target = self.target(self.consumed + in_frames as u64);
        let room = (output.len() / ch) as u64;
        let count = (target - self.produced).min(room);

        for (k, frame) in output.chunks_exact_mut(ch).take(count as usize).enumerate() {
            let j = u128::from(self.produced + k as u64);
            let pos = j * u128::from(self.in_rate);
            let q = (pos / u128::from(self.out_rate)) as i128;
            let frac = (pos % u128::from(self.out_rate)) as f32 / self.out_rate as f32;
            for (c, out) in frame.iter_mut().enumerate() {
                let a = self.sample(input, q - 1, c);
                let b = self.sample(input, q, c);
                *out = a + (b - a) * frac;
            }
        }

        self.remember(input, in_frames);
        self.consumed += in_frames as u64;
        self.produced += count;
        count as usize
    }

    /// First output frame whose left neighbour is still in the history
    fn first_reachable(&self) -> u64 {
        if self.consumed <= self.history_frames {
            return 0;
        }
        let oldest = self.consumed - self.history_frames;
        ((u128::from(oldest + 1) * u128::from(self.out_rate)).div_ceil(u128::from(self.in_rate))) as u64
    }

    fn remember(&mut self, input: &[f32], in_frames: usize) {
        let ch = self.channels;
        let keep = in_frames.min(self.history_frames as usize);
        for k in in_frames - keep..in_frames {
            let abs = self.consumed + k as u64;
            let slot = (abs % self.history_frames) as usize * ch;
            self.history[slot..slot + ch].copy_from_slice(&input[k * ch..(k + 1) * ch]);
        }
    }

    /// Forget all carried state, as after a stream restart.
    pub fn reset(&mut self) {
        self.consumed = 0;
        self.produced = 0;
        self.history.fill(0.0);
    }
}

/// Channel conversion followed by rate conversion, with scratch sized for
/// `max_frames` input frames per call.
pub struct FormatAdapter {
    from: StreamFormat,
    to: StreamFormat,
    resampler: LinearResampler,
    scratch: Box<[f32]>,
    max_frames: usize,
}

impl FormatAdapter {
    pub fn new(from: StreamFormat, to: StreamFormat, max_frames: usize) -> Self {
        let max_frames = max_frames.max(1);
        Self {
            from,
            to,
            resampler: LinearResampler::with_history(from.sample_rate, to.sample_rate, to.channels as usize, max_frames),
            scratch: vec![0.0; max_frames * to.channels as usize].into_boxed_slice(),
            max_frames,
        }
    }

    pub fn from_format(&self) -> StreamFormat {
        self.from
    }

    pub fn to_format(&self) -> StreamFormat {
        self.to
    }

    pub fn is_identity(&self) -> bool {
        self.from == self.to
    }

    /// Largest output (in frames) a call with `input_frames` can produce.
    pub fn max_output_frames(&self, input_frames: usize) -> usize {
        let calls = input_frames.div_ceil(self.max_frames).max(1);
        self.resampler.max_output_frames(input_frames) + calls
    }

    /// Convert `frames` interleaved input frames; returns frames written to `output`.
    pub fn convert(&mut self, input: &[f32], frames: usize, output: &mut [f32]) -> usize {
        let in_ch = self.from.channels as usize;
        let out_ch = self.to.channels as usize;
        let mut written = 0;

        for chunk in input[..frames * in_ch].chunks(self.max_frames * in_ch) {
            let n = chunk.len() / in_ch;
            let mixed = &mut self.scratch[..n * out_ch];
            convert_channels(chunk, in_ch, mixed, out_ch, n);
            written += self.resampler.process(mixed, &mut output[written * out_ch..]);
        }
        written
    }

    pub fn reset(&mut self) {
        self.resampler.reset();
    }
}
