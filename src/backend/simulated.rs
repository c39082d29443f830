//! Virtual audio hardware
//!
//! `SimulatedHost` implements [`NativeHost`] without any audio device. It
//! runs either on a manually advanced virtual clock, where callbacks fire
//! in timestamp order inside [`SimulatedHost::advance`], or on real
//! threads, one per stream. Capture periods can be jittered around their
//! nominal grid, and faults can be injected at any time.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::native::{
    CaptureCallback, CaptureFactory, CaptureReader, Direction, FaultCallback, HostCapabilities,
    NativeFault, NativeHost, NativeStream, RenderCallback, RenderFactory, StreamRequest,
    StreamTuning,
};
use crate::audio::buffer::{bridge, bridge_capacity, BridgeProducer};
use crate::audio::format::StreamFormat;
use crate::error::NativeError;

/// How simulated time advances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// Only inside `advance`, deterministically
    Manual,
    /// In real time, one thread per stream
    Threaded,
}

/// What the simulated microphone produces
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureSignal {
    /// Each frame holds its own frame index (all channels equal)
    Ramp,
    Silence,
    Constant(f32),
}

#[derive(Debug, Clone)]
pub struct SimulatedHostConfig {
    pub clock: Clock,
    pub capabilities: HostCapabilities,
    /// Capture callback timing jitter as a fraction of the period
    pub capture_jitter: f64,
    pub seed: u64,
    pub signal: CaptureSignal,
    /// Keep every rendered sample for inspection
    pub record_render: bool,
}

impl Default for SimulatedHostConfig {
    fn default() -> Self {
        Self {
            clock: Clock::Manual,
            capabilities: HostCapabilities {
                low_latency_streaming: true,
                pull_capture: true,
                prefers_worker_thread: false,
            },
            capture_jitter: 0.0,
            seed: 0x5eed,
            signal: CaptureSignal::Ramp,
            record_render: false,
        }
    }
}

/// Small deterministic generator for callback jitter
#[derive(Debug, Clone)]
struct Lcg(u64);

impl Lcg {
    fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[derive(Default)]
struct FaultPlan {
    fail_opens: u32,
    fail_direction: Option<Direction>,
    error: Option<NativeError>,
    forced_capture: Option<StreamFormat>,
    forced_render: Option<StreamFormat>,
}

struct HostShared {
    config: SimulatedHostConfig,
    epoch: Instant,
    virtual_ns: AtomicU64,
    streams: Mutex<Vec<Weak<SimStream>>>,
    next_id: AtomicU64,
    deny_capture: AtomicBool,
    plan: Mutex<FaultPlan>,
    render_opens: AtomicU64,
    capture_opens: AtomicU64,
    capture_frame: AtomicU64,
    render_callbacks: AtomicU64,
    rendered: Mutex<Vec<f32>>,
}

impl HostShared {
    fn now_ns(&self) -> u64 {
        match self.config.clock {
            Clock::Manual => self.virtual_ns.load(Ordering::Acquire),
            Clock::Threaded => self.epoch.elapsed().as_nanos() as u64,
        }
    }

    fn live_streams(&self) -> Vec<Arc<SimStream>> {
        let mut streams = self.streams.lock();
        streams.retain(|s| s.strong_count() > 0);
        streams.iter().filter_map(Weak::upgrade).collect()
    }

    fn take_open_failure(&self, direction: Direction) -> Option<NativeError> {
        let mut plan = self.plan.lock();
        if plan.fail_opens == 0 || plan.fail_direction.is_some_and(|d| d != direction) {
            return None;
        }
        plan.fail_opens -= 1;
        Some(plan.error.clone().unwrap_or(NativeError::DeviceBusy))
    }

    fn fill_signal(&self, buffer: &mut [f32], channels: usize) {
        let frames = buffer.len() / channels;
        let start = self.capture_frame.fetch_add(frames as u64, Ordering::Relaxed);
        for (i, frame) in buffer.chunks_exact_mut(channels).enumerate() {
            let value = match self.config.signal {
                CaptureSignal::Ramp => (start + i as u64) as f32,
                CaptureSignal::Silence => 0.0,
                CaptureSignal::Constant(v) => v,
            };
            frame.fill(value);
        }
    }
}

enum SimCallback {
    Render(RenderCallback),
    Capture(CaptureCallback),
    Reader(BridgeProducer<f32>),
}

struct StreamState {
    running: bool,
    closed: bool,
    lost: bool,
    callback: SimCallback,
    buffer: Vec<f32>,
    origin_ns: u64,
    fired: u64,
    next_due_ns: u64,
    rng: Lcg,
}

struct SimStream {
    id: u64,
    direction: Direction,
    format: StreamFormat,
    period_ns: u64,
    jitter: f64,
    tuning: StreamTuning,
    faults: FaultCallback,
    state: Mutex<StreamState>,
    host: Weak<HostShared>,
}

impl SimStream {
    fn schedule(&self, state: &mut StreamState) {
        let nominal = state.origin_ns + (state.fired + 1) * self.period_ns;
        let offset = if self.jitter > 0.0 {
            (state.rng.next_f64() * 2.0 - 1.0) * self.jitter * self.period_ns as f64
        } else {
            0.0
        };
        state.next_due_ns = (nominal as f64 + offset).max(0.0) as u64;
    }

    /// Run one hardware period if the stream is live.
    fn fire(&self) {
        let Some(host) = self.host.upgrade() else {
            return;
        };
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.running || state.closed || state.lost {
            return;
        }

        let channels = self.format.channels as usize;
        match &mut state.callback {
            SimCallback::Render(callback) => {
                state.buffer.fill(0.0);
                callback(&mut state.buffer, &self.tuning);
                host.render_callbacks.fetch_add(1, Ordering::Relaxed);
                if host.config.record_render {
                    host.rendered.lock().extend_from_slice(&state.buffer);
                }
            }
            SimCallback::Capture(callback) => {
                host.fill_signal(&mut state.buffer, channels);
                callback(&state.buffer);
            }
            SimCallback::Reader(producer) => {
                host.fill_signal(&mut state.buffer, channels);
                producer.write(&state.buffer);
            }
        }

        state.fired += 1;
        self.schedule(state);
    }

    fn due(&self) -> Option<u64> {
        let state = self.state.lock();
        (state.running && !state.closed && !state.lost).then_some(state.next_due_ns)
    }
}

fn run_stream_thread(stream: Arc<SimStream>) {
    loop {
        let due = {
            let state = stream.state.lock();
            if state.closed {
                break;
            }
            (state.running && !state.lost).then_some(state.next_due_ns)
        };
        let Some(host) = stream.host.upgrade() else {
            break;
        };
        match due {
            None => thread::park_timeout(Duration::from_millis(5)),
            Some(due) => {
                let now = host.now_ns();
                if due > now {
                    thread::sleep(Duration::from_nanos(due - now).min(Duration::from_millis(5)));
                } else {
                    stream.fire();
                }
            }
        }
    }
}

/// Handle returned to drivers
struct SimNativeStream {
    stream: Arc<SimStream>,
    thread: Option<JoinHandle<()>>,
}

impl NativeStream for SimNativeStream {
    fn format(&self) -> StreamFormat {
        self.stream.format
    }

    fn tuning(&self) -> &StreamTuning {
        &self.stream.tuning
    }

    fn start(&mut self) -> Result<(), NativeError> {
        let Some(host) = self.stream.host.upgrade() else {
            return Err(NativeError::Unavailable("host gone".into()));
        };
        {
            let mut state = self.stream.state.lock();
            if state.lost {
                return Err(NativeError::Unavailable("device disconnected".into()));
            }
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.origin_ns = host.now_ns();
            state.fired = 0;
            self.stream.schedule(&mut state);
        }
        if let Some(thread) = &self.thread {
            thread.thread().unpark();
        }
        Ok(())
    }

    fn stop(&mut self) {
        // Taking the lock waits out any callback in flight.
        self.stream.state.lock().running = false;
    }
}

impl Drop for SimNativeStream {
    fn drop(&mut self) {
        {
            let mut state = self.stream.state.lock();
            state.running = false;
            state.closed = true;
        }
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

/// Deterministic stand-in for a native audio API
#[derive(Clone)]
pub struct SimulatedHost {
    shared: Arc<HostShared>,
}

impl SimulatedHost {
    pub fn new(config: SimulatedHostConfig) -> Self {
        Self {
            shared: Arc::new(HostShared {
                config,
                epoch: Instant::now(),
                virtual_ns: AtomicU64::new(0),
                streams: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                deny_capture: AtomicBool::new(false),
                plan: Mutex::new(FaultPlan::default()),
                render_opens: AtomicU64::new(0),
                capture_opens: AtomicU64::new(0),
                capture_frame: AtomicU64::new(0),
                render_callbacks: AtomicU64::new(0),
                rendered: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn manual() -> Self {
        Self::new(SimulatedHostConfig::default())
    }

    pub fn threaded() -> Self {
        Self::new(SimulatedHostConfig {
            clock: Clock::Threaded,
            ..SimulatedHostConfig::default()
        })
    }

    pub fn config(&self) -> &SimulatedHostConfig {
        &self.shared.config
    }

    /// Current simulated time
    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.shared.now_ns())
    }

    /// Fire every callback due within `duration`, earliest first.
    ///
    /// Only meaningful with [`Clock::Manual`].
    pub fn advance(&self, duration: Duration) {
        let target = self.shared.now_ns() + duration.as_nanos() as u64;
        loop {
            let next = self
                .shared
                .live_streams()
                .into_iter()
                .filter_map(|s| s.due().filter(|&due| due <= target).map(|due| (due, s.id, s)))
                .min_by_key(|(due, id, _)| (*due, *id));
            let Some((due, _, stream)) = next else {
                break;
            };
            self.shared.virtual_ns.fetch_max(due, Ordering::AcqRel);
            stream.fire();
        }
        self.shared.virtual_ns.fetch_max(target, Ordering::AcqRel);
    }

    /// Refuse capture opens with `PermissionDenied`
    pub fn deny_capture_permission(&self, deny: bool) {
        self.shared.deny_capture.store(deny, Ordering::Relaxed);
    }

    /// Make the next `count` opens (any direction) fail with `error`
    pub fn fail_next_opens(&self, count: u32, error: NativeError) {
        let mut plan = self.shared.plan.lock();
        plan.fail_opens = count;
        plan.error = Some(error);
    }

    /// Make the next `count` opens in `direction` fail with `error`
    pub fn fail_next_opens_for(&self, direction: Direction, count: u32, error: NativeError) {
        let mut plan = self.shared.plan.lock();
        plan.fail_direction = Some(direction);
        plan.fail_opens = count;
        plan.error = Some(error);
    }

    /// Negotiate this capture format regardless of the request
    pub fn force_capture_format(&self, format: Option<StreamFormat>) {
        self.shared.plan.lock().forced_capture = format;
    }

    /// Negotiate this render format regardless of the request
    pub fn force_render_format(&self, format: Option<StreamFormat>) {
        self.shared.plan.lock().forced_render = format;
    }

    /// Unplug the device: every open stream stops calling back and reports
    /// `Disconnected`.
    pub fn disconnect(&self) {
        let streams = self.shared.live_streams();
        for stream in &streams {
            stream.state.lock().lost = true;
        }
        for stream in &streams {
            (stream.faults)(NativeFault::Disconnected);
        }
    }

    /// Report `count` buffer errors on every open stream
    pub fn inject_buffer_errors(&self, count: u32) {
        for stream in self.shared.live_streams() {
            for _ in 0..count {
                (stream.faults)(NativeFault::BufferError);
            }
        }
    }

    /// Bump the xrun counter of every render stream
    pub fn inject_xruns(&self, count: u64) {
        for stream in self.shared.live_streams() {
            if stream.direction == Direction::Render {
                stream.tuning.record_xruns(count);
            }
        }
    }

    /// Successful render opens so far
    pub fn render_opens(&self) -> u64 {
        self.shared.render_opens.load(Ordering::Relaxed)
    }

    /// Successful capture opens so far
    pub fn capture_opens(&self) -> u64 {
        self.shared.capture_opens.load(Ordering::Relaxed)
    }

    pub fn render_callbacks(&self) -> u64 {
        self.shared.render_callbacks.load(Ordering::Relaxed)
    }

    /// Streams currently open (running or not)
    pub fn open_streams(&self) -> usize {
        self.shared
            .live_streams()
            .iter()
            .filter(|s| !s.state.lock().closed)
            .count()
    }

    /// Streams currently delivering callbacks
    pub fn running_streams(&self) -> usize {
        self.shared.live_streams().iter().filter(|s| s.due().is_some()).count()
    }

    /// Buffer size of the first open render stream
    pub fn render_buffer_frames(&self) -> Option<usize> {
        self.shared
            .live_streams()
            .iter()
            .find(|s| s.direction == Direction::Render && !s.state.lock().closed)
            .map(|s| s.tuning.buffer_frames())
    }

    /// Drain everything rendered since the last call (needs `record_render`)
    pub fn take_rendered(&self) -> Vec<f32> {
        std::mem::take(&mut *self.shared.rendered.lock())
    }

    fn register(
        &self,
        request: &StreamRequest,
        format: StreamFormat,
        callback: SimCallback,
        faults: FaultCallback,
    ) -> Box<dyn NativeStream> {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let period = request.period_frames.max(1);
        let jitter = match request.direction {
            Direction::Capture => shared.config.capture_jitter,
            Direction::Render => 0.0,
        };

        let stream = Arc::new(SimStream {
            id,
            direction: request.direction,
            format,
            period_ns: period as u64 * 1_000_000_000 / u64::from(format.sample_rate),
            jitter,
            tuning: StreamTuning::new(period, period, request.max_buffer_frames),
            faults,
            state: Mutex::new(StreamState {
                running: false,
                closed: false,
                lost: false,
                callback,
                buffer: vec![0.0; period * format.channels as usize],
                origin_ns: 0,
                fired: 0,
                next_due_ns: 0,
                rng: Lcg(shared.config.seed ^ id.wrapping_mul(0x9e37_79b9_7f4a_7c15)),
            }),
            host: Arc::downgrade(shared),
        });
        shared.streams.lock().push(Arc::downgrade(&stream));

        let thread = match shared.config.clock {
            Clock::Manual => None,
            Clock::Threaded => {
                let worker = stream.clone();
                let name = match request.direction {
                    Direction::Capture => "sim-capture",
                    Direction::Render => "sim-render",
                };
                thread::Builder::new()
                    .name(name.into())
                    .spawn(move || run_stream_thread(worker))
                    .ok()
            }
        };

        Box::new(SimNativeStream { stream, thread })
    }

    /// Apply injected failures, then pick the capture format
    fn capture_format(&self, request: &StreamRequest) -> Result<StreamFormat, NativeError> {
        if let Some(err) = self.shared.take_open_failure(Direction::Capture) {
            return Err(err);
        }
        if self.shared.deny_capture.load(Ordering::Relaxed) {
            return Err(NativeError::PermissionDenied);
        }
        Ok(self.shared.plan.lock().forced_capture.unwrap_or(request.format))
    }
}

impl NativeHost for SimulatedHost {
    fn name(&self) -> &str {
        "simulated"
    }

    fn capabilities(&self) -> HostCapabilities {
        self.shared.config.capabilities
    }

    fn open_render(
        &self,
        request: &StreamRequest,
        callback: RenderFactory,
        faults: FaultCallback,
    ) -> Result<Box<dyn NativeStream>, NativeError> {
        if let Some(err) = self.shared.take_open_failure(Direction::Render) {
            return Err(err);
        }
        let format = self.shared.plan.lock().forced_render.unwrap_or(request.format);
        let stream = self.register(request, format, SimCallback::Render(callback(format)), faults);
        self.shared.render_opens.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }

    fn open_capture(
        &self,
        request: &StreamRequest,
        callback: CaptureFactory,
        faults: FaultCallback,
    ) -> Result<Box<dyn NativeStream>, NativeError> {
        let format = self.capture_format(request)?;
        let stream = self.register(request, format, SimCallback::Capture(callback(format)), faults);
        self.shared.capture_opens.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }

    fn open_capture_reader(
        &self,
        request: &StreamRequest,
        faults: FaultCallback,
    ) -> Result<(Box<dyn NativeStream>, Box<dyn CaptureReader>), NativeError> {
        if !self.shared.config.capabilities.pull_capture {
            return Err(NativeError::Unsupported("pull capture".into()));
        }
        let format = self.capture_format(request)?;
        let capacity = bridge_capacity(format.sample_rate, request.period_frames);
        let (producer, consumer) = bridge::<f32>(capacity, format.channels as usize);
        let stream = self.register(request, format, SimCallback::Reader(producer), faults);
        self.shared.capture_opens.fetch_add(1, Ordering::Relaxed);
        Ok((stream, Box::new(consumer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoleHint;

    fn request(direction: Direction, frames: usize) -> StreamRequest {
        StreamRequest {
            direction,
            format: StreamFormat::new(48_000, 1),
            period_frames: frames,
            max_buffer_frames: 4096,
            role: RoleHint::General,
            device_id: None,
            low_latency: true,
        }
    }

    fn no_faults() -> FaultCallback {
        Arc::new(|_: NativeFault| {})
    }

    fn render_with(callback: impl FnMut(&mut [f32], &StreamTuning) + Send + 'static) -> RenderFactory {
        Box::new(move |_: StreamFormat| -> RenderCallback { Box::new(callback) })
    }

    fn capture_with(callback: impl FnMut(&[f32]) + Send + 'static) -> CaptureFactory {
        Box::new(move |_: StreamFormat| -> CaptureCallback { Box::new(callback) })
    }

    fn counting_render(host: &SimulatedHost, frames: usize) -> (Box<dyn NativeStream>, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let stream = host
            .open_render(
                &request(Direction::Render, frames),
                render_with(move |out: &mut [f32], _: &StreamTuning| {
                    out.fill(1.0);
                    counter.fetch_add(1, Ordering::Relaxed);
                }),
                no_faults(),
            )
            .unwrap();
        (stream, calls)
    }

    #[test]
    fn test_manual_clock_fires_on_grid() {
        let host = SimulatedHost::manual();
        let (mut stream, calls) = counting_render(&host, 480);

        host.advance(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        stream.start().unwrap();
        host.advance(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::Relaxed), 10);

        stream.stop();
        host.advance(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::Relaxed), 10);
        assert_eq!(host.render_opens(), 1);
    }

    #[test]
    fn test_capture_ramp_and_jitter_stay_ordered() {
        let host = SimulatedHost::new(SimulatedHostConfig {
            capture_jitter: 0.2,
            ..SimulatedHostConfig::default()
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut stream = host
            .open_capture(
                &request(Direction::Capture, 100),
                capture_with(move |input: &[f32]| sink.lock().extend_from_slice(input)),
                no_faults(),
            )
            .unwrap();
        stream.start().unwrap();
        host.advance(Duration::from_millis(500));

        let seen = seen.lock();
        // 240 periods nominally; the last may be jittered past the window.
        assert!(seen.len() >= 239 * 100 && seen.len() <= 240 * 100);
        assert!(seen.iter().enumerate().all(|(i, &v)| v == i as f32));
    }

    #[test]
    fn test_fault_injection() {
        let host = SimulatedHost::manual();
        host.deny_capture_permission(true);
        let denied = host
            .open_capture(&request(Direction::Capture, 64), capture_with(|_: &[f32]| {}), no_faults())
            .err();
        assert_eq!(denied, Some(NativeError::PermissionDenied));

        host.fail_next_opens(1, NativeError::DeviceBusy);
        let busy = host
            .open_render(
                &request(Direction::Render, 64),
                render_with(|_: &mut [f32], _: &StreamTuning| {}),
                no_faults(),
            )
            .err();
        assert_eq!(busy, Some(NativeError::DeviceBusy));

        let faults = Arc::new(Mutex::new(Vec::new()));
        let record = faults.clone();
        let mut stream = host
            .open_render(
                &request(Direction::Render, 64),
                render_with(|_: &mut [f32], _: &StreamTuning| {}),
                Arc::new(move |f: NativeFault| record.lock().push(f)),
            )
            .unwrap();
        stream.start().unwrap();
        assert_eq!(host.running_streams(), 1);

        host.disconnect();
        assert_eq!(*faults.lock(), vec![NativeFault::Disconnected]);
        assert_eq!(host.running_streams(), 0);
        assert!(stream.start().is_err());
    }

    #[test]
    fn test_forced_format_reaches_factory() {
        let host = SimulatedHost::manual();
        host.force_render_format(Some(StreamFormat::new(44_100, 2)));
        let negotiated = Arc::new(Mutex::new(None));
        let slot = negotiated.clone();
        let factory: RenderFactory = Box::new(move |format: StreamFormat| -> RenderCallback {
            *slot.lock() = Some(format);
            Box::new(|_: &mut [f32], _: &StreamTuning| {})
        });
        let stream = host
            .open_render(&request(Direction::Render, 64), factory, no_faults())
            .unwrap();
        assert_eq!(stream.format(), StreamFormat::new(44_100, 2));
        assert_eq!(*negotiated.lock(), Some(StreamFormat::new(44_100, 2)));
    }

    #[test]
    fn test_threaded_clock_delivers_callbacks() {
        let host = SimulatedHost::threaded();
        let (mut stream, calls) = counting_render(&host, 480);
        stream.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        stream.stop();
        let fired = calls.load(Ordering::Relaxed);
        assert!(fired >= 5, "only {fired} callbacks in 200 ms");

        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::Relaxed), fired);
        drop(stream);
        assert_eq!(host.open_streams(), 0);
    }
}
