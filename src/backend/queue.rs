//! Legacy buffer-queue backend
//!
//! Capture and render run on independent hardware callbacks. Duplex
//! streams go through the split topology: capture feeds a ring buffer
//! bridge, and the render callback pulls from it and runs the processor.
//! This backend works everywhere, so it is the universal fallback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::native::{
    CaptureCallback, CaptureFactory, Direction, FaultMonitor, HostCapabilities, NativeHost,
    RenderCallback, RenderFactory, StreamRequest, StreamTuning,
};
use super::{Backend, BackendKind, Driver, DriverContext, DriverStreams, NegotiatedStream};
use crate::audio::buffer::{bridge, bridge_capacity, BridgeConsumer, BridgeProducer};
use crate::audio::format::StreamFormat;
use crate::config::{SchedulingPolicy, StreamConfig};
use crate::constants::QUEUE_MAX_BUFFER_FRAMES;
use crate::dispatch::{CapturePath, DispatchCore, DispatchState, Pull, RenderPath, SplitCapture, SplitRender};
use crate::error::{NativeError, OpenError};
use crate::event::StreamEvent;

/// How long an idle worker sleeps before checking again without a wakeup
const WORKER_IDLE: Duration = Duration::from_millis(2);

/// Buffer-queue backend over any [`NativeHost`]
pub struct QueueBackend {
    host: Arc<dyn NativeHost>,
    name: String,
    kind: BackendKind,
    max_buffer_frames: usize,
    caps: HostCapabilities,
}

impl QueueBackend {
    pub fn new(host: Arc<dyn NativeHost>) -> Self {
        Self::with_limits(host, "queue", BackendKind::Queue, QUEUE_MAX_BUFFER_FRAMES)
    }

    /// Same driver model with a different identity and buffer ceiling
    pub(crate) fn with_limits(
        host: Arc<dyn NativeHost>,
        name: &str,
        kind: BackendKind,
        max_buffer_frames: usize,
    ) -> Self {
        let caps = host.capabilities();
        Self {
            host,
            name: name.to_string(),
            kind,
            max_buffer_frames,
            caps,
        }
    }

    fn request(&self, config: &StreamConfig, direction: Direction, period: usize) -> StreamRequest {
        StreamRequest {
            direction,
            format: config.format(),
            period_frames: period,
            max_buffer_frames: self.max_buffer_frames,
            role: config.role,
            device_id: config.device_id.clone(),
            low_latency: false,
        }
    }
}

impl Backend for QueueBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> HostCapabilities {
        self.caps
    }

    fn accepts(&self, _config: &StreamConfig) -> Result<(), OpenError> {
        Ok(())
    }

    fn open(&self, config: &StreamConfig, ctx: &DriverContext) -> Result<Box<dyn Driver>, OpenError> {
        let period = config.frames.clamp(1, self.max_buffer_frames);
        let app = config.format();
        let monitor = FaultMonitor::new(ctx.faults.clone());
        let mut restart_flags = Vec::new();
        let mut worker = None;
        let mut render_source = None;

        // Capture first: a refused permission changes what render has to do.
        let mut capture = None;
        if config.input {
            let factory = if config.output {
                let capacity = bridge_capacity(app.sample_rate, period);
                let (producer, consumer) = bridge::<f32>(capacity, app.channels as usize);
                let wake = if ctx.policy == SchedulingPolicy::DedicatedWorker {
                    let (handle, processed) = Worker::spawn(consumer, ctx.core.clone(), period, &mut restart_flags)?;
                    let thread = handle.thread();
                    worker = Some(handle);
                    render_source = Some(RenderSource::Processed(processed));
                    thread
                } else {
                    render_source = Some(RenderSource::Captured(consumer));
                    None
                };
                split_capture_factory(producer, app, period, ctx.core.clone(), &monitor, wake)
            } else {
                direct_capture_factory(app, period, ctx.core.clone(), &monitor)
            };

            let request = self.request(config, Direction::Capture, period);
            match self.host.open_capture(&request, factory, monitor.callback()) {
                Ok(stream) => capture = Some(stream),
                Err(NativeError::PermissionDenied) if config.output => {
                    warn!("{}: capture permission refused, continuing output-only", self.name);
                    ctx.events.emit(StreamEvent::InputDisabled {
                        reason: "capture permission refused".into(),
                    });
                    render_source = None;
                    worker = None;
                    restart_flags.clear();
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut render = None;
        if config.output {
            let factory = render_factory(render_source, config, period, ctx.core.clone(), &monitor, &mut restart_flags);
            let request = self.request(config, Direction::Render, period);
            render = Some(self.host.open_render(&request, factory, monitor.callback())?);
        }

        let buffer_frames = render
            .as_deref()
            .or(capture.as_deref())
            .map(|s| s.tuning().buffer_frames())
            .unwrap_or(period);
        let policy = if worker.is_some() {
            SchedulingPolicy::DedicatedWorker
        } else {
            SchedulingPolicy::HardwareCallback
        };
        let negotiated = NegotiatedStream {
            backend: self.name.clone(),
            capture: capture.as_ref().map(|s| s.format()),
            render: render.as_ref().map(|s| s.format()),
            period_frames: period,
            buffer_frames,
            policy,
        };
        info!(
            "{}: opened (capture: {:?}, render: {:?}, period {} frames, {:?})",
            self.name, negotiated.capture, negotiated.render, period, policy
        );

        let mut driver = QueueDriver {
            streams: DriverStreams::new(render, capture, restart_flags, ctx.core.clone()),
            worker,
            max_buffer_frames: self.max_buffer_frames,
            negotiated,
        };
        if let Some(hint) = config.buffer_size_hint {
            driver.set_buffer_size_hint(hint);
        }
        Ok(Box::new(driver))
    }
}

/// Where the render callback gets its input from in duplex mode
enum RenderSource {
    /// Raw captured input; the render callback runs the processor
    Captured(BridgeConsumer<f32>),
    /// Output already produced by the worker thread
    Processed(BridgeConsumer<f32>),
}

fn split_capture_factory(
    producer: BridgeProducer<f32>,
    app: StreamFormat,
    period: usize,
    core: Arc<DispatchCore>,
    monitor: &Arc<FaultMonitor>,
    wake: Option<Thread>,
) -> CaptureFactory {
    let monitor = monitor.clone();
    Box::new(move |native: StreamFormat| -> CaptureCallback {
        let mut split = SplitCapture::new(producer, native, app, period, core);
        Box::new(move |input: &[f32]| {
            split.push(input);
            if let Some(worker) = &wake {
                worker.unpark();
            }
            monitor.healthy();
        })
    })
}

fn direct_capture_factory(
    app: StreamFormat,
    period: usize,
    core: Arc<DispatchCore>,
    monitor: &Arc<FaultMonitor>,
) -> CaptureFactory {
    let monitor = monitor.clone();
    Box::new(move |native: StreamFormat| -> CaptureCallback {
        let mut path = CapturePath::new(native, app, period);
        Box::new(move |input: &[f32]| {
            path.capture(input, |frames, count| {
                core.process(Some(frames), None, count);
            });
            monitor.healthy();
        })
    })
}

fn render_factory(
    source: Option<RenderSource>,
    config: &StreamConfig,
    period: usize,
    core: Arc<DispatchCore>,
    monitor: &Arc<FaultMonitor>,
    restart_flags: &mut Vec<Arc<AtomicBool>>,
) -> RenderFactory {
    let app = config.format();
    let channels = app.channels as usize;
    let monitor = monitor.clone();

    match source {
        None => Box::new(move |native: StreamFormat| -> RenderCallback {
            let mut path = RenderPath::new(app, native, period);
            Box::new(move |out: &mut [f32], _: &StreamTuning| {
                path.render(out, |buf, frames| {
                    core.process(None, Some(buf), frames);
                });
                monitor.healthy();
            })
        }),
        Some(RenderSource::Captured(consumer)) => {
            let mut split = SplitRender::new(consumer, channels, period, config.latency_target);
            restart_flags.push(split.restart_flag());
            Box::new(move |native: StreamFormat| -> RenderCallback {
                let mut path = RenderPath::new(app, native, period);
                let mut input = vec![0.0f32; period * channels];
                Box::new(move |out: &mut [f32], _: &StreamTuning| {
                    path.render(out, |buf, frames| {
                        let input = &mut input[..frames * channels];
                        match split.pull(input) {
                            Pull::Ready => {
                                core.process(Some(&*input), Some(buf), frames);
                            }
                            Pull::Underrun => core.dropout(Some(buf)),
                        }
                    });
                    monitor.healthy();
                })
            })
        }
        Some(RenderSource::Processed(consumer)) => {
            let mut split = SplitRender::new(consumer, channels, period, config.latency_target);
            restart_flags.push(split.restart_flag());
            Box::new(move |native: StreamFormat| -> RenderCallback {
                let mut path = RenderPath::new(app, native, period);
                Box::new(move |out: &mut [f32], _: &StreamTuning| {
                    path.render(out, |buf, _| {
                        if split.pull(buf) == Pull::Underrun {
                            core.dropout(Some(buf));
                        }
                    });
                    monitor.healthy();
                })
            })
        }
    }
}

/// Runs the processor off the hardware threads.
///
/// Reads whole periods of captured input, processes them and queues the
/// output for the render callback. The capture callback unparks it.
struct Worker {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        mut input: BridgeConsumer<f32>,
        core: Arc<DispatchCore>,
        period: usize,
        restart_flags: &mut Vec<Arc<AtomicBool>>,
    ) -> Result<(Self, BridgeConsumer<f32>), OpenError> {
        let channels = input.ring().channels();
        let (mut output, processed) = bridge::<f32>(input.ring().capacity(), channels);
        let shutdown = Arc::new(AtomicBool::new(false));
        let restart = Arc::new(AtomicBool::new(true));
        restart_flags.push(restart.clone());

        let stop = shutdown.clone();
        let handle = thread::Builder::new()
            .name("duplex-worker".into())
            .spawn(move || {
                let mut in_buf = vec![0.0f32; period * channels];
                let mut out_buf = vec![0.0f32; period * channels];
                while !stop.load(Ordering::Acquire) {
                    if core.state() != DispatchState::Running {
                        thread::park_timeout(WORKER_IDLE);
                        continue;
                    }
                    if restart.swap(false, Ordering::AcqRel) {
                        let stale = input.available().saturating_sub(period);
                        input.skip(stale);
                    }
                    if !input.read_into(&mut in_buf) {
                        thread::park_timeout(WORKER_IDLE);
                        continue;
                    }
                    core.process(Some(&in_buf), Some(&mut out_buf), period);
                    let written = output.write(&out_buf);
                    if written < period {
                        core.record_overrun(period - written);
                    }
                }
            })
            .map_err(|e| OpenError::Backend(format!("failed to spawn worker: {e}")))?;

        Ok((
            Self {
                shutdown,
                handle: Some(handle),
            },
            processed,
        ))
    }

    fn thread(&self) -> Option<Thread> {
        self.handle.as_ref().map(|h| h.thread().clone())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

/// An open buffer-queue stream
pub struct QueueDriver {
    streams: DriverStreams,
    worker: Option<Worker>,
    max_buffer_frames: usize,
    negotiated: NegotiatedStream,
}

impl Driver for QueueDriver {
    fn negotiated(&self) -> &NegotiatedStream {
        &self.negotiated
    }

    fn start(&mut self) -> Result<(), OpenError> {
        self.streams.start(&self.negotiated.backend, self.negotiated.buffer_frames)?;
        if let Some(thread) = self.worker.as_ref().and_then(Worker::thread) {
            thread.unpark();
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.streams.stop(&self.negotiated.backend);
    }

    fn set_buffer_size_hint(&mut self, frames: usize) -> usize {
        let target = frames.min(self.max_buffer_frames);
        let applied = match self.streams.primary() {
            Some(stream) => stream.tuning().set_buffer_frames(target),
            None => target.max(1),
        };
        self.negotiated.buffer_frames = applied;
        self.streams.core.set_buffer_frames(applied);
        debug!("{}: buffer size {} frames", self.negotiated.backend, applied);
        applied
    }
}

impl Drop for QueueDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
