//! Modern low-latency streaming backend
//!
//! One render stream drives everything. Capture, when enabled, is read
//! without blocking from inside the render callback, so input and output
//! for a buffer are handled in a single combined callback. The render
//! stream is opened even for input-only streams because some devices only
//! deliver capture while an output stream is running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::native::{
    CaptureReader, Direction, FaultMonitor, HostCapabilities, NativeHost, RenderCallback,
    RenderFactory, StreamRequest, StreamTuning,
};
use super::{Backend, BackendKind, Driver, DriverContext, DriverStreams, NegotiatedStream};
use crate::audio::format::StreamFormat;
use crate::config::{RoleHint, SchedulingPolicy, StreamConfig};
use crate::constants::STREAMING_MAX_BUFFER_FRAMES;
use crate::dispatch::{DispatchCore, Pull, SplitRender};
use crate::error::{NativeError, OpenError};
use crate::event::StreamEvent;

/// Low-latency streaming backend over a capable [`NativeHost`]
pub struct StreamingBackend {
    host: Arc<dyn NativeHost>,
    caps: HostCapabilities,
}

impl StreamingBackend {
    pub fn new(host: Arc<dyn NativeHost>) -> Self {
        let caps = host.capabilities();
        Self { host, caps }
    }

    fn request(&self, config: &StreamConfig, direction: Direction, period: usize) -> StreamRequest {
        StreamRequest {
            direction,
            format: config.format(),
            period_frames: period,
            max_buffer_frames: STREAMING_MAX_BUFFER_FRAMES,
            role: config.role,
            device_id: config.device_id.clone(),
            low_latency: true,
        }
    }
}

fn require_format(direction: &str, actual: StreamFormat, wanted: StreamFormat) -> Result<(), OpenError> {
    if actual == wanted {
        Ok(())
    } else {
        Err(OpenError::UnsupportedFormat(format!(
            "{direction} runs at {actual}, stream needs {wanted}"
        )))
    }
}

impl Backend for StreamingBackend {
    fn name(&self) -> &str {
        "streaming"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Streaming
    }

    fn capabilities(&self) -> HostCapabilities {
        self.caps
    }

    fn accepts(&self, config: &StreamConfig) -> Result<(), OpenError> {
        if !self.caps.low_latency_streaming {
            return Err(OpenError::Backend(format!(
                "{} has no low-latency streaming path",
                self.host.name()
            )));
        }
        if config.input && !self.caps.pull_capture {
            return Err(OpenError::Backend(format!(
                "{} cannot read capture from a render callback",
                self.host.name()
            )));
        }
        // Voice presets need input processing the low-latency path turns off.
        if config.input && config.role == RoleHint::VoiceCapture {
            return Err(OpenError::RoleIncompatible {
                backend: self.name().to_string(),
                role: config.role.to_string(),
            });
        }
        Ok(())
    }

    fn open(&self, config: &StreamConfig, ctx: &DriverContext) -> Result<Box<dyn Driver>, OpenError> {
        let period = config.frames.clamp(1, STREAMING_MAX_BUFFER_FRAMES);
        let app = config.format();
        let monitor = FaultMonitor::new(ctx.faults.clone());

        let mut capture = None;
        let mut reader = None;
        if config.input {
            let request = self.request(config, Direction::Capture, period);
            match self.host.open_capture_reader(&request, monitor.callback()) {
                Ok((stream, source)) => {
                    require_format("capture", stream.format(), app)?;
                    capture = Some(stream);
                    reader = Some(source);
                }
                Err(NativeError::PermissionDenied) if config.output => {
                    warn!("streaming: capture permission refused, continuing output-only");
                    ctx.events.emit(StreamEvent::InputDisabled {
                        reason: "capture permission refused".into(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        let input = reader.map(|source| SplitRender::new(source, app.channels as usize, period, config.latency_target));
        let mut restart_flags: Vec<Arc<AtomicBool>> = input.iter().map(SplitRender::restart_flag).collect();
        let fresh = Arc::new(AtomicBool::new(true));
        restart_flags.push(fresh.clone());

        let mut callback = CombinedCallback {
            input,
            scratch: vec![0.0; period * app.channels as usize].into_boxed_slice(),
            output_enabled: config.output,
            channels: app.channels as usize,
            period,
            core: ctx.core.clone(),
            monitor: monitor.clone(),
            fresh,
            rendered_frames: 0,
            grow_after: u64::from(app.sample_rate / 2),
            last_xruns: 0,
        };
        let factory: RenderFactory = Box::new(move |_: StreamFormat| -> RenderCallback {
            Box::new(move |out: &mut [f32], tuning: &StreamTuning| callback.render(out, tuning))
        });
        let request = self.request(config, Direction::Render, period);
        let render = self.host.open_render(&request, factory, monitor.callback())?;
        require_format("render", render.format(), app)?;

        let negotiated = NegotiatedStream {
            backend: self.name().to_string(),
            capture: capture.as_ref().map(|s| s.format()),
            render: config.output.then(|| render.format()),
            period_frames: period,
            buffer_frames: render.tuning().buffer_frames(),
            policy: SchedulingPolicy::HardwareCallback,
        };
        info!(
            "streaming: opened (capture: {:?}, render: {:?}, period {} frames)",
            negotiated.capture, negotiated.render, period
        );

        let mut driver = StreamingDriver {
            streams: DriverStreams::new(Some(render), capture, restart_flags, ctx.core.clone()),
            negotiated,
        };
        if let Some(hint) = config.buffer_size_hint {
            driver.set_buffer_size_hint(hint);
        }
        Ok(Box::new(driver))
    }
}

/// The render callback: pulls capture, runs the processor, fills output.
struct CombinedCallback {
    input: Option<SplitRender<Box<dyn CaptureReader>>>,
    scratch: Box<[f32]>,
    output_enabled: bool,
    channels: usize,
    period: usize,
    core: Arc<DispatchCore>,
    monitor: Arc<FaultMonitor>,
    /// Set on start; the next callback resets the adaptation window
    fresh: Arc<AtomicBool>,
    rendered_frames: u64,
    grow_after: u64,
    last_xruns: u64,
}

impl CombinedCallback {
    fn render(&mut self, out: &mut [f32], tuning: &StreamTuning) {
        self.monitor.healthy();
        if self.fresh.swap(false, Ordering::AcqRel) {
            self.rendered_frames = 0;
            self.last_xruns = tuning.xrun_count();
        }

        let ch = self.channels;
        for chunk in out.chunks_mut(self.period * ch) {
            let frames = chunk.len() / ch;
            let output = if self.output_enabled {
                Some(&mut *chunk)
            } else {
                chunk.fill(0.0);
                None
            };
            match self.input.as_mut() {
                None => {
                    self.core.process(None, output, frames);
                }
                Some(split) => {
                    let input = &mut self.scratch[..frames * ch];
                    match split.pull(input) {
                        Pull::Ready => {
                            self.core.process(Some(&*input), output, frames);
                        }
                        Pull::Underrun => self.core.dropout(output),
                    }
                }
            }
        }

        self.rendered_frames += (out.len() / ch) as u64;
        self.adapt_buffer(tuning);
    }

    /// Grow the hardware buffer by one burst whenever new xruns appear,
    /// up to the tuning's ceiling.
    ///
    /// Xruns during the settling window keep the baseline from start, so
    /// a startup burst still grows the buffer once the window closes.
    fn adapt_buffer(&mut self, tuning: &StreamTuning) {
        if self.rendered_frames < self.grow_after {
            return;
        }
        let xruns = tuning.xrun_count();
        if xruns == self.last_xruns {
            return;
        }
        self.last_xruns = xruns;
        let current = tuning.buffer_frames();
        if current >= tuning.max_frames() {
            return;
        }
        let applied = tuning.set_buffer_frames(current + tuning.burst_frames());
        self.core.notify_buffer_resized(applied);
    }
}

/// An open streaming-backend stream
pub struct StreamingDriver {
    streams: DriverStreams,
    negotiated: NegotiatedStream,
}

impl Driver for StreamingDriver {
    fn negotiated(&self) -> &NegotiatedStream {
        &self.negotiated
    }

    fn start(&mut self) -> Result<(), OpenError> {
        self.streams.start(&self.negotiated.backend, self.negotiated.buffer_frames)
    }

    fn stop(&mut self) {
        self.streams.stop(&self.negotiated.backend);
    }

    fn set_buffer_size_hint(&mut self, frames: usize) -> usize {
        let applied = match self.streams.primary() {
            Some(stream) => stream.tuning().set_buffer_frames(frames),
            None => frames.clamp(1, STREAMING_MAX_BUFFER_FRAMES),
        };
        self.negotiated.buffer_frames = applied;
        self.streams.core.set_buffer_frames(applied);
        debug!("streaming: buffer size {} frames", applied);
        applied
    }
}

impl Drop for StreamingDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::processor_slot;
    use crate::backend::native::NativeFault;
    use crate::backend::simulated::{SimulatedHost, SimulatedHostConfig};
    use crate::event::{ControlEvent, EventSink};
    use crate::SampleBuffer;
    use crossbeam_channel::{bounded, Receiver};
    use std::time::Duration;

    struct Rig {
        host: SimulatedHost,
        backend: StreamingBackend,
        ctx: DriverContext,
        control: Receiver<ControlEvent>,
        events: Receiver<StreamEvent>,
    }

    fn rig_with(config: &StreamConfig, host_config: SimulatedHostConfig) -> Rig {
        let host = SimulatedHost::new(SimulatedHostConfig {
            record_render: true,
            ..host_config
        });
        let (control_tx, control) = bounded(16);
        let processor = |buf: &mut SampleBuffer<'_>, _: usize, _: u32| {
            buf.pass_through();
            true
        };
        let core = Arc::new(DispatchCore::new(config, processor_slot(processor), control_tx));
        let (events, events_rx) = EventSink::channel();
        Rig {
            backend: StreamingBackend::new(Arc::new(host.clone())),
            host,
            ctx: DriverContext {
                core,
                faults: Arc::new(|_: NativeFault| {}),
                events,
                policy: SchedulingPolicy::HardwareCallback,
            },
            control,
            events: events_rx,
        }
    }

    fn rig(config: &StreamConfig) -> Rig {
        rig_with(config, SimulatedHostConfig::default())
    }

    #[test]
    fn test_rejects_voice_capture_and_missing_capabilities() {
        let voice = StreamConfig::default().with_role(RoleHint::VoiceCapture);
        let r = rig(&voice);
        assert!(matches!(r.backend.accepts(&voice), Err(OpenError::RoleIncompatible { .. })));
        // Output-only voice streams are fine.
        assert!(r.backend.accepts(&voice.clone().with_input(false)).is_ok());

        let limited = rig_with(
            &StreamConfig::default(),
            SimulatedHostConfig {
                capabilities: HostCapabilities {
                    low_latency_streaming: true,
                    pull_capture: false,
                    prefers_worker_thread: false,
                },
                ..SimulatedHostConfig::default()
            },
        );
        assert!(limited.backend.accepts(&StreamConfig::default()).is_err());
        assert!(limited.backend.accepts(&StreamConfig::default().with_input(false)).is_ok());
    }

    #[test]
    fn test_combined_callback_passes_capture_through() {
        let config = StreamConfig::new(48_000, 192).with_channels(1);
        let r = rig(&config);
        let mut driver = r.backend.open(&config, &r.ctx).unwrap();
        driver.start().unwrap();
        r.host.advance(Duration::from_millis(200));

        let rendered = r.host.take_rendered();
        let audible: Vec<f32> = rendered.iter().copied().skip_while(|&s| s == 0.0).collect();
        assert!(audible.len() > 8_000);
        assert!(audible.windows(2).all(|w| w[1] == w[0] + 1.0));
        assert_eq!(r.ctx.core.stats().dropouts, 0);
    }

    #[test]
    fn test_input_only_still_opens_render() {
        let config = StreamConfig::new(48_000, 256).with_output(false);
        let r = rig(&config);
        let mut driver = r.backend.open(&config, &r.ctx).unwrap();
        assert_eq!(r.host.render_opens(), 1);
        assert!(driver.negotiated().render.is_none());
        driver.start().unwrap();
        r.host.advance(Duration::from_millis(50));
        assert!(r.ctx.core.stats().processed > 0);
        assert!(r.host.take_rendered().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_format_mismatch_is_unsupported() {
        let config = StreamConfig::new(48_000, 256);
        let r = rig(&config);
        r.host.force_capture_format(Some(StreamFormat::new(44_100, 2)));
        let err = r.backend.open(&config, &r.ctx).err();
        assert!(matches!(err, Some(OpenError::UnsupportedFormat(_))));
        assert_eq!(r.host.open_streams(), 0);
    }

    #[test]
    fn test_permission_denied_degrades() {
        let config = StreamConfig::new(48_000, 256);
        let r = rig(&config);
        r.host.deny_capture_permission(true);
        let driver = r.backend.open(&config, &r.ctx).unwrap();
        assert!(!driver.negotiated().input_enabled());
        assert!(matches!(r.events.try_recv(), Ok(StreamEvent::InputDisabled { .. })));
    }

    #[test]
    fn test_buffer_grows_on_xruns_after_settling() {
        let config = StreamConfig::new(48_000, 192).with_input(false);
        let r = rig(&config);
        let mut driver = r.backend.open(&config, &r.ctx).unwrap();
        driver.start().unwrap();
        let initial = r.host.render_buffer_frames().unwrap();

        // Nothing changes while the stream settles.
        r.host.advance(Duration::from_millis(100));
        r.host.inject_xruns(1);
        r.host.advance(Duration::from_millis(100));
        assert_eq!(r.host.render_buffer_frames(), Some(initial));

        r.host.advance(Duration::from_millis(400));
        assert_eq!(r.host.render_buffer_frames(), Some(initial + 192));
        assert_eq!(r.control.try_recv(), Ok(ControlEvent::BufferResized(initial + 192)));

        r.host.inject_xruns(1);
        r.host.advance(Duration::from_millis(10));
        assert_eq!(r.host.render_buffer_frames(), Some(initial + 384));
        assert_eq!(r.control.try_recv(), Ok(ControlEvent::BufferResized(initial + 384)));

        for _ in 0..100 {
            r.host.inject_xruns(1);
            r.host.advance(Duration::from_millis(5));
        }
        assert_eq!(r.host.render_buffer_frames(), Some(STREAMING_MAX_BUFFER_FRAMES));
    }

    #[test]
    fn test_startup_xrun_burst_grows_buffer_once() {
        let config = StreamConfig::new(48_000, 192).with_input(false);
        let r = rig(&config);
        let mut driver = r.backend.open(&config, &r.ctx).unwrap();
        driver.start().unwrap();
        let initial = r.host.render_buffer_frames().unwrap();

        r.host.advance(Duration::from_millis(10));
        r.host.inject_xruns(5);
        r.host.advance(Duration::from_millis(490));
        assert_eq!(r.host.render_buffer_frames(), Some(initial));

        r.host.advance(Duration::from_millis(200));
        assert_eq!(r.host.render_buffer_frames(), Some(initial + 192));
        assert_eq!(r.control.try_recv(), Ok(ControlEvent::BufferResized(initial + 192)));
        assert!(r.control.try_recv().is_err());
    }
}
