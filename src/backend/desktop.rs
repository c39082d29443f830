//! Desktop audio through cpal
//!
//! A cpal stream is not `Send` on every platform, so each native stream
//! lives on its own thread. The thread builds the stream, reports the
//! negotiated format, then serves play/pause/close commands until the
//! owning [`CpalStream`] is dropped.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::native::{
    CaptureFactory, CaptureReader, Direction, FaultCallback, HostCapabilities, NativeFault,
    NativeHost, NativeStream, RenderFactory, StreamRequest, StreamTuning,
};
use super::{Backend, BackendKind, Driver, DriverContext, QueueBackend};
use crate::audio::device::{find_device, DeviceRole};
use crate::audio::format::{f32_slice_to_i16, i16_slice_to_f32, StreamFormat};
use crate::config::StreamConfig;
use crate::constants::{DESKTOP_MAX_BUFFER_FRAMES, MAX_PERIOD_FRAMES, STOP_ACK_TIMEOUT_MS};
use crate::error::{NativeError, OpenError};

enum Command {
    Play,
    Pause,
    Close,
}

/// The cpal default host as a [`NativeHost`]
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalHost;

impl CpalHost {
    pub fn new() -> Self {
        Self
    }
}

/// Pick the supported config closest to the request: exact channels and
/// rate in F32, then I16, then the device default.
fn negotiate(
    device: &cpal::Device,
    request: &StreamRequest,
) -> Result<(cpal::StreamConfig, cpal::SampleFormat), NativeError> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = match request.direction {
        Direction::Render => device.supported_output_configs().map(|c| c.collect()),
        Direction::Capture => device.supported_input_configs().map(|c| c.collect()),
    }
    .map_err(|e| NativeError::Unavailable(e.to_string()))?;

    let rate = cpal::SampleRate(request.format.sample_rate);
    let exact = [cpal::SampleFormat::F32, cpal::SampleFormat::I16]
        .into_iter()
        .find_map(|format| {
            ranges.iter().find(|r| {
                r.sample_format() == format
                    && r.channels() == request.format.channels
                    && r.min_sample_rate() <= rate
                    && r.max_sample_rate() >= rate
            })
        })
        .cloned();

    let supported = match exact {
        Some(range) => range.with_sample_rate(rate),
        None => match request.direction {
            Direction::Render => device.default_output_config(),
            Direction::Capture => device.default_input_config(),
        }
        .map_err(|e| NativeError::InvalidFormat(e.to_string()))?,
    };

    let sample_format = supported.sample_format();
    if !matches!(sample_format, cpal::SampleFormat::F32 | cpal::SampleFormat::I16) {
        return Err(NativeError::InvalidFormat(format!("sample format {sample_format:?}")));
    }

    let period = request.period_frames as u32;
    let buffer_size = match supported.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&period) => {
            cpal::BufferSize::Fixed(period)
        }
        _ => cpal::BufferSize::Default,
    };
    let mut config = supported.config();
    config.buffer_size = buffer_size;
    Ok((config, sample_format))
}

fn build_error(err: cpal::BuildStreamError) -> NativeError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => NativeError::Unavailable("device not available".into()),
        cpal::BuildStreamError::StreamConfigNotSupported => NativeError::InvalidFormat("config not supported".into()),
        other => NativeError::Host(other.to_string()),
    }
}

fn error_callback(faults: FaultCallback) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| match err {
        cpal::StreamError::DeviceNotAvailable => faults(NativeFault::Disconnected),
        other => {
            debug!("cpal stream error: {}", other);
            faults(NativeFault::BufferError);
        }
    }
}

fn device_for(request: &StreamRequest) -> Result<cpal::Device, NativeError> {
    let role = match request.direction {
        Direction::Render => DeviceRole::Output,
        Direction::Capture => DeviceRole::Input,
    };
    find_device(request.device_id.as_deref(), role).ok_or_else(|| {
        NativeError::Unavailable(request.device_id.clone().unwrap_or_else(|| "no default device".into()))
    })
}

fn scratch_len(config: &cpal::StreamConfig, period: usize) -> usize {
    let frames = match config.buffer_size {
        cpal::BufferSize::Fixed(n) => n as usize,
        cpal::BufferSize::Default => MAX_PERIOD_FRAMES,
    };
    frames.max(period) * config.channels as usize
}

fn build_render(
    request: &StreamRequest,
    factory: RenderFactory,
    faults: FaultCallback,
    tuning: Arc<StreamTuning>,
) -> Result<(cpal::Stream, StreamFormat), NativeError> {
    let device = device_for(request)?;
    let (config, sample_format) = negotiate(&device, request)?;
    let format = StreamFormat::new(config.sample_rate.0, config.channels);
    let mut callback = factory(format);

    let stream = match sample_format {
        cpal::SampleFormat::I16 => {
            let mut scratch = vec![0.0f32; scratch_len(&config, request.period_frames)];
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    for chunk in data.chunks_mut(scratch.len()) {
                        let buf = &mut scratch[..chunk.len()];
                        callback(buf, &tuning);
                        f32_slice_to_i16(buf, chunk);
                    }
                },
                error_callback(faults),
                None,
            )
        }
        _ => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| callback(data, &tuning),
            error_callback(faults),
            None,
        ),
    }
    .map_err(build_error)?;
    Ok((stream, format))
}

fn build_capture(
    request: &StreamRequest,
    factory: CaptureFactory,
    faults: FaultCallback,
) -> Result<(cpal::Stream, StreamFormat), NativeError> {
    let device = device_for(request)?;
    let (config, sample_format) = negotiate(&device, request)?;
    let format = StreamFormat::new(config.sample_rate.0, config.channels);
    let mut callback = factory(format);

    let stream = match sample_format {
        cpal::SampleFormat::I16 => {
            let mut scratch = vec![0.0f32; scratch_len(&config, request.period_frames)];
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    for chunk in data.chunks(scratch.len()) {
                        let buf = &mut scratch[..chunk.len()];
                        i16_slice_to_f32(chunk, buf);
                        callback(buf);
                    }
                },
                error_callback(faults),
                None,
            )
        }
        _ => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| callback(data),
            error_callback(faults),
            None,
        ),
    }
    .map_err(|err| match err {
        cpal::BuildStreamError::BackendSpecific { err } if err.description.to_lowercase().contains("permission") => {
            NativeError::PermissionDenied
        }
        other => build_error(other),
    })?;
    Ok((stream, format))
}

/// A cpal stream owned by its own thread
pub struct CpalStream {
    format: StreamFormat,
    tuning: Arc<StreamTuning>,
    commands: Sender<Command>,
    acks: Receiver<Result<(), NativeError>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn spawn<F>(name: &str, tuning: Arc<StreamTuning>, build: F) -> Result<Self, NativeError>
    where
        F: FnOnce() -> Result<(cpal::Stream, StreamFormat), NativeError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = bounded(1);
        let (commands, command_rx) = bounded::<Command>(4);
        let (ack_tx, acks) = bounded(4);

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok((stream, format)) => {
                        let _ = ready_tx.send(Ok(format));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                for command in command_rx.iter() {
                    let result = match command {
                        Command::Play => stream.play().map_err(|e| NativeError::Host(e.to_string())),
                        Command::Pause => stream.pause().map_err(|e| NativeError::Host(e.to_string())),
                        Command::Close => break,
                    };
                    let _ = ack_tx.send(result);
                }
                // Dropping the stream waits for an in-flight callback.
                drop(stream);
            })
            .map_err(|e| NativeError::Host(format!("failed to spawn stream thread: {e}")))?;

        let format = match ready_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(NativeError::Host("stream thread exited".into())),
        };
        match format {
            Ok(format) => Ok(Self {
                format,
                tuning,
                commands,
                acks,
                thread: Some(thread),
            }),
            Err(err) => {
                let _ = thread.join();
                Err(err)
            }
        }
    }

    fn command(&self, command: Command) -> Result<(), NativeError> {
        self.commands
            .send(command)
            .map_err(|_| NativeError::Host("stream thread gone".into()))?;
        match self.acks.recv_timeout(Duration::from_millis(STOP_ACK_TIMEOUT_MS)) {
            Ok(result) => result,
            Err(_) => Err(NativeError::Host("stream thread did not answer".into())),
        }
    }
}

impl NativeStream for CpalStream {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn tuning(&self) -> &StreamTuning {
        &self.tuning
    }

    fn start(&mut self) -> Result<(), NativeError> {
        self.command(Command::Play)
    }

    fn stop(&mut self) {
        if let Err(err) = self.command(Command::Pause) {
            warn!("cpal: pause failed: {}", err);
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("cpal stream thread panicked");
            }
        }
    }
}

impl NativeHost for CpalHost {
    fn name(&self) -> &str {
        "cpal"
    }

    fn capabilities(&self) -> HostCapabilities {
        HostCapabilities::default()
    }

    fn open_render(
        &self,
        request: &StreamRequest,
        callback: RenderFactory,
        faults: FaultCallback,
    ) -> Result<Box<dyn NativeStream>, NativeError> {
        let period = request.period_frames;
        let tuning = Arc::new(StreamTuning::new(period, period, request.max_buffer_frames));
        let shared = tuning.clone();
        let request = request.clone();
        let stream = CpalStream::spawn("cpal-render", tuning, move || {
            build_render(&request, callback, faults, shared)
        })?;
        debug!("cpal: render stream at {}", stream.format);
        Ok(Box::new(stream))
    }

    fn open_capture(
        &self,
        request: &StreamRequest,
        callback: CaptureFactory,
        faults: FaultCallback,
    ) -> Result<Box<dyn NativeStream>, NativeError> {
        let period = request.period_frames;
        let tuning = Arc::new(StreamTuning::new(period, period, request.max_buffer_frames));
        let request = request.clone();
        let stream = CpalStream::spawn("cpal-capture", tuning, move || {
            build_capture(&request, callback, faults)
        })?;
        debug!("cpal: capture stream at {}", stream.format);
        Ok(Box::new(stream))
    }

    fn open_capture_reader(
        &self,
        _request: &StreamRequest,
        _faults: FaultCallback,
    ) -> Result<(Box<dyn NativeStream>, Box<dyn CaptureReader>), NativeError> {
        Err(NativeError::Unsupported("cpal has no pull capture".into()))
    }
}

/// Queue-model driver over cpal devices
pub struct DesktopBackend {
    inner: QueueBackend,
}

impl DesktopBackend {
    pub fn new() -> Self {
        Self {
            inner: QueueBackend::with_limits(
                Arc::new(CpalHost::new()),
                "desktop",
                BackendKind::Desktop,
                DESKTOP_MAX_BUFFER_FRAMES,
            ),
        }
    }
}

impl Default for DesktopBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for DesktopBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn capabilities(&self) -> HostCapabilities {
        self.inner.capabilities()
    }

    fn accepts(&self, config: &StreamConfig) -> Result<(), OpenError> {
        self.inner.accepts(config)
    }

    fn open(&self, config: &StreamConfig, ctx: &DriverContext) -> Result<Box<dyn Driver>, OpenError> {
        self.inner.open(config, ctx)
    }
}
