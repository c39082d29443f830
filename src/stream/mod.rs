//! Application-facing duplex stream
//!
//! [`DuplexStream::open`] picks a backend and returns a [`StreamHandle`].
//! The handle owns the lifecycle, a control thread that serves requests
//! raised on audio threads, and the recovery supervisor.

pub mod lifecycle;
pub mod recovery;

pub use lifecycle::{Action, Command, Lifecycle, LifecycleState, Transition};
pub use recovery::{RecoveryGuard, RecoveryPolicy, RecoverySupervisor, RecoveryToken};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::audio::processor::{in_audio_callback, processor_slot, AudioProcessor};
use crate::backend::native::NativeFault;
use crate::backend::{BackendSelector, Driver, DriverContext, NegotiatedStream};
use crate::config::{SchedulingPolicy, StreamConfig};
use crate::constants::CONTROL_CHANNEL_CAPACITY;
use crate::dispatch::{DispatchCore, StreamStats};
use crate::error::{Error, OpenError, Result};
use crate::event::{ControlEvent, EventSink, StreamEvent};

/// Entry point for opening streams
pub struct DuplexStream;

impl DuplexStream {
    /// Open a stream on the first backend of `selector` that succeeds.
    ///
    /// The stream is opened but not started.
    pub fn open(
        config: StreamConfig,
        processor: impl AudioProcessor + 'static,
        selector: BackendSelector,
    ) -> Result<StreamHandle> {
        Self::open_with(config, processor, selector, RecoveryPolicy::default())
    }

    pub fn open_with(
        config: StreamConfig,
        processor: impl AudioProcessor + 'static,
        selector: BackendSelector,
        recovery: RecoveryPolicy,
    ) -> Result<StreamHandle> {
        debug_assert!(!in_audio_callback(), "stream opened from an audio callback");
        config.validate()?;

        let (control_tx, control_rx) = bounded(CONTROL_CHANNEL_CAPACITY);
        let (events, events_rx) = EventSink::channel();
        let core = Arc::new(DispatchCore::new(&config, processor_slot(processor), control_tx.clone()));

        let inner = Arc::new(StreamInner {
            config,
            selector,
            core,
            events,
            control: Mutex::new(Control {
                lifecycle: Lifecycle::new(),
                driver: None,
            }),
            recovery: RecoverySupervisor::new(recovery),
            last_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let driver = inner.open_driver().map_err(|err| {
            error!("Failed to open stream: {}", err);
            Error::Open(err)
        })?;
        info!(
            "Opened {} Hz / {} frames / {} ch stream on {}",
            inner.config.sample_rate,
            inner.config.frames,
            inner.config.channels,
            driver.negotiated().backend
        );
        inner.control.lock().driver = Some(driver);

        let weak = Arc::downgrade(&inner);
        let control_thread = thread::Builder::new()
            .name("duplex-control".into())
            .spawn(move || run_control_loop(weak, control_rx))?;

        Ok(StreamHandle {
            inner,
            events: events_rx,
            control_tx,
            control_thread: Some(control_thread),
        })
    }
}

struct Control {
    lifecycle: Lifecycle,
    driver: Option<Box<dyn Driver>>,
}

#[derive(Debug, Clone)]
enum Failure {
    Open(OpenError),
    Recovery { attempts: u32, last: OpenError },
}

impl Failure {
    fn to_error(&self) -> Error {
        match self {
            Failure::Open(err) => Error::Open(err.clone()),
            Failure::Recovery { attempts, last } => Error::RecoveryFailed {
                attempts: *attempts,
                last: last.clone(),
            },
        }
    }
}

struct StreamInner {
    config: StreamConfig,
    selector: BackendSelector,
    core: Arc<DispatchCore>,
    events: EventSink,
    control: Mutex<Control>,
    recovery: RecoverySupervisor,
    last_error: Mutex<Option<Failure>>,
    closed: AtomicBool,
}

impl StreamInner {
    fn driver_context(self: &Arc<Self>) -> DriverContext {
        let weak = Arc::downgrade(self);
        DriverContext {
            core: self.core.clone(),
            faults: Arc::new(move |fault: NativeFault| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_fault(fault);
                }
            }),
            events: self.events.clone(),
            policy: SchedulingPolicy::HardwareCallback,
        }
    }

    fn open_driver(self: &Arc<Self>) -> std::result::Result<Box<dyn Driver>, OpenError> {
        self.selector.open(&self.config, &self.driver_context())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Reopen if needed, then start hardware. Returns the backend name.
    fn start_hardware(self: &Arc<Self>, control: &mut Control) -> std::result::Result<String, OpenError> {
        if control.driver.is_none() {
            control.driver = Some(self.open_driver()?);
        }
        let Some(driver) = control.driver.as_mut() else {
            return Err(OpenError::Backend("driver missing after open".into()));
        };

        self.core.rearm_power_policy();
        if let Err(err) = driver.start() {
            // Closing releases any half-started native stream.
            if let Some(driver) = control.driver.take() {
                driver.close();
            }
            return Err(err);
        }
        Ok(driver.negotiated().backend.clone())
    }

    fn apply(self: &Arc<Self>, command: Command) -> Result<()> {
        self.ensure_open()?;
        let mut control = self.control.lock();

        match command {
            Command::Foreground => self.core.set_foreground(true),
            Command::Background => {
                self.core.set_foreground(false);
                self.core.rearm_power_policy();
            }
            _ => {}
        }

        let transition = control.lifecycle.apply(command);
        if transition.from != transition.to {
            debug!("Lifecycle {} -> {}", transition.from, transition.to);
        }

        match transition.action {
            Action::StartHardware => match self.start_hardware(&mut control) {
                Ok(backend) => {
                    if transition.is_resume() {
                        info!("Resumed on {}", backend);
                        self.events.emit(StreamEvent::Resumed);
                    } else {
                        info!("Started on {}", backend);
                        self.events.emit(StreamEvent::Started { backend });
                    }
                }
                Err(err) => {
                    error!("Failed to start stream: {}", err);
                    control.lifecycle.apply(Command::Fail);
                    *self.last_error.lock() = Some(Failure::Open(err.clone()));
                    return Err(Error::Open(err));
                }
            },
            Action::StopHardware => {
                if let Some(driver) = control.driver.as_mut() {
                    driver.stop();
                }
                info!("Stopped");
                self.events.emit(StreamEvent::Stopped);
            }
            Action::None => {}
        }
        Ok(())
    }

    /// Serve a suspend request raised by the dispatcher
    fn suspend(&self) {
        let mut control = self.control.lock();
        let transition = control.lifecycle.apply(Command::Suspend);
        if transition.action != Action::StopHardware {
            // Foregrounded or stopped since the request; let it fire again later.
            self.core.rearm_power_policy();
            return;
        }
        if let Some(driver) = control.driver.as_mut() {
            driver.stop();
        }
        info!("Suspended after background silence");
        self.events.emit(StreamEvent::Suspended);
    }

    fn on_fault(self: &Arc<Self>, fault: NativeFault) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let weak = Arc::downgrade(self);
        let started = self.recovery.notify_fatal(move |guard| {
            if let Some(inner) = weak.upgrade() {
                inner.recover(fault, guard);
            }
        });
        if !started {
            debug!("Ignoring {} while recovery is in progress", fault);
        }
    }

    fn recover(self: &Arc<Self>, fault: NativeFault, _guard: RecoveryGuard) {
        warn!("Device lost ({}), recovering", fault);
        self.events.emit(StreamEvent::DeviceLost { fault });

        // Tear down outside the lock; close blocks until callbacks have quiesced.
        let lost = self.control.lock().driver.take();
        if let Some(driver) = lost {
            driver.close();
        }

        let policy = self.recovery.policy();
        let attempts = policy.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            thread::sleep(policy.grace);
            let mut control = self.control.lock();
            if self.closed.load(Ordering::Acquire) {
                debug!("Stream closed during recovery");
                return;
            }
            if control.driver.is_some() {
                // Reopened by a start call in the meantime.
                return;
            }

            match self.reopen(&mut control) {
                Ok(backend) => {
                    self.core.record_restart();
                    *self.last_error.lock() = None;
                    info!("Recovered on {} after {} attempt(s)", backend, attempt);
                    self.events.emit(StreamEvent::Recovered {
                        backend,
                        attempts: attempt,
                    });
                    return;
                }
                Err(err) => {
                    warn!("Recovery attempt {}/{} failed: {}", attempt, attempts, err);
                    last = Some(err);
                }
            }
        }

        let last = last.unwrap_or_else(|| OpenError::NoBackendAvailable(Vec::new()));
        let mut control = self.control.lock();
        control.lifecycle.apply(Command::Fail);
        error!("Recovery failed after {} attempts: {}", attempts, last);
        self.events.emit(StreamEvent::RecoveryFailed {
            reason: last.to_string(),
        });
        *self.last_error.lock() = Some(Failure::Recovery { attempts, last });
    }

    fn reopen(self: &Arc<Self>, control: &mut Control) -> std::result::Result<String, OpenError> {
        let mut driver = self.open_driver()?;
        if control.lifecycle.state().is_running() {
            self.core.rearm_power_policy();
            driver.start()?;
        }
        let backend = driver.negotiated().backend.clone();
        control.driver = Some(driver);
        Ok(backend)
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let driver = {
            let mut control = self.control.lock();
            control.lifecycle.apply(Command::Stop);
            control.driver.take()
        };
        if let Some(driver) = driver {
            driver.close();
        }
        info!("Stream closed");
    }
}

fn run_control_loop(inner: Weak<StreamInner>, rx: Receiver<ControlEvent>) {
    while let Ok(event) = rx.recv() {
        let Some(inner) = inner.upgrade() else { break };
        match event {
            ControlEvent::SuspendRequested => inner.suspend(),
            ControlEvent::BufferResized(frames) => {
                info!("Hardware buffer grown to {} frames", frames);
                inner.events.emit(StreamEvent::BufferResized { frames });
            }
            ControlEvent::Shutdown => break,
        }
    }
    debug!("Control thread exiting");
}

/// An open duplex stream.
///
/// Control methods must be called from ordinary threads, never from the
/// processing callback. Dropping the handle closes the stream.
pub struct StreamHandle {
    inner: Arc<StreamInner>,
    events: Receiver<StreamEvent>,
    control_tx: Sender<ControlEvent>,
    control_thread: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn start(&self) -> Result<()> {
        debug_assert!(!in_audio_callback(), "start called from an audio callback");
        self.inner.apply(Command::Start)
    }

    pub fn stop(&self) -> Result<()> {
        debug_assert!(!in_audio_callback(), "stop called from an audio callback");
        self.inner.apply(Command::Stop)
    }

    /// The application came to the foreground. Restarts suspended hardware.
    pub fn on_foreground(&self) -> Result<()> {
        debug_assert!(!in_audio_callback(), "on_foreground called from an audio callback");
        self.inner.apply(Command::Foreground)
    }

    /// The application went to the background. Hardware keeps running
    /// until the processor has been silent for a second.
    pub fn on_background(&self) -> Result<()> {
        debug_assert!(!in_audio_callback(), "on_background called from an audio callback");
        self.inner.apply(Command::Background)
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.control.lock().lifecycle.state()
    }

    pub fn stats(&self) -> StreamStats {
        self.inner.core.stats()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &Receiver<StreamEvent> {
        &self.events
    }

    /// What the current driver negotiated; `None` while no driver is open
    pub fn negotiated(&self) -> Option<NegotiatedStream> {
        let control = self.inner.control.lock();
        control.driver.as_ref().map(|d| d.negotiated().clone())
    }

    /// The error that left the stream stopped, if any
    pub fn last_error(&self) -> Option<Error> {
        self.inner.last_error.lock().as_ref().map(Failure::to_error)
    }

    pub fn is_recovering(&self) -> bool {
        self.inner.recovery.in_progress()
    }

    /// Advisory; returns the size the backend applied
    pub fn set_buffer_size_hint(&self, frames: usize) -> Option<usize> {
        debug_assert!(!in_audio_callback(), "buffer hint set from an audio callback");
        let mut control = self.inner.control.lock();
        let applied = control.driver.as_mut().map(|d| d.set_buffer_size_hint(frames));
        if let Some(applied) = applied {
            debug!("Buffer size hint {} -> {} frames", frames, applied);
        }
        applied
    }

    /// Stop and release the hardware; blocks until callbacks have quiesced
    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        debug_assert!(!in_audio_callback(), "stream closed from an audio callback");
        self.inner.shutdown();
        if let Some(thread) = self.control_thread.take() {
            let _ = self.control_tx.send(ControlEvent::Shutdown);
            if thread.join().is_err() {
                warn!("Control thread panicked");
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedHost;
    use crate::error::NativeError;
    use crate::SampleBuffer;
    use std::time::{Duration, Instant};

    fn pass(buf: &mut SampleBuffer<'_>, _: usize, _: u32) -> bool {
        buf.pass_through();
        true
    }

    fn quick() -> RecoveryPolicy {
        RecoveryPolicy {
            grace: Duration::from_millis(5),
            max_attempts: 3,
        }
    }

    fn open(host: &SimulatedHost, config: StreamConfig) -> StreamHandle {
        let selector = BackendSelector::with_native_host(Arc::new(host.clone()));
        DuplexStream::open_with(config, pass, selector, quick()).unwrap()
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_open_does_not_start() {
        let host = SimulatedHost::manual();
        let stream = open(&host, StreamConfig::default());
        assert_eq!(stream.state(), LifecycleState::Stopped);
        assert_eq!(host.running_streams(), 0);
        assert_eq!(stream.negotiated().unwrap().backend, "streaming");
    }

    #[test]
    fn test_start_stop_events() {
        let host = SimulatedHost::manual();
        let stream = open(&host, StreamConfig::default());

        stream.start().unwrap();
        assert_eq!(stream.state(), LifecycleState::ForegroundRunning);
        assert!(host.running_streams() > 0);
        assert_eq!(
            stream.events().try_recv().unwrap(),
            StreamEvent::Started {
                backend: "streaming".into()
            }
        );

        stream.stop().unwrap();
        assert_eq!(host.running_streams(), 0);
        assert_eq!(stream.events().try_recv().unwrap(), StreamEvent::Stopped);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let host = SimulatedHost::manual();
        let selector = BackendSelector::with_native_host(Arc::new(host));
        let config = StreamConfig::new(48_000, 0);
        assert!(matches!(
            DuplexStream::open(config, pass, selector),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_open_failure_reported_synchronously() {
        let host = SimulatedHost::manual();
        host.fail_next_opens(10, NativeError::DeviceBusy);
        let selector = BackendSelector::with_native_host(Arc::new(host));
        match DuplexStream::open(StreamConfig::default(), pass, selector) {
            Err(Error::Open(OpenError::NoBackendAvailable(attempts))) => assert_eq!(attempts.len(), 2),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("open should fail"),
        }
    }

    #[test]
    fn test_close_releases_hardware() {
        let host = SimulatedHost::manual();
        let stream = open(&host, StreamConfig::default());
        stream.start().unwrap();
        stream.close();
        assert_eq!(host.open_streams(), 0);
    }

    #[test]
    fn test_disconnect_recovers() {
        let host = SimulatedHost::manual();
        let stream = open(&host, StreamConfig::default());
        stream.start().unwrap();
        let opens = host.render_opens();

        host.disconnect();
        assert!(wait_for(|| stream.stats().restarts == 1 && !stream.is_recovering()));
        assert_eq!(host.render_opens(), opens + 1);
        assert_eq!(stream.state(), LifecycleState::ForegroundRunning);
        assert!(host.running_streams() > 0);
        assert!(stream.last_error().is_none());

        let events: Vec<_> = stream.events().try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, StreamEvent::DeviceLost { .. })));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Recovered { attempts: 1, .. })));
    }

    #[test]
    fn test_recovery_while_stopped_does_not_start() {
        let host = SimulatedHost::manual();
        let stream = open(&host, StreamConfig::default());
        host.disconnect();
        assert!(wait_for(|| stream.stats().restarts == 1 && !stream.is_recovering()));
        assert_eq!(stream.state(), LifecycleState::Stopped);
        assert_eq!(host.running_streams(), 0);
    }

    #[test]
    fn test_start_after_failed_recovery_reopens() {
        let host = SimulatedHost::manual();
        let stream = open(&host, StreamConfig::default());
        stream.start().unwrap();

        // Two backends times three attempts.
        host.fail_next_opens(6, NativeError::Unavailable("gone".into()));
        host.disconnect();
        assert!(wait_for(|| stream.last_error().is_some() && !stream.is_recovering()));
        assert_eq!(stream.state(), LifecycleState::Stopped);
        assert!(matches!(
            stream.last_error(),
            Some(Error::RecoveryFailed { attempts: 3, .. })
        ));
        assert!(stream.negotiated().is_none());

        stream.start().unwrap();
        assert_eq!(stream.state(), LifecycleState::ForegroundRunning);
        assert!(stream.negotiated().is_some());
    }

    #[test]
    fn test_control_after_close_fails() {
        let host = SimulatedHost::manual();
        let stream = open(&host, StreamConfig::default());
        stream.inner.shutdown();
        assert!(matches!(stream.start(), Err(Error::Closed)));
    }
}
