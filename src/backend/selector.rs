//! Backend selection with fallback

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::native::NativeHost;
use super::{Backend, Driver, DriverContext, QueueBackend, StreamingBackend};
use crate::config::{SchedulingPolicy, StreamConfig};
use crate::error::OpenError;

/// Tries backends in preference order until one opens.
///
/// Host capabilities are queried once, when the backends are built, and
/// reused for every open and every recovery reopen. A failure whose
/// error does not allow fallback ends the search early.
#[derive(Clone)]
pub struct BackendSelector {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendSelector {
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
        Self { backends }
    }

    /// Streaming first when the host has the capability, queue always
    pub fn with_native_host(host: Arc<dyn NativeHost>) -> Self {
        let caps = host.capabilities();
        let mut backends: Vec<Arc<dyn Backend>> = Vec::new();
        if caps.low_latency_streaming {
            backends.push(Arc::new(StreamingBackend::new(host.clone())));
        }
        backends.push(Arc::new(QueueBackend::new(host)));
        Self::new(backends)
    }

    /// The default backends for this build
    #[cfg(feature = "desktop")]
    pub fn for_platform() -> Result<Self, OpenError> {
        Ok(Self::new(vec![Arc::new(super::desktop::DesktopBackend::new())]))
    }

    /// The default backends for this build
    #[cfg(not(feature = "desktop"))]
    pub fn for_platform() -> Result<Self, OpenError> {
        Err(OpenError::NoBackendAvailable(Vec::new()))
    }

    pub fn backends(&self) -> impl Iterator<Item = &dyn Backend> {
        self.backends.iter().map(|b| b.as_ref())
    }

    /// Open the first backend that accepts `config` and succeeds.
    pub fn open(&self, config: &StreamConfig, ctx: &DriverContext) -> Result<Box<dyn Driver>, OpenError> {
        let mut attempts = Vec::new();

        for backend in &self.backends {
            if let Err(reason) = backend.accepts(config) {
                debug!("Skipping backend {}: {}", backend.name(), reason);
                attempts.push((backend.name().to_string(), reason));
                continue;
            }

            let policy = if backend.capabilities().prefers_worker_thread {
                SchedulingPolicy::DedicatedWorker
            } else {
                SchedulingPolicy::HardwareCallback
            };

            match backend.open(config, &ctx.with_policy(policy)) {
                Ok(driver) => {
                    info!("Using backend {}", backend.name());
                    return Ok(driver);
                }
                Err(err) => {
                    warn!("Backend {} failed to open: {}", backend.name(), err);
                    let fallback = err.allows_fallback();
                    attempts.push((backend.name().to_string(), err));
                    if !fallback {
                        break;
                    }
                }
            }
        }

        Err(OpenError::NoBackendAvailable(attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::StreamFormat;
    use crate::audio::processor::processor_slot;
    use crate::backend::native::{HostCapabilities, NativeFault};
    use crate::backend::simulated::{SimulatedHost, SimulatedHostConfig};
    use crate::config::RoleHint;
    use crate::dispatch::DispatchCore;
    use crate::error::NativeError;
    use crate::event::EventSink;
    use crate::SampleBuffer;
    use crossbeam_channel::bounded;

    fn ctx(config: &StreamConfig) -> DriverContext {
        let (tx, _rx) = bounded(4);
        let (events, _) = EventSink::channel();
        DriverContext {
            core: Arc::new(DispatchCore::new(
                config,
                processor_slot(|_: &mut SampleBuffer<'_>, _: usize, _: u32| true),
                tx,
            )),
            faults: Arc::new(|_: NativeFault| {}),
            events,
            policy: SchedulingPolicy::HardwareCallback,
        }
    }

    fn host_with(caps: HostCapabilities) -> SimulatedHost {
        SimulatedHost::new(SimulatedHostConfig {
            capabilities: caps,
            ..SimulatedHostConfig::default()
        })
    }

    #[test]
    fn test_prefers_streaming() {
        let host = SimulatedHost::manual();
        let selector = BackendSelector::with_native_host(Arc::new(host));
        let names: Vec<_> = selector.backends().map(|b| b.name().to_string()).collect();
        assert_eq!(names, vec!["streaming", "queue"]);

        let config = StreamConfig::default();
        let driver = selector.open(&config, &ctx(&config)).unwrap();
        assert_eq!(driver.negotiated().backend, "streaming");
    }

    #[test]
    fn test_voice_capture_falls_back_to_queue() {
        let selector = BackendSelector::with_native_host(Arc::new(SimulatedHost::manual()));
        let config = StreamConfig::default().with_role(RoleHint::VoiceCapture);
        let driver = selector.open(&config, &ctx(&config)).unwrap();
        assert_eq!(driver.negotiated().backend, "queue");
    }

    #[test]
    fn test_format_failure_falls_back() {
        let host = SimulatedHost::manual();
        host.force_capture_format(Some(StreamFormat::new(44_100, 1)));
        let selector = BackendSelector::with_native_host(Arc::new(host));
        let config = StreamConfig::default();
        let driver = selector.open(&config, &ctx(&config)).unwrap();
        assert_eq!(driver.negotiated().backend, "queue");
        assert_eq!(driver.negotiated().capture, Some(StreamFormat::new(44_100, 1)));
    }

    #[test]
    fn test_all_backends_failing_reports_each() {
        let host = SimulatedHost::manual();
        host.fail_next_opens(10, NativeError::DeviceBusy);
        let selector = BackendSelector::with_native_host(Arc::new(host));
        let config = StreamConfig::default();
        match selector.open(&config, &ctx(&config)) {
            Err(OpenError::NoBackendAvailable(attempts)) => {
                let names: Vec<_> = attempts.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["streaming", "queue"]);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("open should fail"),
        }
    }

    #[test]
    fn test_refused_permission_stops_the_chain() {
        let host = SimulatedHost::manual();
        host.deny_capture_permission(true);
        let selector = BackendSelector::with_native_host(Arc::new(host.clone()));
        let config = StreamConfig::default().with_output(false);
        match selector.open(&config, &ctx(&config)) {
            Err(OpenError::NoBackendAvailable(attempts)) => {
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].0, "streaming");
                assert!(matches!(attempts[0].1, OpenError::PermissionDenied(_)));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("open should fail"),
        }
        assert_eq!(host.open_streams(), 0);
    }

    #[test]
    fn test_worker_policy_for_quirky_hosts() {
        let host = host_with(HostCapabilities {
            low_latency_streaming: false,
            pull_capture: false,
            prefers_worker_thread: true,
        });
        let selector = BackendSelector::with_native_host(Arc::new(host));
        assert_eq!(selector.backends().count(), 1);

        let config = StreamConfig::default();
        let driver = selector.open(&config, &ctx(&config)).unwrap();
        assert_eq!(driver.negotiated().policy, SchedulingPolicy::DedicatedWorker);
    }

    #[cfg(not(feature = "desktop"))]
    #[test]
    fn test_no_platform_backend_without_desktop() {
        assert!(matches!(
            BackendSelector::for_platform(),
            Err(OpenError::NoBackendAvailable(_))
        ));
    }
}
