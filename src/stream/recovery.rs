//! Recovery from fatal device loss

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::constants::{MAX_RESTART_ATTEMPTS, RESTART_GRACE_MS};

/// "Restart in progress" flag shared by fault callbacks.
///
/// Acquired with a single compare-exchange and released when the
/// [`RecoveryGuard`] drops.
#[derive(Debug, Default)]
pub struct RecoveryToken {
    held: AtomicBool,
}

impl RecoveryToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<RecoveryGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RecoveryGuard { token: self.clone() })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Holds the token until the recovery finishes, successfully or not
#[derive(Debug)]
pub struct RecoveryGuard {
    token: Arc<RecoveryToken>,
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        self.token.held.store(false, Ordering::Release);
    }
}

/// Timing of the teardown/reopen cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Pause after teardown and between reopen attempts
    pub grace: Duration,
    pub max_attempts: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(RESTART_GRACE_MS),
            max_attempts: MAX_RESTART_ATTEMPTS,
        }
    }
}

/// Runs at most one recovery at a time, each on its own detached thread
#[derive(Debug)]
pub struct RecoverySupervisor {
    token: Arc<RecoveryToken>,
    policy: RecoveryPolicy,
}

impl RecoverySupervisor {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            token: RecoveryToken::new(),
            policy,
        }
    }

    pub fn policy(&self) -> RecoveryPolicy {
        self.policy
    }

    pub fn in_progress(&self) -> bool {
        self.token.is_held()
    }

    /// Start `job` on a recovery thread unless one is already running.
    ///
    /// Returns whether a recovery was started. The job receives the guard
    /// and the token is released when the job drops it.
    pub fn notify_fatal<F>(&self, job: F) -> bool
    where
        F: FnOnce(RecoveryGuard) + Send + 'static,
    {
        let Some(guard) = self.token.try_acquire() else {
            debug!("Recovery already in progress");
            return false;
        };

        match thread::Builder::new()
            .name("duplex-recovery".into())
            .spawn(move || job(guard))
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to spawn recovery thread: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_token_is_exclusive() {
        let token = RecoveryToken::new();
        let guard = token.try_acquire();
        assert!(guard.is_some());
        assert!(token.try_acquire().is_none());
        drop(guard);
        assert!(!token.is_held());
        assert!(token.try_acquire().is_some());
    }

    #[test]
    fn test_second_notification_ignored_while_running() {
        let supervisor = RecoverySupervisor::new(RecoveryPolicy::default());
        let runs = Arc::new(AtomicU32::new(0));
        let (release_tx, release_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let counter = runs.clone();
        assert!(supervisor.notify_fatal(move |_guard| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.recv();
            let _ = done_tx.send(());
        }));

        let counter = runs.clone();
        assert!(!supervisor.notify_fatal(move |_guard| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(supervisor.in_progress());

        release_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // The guard drops right after the job returns.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while supervisor.in_progress() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!supervisor.in_progress());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_policy() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.grace, Duration::from_millis(200));
        assert_eq!(policy.max_attempts, 3);
    }
}
