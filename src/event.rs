//! Notifications delivered to the application
//!
//! Events are informational. Failures that need action are also reflected
//! in [`StreamHandle::state`](crate::stream::StreamHandle::state) and
//! [`StreamHandle::last_error`](crate::stream::StreamHandle::last_error).

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::backend::native::NativeFault;
use crate::constants::EVENT_CHANNEL_CAPACITY;

/// Stream lifecycle and health notifications
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Hardware streams started
    Started { backend: String },

    /// Hardware streams stopped on request
    Stopped,

    /// Hardware stopped after a second of silence in the background
    Suspended,

    /// Hardware restarted after a suspend
    Resumed,

    /// Capture could not be opened (usually a refused permission); the
    /// stream carries on output-only
    InputDisabled { reason: String },

    /// The backend grew its hardware buffer after detecting glitches
    BufferResized { frames: usize },

    /// The device went away; recovery is in progress
    DeviceLost { fault: NativeFault },

    /// Recovery reopened the stream
    Recovered { backend: String, attempts: u32 },

    /// Recovery gave up; the stream is stopped
    RecoveryFailed { reason: String },
}

/// Sending side of the event channel. Never blocks; events are dropped
/// when the application is not draining them.
#[derive(Clone)]
pub struct EventSink {
    tx: Sender<StreamEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, Receiver<StreamEvent>) {
        let (tx, rx) = bounded(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: StreamEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                tracing::debug!(?event, "event channel full, dropping");
            }
        }
    }
}

/// Requests raised on audio threads and served by the stream's control thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlEvent {
    /// Background silence crossed the power-saving threshold
    SuspendRequested,
    /// The backend grew its buffer
    BufferResized(usize),
    Shutdown,
}
