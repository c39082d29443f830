//! # Duplex Audio I/O
//!
//! Low-latency full-duplex audio streams over interchangeable native
//! backends, with one callback contract for the application.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        StreamHandle (stream)                         │
//! │  start / stop / on_foreground / on_background / events / stats       │
//! │                                                                      │
//! │   ┌──────────────────┐    ┌────────────────────┐                     │
//! │   │ Lifecycle/Power  │◄───│ control thread     │◄── suspend request  │
//! │   └────────┬─────────┘    └────────────────────┘    (from RT side)   │
//! │            │                                                         │
//! │   ┌────────▼─────────┐    ┌────────────────────┐                     │
//! │   │ BackendSelector  │◄───│ RecoverySupervisor │◄── NativeFault      │
//! │   │ streaming, queue │    │ (detached thread)  │                     │
//! │   │ or desktop       │    └────────────────────┘                     │
//! │   └────────┬─────────┘                                               │
//! └────────────┼─────────────────────────────────────────────────────────┘
//!              ▼
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │ Driver (owns native capture/render streams)                  │
//!   │                                                              │
//!   │  capture cb ──► FormatAdapter ──► RingBuffer bridge ──┐      │
//!   │                                                       ▼      │
//!   │  render cb ◄── FormatAdapter ◄── DispatchCore ◄── processor  │
//!   └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing on the real-time path allocates, blocks or waits on a lock.

pub mod audio;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod stream;

pub use audio::processor::{AudioProcessor, SampleBuffer};
pub use config::{RoleHint, SchedulingPolicy, StreamConfig};
pub use error::{Error, OpenError, Result};
pub use event::StreamEvent;
pub use stream::{DuplexStream, LifecycleState, StreamHandle};

/// Crate-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default frames per logical buffer
    pub const DEFAULT_PERIOD_FRAMES: usize = 256;

    /// Largest logical buffer accepted by `StreamConfig::validate`
    pub const MAX_PERIOD_FRAMES: usize = 8192;

    /// Hardware buffer ceiling for the legacy queue backend
    pub const QUEUE_MAX_BUFFER_FRAMES: usize = 1024;

    /// Hardware buffer ceiling for adaptive growth on the streaming backend
    pub const STREAMING_MAX_BUFFER_FRAMES: usize = 4096;

    /// Hardware buffer ceiling for desktop devices
    pub const DESKTOP_MAX_BUFFER_FRAMES: usize = 4096;

    /// After an underrun, wait for this many periods (num / den) before reading again
    pub const UNDERRUN_REFILL_PERIODS: (usize, usize) = (3, 2);

    /// Default latency bound in periods when no explicit target is given
    pub const DEFAULT_LATENCY_PERIODS: usize = 4;

    /// Consecutive buffer errors tolerated before the device counts as lost
    pub const MAX_CONSECUTIVE_BUFFER_ERRORS: u32 = 10;

    /// Pause between tearing a lost device down and reopening it
    pub const RESTART_GRACE_MS: u64 = 200;

    /// Reopen attempts before recovery gives up
    pub const MAX_RESTART_ATTEMPTS: u32 = 3;

    /// How long a stop waits for a native stream to acknowledge
    pub const STOP_ACK_TIMEOUT_MS: u64 = 2000;

    /// Capacity of the application event channel
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;

    /// Capacity of the internal control channel
    pub const CONTROL_CHANNEL_CAPACITY: usize = 16;
}
