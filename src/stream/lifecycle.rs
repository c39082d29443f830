//! Lifecycle and power state machine
//!
//! Pure bookkeeping: [`Lifecycle::apply`] says what the hardware should do
//! and the stream carries it out. Nothing here touches a driver.

/// Where a stream is in its application-visible lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Stopped,
    ForegroundRunning,
    /// App in background, hardware still running
    BackgroundRunning,
    /// App in background, hardware stopped after a second of silence
    BackgroundSuspended,
}

impl LifecycleState {
    /// Whether the hardware should be delivering callbacks
    pub fn is_running(self) -> bool {
        matches!(
            self,
            LifecycleState::ForegroundRunning | LifecycleState::BackgroundRunning
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::ForegroundRunning => "foreground-running",
            LifecycleState::BackgroundRunning => "background-running",
            LifecycleState::BackgroundSuspended => "background-suspended",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Foreground,
    Background,
    /// Background silence threshold reached
    Suspend,
    /// Hardware could not be (re)started
    Fail,
}

/// What the hardware has to do for a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    StartHardware,
    StopHardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub action: Action,
}

impl Transition {
    /// Hardware restarting after a background suspend
    pub fn is_resume(&self) -> bool {
        self.from == LifecycleState::BackgroundSuspended && self.action == Action::StartHardware
    }
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: LifecycleState,
    foreground: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// A stopped stream of an application in the foreground
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Stopped,
            foreground: true,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    fn running_state(&self) -> LifecycleState {
        if self.foreground {
            LifecycleState::ForegroundRunning
        } else {
            LifecycleState::BackgroundRunning
        }
    }

    pub fn apply(&mut self, command: Command) -> Transition {
        use LifecycleState::*;

        let from = self.state;
        let (to, action) = match command {
            Command::Start => match from {
                Stopped | BackgroundSuspended => (self.running_state(), Action::StartHardware),
                running => (running, Action::None),
            },
            Command::Stop => {
                let action = if from.is_running() {
                    Action::StopHardware
                } else {
                    Action::None
                };
                (Stopped, action)
            }
            // Resume always ends up running.
            Command::Foreground => {
                self.foreground = true;
                match from {
                    Stopped | BackgroundSuspended => (ForegroundRunning, Action::StartHardware),
                    _ => (ForegroundRunning, Action::None),
                }
            }
            Command::Background => {
                self.foreground = false;
                match from {
                    ForegroundRunning => (BackgroundRunning, Action::None),
                    other => (other, Action::None),
                }
            }
            Command::Suspend => match from {
                BackgroundRunning => (BackgroundSuspended, Action::StopHardware),
                other => (other, Action::None),
            },
            Command::Fail => (Stopped, Action::None),
        };

        self.state = to;
        Transition { from, to, action }
    }
}
