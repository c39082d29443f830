//! Stream and application configuration

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::audio::format::StreamFormat;
use crate::constants::*;
use crate::error::{Error, Result};

/// Intended use of a stream, used for backend choice and OS tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleHint {
    #[default]
    General,
    /// Capture that relies on OS voice processing (echo cancellation etc.)
    VoiceCapture,
    /// Output categorised as media playback
    MediaPlayback,
}

impl std::fmt::Display for RoleHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoleHint::General => "general",
            RoleHint::VoiceCapture => "voice-capture",
            RoleHint::MediaPlayback => "media-playback",
        };
        f.write_str(name)
    }
}

/// How processing is scheduled once a backend is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Process directly on the hardware callback thread
    #[default]
    HardwareCallback,
    /// Process on a dedicated worker woken by the capture callback
    DedicatedWorker,
}

/// Parameters of one duplex stream. Immutable once the stream is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Frames per logical buffer
    pub frames: usize,

    /// Interleaved channels seen by the processor
    pub channels: u16,

    /// Capture enabled
    pub input: bool,

    /// Render enabled
    pub output: bool,

    pub role: RoleHint,

    /// Fixed end-to-end latency target in frames
    pub latency_target: Option<usize>,

    /// Advisory hardware buffer size in frames
    pub buffer_size_hint: Option<usize>,

    /// Device id from [`list_devices`](crate::audio::device::list_devices)
    pub device_id: Option<String>,

    /// Suspend hardware after a second of background silence
    pub power_saving: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frames: DEFAULT_PERIOD_FRAMES,
            channels: DEFAULT_CHANNELS,
            input: true,
            output: true,
            role: RoleHint::General,
            latency_target: None,
            buffer_size_hint: None,
            device_id: None,
            power_saving: true,
        }
    }
}

impl StreamConfig {
    pub fn new(sample_rate: u32, frames: usize) -> Self {
        Self {
            sample_rate,
            frames,
            ..Self::default()
        }
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_input(mut self, enabled: bool) -> Self {
        self.input = enabled;
        self
    }

    pub fn with_output(mut self, enabled: bool) -> Self {
        self.output = enabled;
        self
    }

    pub fn with_role(mut self, role: RoleHint) -> Self {
        self.role = role;
        self
    }

    pub fn with_latency_target(mut self, frames: usize) -> Self {
        self.latency_target = Some(frames);
        self
    }

    pub fn with_buffer_size_hint(mut self, frames: usize) -> Self {
        self.buffer_size_hint = Some(frames);
        self
    }

    pub fn with_device(mut self, id: impl Into<String>) -> Self {
        self.device_id = Some(id.into());
        self
    }

    pub fn with_power_saving(mut self, enabled: bool) -> Self {
        self.power_saving = enabled;
        self
    }

    /// Application-side format
    pub fn format(&self) -> StreamFormat {
        StreamFormat::new(self.sample_rate, self.channels)
    }

    pub fn is_duplex(&self) -> bool {
        self.input && self.output
    }

    /// Hardware buffer size to ask for: the hint if given, else the period.
    pub fn requested_buffer_frames(&self) -> usize {
        self.buffer_size_hint.unwrap_or(self.frames).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::Config("sample rate must be non-zero".into()));
        }
        if self.frames == 0 || self.frames > MAX_PERIOD_FRAMES {
            return Err(Error::Config(format!(
                "frames per buffer must be in 1..={MAX_PERIOD_FRAMES}, got {}",
                self.frames
            )));
        }
        if self.channels == 0 {
            return Err(Error::Config("channel count must be non-zero".into()));
        }
        if !self.input && !self.output {
            return Err(Error::Config("stream needs input, output or both".into()));
        }
        Ok(())
    }
}

/// Settings for the loopback demo, stored as TOML in the user config dir
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sample_rate: u32,
    pub frames: usize,
    pub channels: u16,
    pub input: bool,
    pub output: bool,
    pub role: RoleHint,
    pub latency_target: Option<usize>,
    pub buffer_size_hint: Option<usize>,
    pub device_id: Option<String>,
    pub power_saving: bool,
    /// Seconds between statistics log lines
    pub stats_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let stream = StreamConfig::default();
        Self {
            sample_rate: stream.sample_rate,
            frames: stream.frames,
            channels: stream.channels,
            input: stream.input,
            output: stream.output,
            role: stream.role,
            latency_target: stream.latency_target,
            buffer_size_hint: stream.buffer_size_hint,
            device_id: stream.device_id,
            power_saving: stream.power_saving,
            stats_interval_secs: 5,
        }
    }
}

impl AppConfig {
    /// Load from the platform config directory, or defaults if no file exists.
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from an explicit path; a missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            sample_rate: self.sample_rate,
            frames: self.frames,
            channels: self.channels,
            input: self.input,
            output: self.output,
            role: self.role,
            latency_target: self.latency_target,
            buffer_size_hint: self.buffer_size_hint,
            device_id: self.device_id.clone(),
            power_saving: self.power_saving,
        }
    }
}

/// `<config dir>/duplex-audio-io/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "duplex-audio-io").map(|dirs| dirs.config_dir().join("config.toml"))
}
