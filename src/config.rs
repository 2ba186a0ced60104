//! Application configuration
//!
//! Loaded from TOML. Every field has a default, so a missing file or a
//! partial file is fine:
//!
//! ```toml
//! [audio]
//! sample_rate = 32000
//! frames_per_buffer = 320
//!
//! [jitter]
//! min_playout_delay = 3
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::echo::AEC_SAMPLE_RATES;
use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub jitter: JitterConfig,
    pub echo: EchoConfig,
    pub network: NetworkConfig,
    pub controls: ControlDefaults,
}

/// Device and framing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Samples per tick and per packet
    pub frames_per_buffer: usize,
    /// Device channel count; the call itself is always mono
    pub channels: u16,
    /// Outbound ring buffer length
    pub ring_buffer_ms: u32,
    /// Input device name, default device when unset
    pub input_device: Option<String>,
    /// Output device name, default device when unset
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frames_per_buffer: DEFAULT_FRAMES_PER_BUFFER,
            channels: DEFAULT_CHANNELS,
            ring_buffer_ms: DEFAULT_RING_BUFFER_MS,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    /// Ring buffer capacity in samples
    pub fn ring_buffer_samples(&self) -> usize {
        (self.sample_rate as u64 * self.ring_buffer_ms as u64 / 1000) as usize
    }

    /// Duration of one tick
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames_per_buffer as f64 / self.sample_rate as f64)
    }
}

/// Receive-side jitter buffer sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    pub capacity: usize,
    pub min_playout_delay: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_JITTER_SLOTS,
            min_playout_delay: DEFAULT_MIN_PLAYOUT_DELAY,
        }
    }
}

/// Echo canceller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    /// AEC3 when set, pass-through otherwise
    pub enabled: bool,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Transport settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Sender pacing; one frame duration when unset
    pub send_interval_ms: Option<u64>,
}

/// Initial values for the runtime tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlDefaults {
    pub gain: f32,
    pub noise_gate_threshold: f32,
}

impl Default for ControlDefaults {
    fn default() -> Self {
        Self {
            gain: DEFAULT_GAIN,
            noise_gate_threshold: DEFAULT_NOISE_GATE_THRESHOLD,
        }
    }
}

impl AppConfig {
    /// Parse from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        tracing::info!("Loaded config from {}", path.display());
        Self::from_toml(&content)
    }

    /// Load from the platform config directory
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// `<config dir>/p2p-voice-call/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "p2p-voice-call")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Pacing interval for the sender loop
    pub fn send_interval(&self) -> Duration {
        self.network
            .send_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.audio.frame_duration())
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be positive".into()));
        }
        if self.audio.frames_per_buffer == 0 {
            return Err(Error::Config("frames_per_buffer must be positive".into()));
        }
        if self.audio.channels == 0 {
            return Err(Error::Config("channels must be positive".into()));
        }
        if self.audio.ring_buffer_samples() < self.audio.frames_per_buffer {
            return Err(Error::Config(format!(
                "ring buffer ({} samples) is smaller than one frame ({})",
                self.audio.ring_buffer_samples(),
                self.audio.frames_per_buffer
            )));
        }
        if self.jitter.capacity == 0 {
            return Err(Error::Config("jitter capacity must be positive".into()));
        }
        if self.jitter.min_playout_delay == 0 || self.jitter.min_playout_delay > self.jitter.capacity {
            return Err(Error::Config(format!(
                "min_playout_delay must be in 1..={}",
                self.jitter.capacity
            )));
        }
        if self.echo.enabled && !AEC_SAMPLE_RATES.contains(&self.audio.sample_rate) {
            return Err(Error::Config(format!(
                "echo cancellation needs a sample rate of {:?} Hz, got {}",
                AEC_SAMPLE_RATES, self.audio.sample_rate
            )));
        }
        if self.network.send_interval_ms == Some(0) {
            return Err(Error::Config("send_interval_ms must be positive".into()));
        }
        Ok(())
    }
}
