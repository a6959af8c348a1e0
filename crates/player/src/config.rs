use std::path::{Path, PathBuf};
use std::time::Duration;

use frame_scheduler::{PacingConfig, PacingConfigError};
use serde::Deserialize;
use thiserror::Error;
use tile_polling::PollingConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{field} {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Pacing(#[from] PacingConfigError),
}

/// Playback settings, read from the `[playback]` table of a TOML file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlayerConfig {
    /// Frame buffers cycling between preparing, ready and presenting.
    pub pool_size: usize,
    pub target_fps: f64,
    pub jitter_multiplier: f64,
    /// Non-blocking hand-off pops per presentation tick.
    pub drain_attempts_per_tick: usize,
    pub poll_idle_backoff_ms: u64,
    pub fov_hint_capacity: usize,
    pub stats_log_interval_secs: f64,
    pub trace_path: Option<PathBuf>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            target_fps: 30.0,
            jitter_multiplier: 3.0,
            drain_attempts_per_tick: 3,
            poll_idle_backoff_ms: 1,
            fov_hint_capacity: 16,
            stats_log_interval_secs: 3.0,
            trace_path: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    playback: PlayerConfig,
}

impl PlayerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        file.playback.validate()?;
        Ok(file.playback)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(invalid("pool_size", "must be at least 1"));
        }
        if self.drain_attempts_per_tick == 0 {
            return Err(invalid("drain_attempts_per_tick", "must be at least 1"));
        }
        if self.fov_hint_capacity == 0 {
            return Err(invalid("fov_hint_capacity", "must be at least 1"));
        }
        if !self.stats_log_interval_secs.is_finite() || self.stats_log_interval_secs <= 0.0 {
            return Err(invalid("stats_log_interval_secs", "must be above zero"));
        }
        if Duration::try_from_secs_f64(self.stats_log_interval_secs).is_err() {
            return Err(invalid("stats_log_interval_secs", "is too long to represent"));
        }
        self.pacing().validate()?;
        Ok(())
    }

    pub fn pacing(&self) -> PacingConfig {
        PacingConfig {
            target_fps: self.target_fps,
            jitter_multiplier: self.jitter_multiplier,
        }
    }

    pub fn polling(&self) -> PollingConfig {
        PollingConfig {
            idle_backoff: Duration::from_millis(self.poll_idle_backoff_ms),
        }
    }

    pub fn stats_log_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.stats_log_interval_secs).unwrap_or(Duration::MAX)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_owned(),
    }
}
