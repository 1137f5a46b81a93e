//! Engine configuration file format.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tactus_core::{DEFAULT_EVENT_CAPACITY, EngineOptions};

use crate::error::ConfigError;

/// Lowest sample rate accepted by [`EngineConfig::validate`].
pub const MIN_SAMPLE_RATE: u32 = 8_000;
/// Highest sample rate accepted by [`EngineConfig::validate`].
pub const MAX_SAMPLE_RATE: u32 = 384_000;
/// Largest block size accepted by [`EngineConfig::validate`].
pub const MAX_BLOCK_SIZE: u32 = 8192;

/// Which backend drives the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// System audio through cpal.
    #[default]
    Cpal,
    /// Silent timer-driven backend.
    Null,
}

/// `[backend]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend to open.
    #[serde(default)]
    pub kind: BackendKind,

    /// Output device name filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Input channels; zero opens no input.
    #[serde(default)]
    pub input_channels: u16,

    /// Output channels.
    #[serde(default = "default_output_channels")]
    pub output_channels: u16,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            device: None,
            input_channels: 0,
            output_channels: default_output_channels(),
        }
    }
}

/// Engine configuration.
///
/// Every field has a default, so an empty file is a valid configuration.
///
/// # TOML Format
///
/// ```toml
/// sample_rate = 48000
/// block_size = 256
/// max_parallelism = 4
/// return_to_cue = true
///
/// [backend]
/// kind = "cpal"
/// device = "USB"
/// input_channels = 2
/// output_channels = 2
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Requested sample rate in Hz.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Requested block size in frames.
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Largest number of concurrent work units per stage.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// Worker threads; 0 derives them from `max_parallelism`.
    #[serde(default)]
    pub worker_threads: usize,

    /// Whether stop returns to the cue point.
    #[serde(default = "default_true")]
    pub return_to_cue: bool,

    /// Initial tempo in BPM.
    #[serde(default = "default_bpm")]
    pub bpm: f64,

    /// Capacity of each event port.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Seconds of audio buffered per armed node.
    #[serde(default = "default_record_buffer_seconds")]
    pub record_buffer_seconds: f64,

    /// Failure reports buffered between monitor polls.
    #[serde(default = "default_failure_queue_capacity")]
    pub failure_queue_capacity: usize,

    /// Transport commands buffered between blocks.
    #[serde(default = "default_command_queue_capacity")]
    pub command_queue_capacity: usize,

    /// Backend selection.
    #[serde(default)]
    pub backend: BackendConfig,
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_block_size() -> u32 {
    256
}

fn default_max_parallelism() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_bpm() -> f64 {
    120.0
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_record_buffer_seconds() -> f64 {
    4.0
}

fn default_failure_queue_capacity() -> usize {
    1024
}

fn default_command_queue_capacity() -> usize {
    256
}

fn default_output_channels() -> u16 {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            block_size: default_block_size(),
            max_parallelism: default_max_parallelism(),
            worker_threads: 0,
            return_to_cue: true,
            bpm: default_bpm(),
            event_capacity: default_event_capacity(),
            record_buffer_seconds: default_record_buffer_seconds(),
            failure_queue_capacity: default_failure_queue_capacity(),
            command_queue_capacity: default_command_queue_capacity(),
            backend: BackendConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        Self::from_toml(&content)
    }

    /// Load the file at `path` if it exists, the defaults otherwise.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load a configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Save the configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))?;
        Ok(())
    }

    /// Convert the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks that the engine can run with these values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(ConfigError::invalid(
                "sample_rate",
                format!(
                    "{} Hz is outside {MIN_SAMPLE_RATE}..={MAX_SAMPLE_RATE}",
                    self.sample_rate
                ),
            ));
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::invalid(
                "block_size",
                format!("{} is outside 1..={MAX_BLOCK_SIZE}", self.block_size),
            ));
        }
        if self.max_parallelism == 0 {
            return Err(ConfigError::invalid("max_parallelism", "must be at least 1"));
        }
        if !(self.bpm.is_finite() && self.bpm > 0.0) {
            return Err(ConfigError::invalid("bpm", format!("{} is not a tempo", self.bpm)));
        }
        if !(self.record_buffer_seconds.is_finite() && self.record_buffer_seconds > 0.0) {
            return Err(ConfigError::invalid(
                "record_buffer_seconds",
                "must be positive",
            ));
        }
        if self.backend.output_channels == 0 {
            return Err(ConfigError::invalid(
                "backend.output_channels",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Engine options for this configuration at the requested rate and block size.
    ///
    /// Use [`engine_options_for`](Self::engine_options_for) once the backend
    /// has negotiated the actual values.
    pub fn engine_options(&self) -> EngineOptions {
        self.engine_options_for(self.sample_rate, self.block_size)
    }

    /// Engine options with a negotiated sample rate and block size.
    pub fn engine_options_for(&self, sample_rate: u32, block_size: u32) -> EngineOptions {
        EngineOptions {
            sample_rate: f64::from(sample_rate),
            max_block: block_size as usize,
            max_parallelism: self.max_parallelism,
            worker_threads: self.worker_threads,
            event_capacity: self.event_capacity,
            failure_queue_capacity: self.failure_queue_capacity,
            command_queue_capacity: self.command_queue_capacity,
            return_to_cue: self.return_to_cue,
            bpm: self.bpm,
            record_buffer_seconds: self.record_buffer_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_backend_table() {
        let config = EngineConfig::from_toml(
            r#"
            block_size = 128

            [backend]
            kind = "null"
            input_channels = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.block_size, 128);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.backend.kind, BackendKind::Null);
        assert_eq!(config.backend.input_channels, 2);
        assert_eq!(config.backend.output_channels, 2);
        assert!(config.backend.device.is_none());
    }

    #[test]
    fn unknown_backend_kind_rejected() {
        let err = EngineConfig::from_toml("[backend]\nkind = \"jack\"").unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(_)));
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let cases = [
            EngineConfig {
                sample_rate: 4000,
                ..EngineConfig::default()
            },
            EngineConfig {
                block_size: 0,
                ..EngineConfig::default()
            },
            EngineConfig {
                max_parallelism: 0,
                ..EngineConfig::default()
            },
            EngineConfig {
                bpm: f64::NAN,
                ..EngineConfig::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidValue { .. })),
                "{config:?} should be invalid"
            );
        }
    }

    #[test]
    fn engine_options_follow_negotiation() {
        let config = EngineConfig {
            max_parallelism: 3,
            bpm: 90.0,
            return_to_cue: false,
            ..EngineConfig::default()
        };
        let options = config.engine_options_for(44100, 512);
        assert_eq!(options.sample_rate, 44100.0);
        assert_eq!(options.max_block, 512);
        assert_eq!(options.max_parallelism, 3);
        assert_eq!(options.bpm, 90.0);
        assert!(!options.return_to_cue);
        assert_eq!(config.engine_options().max_block, 256);
    }
}
