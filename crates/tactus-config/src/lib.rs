//! Configuration for the tactus engine.
//!
//! # Features
//!
//! - **Engine config**: [`EngineConfig`] read from and written to TOML, with
//!   defaults for every field and range validation
//! - **Paths**: platform-specific config and session directories
//!
//! # Example
//!
//! ```rust,no_run
//! use tactus_config::{EngineConfig, default_config_path};
//!
//! let config = EngineConfig::load_or_default(default_config_path()).unwrap();
//! config.validate().unwrap();
//! let options = config.engine_options();
//! assert_eq!(options.max_block, config.block_size as usize);
//! ```

mod engine_config;
mod error;

/// Platform-specific paths for configuration and sessions.
pub mod paths;

pub use engine_config::{
    BackendConfig, BackendKind, EngineConfig, MAX_BLOCK_SIZE, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE,
};
pub use error::ConfigError;
pub use paths::{
    CONFIG_FILE, default_config_path, ensure_user_config_dir, ensure_user_sessions_dir,
    find_session, user_config_dir, user_sessions_dir,
};
