//! Platform-specific paths for configuration and saved sessions.
//!
//! - **User config**: `~/.config/tactus/` (Linux), `~/Library/Application Support/tactus/` (macOS), `%APPDATA%\tactus\` (Windows)
//! - **Sessions**: `sessions/` under the user config directory

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Application name used for directory paths.
const APP_NAME: &str = "tactus";

/// Engine configuration file name.
pub const CONFIG_FILE: &str = "engine.toml";

/// Subdirectory name for saved sessions.
const SESSIONS_SUBDIR: &str = "sessions";

/// Returns the user-specific configuration directory.
///
/// Falls back to the current directory if the platform directory cannot be
/// determined.
pub fn user_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Returns the default engine configuration path.
pub fn default_config_path() -> PathBuf {
    user_config_dir().join(CONFIG_FILE)
}

/// Returns the directory holding saved session descriptions.
pub fn user_sessions_dir() -> PathBuf {
    user_config_dir().join(SESSIONS_SUBDIR)
}

/// Creates the user configuration directory if needed.
pub fn ensure_user_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = user_config_dir();
    ensure_dir(&dir)?;
    Ok(dir)
}

/// Creates the sessions directory if needed.
pub fn ensure_user_sessions_dir() -> Result<PathBuf, ConfigError> {
    let dir = user_sessions_dir();
    ensure_dir(&dir)?;
    Ok(dir)
}

fn ensure_dir(dir: &Path) -> Result<(), ConfigError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::create_dir(dir, e))?;
    }
    Ok(())
}

/// Finds a session description.
///
/// `name` may be a path to an existing file, or a session name looked up in
/// [`user_sessions_dir`] with or without its `.json` extension.
pub fn find_session(name: &str) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.is_file() {
        return Some(direct.to_path_buf());
    }
    find_session_in(&user_sessions_dir(), name)
}

fn find_session_in(dir: &Path, name: &str) -> Option<PathBuf> {
    let file = if Path::new(name).extension().is_some_and(|e| e == "json") {
        name.to_string()
    } else {
        format!("{name}.json")
    };
    let path = dir.join(file);
    path.is_file().then_some(path)
}
