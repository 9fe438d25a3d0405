//! Layered configuration.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`DualinkSettings::default()`]
//! 2. **User file**: `~/.dualink/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `DUALINK_*` overrides (highest priority)

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    parse_bool, parse_level, parse_u64_range, settings_path,
};
pub use types::{DualinkSettings, LoggingSettings, TransportSettings};

use thiserror::Error;

/// Errors that can occur when loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
