//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn, Level};

use super::types::DualinkSettings;
use super::Result;

const ENV_URL: &str = "DUALINK_URL";
const ENV_CONNECT_TIMEOUT_MS: &str = "DUALINK_CONNECT_TIMEOUT_MS";
const ENV_LOG_LEVEL: &str = "DUALINK_LOG_LEVEL";
const ENV_LOG_JSON: &str = "DUALINK_LOG_JSON";

/// Resolve the path to the settings file (`~/.dualink/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".dualink").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DualinkSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<DualinkSettings> {
    let defaults = serde_json::to_value(DualinkSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: DualinkSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `DUALINK_*` environment variable overrides.
pub fn apply_env_overrides(settings: &mut DualinkSettings) {
    apply_overrides(settings, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary key lookup. Invalid values are logged
/// and ignored, keeping the file/default value.
pub fn apply_overrides<F>(settings: &mut DualinkSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(v) = read(ENV_URL) {
        settings.transport.url = v;
    }
    if let Some(v) = read(ENV_CONNECT_TIMEOUT_MS) {
        match parse_u64_range(&v, 1, 600_000) {
            Some(ms) => settings.transport.connect_timeout_ms = Some(ms),
            None => warn!(key = ENV_CONNECT_TIMEOUT_MS, value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read(ENV_LOG_LEVEL) {
        match parse_level(&v) {
            Some(level) => settings.logging.level = level,
            None => warn!(key = ENV_LOG_LEVEL, value = %v, "invalid log level env var, ignoring"),
        }
    }
    if let Some(v) = read(ENV_LOG_JSON) {
        match parse_bool(&v) {
            Some(json) => settings.logging.json = json,
            None => warn!(key = ENV_LOG_JSON, value = %v, "invalid boolean env var, ignoring"),
        }
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Normalize a log level name (`trace` through `error`, case-insensitive).
pub fn parse_level(val: &str) -> Option<String> {
    Level::from_str(val.trim())
        .ok()
        .map(|level| level.to_string().to_lowercase())
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
