use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DualinkSettings {
    pub transport: TransportSettings,
    pub logging: LoggingSettings,
}

impl DualinkSettings {
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()
    }
}

/// Connection target and connect behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Endpoint the connector opens, e.g. `https://localhost:4433/`.
    pub url: String,
    /// Upper bound on waiting for the connection to become ready.
    /// `None` waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            url: "https://localhost:4433/".to_string(),
            connect_timeout_ms: None,
        }
    }
}

impl TransportSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(SettingsError::InvalidValue("transport url must not be empty".into()));
        }
        match url.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => Ok(()),
            _ => Err(SettingsError::InvalidValue(format!(
                "transport url must include a scheme and host: {url}"
            ))),
        }
    }
}

/// Log output configuration consumed by the telemetry crate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module level overrides, e.g. `{"dualink_transport": "trace"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_target_is_local_endpoint() {
        let settings = DualinkSettings::default();
        assert_eq!(settings.transport.url, "https://localhost:4433/");
        assert!(settings.transport.connect_timeout().is_none());
        assert_eq!(settings.logging.level, "info");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn connect_timeout_round_trip() {
        let t = TransportSettings::new("https://game.example:4433/")
            .with_connect_timeout(Duration::from_millis(2500));
        assert_eq!(t.connect_timeout_ms, Some(2500));
        assert_eq!(t.connect_timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn validate_rejects_empty_url() {
        let t = TransportSettings::new("  ");
        assert!(matches!(t.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_missing_scheme() {
        for url in ["localhost:4433", "://host", "https://"] {
            assert!(TransportSettings::new(url).validate().is_err(), "url: {url}");
        }
    }

    #[test]
    fn serde_uses_camel_case() {
        let t = TransportSettings::default().with_connect_timeout(Duration::from_secs(1));
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["connectTimeoutMs"], 1000);
    }

    #[test]
    fn huge_timeout_saturates() {
        let t = TransportSettings::default().with_connect_timeout(Duration::MAX);
        assert_eq!(t.connect_timeout_ms, Some(u64::MAX));
    }

    #[test]
    fn module_levels_are_a_json_object() {
        let logging: LoggingSettings = serde_json::from_value(serde_json::json!({
            "level": "warn",
            "modules": {"dualink_transport": "trace", "dualink_core": "debug"}
        }))
        .unwrap();
        assert_eq!(logging.modules.get("dualink_transport").map(String::as_str), Some("trace"));
        assert_eq!(logging.modules.len(), 2);

        let json = serde_json::to_value(&logging).unwrap();
        assert_eq!(json["modules"]["dualink_core"], "debug");
    }

    #[test]
    fn missing_timeout_is_not_serialized() {
        let json = serde_json::to_value(TransportSettings::default()).unwrap();
        assert!(json.get("connectTimeoutMs").is_none());
    }
}
