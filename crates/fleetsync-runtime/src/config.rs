//! Engine configuration handed to the orchestrator at `initialize` time.
//!
//! Keys are camelCase so a flat JSON/TOML object written for the flow
//! environment (`domainId`, `host`, `port`, `jwt`, `quietLogging`)
//! deserializes verbatim.

use std::collections::BTreeMap;
use std::time::Duration;

use fleetsync_middleware::SocketTarget;
use fleetsync_types::{FleetError, StreamCategory};
use serde::{Deserialize, Serialize};

/// Default outward socket port.
pub const DEFAULT_PORT: u16 = 8000;

/// Built-in throttle interval for `category`, in milliseconds.
///
/// For [`StreamCategory::NavGraph`] this is the secondary reprocess
/// interval; graphs themselves are applied on arrival.
pub fn default_throttle_ms(category: StreamCategory) -> u64 {
    match category {
        StreamCategory::FleetState | StreamCategory::DoorState | StreamCategory::LiftState => 500,
        StreamCategory::DynamicEvent => 50,
        StreamCategory::NavGraph => 5000,
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Bus partition joined by the telemetry transport.
    #[serde(default)]
    pub domain_id: u32,

    /// Outward socket host.  The socket step is skipped when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,

    /// Suppress per-message debug output.
    #[serde(default)]
    pub quiet_logging: bool,

    /// Per-category overrides keyed by category label (`fleet_state`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub throttle: BTreeMap<String, u64>,

    #[serde(default = "default_map_cache_ttl_ms")]
    pub map_cache_ttl_ms: u64,

    /// Period of the trailing-edge flush timer.
    #[serde(default = "default_flush_tick_ms")]
    pub flush_tick_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_map_cache_ttl_ms() -> u64 {
    30_000
}
fn default_flush_tick_ms() -> u64 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            domain_id: 0,
            host: None,
            port: DEFAULT_PORT,
            jwt: None,
            quiet_logging: false,
            throttle: BTreeMap::new(),
            map_cache_ttl_ms: default_map_cache_ttl_ms(),
            flush_tick_ms: default_flush_tick_ms(),
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("domain_id", &self.domain_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("jwt", if self.jwt.is_some() { &"<redacted>" } else { &"<not set>" })
            .field("quiet_logging", &self.quiet_logging)
            .field("throttle", &self.throttle)
            .field("map_cache_ttl_ms", &self.map_cache_ttl_ms)
            .field("flush_tick_ms", &self.flush_tick_ms)
            .finish()
    }
}

impl EngineConfig {
    /// Parse a flat JSON configuration object.
    pub fn from_json(value: serde_json::Value) -> Result<Self, FleetError> {
        let cfg: EngineConfig = serde_json::from_value(value)
            .map_err(|e| FleetError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        for (label, ms) in &self.throttle {
            if StreamCategory::parse(label).is_none() {
                return Err(FleetError::InvalidConfig(format!(
                    "unknown throttle category {label:?}"
                )));
            }
            if *ms == 0 {
                return Err(FleetError::InvalidConfig(format!(
                    "throttle interval for {label} must be greater than zero"
                )));
            }
        }
        if self.flush_tick_ms == 0 {
            return Err(FleetError::InvalidConfig(
                "flushTickMs must be greater than zero".to_string(),
            ));
        }
        if self.host.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err(FleetError::InvalidConfig("host must not be empty".to_string()));
        }
        Ok(())
    }

    /// Effective interval for `category`: the override if any, else the
    /// built-in default.
    pub fn throttle_interval(&self, category: StreamCategory) -> Duration {
        let ms = self
            .throttle
            .get(category.as_str())
            .copied()
            .unwrap_or_else(|| default_throttle_ms(category));
        Duration::from_millis(ms)
    }

    pub fn map_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.map_cache_ttl_ms)
    }

    pub fn flush_tick(&self) -> Duration {
        Duration::from_millis(self.flush_tick_ms)
    }

    /// The outward socket target, present iff `host` is configured.
    pub fn socket_target(&self) -> Option<SocketTarget> {
        self.host.as_ref().map(|host| SocketTarget {
            host: host.clone(),
            port: self.port,
            jwt: self.jwt.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_keys_deserialize_verbatim() {
        let cfg = EngineConfig::from_json(json!({
            "domainId": 42,
            "host": "dashboard.local",
            "jwt": "abc",
            "quietLogging": true,
            "throttle": { "door_state": 250 }
        }))
        .unwrap();

        assert_eq!(cfg.domain_id, 42);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.quiet_logging);
        assert_eq!(cfg.throttle_interval(StreamCategory::DoorState), Duration::from_millis(250));
        assert_eq!(cfg.throttle_interval(StreamCategory::FleetState), Duration::from_millis(500));
        assert_eq!(cfg.throttle_interval(StreamCategory::DynamicEvent), Duration::from_millis(50));
    }

    #[test]
    fn socket_target_only_with_host() {
        assert!(EngineConfig::default().socket_target().is_none());
        let cfg = EngineConfig {
            host: Some("10.0.0.5".into()),
            port: 9001,
            ..Default::default()
        };
        assert_eq!(cfg.socket_target().unwrap().url(), "ws://10.0.0.5:9001");
    }

    #[test]
    fn zero_interval_is_invalid() {
        let err = EngineConfig::from_json(json!({ "throttle": { "fleet_state": 0 } })).unwrap_err();
        assert!(matches!(err, FleetError::InvalidConfig(_)));
    }

    #[test]
    fn unknown_category_is_invalid() {
        assert!(EngineConfig::from_json(json!({ "throttle": { "robots": 10 } })).is_err());
    }

    #[test]
    fn debug_redacts_jwt() {
        let cfg = EngineConfig {
            jwt: Some("super-secret".into()),
            ..Default::default()
        };
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("super-secret"));
        assert!(dbg.contains("<redacted>"));
    }
}
