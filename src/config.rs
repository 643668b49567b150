//! Runtime configuration
//!
//! One serde struct covers the whole runtime. [`BusConfig::validate`] must
//! pass before the converters are used; the converters themselves never
//! re-check.

use crate::client::ClientOptions;
use crate::dedup::MessageDeduplicator;
use crate::dispatch::{DispatchOptions, OverflowStrategy};
use crate::error::{BusError, Result};
use crate::provider::nats::NatsConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one service's messaging runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusConfig {
    /// Broker URL (e.g., "nats://127.0.0.1:4222")
    pub broker_url: String,

    /// Connection name reported to the broker
    pub client_id: String,

    /// Service name used in health and keepalive topics
    pub service_id: String,

    pub keepalive_secs: u64,

    pub health_enabled: bool,

    pub heartbeat_enabled: bool,

    pub heartbeat_interval_secs: u64,

    /// Dedup window; 0 disables deduplication
    pub dedupe_ttl_secs: u64,

    pub dedupe_max_entries: usize,

    pub reconnect_min_delay_secs: u64,

    pub reconnect_max_delay_secs: u64,

    /// Capacity of the dispatcher queue
    pub queue_size: usize,

    pub workers: usize,

    /// Handler deadline in seconds (fractions allowed)
    pub handler_timeout_secs: f64,

    pub overflow: OverflowStrategy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker_url: "nats://127.0.0.1:4222".to_string(),
            client_id: "homebot".to_string(),
            service_id: "homebot".to_string(),
            keepalive_secs: 60,
            health_enabled: true,
            heartbeat_enabled: false,
            heartbeat_interval_secs: 10,
            dedupe_ttl_secs: 300,
            dedupe_max_entries: 10_000,
            reconnect_min_delay_secs: 1,
            reconnect_max_delay_secs: 30,
            queue_size: 1000,
            workers: 1,
            handler_timeout_secs: 10.0,
            overflow: OverflowStrategy::DropOldest,
        }
    }
}

impl BusConfig {
    /// Defaults with a service id; the client id follows the service id
    pub fn for_service(service_id: impl Into<String>) -> Self {
        let service_id = service_id.into();
        Self {
            client_id: service_id.clone(),
            service_id,
            ..Default::default()
        }
    }

    /// Parse from JSON, filling missing fields with defaults, then validate
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_id.trim().is_empty() {
            return Err(BusError::Config("serviceId cannot be empty".to_string()));
        }
        if self.reconnect_max_delay_secs < self.reconnect_min_delay_secs {
            return Err(BusError::Config(format!(
                "reconnectMaxDelaySecs ({}) must be >= reconnectMinDelaySecs ({})",
                self.reconnect_max_delay_secs, self.reconnect_min_delay_secs
            )));
        }
        if self.dedupe_ttl_secs > 0 && self.dedupe_max_entries == 0 {
            return Err(BusError::Config(
                "dedupeMaxEntries must be > 0 when deduplication is enabled".to_string(),
            ));
        }
        if self.heartbeat_interval_secs < 1 {
            return Err(BusError::Config("heartbeatIntervalSecs must be >= 1".to_string()));
        }
        if !(1..=3600).contains(&self.keepalive_secs) {
            return Err(BusError::Config(format!(
                "keepaliveSecs must be within 1..=3600, got {}",
                self.keepalive_secs
            )));
        }
        if self.queue_size == 0 {
            return Err(BusError::Config("queueSize must be >= 1".to_string()));
        }
        if self.workers == 0 {
            return Err(BusError::Config("workers must be >= 1".to_string()));
        }
        if !(self.handler_timeout_secs.is_finite() && self.handler_timeout_secs > 0.0) {
            return Err(BusError::Config(format!(
                "handlerTimeoutSecs must be positive, got {}",
                self.handler_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            service_id: self.service_id.clone(),
            reconnect_min_delay: Duration::from_secs(self.reconnect_min_delay_secs),
            reconnect_max_delay: Duration::from_secs(self.reconnect_max_delay_secs),
            health: self.health_enabled,
            heartbeat: self.heartbeat_enabled,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            ..Default::default()
        }
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            queue_size: self.queue_size,
            workers: self.workers,
            handler_timeout: Duration::from_secs_f64(self.handler_timeout_secs),
            overflow: self.overflow,
        }
    }

    pub fn deduplicator(&self) -> MessageDeduplicator {
        if self.dedupe_ttl_secs == 0 {
            return MessageDeduplicator::disabled();
        }
        MessageDeduplicator::new(Duration::from_secs(self.dedupe_ttl_secs), self.dedupe_max_entries)
    }

    pub fn nats_config(&self) -> NatsConfig {
        NatsConfig {
            url: self.broker_url.clone(),
            client_id: self.client_id.clone(),
            keepalive_secs: self.keepalive_secs,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = BusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.overflow, OverflowStrategy::DropOldest);
    }

    #[test]
    fn test_for_service() {
        let config = BusConfig::for_service("speech");
        assert_eq!(config.service_id, "speech");
        assert_eq!(config.client_id, "speech");
        assert_eq!(config.client_options().service_id, "speech");
    }

    #[test]
    fn test_from_json_partial() {
        let config = BusConfig::from_json(
            r#"{"serviceId": "tts", "overflow": "block", "handlerTimeoutSecs": 0.5, "workers": 4}"#,
        )
        .unwrap();
        assert_eq!(config.service_id, "tts");
        assert_eq!(config.queue_size, 1000);

        let dispatch = config.dispatch_options();
        assert_eq!(dispatch.overflow, OverflowStrategy::Block);
        assert_eq!(dispatch.handler_timeout, Duration::from_millis(500));
        assert_eq!(dispatch.workers, 4);
    }

    #[test]
    fn test_rejects_invalid() {
        let cases = [
            BusConfig {
                reconnect_min_delay_secs: 10,
                reconnect_max_delay_secs: 5,
                ..Default::default()
            },
            BusConfig {
                dedupe_max_entries: 0,
                ..Default::default()
            },
            BusConfig {
                heartbeat_interval_secs: 0,
                ..Default::default()
            },
            BusConfig {
                keepalive_secs: 0,
                ..Default::default()
            },
            BusConfig {
                keepalive_secs: 3601,
                ..Default::default()
            },
            BusConfig {
                queue_size: 0,
                ..Default::default()
            },
            BusConfig {
                workers: 0,
                ..Default::default()
            },
            BusConfig {
                handler_timeout_secs: 0.0,
                ..Default::default()
            },
        ];

        for config in cases {
            assert!(
                matches!(config.validate(), Err(BusError::Config(_))),
                "accepted {:?}",
                config
            );
        }
    }

    #[test]
    fn test_zero_ttl_disables_dedup() {
        let config = BusConfig {
            dedupe_ttl_secs: 0,
            dedupe_max_entries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(!config.deduplicator().is_enabled());
        assert!(BusConfig::default().deduplicator().is_enabled());
    }

    #[test]
    fn test_unknown_overflow_rejected() {
        assert!(BusConfig::from_json(r#"{"overflow": "drop_all"}"#).is_err());
    }

    #[test]
    fn test_nats_config() {
        let config = BusConfig {
            broker_url: "nats://robot.local:4222".to_string(),
            keepalive_secs: 30,
            ..Default::default()
        };
        let nats = config.nats_config();
        assert_eq!(nats.url, "nats://robot.local:4222");
        assert_eq!(nats.keepalive_secs, 30);
    }
}
