use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reconnect::ReconnectPolicy;

/// Longest broker host the portal and the record accept (the form field holds 40 with the
/// terminator).
pub const MAX_MQTT_SERVER_LEN: usize = 39;
/// Longest broker port string (the form field holds 6 with the terminator).
pub const MAX_MQTT_PORT_LEN: usize = 5;

pub const DEFAULT_MQTT_SERVER: &str = match option_env!("UPLINK_MQTT_SERVER") {
    Some(server) => server,
    None => "192.168.1.100",
};
pub const DEFAULT_MQTT_PORT: &str = match option_env!("UPLINK_MQTT_PORT") {
    Some(port) => port,
    None => "1883",
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config record is not valid JSON: {0}")]
    Malformed(String),
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("mqtt_port `{0}` is not a port number")]
    InvalidPort(String),
}

/// Broker endpoint the node publishes to. Field names are the persisted record's keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub mqtt_server: String,
    pub mqtt_port: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mqtt_server: DEFAULT_MQTT_SERVER.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT.to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn new(mqtt_server: impl Into<String>, mqtt_port: impl Into<String>) -> Self {
        Self {
            mqtt_server: mqtt_server.into(),
            mqtt_port: mqtt_port.into(),
        }
    }

    /// Builds a config from operator input, trimming surrounding whitespace.
    pub fn from_input(mqtt_server: &str, mqtt_port: &str) -> Result<Self, ConfigError> {
        let config = Self::new(mqtt_server.trim(), mqtt_port.trim());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt_server.is_empty() {
            return Err(ConfigError::Empty {
                field: "mqtt_server",
            });
        }
        if self.mqtt_server.chars().count() > MAX_MQTT_SERVER_LEN {
            return Err(ConfigError::TooLong {
                field: "mqtt_server",
                max: MAX_MQTT_SERVER_LEN,
            });
        }
        if self.mqtt_port.is_empty() {
            return Err(ConfigError::Empty { field: "mqtt_port" });
        }
        if self.mqtt_port.len() > MAX_MQTT_PORT_LEN {
            return Err(ConfigError::TooLong {
                field: "mqtt_port",
                max: MAX_MQTT_PORT_LEN,
            });
        }
        self.port_number()?;
        Ok(())
    }

    pub fn port_number(&self) -> Result<u16, ConfigError> {
        if !self.mqtt_port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::InvalidPort(self.mqtt_port.clone()));
        }
        match self.mqtt_port.parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(ConfigError::InvalidPort(self.mqtt_port.clone())),
        }
    }

    pub fn from_record(raw: &[u8]) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_slice(raw).map_err(|err| ConfigError::Malformed(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_record(&self) -> Vec<u8> {
        // Two string fields cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Steady-state tuning that is compiled in rather than persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOptions {
    pub heartbeat_interval_ms: u64,
    pub indicator_period_ms: u64,
    pub restart_delay_ms: u64,
    pub stats_interval_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            indicator_period_ms: 50,
            restart_delay_ms: 1_000,
            stats_interval_ms: 60_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn record_uses_persisted_field_names() {
        let config = DeviceConfig::new("broker.example", "8883");
        let raw = String::from_utf8(config.to_record()).unwrap();

        assert_eq!(
            raw,
            r#"{"mqtt_server":"broker.example","mqtt_port":"8883"}"#
        );
        assert_eq!(DeviceConfig::from_record(raw.as_bytes()).unwrap(), config);
    }

    #[test]
    fn rejects_records_missing_a_field() {
        let err = DeviceConfig::from_record(br#"{"mqtt_server":"broker.example"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert_eq!(
            DeviceConfig::new("", "1883").validate(),
            Err(ConfigError::Empty {
                field: "mqtt_server"
            })
        );
        assert_eq!(
            DeviceConfig::new("a".repeat(40), "1883").validate(),
            Err(ConfigError::TooLong {
                field: "mqtt_server",
                max: MAX_MQTT_SERVER_LEN
            })
        );
        assert_eq!(
            DeviceConfig::new("broker", "123456").validate(),
            Err(ConfigError::TooLong {
                field: "mqtt_port",
                max: MAX_MQTT_PORT_LEN
            })
        );
        assert_eq!(
            DeviceConfig::new("broker", "70000").validate(),
            Err(ConfigError::InvalidPort("70000".to_string()))
        );
        assert_eq!(
            DeviceConfig::new("broker", "+123").validate(),
            Err(ConfigError::InvalidPort("+123".to_string()))
        );
        assert_eq!(
            DeviceConfig::new("broker", "0").validate(),
            Err(ConfigError::InvalidPort("0".to_string()))
        );
    }

    #[test]
    fn operator_input_is_trimmed() {
        let config = DeviceConfig::from_input("  broker.example ", " 8883").unwrap();
        assert_eq!(config, DeviceConfig::new("broker.example", "8883"));
        assert_eq!(config.port_number(), Ok(8883));
    }

    #[test]
    fn defaults_are_valid() {
        assert!(DeviceConfig::default().validate().is_ok());
    }
}
