use serde::{Deserialize, Serialize};

use crate::{
    config::{ConfigError, DeviceConfig},
    types::ProvisioningOutcome,
};

/// How long the portal waits for a submission before provisioning gives up.
pub const PORTAL_TIMEOUT_MS: u64 = 180_000;
/// Automatic join attempts with known credentials before the portal opens.
pub const AUTO_JOIN_ATTEMPTS: u32 = 5;
pub const AUTO_JOIN_RETRY_DELAY_MS: u64 = 3_000;

/// Operator-editable text field on the portal form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortalField {
    pub id: &'static str,
    pub label: &'static str,
    /// Includes the terminator slot the original form reserved.
    #[serde(rename = "maxLength")]
    pub max_length: usize,
}

pub const FIELD_SERVER: PortalField = PortalField {
    id: "server",
    label: "mqtt server",
    max_length: 40,
};

pub const FIELD_PORT: PortalField = PortalField {
    id: "port",
    label: "mqtt port",
    max_length: 6,
};

/// Payload the portal page posts on save.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortalSubmission {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: Option<String>,
    pub server: String,
    pub port: String,
}

impl PortalSubmission {
    pub fn device_config(&self) -> Result<DeviceConfig, ConfigError> {
        DeviceConfig::from_input(&self.server, &self.port)
    }
}

/// What the portal page pre-fills from the in-memory config.
#[derive(Debug, Clone, Serialize)]
pub struct PortalDefaults {
    #[serde(rename = "apName")]
    pub ap_name: String,
    pub ssid: String,
    pub fields: [PortalField; 2],
    pub server: String,
    pub port: String,
}

impl PortalDefaults {
    pub fn new(ap_name: &str, ssid: &str, current: &DeviceConfig) -> Self {
        Self {
            ap_name: ap_name.to_string(),
            ssid: ssid.to_string(),
            fields: [FIELD_SERVER, FIELD_PORT],
            server: current.mqtt_server.clone(),
            port: current.mqtt_port.clone(),
        }
    }
}

/// Access point name derived from the device identity (the low three bytes of its MAC).
pub fn access_point_name(device_id: [u8; 6]) -> String {
    format!(
        "UPLINK-{:02X}{:02X}{:02X}",
        device_id[3], device_id[4], device_id[5]
    )
}

pub trait ProvisioningListener {
    /// The access point is up and the portal is waiting for an operator.
    fn on_enter_provisioning(&mut self, ap_address: &str, ap_name: &str);

    /// The operator saved the form. Called before `provision` returns.
    fn on_config_submitted(&mut self, mqtt_server: &str, mqtt_port: &str);
}

/// Brings the network up, falling back to an access point and portal form.
pub trait Provisioner {
    /// Blocks until the network is joined, the operator submits the form, or the portal
    /// times out.
    fn provision(
        &mut self,
        current: &DeviceConfig,
        listener: &mut dyn ProvisioningListener,
    ) -> ProvisioningOutcome;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn ap_name_uses_device_suffix() {
        assert_eq!(
            access_point_name([0x24, 0x6f, 0x28, 0xab, 0x0c, 0x01]),
            "UPLINK-AB0C01"
        );
    }

    #[test]
    fn submission_validates_broker_fields() {
        let submission: PortalSubmission = serde_json::from_str(
            r#"{"ssid":"home","password":"secret","server":" broker.example ","port":"8883"}"#,
        )
        .unwrap();

        assert_eq!(
            submission.device_config().unwrap(),
            DeviceConfig::new("broker.example", "8883")
        );
        assert_eq!(submission.password.as_deref(), Some("secret"));
    }

    #[test]
    fn submission_rejects_oversized_port() {
        let submission = PortalSubmission {
            server: "broker.example".to_string(),
            port: "188300".to_string(),
            ..Default::default()
        };

        assert!(submission.device_config().is_err());
    }

    #[test]
    fn defaults_carry_form_limits() {
        let defaults = PortalDefaults::new("UPLINK-000001", "home", &DeviceConfig::default());
        let json = serde_json::to_value(&defaults).unwrap();

        assert_eq!(json["fields"][0]["id"], "server");
        assert_eq!(json["fields"][0]["maxLength"], 40);
        assert_eq!(json["fields"][1]["label"], "mqtt port");
        assert_eq!(json["fields"][1]["maxLength"], 6);
    }
}
