pub const MQTT_CLIENT_ID: &str = "uplink-node";

pub const TOPIC_OUT: &str = "uplink/out";
pub const TOPIC_IN: &str = "uplink/in";

pub const ANNOUNCE_PAYLOAD: &str = "online";

pub fn heartbeat_payload(counter: u64) -> String {
    format!("heartbeat #{counter}")
}
