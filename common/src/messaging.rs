use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    indicator::{Indicator, IndicatorPin},
    reconnect::{ReconnectPolicy, ReconnectState},
    topics::{heartbeat_payload, ANNOUNCE_PAYLOAD, MQTT_CLIENT_ID, TOPIC_IN, TOPIC_OUT},
    types::ConnectionState,
};

/// Inbound payloads above this size are dropped rather than buffered.
pub const MAX_INBOUND_PAYLOAD_BYTES: usize = 256;
/// Upper bound on inbound messages handled per `service` call.
const MAX_INBOUND_PER_SERVICE: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The broker or transport refused the session. `code` is the status the client reports.
    #[error("connection refused (rc={code})")]
    Refused { code: i32 },
    #[error("connection timed out")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    /// The session closed before or while it was in use.
    #[error("connection lost")]
    ConnectionLost,
    #[error("{0}")]
    Transport(String),
}

impl LinkError {
    pub fn status_code(&self) -> i32 {
        match self {
            Self::Refused { code } => *code,
            Self::Timeout => -4,
            Self::ConnectionLost => -3,
            Self::NotConnected => -1,
            Self::Transport(_) => -2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe session with one broker.
pub trait BrokerLink {
    /// One blocking connection attempt, bounded by the transport's own timeout.
    fn connect(&mut self, client_id: &str) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), LinkError>;

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError>;

    /// Next message already received, without blocking.
    fn poll_inbound(&mut self) -> Option<InboundMessage>;
}

/// Indicator level requested by an inbound payload.
pub fn command_level(payload: &[u8]) -> bool {
    payload.first() == Some(&b'1')
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessagingStats {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub heartbeats: u64,
    pub inbound: u64,
    pub dropped: u64,
}

/// What one `service` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceReport {
    pub attempted_reconnect: bool,
    pub heartbeat_sent: bool,
    pub inbound_handled: usize,
}

pub struct MessagingChannel<L> {
    link: L,
    policy: ReconnectPolicy,
    reconnect: ReconnectState,
    heartbeat_interval_ms: u64,
    last_heartbeat_ms: u64,
    heartbeat_counter: u64,
    stats: MessagingStats,
}

impl<L: BrokerLink> MessagingChannel<L> {
    pub fn new(link: L, policy: ReconnectPolicy, heartbeat_interval_ms: u64) -> Self {
        Self {
            link,
            policy,
            reconnect: ReconnectState::default(),
            heartbeat_interval_ms,
            last_heartbeat_ms: 0,
            heartbeat_counter: 0,
            stats: MessagingStats::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn stats(&self) -> MessagingStats {
        self.stats
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// One connection attempt. On success announces the node and subscribes to commands.
    pub fn reconnect(&mut self, now_ms: u64) -> bool {
        info!("*PubSub: attempting MQTT connection...");
        self.stats.connect_attempts = self.stats.connect_attempts.saturating_add(1);

        if let Err(err) = self.link.connect(MQTT_CLIENT_ID) {
            self.stats.connect_failures = self.stats.connect_failures.saturating_add(1);
            self.reconnect.record_attempt(now_ms, false);
            warn!(
                "*PubSub: connect failed, rc={} ({err}); retrying in {} ms",
                err.status_code(),
                self.policy.delay_ms(self.reconnect.failures())
            );
            return false;
        }

        self.reconnect.record_attempt(now_ms, true);
        info!("*PubSub: connected");

        if let Err(err) = self.link.publish(TOPIC_OUT, ANNOUNCE_PAYLOAD.as_bytes()) {
            warn!("*PubSub: announce publish failed: {err}");
        }
        if let Err(err) = self.link.subscribe(TOPIC_IN) {
            warn!("*PubSub: subscribe to {TOPIC_IN} failed: {err}");
        }
        true
    }

    /// Called every loop iteration.
    pub fn service<P: IndicatorPin>(
        &mut self,
        now_ms: u64,
        indicator: &mut Indicator<P>,
    ) -> ServiceReport {
        let mut report = ServiceReport::default();

        if !self.link.is_connected() {
            if !self.reconnect.attempt_due(self.policy, now_ms) {
                return report;
            }
            report.attempted_reconnect = true;
            if !self.reconnect(now_ms) {
                return report;
            }
        }

        while report.inbound_handled < MAX_INBOUND_PER_SERVICE {
            let Some(message) = self.link.poll_inbound() else {
                break;
            };
            report.inbound_handled += 1;
            self.handle_inbound(message, indicator);
        }

        if now_ms.saturating_sub(self.last_heartbeat_ms) >= self.heartbeat_interval_ms {
            self.last_heartbeat_ms = now_ms;
            self.heartbeat_counter = self.heartbeat_counter.saturating_add(1);
            let payload = heartbeat_payload(self.heartbeat_counter);
            debug!("*PubSub: publish message: {payload}");
            match self.link.publish(TOPIC_OUT, payload.as_bytes()) {
                Ok(()) => {
                    self.stats.heartbeats = self.stats.heartbeats.saturating_add(1);
                    report.heartbeat_sent = true;
                }
                Err(err) => warn!("*PubSub: heartbeat publish failed: {err}"),
            }
        }

        report
    }

    fn handle_inbound<P: IndicatorPin>(
        &mut self,
        message: InboundMessage,
        indicator: &mut Indicator<P>,
    ) {
        if message.payload.len() > MAX_INBOUND_PAYLOAD_BYTES {
            self.stats.dropped = self.stats.dropped.saturating_add(1);
            debug!(
                "*PubSub: dropping oversized message on [{}] ({} bytes)",
                message.topic,
                message.payload.len()
            );
            return;
        }

        self.stats.inbound = self.stats.inbound.saturating_add(1);
        info!(
            "*PubSub: message arrived [{}] {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );
        indicator.force(command_level(&message.payload));
    }
}
