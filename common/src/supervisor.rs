use log::{info, warn};

use crate::{
    config::{DeviceConfig, NodeOptions},
    indicator::{Indicator, IndicatorPin},
    management::{DiagnosticUpdateListener, ManagementChannel, UpdateTransport},
    messaging::{BrokerLink, MessagingChannel, MessagingStats},
    provisioning::{Provisioner, ProvisioningListener},
    store::{ConfigStore, RecordStorage},
    types::{BootPhase, ProvisioningOutcome},
};

/// Boot could not reach steady state; the platform restarts after `delay_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub delay_ms: u64,
    pub reason: String,
}

/// Receives provisioning notifications during boot.
#[derive(Debug, Default)]
struct BootListener {
    submitted: Option<DeviceConfig>,
}

impl ProvisioningListener for BootListener {
    fn on_enter_provisioning(&mut self, ap_address: &str, ap_name: &str) {
        info!("*WM: Entering config mode...");
        info!("*WM: {ap_address}");
        info!("*WM: {ap_name}");
    }

    fn on_config_submitted(&mut self, mqtt_server: &str, mqtt_port: &str) {
        match DeviceConfig::from_input(mqtt_server, mqtt_port) {
            Ok(config) => {
                info!("*WM: Should save config");
                self.submitted = Some(config);
            }
            Err(err) => warn!("*WM: ignoring submitted broker settings: {err}"),
        }
    }
}

pub struct Supervisor<S, P> {
    store: ConfigStore<S>,
    provisioner: P,
    options: NodeOptions,
    phase: BootPhase,
}

impl<S: RecordStorage, P: Provisioner> Supervisor<S, P> {
    pub fn new(store: ConfigStore<S>, provisioner: P, options: NodeOptions) -> Self {
        Self {
            store,
            provisioner,
            options,
            phase: BootPhase::Init,
        }
    }

    pub fn phase(&self) -> BootPhase {
        self.phase
    }

    pub fn store(&self) -> &ConfigStore<S> {
        &self.store
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    pub fn into_parts(self) -> (ConfigStore<S>, P) {
        (self.store, self.provisioner)
    }

    /// Runs the boot sequence once. `open_link` receives the finalized broker endpoint.
    pub fn boot<U, L, O, F>(
        &mut self,
        updates: U,
        open_link: F,
        pin: O,
        now_ms: u64,
    ) -> Result<SteadyState<U, L, O>, RestartRequest>
    where
        U: UpdateTransport,
        L: BrokerLink,
        O: IndicatorPin,
        F: FnOnce(&DeviceConfig) -> L,
    {
        self.enter(BootPhase::LoadConfig);
        let mut config = self.store.load();

        self.enter(BootPhase::Provision);
        let mut listener = BootListener::default();
        match self.provisioner.provision(&config, &mut listener) {
            ProvisioningOutcome::Joined => info!("*WM: Connected!"),
            ProvisioningOutcome::ConfigSaved => {
                info!("*WM: Connected!");
                if let Some(submitted) = listener.submitted.take() {
                    config = submitted;
                    self.store.save(&config);
                }
            }
            ProvisioningOutcome::Fatal(failure) => {
                self.enter(BootPhase::Restart);
                warn!(
                    "*WM: Failed to connect ({}), restarting...",
                    failure.as_str()
                );
                return Err(RestartRequest {
                    delay_ms: self.options.restart_delay_ms,
                    reason: failure.as_str().to_string(),
                });
            }
        }

        self.enter(BootPhase::StartManagement);
        info!("*OTA: Initializing...");
        let mut management = ManagementChannel::new(updates);
        management.set_listener(Box::new(DiagnosticUpdateListener::default()));
        match management.begin() {
            Ok(()) => info!("*OTA: Ready"),
            Err(err) => warn!("*OTA: {err}; remote updates disabled for this run"),
        }

        self.enter(BootPhase::StartMessaging);
        info!(
            "*PubSub: broker {}:{}",
            config.mqtt_server, config.mqtt_port
        );
        let link = open_link(&config);
        let messaging = MessagingChannel::new(
            link,
            self.options.reconnect,
            self.options.heartbeat_interval_ms,
        );
        let indicator = Indicator::new(pin, self.options.indicator_period_ms, now_ms);

        self.enter(BootPhase::SteadyState);
        Ok(SteadyState {
            config,
            management,
            messaging,
            indicator,
            stats_interval_ms: self.options.stats_interval_ms,
            last_stats_ms: now_ms,
        })
    }

    fn enter(&mut self, phase: BootPhase) {
        info!("boot phase {} -> {}", self.phase.as_str(), phase.as_str());
        self.phase = phase;
    }
}

/// What one control loop iteration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    pub management_events: usize,
    pub indicator_toggled: bool,
    pub reconnect_attempted: bool,
    pub heartbeat_sent: bool,
    pub stats_logged: bool,
}

pub struct SteadyState<U, L, O> {
    config: DeviceConfig,
    management: ManagementChannel<U>,
    messaging: MessagingChannel<L>,
    indicator: Indicator<O>,
    stats_interval_ms: u64,
    last_stats_ms: u64,
}

impl<U, L, O> SteadyState<U, L, O>
where
    U: UpdateTransport,
    L: BrokerLink,
    O: IndicatorPin,
{
    /// One control loop iteration: management, then indicator, then messaging.
    pub fn step(&mut self, now_ms: u64) -> StepReport {
        let mut report = StepReport {
            management_events: self.management.handle(),
            indicator_toggled: self.indicator.tick(now_ms),
            ..Default::default()
        };

        let service = self.messaging.service(now_ms, &mut self.indicator);
        report.reconnect_attempted = service.attempted_reconnect;
        report.heartbeat_sent = service.heartbeat_sent;

        // A reconnect may block for a network timeout; catch up on management right away.
        if service.attempted_reconnect {
            report.management_events += self.management.handle();
        }

        if now_ms.saturating_sub(self.last_stats_ms) >= self.stats_interval_ms {
            self.last_stats_ms = now_ms;
            self.log_stats();
            report.stats_logged = true;
        }

        report
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn management(&self) -> &ManagementChannel<U> {
        &self.management
    }

    pub fn messaging(&self) -> &MessagingChannel<L> {
        &self.messaging
    }

    pub fn messaging_mut(&mut self) -> &mut MessagingChannel<L> {
        &mut self.messaging
    }

    pub fn indicator(&self) -> &Indicator<O> {
        &self.indicator
    }

    fn log_stats(&self) {
        let MessagingStats {
            connect_attempts,
            connect_failures,
            heartbeats,
            inbound,
            dropped,
        } = self.messaging.stats();
        info!(
            "*PubSub: {} attempts={connect_attempts} failures={connect_failures} heartbeats={heartbeats} inbound={inbound} dropped={dropped}",
            self.messaging.state().as_str()
        );
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        reconnect::ReconnectPolicy,
        testing::{FakeLink, FakeProvisioner, FakeUpdates, MemoryStorage, RecordingPin},
        types::{ProvisioningFailure, UpdateEvent},
    };

    fn legacy_options() -> NodeOptions {
        NodeOptions {
            reconnect: ReconnectPolicy::Immediate,
            ..NodeOptions::default()
        }
    }

    #[test]
    fn provisioned_broker_is_persisted_and_restored() {
        let provisioner = FakeProvisioner::submitting("broker.example", "8883");
        let mut supervisor = Supervisor::new(
            ConfigStore::new(MemoryStorage::default()),
            provisioner,
            legacy_options(),
        );

        let mut opened_with = None;
        let node = supervisor
            .boot(
                FakeUpdates::default(),
                |config: &DeviceConfig| {
                    opened_with = Some(config.clone());
                    FakeLink::default()
                },
                RecordingPin::default(),
                0,
            )
            .unwrap();

        let expected = DeviceConfig::new("broker.example", "8883");
        assert_eq!(supervisor.provisioner().seen_defaults, Some(DeviceConfig::default()));
        assert_eq!(node.config(), &expected);
        assert_eq!(opened_with, Some(expected.clone()));
        assert_eq!(supervisor.phase(), BootPhase::SteadyState);

        let (store, _) = supervisor.into_parts();
        let mut restarted = ConfigStore::new(store.into_storage());
        assert_eq!(restarted.load(), expected);
    }

    #[test]
    fn known_network_keeps_loaded_config() {
        let saved = DeviceConfig::new("saved.example", "1884");
        let mut supervisor = Supervisor::new(
            ConfigStore::new(MemoryStorage::with_record(&saved.to_record())),
            FakeProvisioner::joining(),
            legacy_options(),
        );

        let node = supervisor
            .boot(
                FakeUpdates::default(),
                |_: &DeviceConfig| FakeLink::default(),
                RecordingPin::default(),
                0,
            )
            .unwrap();

        assert_eq!(node.config(), &saved);
        assert_eq!(supervisor.store().storage().writes, 0);
    }

    #[test]
    fn invalid_submission_keeps_current_config() {
        let mut supervisor = Supervisor::new(
            ConfigStore::new(MemoryStorage::default()),
            FakeProvisioner::submitting("broker.example", "not-a-port"),
            legacy_options(),
        );

        let node = supervisor
            .boot(
                FakeUpdates::default(),
                |_: &DeviceConfig| FakeLink::default(),
                RecordingPin::default(),
                0,
            )
            .unwrap();

        assert_eq!(node.config(), &DeviceConfig::default());
        assert_eq!(supervisor.store().storage().writes, 0);
    }

    #[test]
    fn provisioning_failure_requests_restart() {
        let mut supervisor = Supervisor::new(
            ConfigStore::new(MemoryStorage::default()),
            FakeProvisioner::failing(ProvisioningFailure::PortalTimeout),
            legacy_options(),
        );

        let result = supervisor.boot(
            FakeUpdates::default(),
            |_: &DeviceConfig| -> FakeLink { panic!("messaging must not start") },
            RecordingPin::default(),
            0,
        );

        assert_eq!(
            result.err(),
            Some(RestartRequest {
                delay_ms: 1_000,
                reason: "portal timed out".to_string(),
            })
        );
        assert_eq!(supervisor.phase(), BootPhase::Restart);
    }

    #[test]
    fn update_begin_failure_is_not_fatal() {
        let mut updates = FakeUpdates::default();
        updates.fail_begin = true;
        let mut supervisor = Supervisor::new(
            ConfigStore::new(MemoryStorage::default()),
            FakeProvisioner::joining(),
            legacy_options(),
        );

        let node = supervisor
            .boot(
                updates,
                |_: &DeviceConfig| FakeLink::default(),
                RecordingPin::default(),
                0,
            )
            .unwrap();

        assert!(!node.management().is_armed());
    }

    #[test]
    fn failed_reconnects_leave_indicator_to_its_timer() {
        let mut supervisor = Supervisor::new(
            ConfigStore::new(MemoryStorage::default()),
            FakeProvisioner::joining(),
            legacy_options(),
        );
        let mut node = supervisor
            .boot(
                FakeUpdates::default(),
                |_: &DeviceConfig| FakeLink::refusing(5),
                RecordingPin::default(),
                0,
            )
            .unwrap();

        for now in [10, 20, 30] {
            let report = node.step(now);
            assert!(report.reconnect_attempted);
            assert!(!report.indicator_toggled);
        }

        assert_eq!(node.messaging().link().connect_calls, 3);
        assert!(node.messaging().link().published.is_empty());
        assert_eq!(node.indicator().pin().levels, vec![false]);
    }

    #[test]
    fn update_events_raised_during_reconnect_are_handled_same_iteration() {
        let updates = FakeUpdates::default();
        let queue = updates.queue();
        let mut link = FakeLink::default();
        link.on_connect = Some(Box::new(move || {
            queue.borrow_mut().push_back(UpdateEvent::Start);
        }));

        let mut supervisor = Supervisor::new(
            ConfigStore::new(MemoryStorage::default()),
            FakeProvisioner::joining(),
            legacy_options(),
        );
        let mut node = supervisor
            .boot(updates, |_: &DeviceConfig| link, RecordingPin::default(), 0)
            .unwrap();

        let report = node.step(10);

        assert!(report.reconnect_attempted);
        assert_eq!(report.management_events, 1);
    }

    #[test]
    fn steady_loop_services_every_duty() {
        let mut supervisor = Supervisor::new(
            ConfigStore::new(MemoryStorage::default()),
            FakeProvisioner::joining(),
            legacy_options(),
        );
        let mut node = supervisor
            .boot(
                FakeUpdates::default(),
                |_: &DeviceConfig| FakeLink::default(),
                RecordingPin::default(),
                0,
            )
            .unwrap();

        let mut toggles = 0;
        let mut heartbeats = 0;
        for now in (10..=2_000).step_by(10) {
            let report = node.step(now);
            toggles += usize::from(report.indicator_toggled);
            heartbeats += usize::from(report.heartbeat_sent);
        }

        assert_eq!(toggles, 40);
        assert_eq!(heartbeats, 2);
        assert!(node.messaging().is_connected());
    }

    #[test]
    fn stats_are_logged_once_per_interval() {
        let mut supervisor = Supervisor::new(
            ConfigStore::new(MemoryStorage::default()),
            FakeProvisioner::joining(),
            legacy_options(),
        );
        let mut node = supervisor
            .boot(
                FakeUpdates::default(),
                |_: &DeviceConfig| FakeLink::default(),
                RecordingPin::default(),
                0,
            )
            .unwrap();

        let logged_at: Vec<u64> = (10..=130_000)
            .step_by(10)
            .filter(|&now| node.step(now).stats_logged)
            .collect();

        assert_eq!(logged_at, vec![60_000, 120_000]);
    }

    #[test]
    fn inbound_command_wins_over_same_iteration_tick() {
        let mut link = FakeLink::default();
        link.connected = true;
        let mut supervisor = Supervisor::new(
            ConfigStore::new(MemoryStorage::default()),
            FakeProvisioner::joining(),
            legacy_options(),
        );
        let mut node = supervisor
            .boot(
                FakeUpdates::default(),
                |_: &DeviceConfig| link,
                RecordingPin::default(),
                0,
            )
            .unwrap();

        // The tick at 50 ms turns the indicator on; the queued "0" command lands after it.
        node.messaging_mut().link_mut().queue("uplink/in", b"0");
        let report = node.step(50);

        assert!(report.indicator_toggled);
        assert!(!node.indicator().is_on());
    }
}
