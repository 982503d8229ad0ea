use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyOutputPin, Output, OutputPin, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use uplink_common::{
    messaging::InboundMessage,
    provisioning::{
        access_point_name, PortalDefaults, PortalSubmission, AUTO_JOIN_ATTEMPTS,
        AUTO_JOIN_RETRY_DELAY_MS, PORTAL_TIMEOUT_MS,
    },
    BrokerLink, ConfigStore, DeviceConfig, IndicatorPin, LinkError, NodeOptions, Provisioner,
    ProvisioningFailure, ProvisioningListener, ProvisioningOutcome, RecordStorage, StorageError,
    Supervisor, UpdateError, UpdateErrorKind, UpdateEvent, UpdateTransport,
};

use crate::portal::{
    PORTAL_API_PATH, PORTAL_HTML, PORTAL_PATHS, UPDATE_PASSWORD_HEADER, UPDATE_PATH,
};

const NVS_NAMESPACE: &str = "uplink";
const NVS_CONFIG_KEY: &str = "device_cfg";
const NVS_NETWORK_KEY: &str = "network";
const MAX_RECORD_BYTES: usize = 512;
const MAX_HTTP_BODY: usize = 1024;
const OTA_CHUNK_SIZE: usize = 4096;
const UPDATE_PORT: u16 = 8266;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const LOOP_INTERVAL_MS: u64 = 10;
const DEFAULT_AP_ADDRESS: &str = "192.168.4.1";

const UPDATE_PASSWORD: &str = match option_env!("UPLINK_UPDATE_PASSWORD") {
    Some(password) => password,
    None => "",
};

type HttpRequest<'a, 'b> = Request<&'a mut EspHttpConnection<'b>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();
    info!("booting uplink node");

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition.clone()))?;
    let provisioner = EspProvisioner {
        wifi: esp_wifi,
        sys_loop,
        partition: nvs_partition.clone(),
    };
    let indicator = EspPin::new(pins.gpio2.downgrade_output())?;

    let options = NodeOptions::default();
    let restart_delay_ms = options.restart_delay_ms;
    let storage = NvsStorage::new(nvs_partition);
    let mut supervisor = Supervisor::new(ConfigStore::new(storage), provisioner, options);

    let boot = supervisor.boot(
        EspUpdateService::new(restart_delay_ms),
        EspMqttLink::new,
        indicator,
        monotonic_ms(),
    );

    let mut node = match boot {
        Ok(node) => node,
        Err(restart) => {
            thread::sleep(Duration::from_millis(restart.delay_ms));
            warn!("restarting: {}", restart.reason);
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
    };

    disable_wifi_power_save();
    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let mut wifi_disconnected_since: Option<Instant> = None;
    loop {
        feed_watchdog();
        maintain_wifi_health(&mut wifi_disconnected_since);
        node.step(monotonic_ms());
        thread::sleep(Duration::from_millis(LOOP_INTERVAL_MS));
    }
}

/// Persists the config record as raw bytes in the NVS namespace.
struct NvsStorage {
    partition: EspDefaultNvsPartition,
    nvs: Option<EspNvs<NvsDefault>>,
}

impl NvsStorage {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            nvs: None,
        }
    }

    fn handle(&mut self) -> Result<&mut EspNvs<NvsDefault>, StorageError> {
        self.nvs
            .as_mut()
            .ok_or_else(|| StorageError::Mount("namespace not open".to_string()))
    }
}

impl RecordStorage for NvsStorage {
    fn mount(&mut self) -> Result<(), StorageError> {
        if self.nvs.is_none() {
            let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
                .map_err(|err| StorageError::Mount(format!("{err:?}")))?;
            self.nvs = Some(nvs);
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let nvs = self.handle()?;
        let mut buffer = [0_u8; MAX_RECORD_BYTES];
        nvs.get_raw(NVS_CONFIG_KEY, &mut buffer)
            .map(|record| record.map(<[u8]>::to_vec))
            .map_err(|err| StorageError::Read(format!("{err:?}")))
    }

    fn write(&mut self, record: &[u8]) -> Result<(), StorageError> {
        self.handle()?
            .set_raw(NVS_CONFIG_KEY, record)
            .map(|_| ())
            .map_err(|err| StorageError::Write(format!("{err:?}")))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NetworkCredentials {
    ssid: String,
    #[serde(default)]
    password: String,
}

fn load_credentials(partition: &EspDefaultNvsPartition) -> Option<NetworkCredentials> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true).ok()?;
    let mut buffer = [0_u8; MAX_RECORD_BYTES];
    let raw = nvs.get_raw(NVS_NETWORK_KEY, &mut buffer).ok()??;
    serde_json::from_slice::<NetworkCredentials>(raw)
        .ok()
        .filter(|credentials| !credentials.ssid.trim().is_empty())
}

fn save_credentials(
    partition: &EspDefaultNvsPartition,
    credentials: &NetworkCredentials,
) -> anyhow::Result<()> {
    let mut nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    nvs.set_raw(NVS_NETWORK_KEY, &serde_json::to_vec(credentials)?)?;
    Ok(())
}

fn clear_credentials(partition: &EspDefaultNvsPartition) -> anyhow::Result<()> {
    let mut nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    nvs.remove(NVS_NETWORK_KEY)?;
    Ok(())
}

fn compiled_credentials() -> Option<NetworkCredentials> {
    let ssid = option_env!("WIFI_SSID").filter(|ssid| !ssid.trim().is_empty())?;
    Some(NetworkCredentials {
        ssid: ssid.to_string(),
        password: option_env!("WIFI_PASS").unwrap_or_default().to_string(),
    })
}

/// Joins the saved network, or falls back to an open access point serving the setup portal.
struct EspProvisioner {
    wifi: EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
    partition: EspDefaultNvsPartition,
}

impl EspProvisioner {
    fn known_credentials(&self) -> Option<NetworkCredentials> {
        load_credentials(&self.partition).or_else(compiled_credentials)
    }

    fn join(&mut self, credentials: &NetworkCredentials) -> anyhow::Result<()> {
        let mut wifi = BlockingWifi::wrap(&mut self.wifi, self.sys_loop.clone())?;
        let _ = wifi.stop();
        join_station(&mut wifi, credentials)
    }

    fn run_portal(
        &mut self,
        current: &DeviceConfig,
        listener: &mut dyn ProvisioningListener,
    ) -> anyhow::Result<Option<PortalSubmission>> {
        let mac = self.wifi.sta_netif().get_mac()?;
        let ap_name = access_point_name(mac);
        let ssid = self
            .known_credentials()
            .map(|credentials| credentials.ssid)
            .unwrap_or_default();

        {
            let mut wifi = BlockingWifi::wrap(&mut self.wifi, self.sys_loop.clone())?;
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_access_point(&mut wifi, &ap_name)?;
        }

        let ap_address = self
            .wifi
            .ap_netif()
            .get_ip_info()
            .map(|info| info.ip.to_string())
            .unwrap_or_else(|_| DEFAULT_AP_ADDRESS.to_string());

        let defaults = PortalDefaults::new(&ap_name, &ssid, current);
        let (tx, rx) = mpsc::sync_channel(1);
        let server = create_portal_server(defaults, tx)?;

        listener.on_enter_provisioning(&ap_address, &ap_name);
        let submission = rx
            .recv_timeout(Duration::from_millis(PORTAL_TIMEOUT_MS))
            .ok();
        drop(server);
        Ok(submission)
    }
}

impl Provisioner for EspProvisioner {
    fn provision(
        &mut self,
        current: &DeviceConfig,
        listener: &mut dyn ProvisioningListener,
    ) -> ProvisioningOutcome {
        if option_env!("UPLINK_RESET_SETTINGS").is_some() {
            match clear_credentials(&self.partition) {
                Ok(()) => info!("*WM: settings reset"),
                Err(err) => warn!("*WM: failed to reset settings: {err:#}"),
            }
        } else if let Some(credentials) = self.known_credentials() {
            match self.join(&credentials) {
                Ok(()) => return ProvisioningOutcome::Joined,
                Err(err) => warn!("*WM: auto-connect failed: {err:#}"),
            }
        }

        let submission = match self.run_portal(current, listener) {
            Ok(Some(submission)) => submission,
            Ok(None) => return ProvisioningOutcome::Fatal(ProvisioningFailure::PortalTimeout),
            Err(err) => {
                return ProvisioningOutcome::Fatal(ProvisioningFailure::Portal(format!("{err:#}")))
            }
        };

        let credentials = NetworkCredentials {
            ssid: submission.ssid.trim().to_string(),
            password: submission.password.clone().unwrap_or_default(),
        };
        if let Err(err) = self.join(&credentials) {
            return ProvisioningOutcome::Fatal(ProvisioningFailure::JoinFailed(format!("{err:#}")));
        }

        if let Err(err) = save_credentials(&self.partition, &credentials) {
            warn!("*WM: failed to save network credentials: {err:#}");
        }
        listener.on_config_submitted(&submission.server, &submission.port);
        ProvisioningOutcome::ConfigSaved
    }
}

fn join_station(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    credentials: &NetworkCredentials,
) -> anyhow::Result<()> {
    let auth_method = if credentials.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: credentials
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: credentials
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("*WM: connecting to `{}`", credentials.ssid);

    let mut last_err = None;
    for attempt in 1..=AUTO_JOIN_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("*WM: connected on attempt {attempt}");
                return Ok(());
            }
            Err(err) => {
                warn!("*WM: connect attempt {attempt}/{AUTO_JOIN_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < AUTO_JOIN_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(AUTO_JOIN_RETRY_DELAY_MS));
        }
    }

    let _ = wifi.disconnect();
    Err(match last_err {
        Some(err) => anyhow::Error::from(err).context("all connect attempts failed"),
        None => anyhow!("all connect attempts failed"),
    })
}

fn start_access_point(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    ap_name: &str,
) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: ap_name
            .try_into()
            .map_err(|_| anyhow!("access point name too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("*WM: access point `{ap_name}` started");
    Ok(())
}

fn create_portal_server(
    defaults: PortalDefaults,
    submissions: mpsc::SyncSender<PortalSubmission>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in PORTAL_PATHS {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler(PORTAL_API_PATH, Method::Get, move |req| {
        write_json(req, &defaults)
    })?;

    server.fn_handler::<anyhow::Error, _>(PORTAL_API_PATH, Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;
        let submission: PortalSubmission =
            serde_json::from_slice(&body).context("invalid portal payload")?;

        if submission.ssid.trim().is_empty() {
            return write_error(req, 400, "ssid cannot be empty");
        }
        if let Err(err) = submission.device_config() {
            return write_error(req, 400, &err.to_string());
        }
        if submissions.try_send(submission).is_err() {
            return write_error(req, 409, "configuration already submitted");
        }

        write_json(req, &serde_json::json!({ "saved": true }))
    })?;

    Ok(server)
}

/// Accepts pushed images on `POST /update` and writes them to the inactive OTA slot.
struct EspUpdateService {
    tx: mpsc::Sender<UpdateEvent>,
    events: mpsc::Receiver<UpdateEvent>,
    in_progress: Arc<AtomicBool>,
    restart_delay_ms: u64,
    server: Option<EspHttpServer<'static>>,
}

impl EspUpdateService {
    fn new(restart_delay_ms: u64) -> Self {
        let (tx, events) = mpsc::channel();
        Self {
            tx,
            events,
            in_progress: Arc::new(AtomicBool::new(false)),
            restart_delay_ms,
            server: None,
        }
    }
}

impl UpdateTransport for EspUpdateService {
    fn begin(&mut self) -> Result<(), UpdateError> {
        let conf = HttpConfiguration {
            http_port: UPDATE_PORT,
            stack_size: 16 * 1024,
            ..Default::default()
        };
        let mut server =
            EspHttpServer::new(&conf).map_err(|err| UpdateError(format!("{err:?}")))?;

        let events = self.tx.clone();
        let in_progress = self.in_progress.clone();
        let restart_delay_ms = self.restart_delay_ms;
        server
            .fn_handler::<anyhow::Error, _>(UPDATE_PATH, Method::Post, move |mut req| {
                if !UPDATE_PASSWORD.is_empty()
                    && req.header(UPDATE_PASSWORD_HEADER).unwrap_or_default() != UPDATE_PASSWORD
                {
                    let _ = events.send(UpdateEvent::Error(UpdateErrorKind::Auth));
                    return write_error(req, 401, "invalid update password");
                }

                if in_progress.swap(true, Ordering::SeqCst) {
                    return write_error(req, 409, "update already in progress");
                }
                let result = flash_image(&mut req, &events);
                in_progress.store(false, Ordering::SeqCst);

                match result {
                    Ok(written) => {
                        write_json(req, &serde_json::json!({ "flashed": true, "bytes": written }))?;
                        schedule_restart(restart_delay_ms);
                        Ok(())
                    }
                    Err(kind) => write_error(req, 500, kind.as_str()),
                }
            })
            .map_err(|err| UpdateError(format!("{err:?}")))?;

        self.server = Some(server);
        info!("*OTA: listening on port {UPDATE_PORT}");
        Ok(())
    }

    fn poll_event(&mut self) -> Option<UpdateEvent> {
        self.events.try_recv().ok()
    }
}

fn flash_image(
    req: &mut HttpRequest<'_, '_>,
    events: &mpsc::Sender<UpdateEvent>,
) -> Result<u64, UpdateErrorKind> {
    let fail = |kind: UpdateErrorKind| {
        let _ = events.send(UpdateEvent::Error(kind));
        kind
    };

    let expected = req.content_len().unwrap_or(0);
    let mut ota = EspOta::new().map_err(|_| fail(UpdateErrorKind::Begin))?;
    let mut update = ota
        .initiate_update()
        .map_err(|_| fail(UpdateErrorKind::Begin))?;
    let _ = events.send(UpdateEvent::Start);

    let mut written = 0_u64;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];
    loop {
        let read = req
            .read(&mut chunk)
            .map_err(|_| fail(UpdateErrorKind::Receive))?;
        if read == 0 {
            break;
        }
        update
            .write(&chunk[..read])
            .map_err(|_| fail(UpdateErrorKind::Receive))?;
        written = written.saturating_add(read as u64);
        let _ = events.send(UpdateEvent::Progress {
            written,
            total: expected.max(written),
        });
    }

    if written == 0 {
        return Err(fail(UpdateErrorKind::End));
    }
    update
        .complete()
        .map_err(|_| fail(UpdateErrorKind::End))?;

    let _ = events.send(UpdateEvent::End);
    Ok(written)
}

fn schedule_restart(delay_ms: u64) {
    let spawned = thread::Builder::new()
        .name("restart-request".into())
        .spawn(move || {
            thread::sleep(Duration::from_millis(delay_ms));
            unsafe { esp_idf_svc::sys::esp_restart() };
        });
    if let Err(err) = spawned {
        warn!("failed to spawn restart thread: {err}");
    }
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({ "error": message }))?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

enum LinkEvent {
    Connected,
    Message(InboundMessage),
    Down(LinkError),
}

/// MQTT session over the ESP-IDF client. Each `connect` replaces the client and its receive
/// thread; the messaging channel owns the retry schedule.
struct EspMqttLink {
    url: String,
    user: Option<&'static str>,
    pass: Option<&'static str>,
    client: Option<EspMqttClient<'static>>,
    events: Option<mpsc::Receiver<LinkEvent>>,
    connected: Arc<AtomicBool>,
}

impl EspMqttLink {
    fn new(config: &DeviceConfig) -> Self {
        Self {
            url: format!("mqtt://{}:{}", config.mqtt_server, config.mqtt_port),
            user: option_env!("MQTT_USER").filter(|user| !user.is_empty()),
            pass: option_env!("MQTT_PASS").filter(|pass| !pass.is_empty()),
            client: None,
            events: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn teardown(&mut self) {
        // Dropping the client ends the receive thread.
        self.client = None;
        self.events = None;
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl BrokerLink for EspMqttLink {
    fn connect(&mut self, client_id: &str) -> Result<(), LinkError> {
        self.teardown();

        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: self.user,
            password: self.pass,
            ..Default::default()
        };
        let (client, mut conn) = EspMqttClient::new(&self.url, &conf)
            .map_err(|err| LinkError::Transport(format!("{err:?}")))?;

        let (tx, rx) = mpsc::channel();
        let connected = self.connected.clone();
        thread::Builder::new()
            .name("mqtt-rx".into())
            .stack_size(8 * 1024)
            .spawn(move || {
                while let Ok(event) = conn.next() {
                    let forwarded = match event.payload() {
                        EventPayload::Connected(_) => {
                            connected.store(true, Ordering::SeqCst);
                            LinkEvent::Connected
                        }
                        EventPayload::Disconnected => {
                            if connected.swap(false, Ordering::SeqCst) {
                                warn!("*PubSub: connection lost");
                            }
                            LinkEvent::Down(LinkError::ConnectionLost)
                        }
                        EventPayload::Received {
                            topic: Some(topic),
                            data,
                            ..
                        } => LinkEvent::Message(InboundMessage {
                            topic: topic.to_string(),
                            payload: data.to_vec(),
                        }),
                        EventPayload::Error(err) => {
                            warn!("*PubSub: client error: {err:?}");
                            LinkEvent::Down(LinkError::Transport(format!("{err:?}")))
                        }
                        _ => continue,
                    };
                    if tx.send(forwarded).is_err() {
                        break;
                    }
                }
            })
            .map_err(|err| LinkError::Transport(err.to_string()))?;

        self.client = Some(client);

        let deadline = Instant::now() + MQTT_CONNECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(LinkEvent::Connected) => break,
                Ok(LinkEvent::Message(_)) => {}
                Ok(LinkEvent::Down(err)) => {
                    self.teardown();
                    return Err(err);
                }
                Err(_) => {
                    self.teardown();
                    return Err(LinkError::Timeout);
                }
            }
        }

        self.events = Some(rx);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        let client = self.client.as_mut().ok_or(LinkError::NotConnected)?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| LinkError::Transport(format!("{err:?}")))
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        let client = self.client.as_mut().ok_or(LinkError::NotConnected)?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| LinkError::Transport(format!("{err:?}")))
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        let events = self.events.as_ref()?;
        loop {
            match events.try_recv().ok()? {
                LinkEvent::Message(message) => return Some(message),
                LinkEvent::Down(_) => self.connected.store(false, Ordering::SeqCst),
                LinkEvent::Connected => {}
            }
        }
    }
}

/// Status LED on a push-pull output.
struct EspPin {
    driver: PinDriver<'static, AnyOutputPin, Output>,
}

impl EspPin {
    fn new(pin: AnyOutputPin) -> anyhow::Result<Self> {
        let mut driver = PinDriver::output(pin)?;
        driver.set_low()?;
        Ok(Self { driver })
    }
}

impl IndicatorPin for EspPin {
    fn set_level(&mut self, on: bool) {
        let result = if on {
            self.driver.set_high()
        } else {
            self.driver.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive indicator: {err:?}");
        }
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn maintain_wifi_health(wifi_disconnected_since: &mut Option<Instant>) {
    if is_wifi_station_connected() {
        *wifi_disconnected_since = None;
        return;
    }

    match wifi_disconnected_since {
        Some(since) if since.elapsed().as_millis() as u64 >= WIFI_RESTART_GRACE_MS => {
            warn!(
                "wifi disconnected for {}s; restarting",
                WIFI_RESTART_GRACE_MS / 1000
            );
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        Some(_) => {}
        None => *wifi_disconnected_since = Some(Instant::now()),
    }
}
