use std::{
    collections::VecDeque,
    hash::{DefaultHasher, Hash, Hasher},
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, ConnectionError, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, runtime::Handle, task::JoinHandle};
use tracing::{info, trace, warn};

use uplink_common::{
    messaging::InboundMessage,
    provisioning::{access_point_name, PortalDefaults, PortalSubmission, PORTAL_TIMEOUT_MS},
    BrokerLink, ConfigStore, DeviceConfig, IndicatorPin, LinkError, NodeOptions, Provisioner,
    ProvisioningFailure, ProvisioningListener, ProvisioningOutcome, ReconnectPolicy,
    RecordStorage, StorageError, Supervisor, UpdateError, UpdateErrorKind, UpdateEvent,
    UpdateTransport,
};

use crate::portal::{
    PORTAL_API_PATH, PORTAL_HTML, PORTAL_PATHS, UPDATE_PASSWORD_HEADER, UPDATE_PATH,
};

const CONFIG_FILE: &str = "config.json";
const NETWORK_FILE: &str = "network.json";
const STAGED_IMAGE_FILE: &str = "staged-firmware.bin";
const LOOP_INTERVAL_MS: u64 = 10;
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const MAX_UPDATE_BYTES: usize = 4 * 1024 * 1024;
const UPDATE_CHUNK_SIZE: usize = 4096;
/// Exit status asking the supervising environment to relaunch the node.
const RESTART_EXIT_CODE: i32 = 75;

#[derive(Debug, Clone)]
struct HostSettings {
    data_dir: PathBuf,
    portal_port: u16,
    update_port: u16,
    reconnect: ReconnectPolicy,
    reset_settings: bool,
    wifi_ssid: Option<String>,
    mqtt_user: String,
    mqtt_pass: String,
    update_password: String,
}

impl HostSettings {
    fn from_env() -> Self {
        let data_dir = std::env::var("UPLINK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.uplink"));

        Self {
            data_dir,
            portal_port: env_port("UPLINK_PORTAL_PORT").unwrap_or(8080),
            update_port: env_port("UPLINK_UPDATE_PORT").unwrap_or(8266),
            reconnect: std::env::var("UPLINK_RECONNECT")
                .ok()
                .and_then(|value| ReconnectPolicy::parse(&value))
                .unwrap_or_default(),
            reset_settings: std::env::var("UPLINK_RESET_SETTINGS")
                .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
                .unwrap_or(false),
            wifi_ssid: std::env::var("UPLINK_WIFI_SSID")
                .ok()
                .or_else(|| option_env!("WIFI_SSID").map(str::to_string))
                .filter(|ssid| !ssid.trim().is_empty()),
            mqtt_user: std::env::var("MQTT_USER").unwrap_or_default(),
            mqtt_pass: std::env::var("MQTT_PASS").unwrap_or_default(),
            update_password: std::env::var("UPLINK_UPDATE_PASSWORD")
                .ok()
                .or_else(|| option_env!("UPLINK_UPDATE_PASSWORD").map(str::to_string))
                .unwrap_or_default(),
        }
    }
}

fn env_port(key: &str) -> Option<u16> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
}

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("booting uplink node (host)");
    let settings = HostSettings::from_env();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let options = NodeOptions {
        reconnect: settings.reconnect,
        ..NodeOptions::default()
    };
    let storage = FileStorage::new(settings.data_dir.join(CONFIG_FILE));
    let provisioner = HostProvisioner::new(runtime.handle().clone(), settings.clone());
    let updates = HostUpdateService::new(runtime.handle().clone(), &settings);
    let mut supervisor = Supervisor::new(ConfigStore::new(storage), provisioner, options);

    let handle = runtime.handle().clone();
    let boot = supervisor.boot(
        updates,
        |config: &DeviceConfig| RumqttLink::new(handle, config, &settings),
        LogPin,
        monotonic_ms(),
    );

    let mut node = match boot {
        Ok(node) => node,
        Err(restart) => {
            thread::sleep(Duration::from_millis(restart.delay_ms));
            warn!("restarting: {}", restart.reason);
            std::process::exit(RESTART_EXIT_CODE);
        }
    };

    info!("uplink node running");
    loop {
        node.step(monotonic_ms());
        thread::sleep(Duration::from_millis(LOOP_INTERVAL_MS));
    }
}

/// Config record kept as a JSON file under the data directory.
struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl RecordStorage for FileStorage {
    fn mount(&mut self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| StorageError::Mount(format!("{}: {err}", parent.display())))?;
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Read(format!(
                "{}: {err}",
                self.path.display()
            ))),
        }
    }

    fn write(&mut self, record: &[u8]) -> Result<(), StorageError> {
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, record)
            .and_then(|()| std::fs::rename(&staging, &self.path))
            .map_err(|err| StorageError::Write(format!("{}: {err}", self.path.display())))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct NetworkCredentials {
    ssid: String,
    #[serde(default)]
    password: String,
}

fn load_credentials(path: &Path) -> Option<NetworkCredentials> {
    let raw = std::fs::read(path).ok()?;
    serde_json::from_slice::<NetworkCredentials>(&raw)
        .ok()
        .filter(|credentials| !credentials.ssid.trim().is_empty())
}

fn save_credentials(path: &Path, credentials: &NetworkCredentials) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(credentials)?)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[derive(Clone)]
struct PortalState {
    defaults: Arc<PortalDefaults>,
    submissions: tokio::sync::mpsc::Sender<PortalSubmission>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Stands in for the Wi-Fi manager: the host is always on a network, so "joining" means
/// having credentials on file. Without them the portal form is served over HTTP.
struct HostProvisioner {
    handle: Handle,
    settings: HostSettings,
}

impl HostProvisioner {
    fn new(handle: Handle, settings: HostSettings) -> Self {
        Self { handle, settings }
    }

    fn credentials_path(&self) -> PathBuf {
        self.settings.data_dir.join(NETWORK_FILE)
    }

    fn known_credentials(&self) -> Option<NetworkCredentials> {
        load_credentials(&self.credentials_path()).or_else(|| {
            self.settings
                .wifi_ssid
                .as_ref()
                .map(|ssid| NetworkCredentials {
                    ssid: ssid.clone(),
                    password: String::new(),
                })
        })
    }

    fn run_portal(
        &self,
        current: &DeviceConfig,
        listener: &mut dyn ProvisioningListener,
    ) -> anyhow::Result<Option<PortalSubmission>> {
        let ap_name = access_point_name(host_device_id());
        let ssid = self
            .known_credentials()
            .map(|credentials| credentials.ssid)
            .unwrap_or_default();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let state = PortalState {
            defaults: Arc::new(PortalDefaults::new(&ap_name, &ssid, current)),
            submissions: tx,
        };

        let mut app = Router::new();
        for path in PORTAL_PATHS {
            app = app.route(path, get(handle_portal_page));
        }
        let app = app
            .route(
                PORTAL_API_PATH,
                get(handle_get_portal).post(handle_post_portal),
            )
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.settings.portal_port));
        let listener_socket = self
            .handle
            .block_on(TcpListener::bind(addr))
            .with_context(|| format!("failed to bind provisioning portal at {addr}"))?;
        let server: JoinHandle<()> = self.handle.spawn(async move {
            if let Err(err) = axum::serve(listener_socket, app).await {
                warn!("provisioning portal stopped: {err}");
            }
        });

        listener.on_enter_provisioning(&format!("http://{addr}"), &ap_name);

        let timeout = Duration::from_millis(PORTAL_TIMEOUT_MS);
        let submission = self
            .handle
            .block_on(async { tokio::time::timeout(timeout, rx.recv()).await })
            .ok()
            .flatten();
        server.abort();
        Ok(submission)
    }
}

impl Provisioner for HostProvisioner {
    fn provision(
        &mut self,
        current: &DeviceConfig,
        listener: &mut dyn ProvisioningListener,
    ) -> ProvisioningOutcome {
        let credentials_path = self.credentials_path();
        if self.settings.reset_settings {
            match std::fs::remove_file(&credentials_path) {
                Ok(()) => info!("*WM: settings reset"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!("*WM: failed to reset settings: {err}"),
            }
        } else if let Some(credentials) = self.known_credentials() {
            info!("*WM: joined `{}` with saved credentials", credentials.ssid);
            return ProvisioningOutcome::Joined;
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
        if credentials.ssid.is_empty() {
            return ProvisioningOutcome::Fatal(ProvisioningFailure::JoinFailed(
                "no SSID submitted".to_string(),
            ));
        }
        if let Err(err) = save_credentials(&credentials_path, &credentials) {
            warn!("*WM: {err:#}");
        }

        listener.on_config_submitted(&submission.server, &submission.port);
        ProvisioningOutcome::ConfigSaved
    }
}

async fn handle_portal_page() -> impl IntoResponse {
    Html(PORTAL_HTML)
}

async fn handle_get_portal(State(state): State<PortalState>) -> impl IntoResponse {
    Json((*state.defaults).clone())
}

async fn handle_post_portal(
    State(state): State<PortalState>,
    Json(submission): Json<PortalSubmission>,
) -> axum::response::Response {
    if submission.ssid.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "ssid cannot be empty");
    }
    if let Err(err) = submission.device_config() {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }
    if state.submissions.try_send(submission).is_err() {
        return error_response(StatusCode::CONFLICT, "configuration already submitted");
    }
    Json(serde_json::json!({ "saved": true })).into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[derive(Clone)]
struct UpdateState {
    events: mpsc::Sender<UpdateEvent>,
    in_progress: Arc<AtomicBool>,
    staged_path: Arc<PathBuf>,
    password: Arc<String>,
}

/// Accepts pushed images over HTTP and stages them next to the config record.
struct HostUpdateService {
    handle: Handle,
    port: u16,
    state: UpdateState,
    events: mpsc::Receiver<UpdateEvent>,
    server: Option<JoinHandle<()>>,
}

impl HostUpdateService {
    fn new(handle: Handle, settings: &HostSettings) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            handle,
            port: settings.update_port,
            state: UpdateState {
                events: tx,
                in_progress: Arc::new(AtomicBool::new(false)),
                staged_path: Arc::new(settings.data_dir.join(STAGED_IMAGE_FILE)),
                password: Arc::new(settings.update_password.clone()),
            },
            events: rx,
            server: None,
        }
    }
}

impl Drop for HostUpdateService {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

impl UpdateTransport for HostUpdateService {
    fn begin(&mut self) -> Result<(), UpdateError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = self
            .handle
            .block_on(TcpListener::bind(addr))
            .map_err(|err| UpdateError(format!("failed to bind {addr}: {err}")))?;

        let app = Router::new()
            .route(UPDATE_PATH, post(handle_post_update))
            .layer(DefaultBodyLimit::max(MAX_UPDATE_BYTES))
            .with_state(self.state.clone());

        self.server = Some(self.handle.spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!("update server stopped: {err}");
            }
        }));
        info!("*OTA: listening on http://{addr}{UPDATE_PATH}");
        Ok(())
    }

    fn poll_event(&mut self) -> Option<UpdateEvent> {
        self.events.try_recv().ok()
    }
}

async fn handle_post_update(
    State(state): State<UpdateState>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    if !state.password.is_empty() {
        let supplied = headers
            .get(UPDATE_PASSWORD_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if supplied != state.password.as_str() {
            let _ = state.events.send(UpdateEvent::Error(UpdateErrorKind::Auth));
            return error_response(StatusCode::UNAUTHORIZED, "invalid update password");
        }
    }

    if state.in_progress.swap(true, Ordering::SeqCst) {
        return error_response(StatusCode::CONFLICT, "update already in progress");
    }
    let result = stage_image(&state, &body).await;
    state.in_progress.store(false, Ordering::SeqCst);

    match result {
        Ok(written) => Json(serde_json::json!({ "staged": true, "bytes": written })).into_response(),
        Err(kind) => error_response(StatusCode::INTERNAL_SERVER_ERROR, kind.as_str()),
    }
}

/// Writes the image to disk, reporting each stage on the event channel.
async fn stage_image(state: &UpdateState, image: &[u8]) -> Result<u64, UpdateErrorKind> {
    use tokio::io::AsyncWriteExt;

    let fail = |kind: UpdateErrorKind| {
        let _ = state.events.send(UpdateEvent::Error(kind));
        kind
    };

    if image.is_empty() {
        return Err(fail(UpdateErrorKind::Begin));
    }

    let partial = state.staged_path.with_extension("part");
    if let Some(parent) = partial.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|_| fail(UpdateErrorKind::Begin))?;
    }
    let mut file = tokio::fs::File::create(&partial)
        .await
        .map_err(|_| fail(UpdateErrorKind::Begin))?;

    let _ = state.events.send(UpdateEvent::Start);
    let total = image.len() as u64;
    let mut written = 0_u64;
    for chunk in image.chunks(UPDATE_CHUNK_SIZE) {
        file.write_all(chunk)
            .await
            .map_err(|_| fail(UpdateErrorKind::Receive))?;
        written = written.saturating_add(chunk.len() as u64);
        let _ = state.events.send(UpdateEvent::Progress { written, total });
    }

    file.flush().await.map_err(|_| fail(UpdateErrorKind::End))?;
    drop(file);
    tokio::fs::rename(&partial, state.staged_path.as_ref())
        .await
        .map_err(|_| fail(UpdateErrorKind::End))?;

    let _ = state.events.send(UpdateEvent::End);
    info!(
        "update image staged at {} ({written} bytes)",
        state.staged_path.display()
    );
    Ok(written)
}

enum LinkEvent {
    Connected,
    Message(InboundMessage),
    Down(LinkError),
}

/// MQTT session over rumqttc. Each `connect` builds a fresh event loop; a dropped session
/// is never retried internally, the messaging channel decides when to try again.
struct RumqttLink {
    handle: Handle,
    host: String,
    port: u16,
    user: String,
    pass: String,
    client: Option<AsyncClient>,
    pump: Option<JoinHandle<()>>,
    events: Option<mpsc::Receiver<LinkEvent>>,
    connected: Arc<AtomicBool>,
    pending: VecDeque<InboundMessage>,
}

impl RumqttLink {
    fn new(handle: Handle, config: &DeviceConfig, settings: &HostSettings) -> Self {
        Self {
            handle,
            host: config.mqtt_server.clone(),
            port: config.port_number().unwrap_or(1883),
            user: settings.mqtt_user.clone(),
            pass: settings.mqtt_pass.clone(),
            client: None,
            pump: None,
            events: None,
            connected: Arc::new(AtomicBool::new(false)),
            pending: VecDeque::new(),
        }
    }

    fn teardown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.client = None;
        self.events = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    fn drain_events(&mut self) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        while let Ok(event) = events.try_recv() {
            match event {
                LinkEvent::Message(message) => self.pending.push_back(message),
                LinkEvent::Down(_) => self.connected.store(false, Ordering::SeqCst),
                LinkEvent::Connected => {}
            }
        }
    }
}

impl Drop for RumqttLink {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl BrokerLink for RumqttLink {
    fn connect(&mut self, client_id: &str) -> Result<(), LinkError> {
        self.teardown();
        self.pending.clear();

        let mut mqtt_options = MqttOptions::new(client_id, self.host.clone(), self.port);
        mqtt_options.set_keep_alive(MQTT_KEEP_ALIVE);
        if !self.user.is_empty() {
            mqtt_options.set_credentials(self.user.clone(), self.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 32);
        let (tx, rx) = mpsc::channel();
        let connected = self.connected.clone();
        let pump = self.handle.spawn(async move {
            loop {
                let event = match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        LinkEvent::Connected
                    }
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        LinkEvent::Message(InboundMessage {
                            topic: message.topic,
                            payload: message.payload.to_vec(),
                        })
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let err = link_error(err);
                        if connected.swap(false, Ordering::SeqCst) {
                            warn!("*PubSub: connection lost: {err}");
                        }
                        let _ = tx.send(LinkEvent::Down(err));
                        break;
                    }
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        self.client = Some(client);
        self.pump = Some(pump);

        let deadline = Instant::now() + MQTT_CONNECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(LinkEvent::Connected) => break,
                Ok(LinkEvent::Message(message)) => self.pending.push_back(message),
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
        let client = self.client.as_ref().ok_or(LinkError::NotConnected)?;
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| LinkError::Transport(err.to_string()))
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        let client = self.client.as_ref().ok_or(LinkError::NotConnected)?;
        client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| LinkError::Transport(err.to_string()))
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        self.drain_events();
        self.pending.pop_front()
    }
}

fn link_error(err: ConnectionError) -> LinkError {
    match err {
        ConnectionError::ConnectionRefused(code) => LinkError::Refused { code: code as i32 },
        ConnectionError::NetworkTimeout => LinkError::Timeout,
        other => LinkError::Transport(other.to_string()),
    }
}

/// The host has no LED; level changes go to the trace log.
struct LogPin;

impl IndicatorPin for LogPin {
    fn set_level(&mut self, on: bool) {
        trace!("indicator {}", if on { "on" } else { "off" });
    }
}

/// Stable six-byte identity for the access point name, derived from the host name.
fn host_device_id() -> [u8; 6] {
    let name = std::env::var("HOSTNAME").unwrap_or_else(|_| "uplink-host".to_string());
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let digest = hasher.finish().to_be_bytes();
    [
        digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]
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
