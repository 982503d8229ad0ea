#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connected => "CONNECTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningFailure {
    /// No known network answered and nobody submitted the portal form in time.
    PortalTimeout,
    /// The operator submitted the form but the network still could not be joined.
    JoinFailed(String),
    /// The access point or portal could not be brought up.
    Portal(String),
}

impl ProvisioningFailure {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PortalTimeout => "portal timed out",
            Self::JoinFailed(reason) | Self::Portal(reason) => reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    /// Joined with previously known credentials; the form was never shown.
    Joined,
    /// Joined after the operator submitted the form. The submitted broker endpoint has
    /// already been handed to `ProvisioningListener::on_config_submitted`.
    ConfigSaved,
    Fatal(ProvisioningFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateErrorKind {
    Auth,
    Begin,
    Connect,
    Receive,
    End,
}

impl UpdateErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "Auth Failed",
            Self::Begin => "Begin Failed",
            Self::Connect => "Connect Failed",
            Self::Receive => "Receive Failed",
            Self::End => "End Failed",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Auth => 0,
            Self::Begin => 1,
            Self::Connect => 2,
            Self::Receive => 3,
            Self::End => 4,
        }
    }
}

/// Lifecycle notification raised by an update transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEvent {
    Start,
    Progress { written: u64, total: u64 },
    End,
    Error(UpdateErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    Init,
    LoadConfig,
    Provision,
    StartManagement,
    StartMessaging,
    SteadyState,
    Restart,
}

impl BootPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::LoadConfig => "LOAD_CONFIG",
            Self::Provision => "PROVISION",
            Self::StartManagement => "START_MANAGEMENT",
            Self::StartMessaging => "START_MESSAGING",
            Self::SteadyState => "STEADY_STATE",
            Self::Restart => "RESTART",
        }
    }
}

/// Percentage for a progress notification. Unknown totals report 0.
pub fn progress_percent(written: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (written.saturating_mul(100) / total).min(100) as u8
}
