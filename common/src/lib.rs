pub mod config;
pub mod indicator;
pub mod management;
pub mod messaging;
pub mod provisioning;
pub mod reconnect;
pub mod store;
pub mod supervisor;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, DeviceConfig, NodeOptions};
pub use indicator::{Indicator, IndicatorPin};
pub use management::{ManagementChannel, UpdateError, UpdateListener, UpdateTransport};
pub use messaging::{BrokerLink, InboundMessage, LinkError, MessagingChannel};
pub use provisioning::{Provisioner, ProvisioningListener};
pub use reconnect::ReconnectPolicy;
pub use store::{ConfigStore, RecordStorage, StorageError};
pub use supervisor::{RestartRequest, SteadyState, Supervisor};
pub use topics::*;
pub use types::{
    BootPhase, ConnectionState, ProvisioningFailure, ProvisioningOutcome, UpdateErrorKind,
    UpdateEvent,
};
