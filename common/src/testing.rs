//! In-memory collaborators for unit tests.

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use crate::{
    config::DeviceConfig,
    indicator::IndicatorPin,
    management::{UpdateError, UpdateTransport},
    messaging::{BrokerLink, InboundMessage, LinkError},
    provisioning::{Provisioner, ProvisioningListener},
    store::{RecordStorage, StorageError},
    types::{ProvisioningFailure, ProvisioningOutcome, UpdateEvent},
};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    pub record: Option<Vec<u8>>,
    pub fail_mount: bool,
    pub fail_reads: bool,
    pub fail_writes: bool,
    pub mount_calls: usize,
    pub writes: usize,
}

impl MemoryStorage {
    pub fn with_record(record: &[u8]) -> Self {
        Self {
            record: Some(record.to_vec()),
            ..Default::default()
        }
    }
}

impl RecordStorage for MemoryStorage {
    fn mount(&mut self) -> Result<(), StorageError> {
        self.mount_calls += 1;
        if self.fail_mount {
            return Err(StorageError::Mount("no filesystem".to_string()));
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        if self.fail_reads {
            return Err(StorageError::Read("bad sector".to_string()));
        }
        Ok(self.record.clone())
    }

    fn write(&mut self, record: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Write("read-only".to_string()));
        }
        self.writes += 1;
        self.record = Some(record.to_vec());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingPin {
    pub levels: Vec<bool>,
}

impl IndicatorPin for RecordingPin {
    fn set_level(&mut self, on: bool) {
        self.levels.push(on);
    }
}

#[derive(Default)]
pub struct FakeLink {
    pub connected: bool,
    pub refuse_with: Option<LinkError>,
    pub connect_calls: usize,
    pub client_ids: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    pub subscriptions: Vec<String>,
    pub inbound: VecDeque<InboundMessage>,
    pub on_connect: Option<Box<dyn FnMut()>>,
}

impl FakeLink {
    pub fn refusing(code: i32) -> Self {
        Self {
            refuse_with: Some(LinkError::Refused { code }),
            ..Default::default()
        }
    }

    pub fn queue(&mut self, topic: &str, payload: &[u8]) {
        self.inbound.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.published
            .iter()
            .filter(|(published_topic, _)| published_topic == topic)
            .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }
}

impl BrokerLink for FakeLink {
    fn connect(&mut self, client_id: &str) -> Result<(), LinkError> {
        self.connect_calls += 1;
        self.client_ids.push(client_id.to_string());
        if let Some(hook) = self.on_connect.as_mut() {
            hook();
        }
        if let Some(err) = self.refuse_with.clone() {
            return Err(err);
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        self.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn poll_inbound(&mut self) -> Option<InboundMessage> {
        if !self.connected {
            return None;
        }
        self.inbound.pop_front()
    }
}

#[derive(Default)]
pub struct FakeUpdates {
    events: Rc<RefCell<VecDeque<UpdateEvent>>>,
    pub fail_begin: bool,
}

impl FakeUpdates {
    pub fn with_events(events: impl IntoIterator<Item = UpdateEvent>) -> Self {
        Self {
            events: Rc::new(RefCell::new(events.into_iter().collect())),
            fail_begin: false,
        }
    }

    pub fn queue(&self) -> Rc<RefCell<VecDeque<UpdateEvent>>> {
        self.events.clone()
    }
}

impl UpdateTransport for FakeUpdates {
    fn begin(&mut self) -> Result<(), UpdateError> {
        if self.fail_begin {
            return Err(UpdateError("port in use".to_string()));
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<UpdateEvent> {
        self.events.borrow_mut().pop_front()
    }
}

pub struct FakeProvisioner {
    outcome: ProvisioningOutcome,
    submission: Option<(String, String)>,
    pub seen_defaults: Option<DeviceConfig>,
}

impl FakeProvisioner {
    pub fn joining() -> Self {
        Self {
            outcome: ProvisioningOutcome::Joined,
            submission: None,
            seen_defaults: None,
        }
    }

    pub fn submitting(server: &str, port: &str) -> Self {
        Self {
            outcome: ProvisioningOutcome::ConfigSaved,
            submission: Some((server.to_string(), port.to_string())),
            seen_defaults: None,
        }
    }

    pub fn failing(failure: ProvisioningFailure) -> Self {
        Self {
            outcome: ProvisioningOutcome::Fatal(failure),
            submission: None,
            seen_defaults: None,
        }
    }
}

impl Provisioner for FakeProvisioner {
    fn provision(
        &mut self,
        current: &DeviceConfig,
        listener: &mut dyn ProvisioningListener,
    ) -> ProvisioningOutcome {
        self.seen_defaults = Some(current.clone());
        if let Some((server, port)) = self.submission.as_ref() {
            listener.on_enter_provisioning("192.168.4.1", "UPLINK-000001");
            listener.on_config_submitted(server, port);
        }
        self.outcome.clone()
    }
}
