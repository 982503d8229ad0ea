use log::{info, warn};
use thiserror::Error;

use crate::types::{progress_percent, UpdateErrorKind, UpdateEvent};

/// Events drained per `handle` call, so a chatty transfer cannot stall the loop.
const MAX_EVENTS_PER_HANDLE: usize = 16;

#[derive(Debug, Error)]
#[error("update service unavailable: {0}")]
pub struct UpdateError(pub String);

/// Remote firmware update service. Transfers are always triggered from the remote side.
pub trait UpdateTransport {
    /// Arms the service once the network is up.
    fn begin(&mut self) -> Result<(), UpdateError>;

    /// Next lifecycle event, without blocking.
    fn poll_event(&mut self) -> Option<UpdateEvent>;
}

pub trait UpdateListener {
    fn on_start(&mut self);
    fn on_progress(&mut self, percent: u8);
    fn on_end(&mut self);
    fn on_error(&mut self, kind: UpdateErrorKind);
}

/// Writes update lifecycle lines to the log.
#[derive(Debug, Default)]
pub struct DiagnosticUpdateListener {
    last_percent: Option<u8>,
}

impl UpdateListener for DiagnosticUpdateListener {
    fn on_start(&mut self) {
        self.last_percent = None;
        info!("*OTA: Start");
    }

    fn on_progress(&mut self, percent: u8) {
        if self.last_percent == Some(percent) {
            return;
        }
        self.last_percent = Some(percent);
        info!("*OTA: Progress: {percent}%");
    }

    fn on_end(&mut self) {
        info!("*OTA: End");
    }

    fn on_error(&mut self, kind: UpdateErrorKind) {
        warn!("*OTA: Error[{}]: {}", kind.code(), kind.as_str());
    }
}

pub struct ManagementChannel<U> {
    transport: U,
    listener: Option<Box<dyn UpdateListener>>,
    armed: bool,
}

impl<U: UpdateTransport> ManagementChannel<U> {
    pub fn new(transport: U) -> Self {
        Self {
            transport,
            listener: None,
            armed: false,
        }
    }

    /// Replaces any previously registered listener.
    pub fn set_listener(&mut self, listener: Box<dyn UpdateListener>) {
        self.listener = Some(listener);
    }

    pub fn begin(&mut self) -> Result<(), UpdateError> {
        self.transport.begin()?;
        self.armed = true;
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Forwards pending transport events to the listener. Returns the number handled.
    pub fn handle(&mut self) -> usize {
        if !self.armed {
            return 0;
        }

        let mut handled = 0;
        while handled < MAX_EVENTS_PER_HANDLE {
            let Some(event) = self.transport.poll_event() else {
                break;
            };
            handled += 1;

            let Some(listener) = self.listener.as_mut() else {
                continue;
            };
            match event {
                UpdateEvent::Start => listener.on_start(),
                UpdateEvent::Progress { written, total } => {
                    listener.on_progress(progress_percent(written, total))
                }
                UpdateEvent::End => listener.on_end(),
                UpdateEvent::Error(kind) => listener.on_error(kind),
            }
        }
        handled
    }
}
