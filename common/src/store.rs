use log::{info, warn};
use thiserror::Error;

use crate::config::DeviceConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to mount storage: {0}")]
    Mount(String),
    #[error("failed to read config record: {0}")]
    Read(String),
    #[error("failed to write config record: {0}")]
    Write(String),
}

/// Durable slot holding exactly one serialized config record.
pub trait RecordStorage {
    fn mount(&mut self) -> Result<(), StorageError>;

    /// Returns `None` when no record has ever been written.
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError>;

    fn write(&mut self, record: &[u8]) -> Result<(), StorageError>;
}

pub struct ConfigStore<S> {
    storage: S,
    mounted: bool,
}

impl<S: RecordStorage> ConfigStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            mounted: false,
        }
    }

    /// Reads the persisted record. Any failure degrades to the compiled-in defaults.
    pub fn load(&mut self) -> DeviceConfig {
        if let Err(err) = self.ensure_mounted() {
            warn!("*FS: {err}; using default config");
            return DeviceConfig::default();
        }

        let raw = match self.storage.read() {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!("*FS: no saved config; using defaults");
                return DeviceConfig::default();
            }
            Err(err) => {
                warn!("*FS: {err}; using default config");
                return DeviceConfig::default();
            }
        };

        match DeviceConfig::from_record(&raw) {
            Ok(config) => {
                info!(
                    "*FS: loaded config mqtt_server=`{}` mqtt_port=`{}`",
                    config.mqtt_server, config.mqtt_port
                );
                config
            }
            Err(err) => {
                warn!("*FS: failed to parse saved config ({err}); using defaults");
                DeviceConfig::default()
            }
        }
    }

    /// Writes the record. Failures are logged; the caller keeps running on its in-memory copy.
    pub fn save(&mut self, config: &DeviceConfig) {
        if let Err(err) = self.ensure_mounted() {
            warn!("*FS: {err}; config not saved");
            return;
        }

        match self.storage.write(&config.to_record()) {
            Ok(()) => info!("*FS: config saved"),
            Err(err) => warn!("*FS: {err}; config will not survive a restart"),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    fn ensure_mounted(&mut self) -> Result<(), StorageError> {
        if self.mounted {
            return Ok(());
        }
        self.storage.mount()?;
        self.mounted = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::MemoryStorage;

    #[test]
    fn saved_config_survives_restart() {
        let mut store = ConfigStore::new(MemoryStorage::default());
        let config = DeviceConfig::new("broker.example", "8883");
        store.save(&config);

        let mut restarted = ConfigStore::new(store.into_storage());
        assert_eq!(restarted.load(), config);
    }

    #[test]
    fn missing_record_yields_defaults() {
        let mut store = ConfigStore::new(MemoryStorage::default());
        assert_eq!(store.load(), DeviceConfig::default());
    }

    #[test]
    fn malformed_records_yield_defaults() {
        let records: [&[u8]; 5] = [
            b"",
            b"not json",
            br#"{"mqtt_server":"broker.example"}"#,
            br#"{"mqtt_server":"","mqtt_port":"1883"}"#,
            br#"{"mqtt_server":"broker.example","mqtt_port":"eighty"}"#,
        ];

        for record in records {
            let mut store = ConfigStore::new(MemoryStorage::with_record(record));
            assert_eq!(store.load(), DeviceConfig::default());
        }
    }

    #[test]
    fn read_and_mount_failures_yield_defaults() {
        let mut storage = MemoryStorage::with_record(br#"{"mqtt_server":"a","mqtt_port":"1"}"#);
        storage.fail_reads = true;
        assert_eq!(ConfigStore::new(storage).load(), DeviceConfig::default());

        let mut storage = MemoryStorage::default();
        storage.fail_mount = true;
        assert_eq!(ConfigStore::new(storage).load(), DeviceConfig::default());
    }

    #[test]
    fn write_failure_is_swallowed() {
        let mut storage = MemoryStorage::default();
        storage.fail_writes = true;
        let mut store = ConfigStore::new(storage);

        store.save(&DeviceConfig::new("broker.example", "8883"));
        assert_eq!(store.storage().record, None);
        assert_eq!(store.load(), DeviceConfig::default());
    }

    #[test]
    fn mounts_once() {
        let mut store = ConfigStore::new(MemoryStorage::default());
        store.load();
        store.save(&DeviceConfig::default());
        store.load();

        assert_eq!(store.storage().mount_calls, 1);
    }
}
