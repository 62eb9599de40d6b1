use std::{
    collections::BTreeMap,
    fs, io,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use lanclip_core::UNKNOWN_DEVICE_NAME;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const PAIRED_DEVICES_FILE: &str = "paired_devices.json";

/// The file holds a handful of records; anything bigger is corrupt or hostile.
pub const MAX_STORE_BYTES: u64 = 1024 * 1024;

/// Durable form of a device we have a pairing relationship with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub address: IpAddr,
    pub hostname: String,
    pub send_enabled: bool,
    pub receive_enabled: bool,
    pub manually_disconnected: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
}

pub trait DeviceStore: Send + Sync {
    fn load(&self) -> Result<Vec<DeviceRecord>, StoreError>;
    /// Replaces the stored list in full.
    fn save(&self, records: &[DeviceRecord]) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDevice {
    #[serde(default = "unknown_name")]
    hostname: String,
    #[serde(default)]
    send_enabled: bool,
    #[serde(default)]
    receive_enabled: bool,
    #[serde(default)]
    manually_disconnected: bool,
}

fn unknown_name() -> String {
    UNKNOWN_DEVICE_NAME.to_owned()
}

/// `paired_devices.json`: an object keyed by address.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(PAIRED_DEVICES_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceStore for JsonFileStore {
    fn load(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let size = fs::metadata(&self.path).map_err(StoreError::Metadata)?.len();
        if size > MAX_STORE_BYTES {
            return Err(StoreError::TooLarge {
                size,
                max: MAX_STORE_BYTES,
            });
        }

        let data = fs::read_to_string(&self.path).map_err(StoreError::Read)?;
        let stored: BTreeMap<String, StoredDevice> =
            serde_json::from_str(&data).map_err(StoreError::Parse)?;

        let mut records = Vec::with_capacity(stored.len());
        for (key, device) in stored {
            let Ok(address) = key.parse::<IpAddr>() else {
                warn!(path = %self.path.display(), "skipping stored device with bad address {key:?}");
                continue;
            };
            records.push(DeviceRecord {
                address,
                hostname: device.hostname,
                send_enabled: device.send_enabled,
                receive_enabled: device.receive_enabled,
                manually_disconnected: device.manually_disconnected,
            });
        }
        Ok(records)
    }

    fn save(&self, records: &[DeviceRecord]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(StoreError::WriteTmp)?;
        }

        let stored: BTreeMap<String, StoredDevice> = records
            .iter()
            .map(|record| {
                (
                    record.address.to_string(),
                    StoredDevice {
                        hostname: record.hostname.clone(),
                        send_enabled: record.send_enabled,
                        receive_enabled: record.receive_enabled,
                        manually_disconnected: record.manually_disconnected,
                    },
                )
            })
            .collect();
        let payload = serde_json::to_string_pretty(&stored).map_err(StoreError::Serialize)?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload.as_bytes()).map_err(StoreError::WriteTmp)?;
        fs::rename(&tmp_path, &self.path).map_err(StoreError::Rename)?;
        Ok(())
    }
}

/// Keeps records in memory only. Useful when nothing should touch the disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<DeviceRecord>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn with_records(records: Vec<DeviceRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn records(&self) -> Vec<DeviceRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl DeviceStore for MemoryStore {
    fn load(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.records())
    }

    fn save(&self, records: &[DeviceRecord]) -> Result<(), StoreError> {
        *self.records.lock().unwrap_or_else(PoisonError::into_inner) = records.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
