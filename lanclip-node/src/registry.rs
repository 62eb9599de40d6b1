//! The authoritative table of remote devices.
//!
//! All reads and read-modify-write sequences go through one mutex around the
//! map, so discovery, pairing, relay and the timeout monitor never see a torn
//! [`Device`]. Callers only ever get cloned snapshots back. Every mutation
//! publishes [`NodeEvent::DeviceListChanged`](crate::events::NodeEvent) and,
//! when it changes anything durable, rewrites the paired-device list while
//! still holding the lock so the file follows mutation order.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use lanclip_core::UNKNOWN_DEVICE_NAME;
use tracing::{info, warn};

use crate::{
    error::NodeError,
    events::EventBus,
    store::{DeviceRecord, DeviceStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Discovered,
    Paired,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub address: IpAddr,
    pub display_name: String,
    pub status: DeviceStatus,
    /// Local clipboard changes are pushed to this device.
    pub send_enabled: bool,
    /// Clipboard pushes from this device are applied locally.
    pub receive_enabled: bool,
    pub last_seen: Instant,
    /// An inbound pairing request is waiting for a local decision.
    pub pairing_pending: bool,
    /// We sent a pairing request and have not had the answer yet.
    pub awaiting_response: bool,
    pub manually_disconnected: bool,
}

impl Device {
    fn new(address: IpAddr) -> Self {
        Self {
            address,
            display_name: UNKNOWN_DEVICE_NAME.to_owned(),
            status: DeviceStatus::Discovered,
            send_enabled: false,
            receive_enabled: false,
            last_seen: Instant::now(),
            pairing_pending: false,
            awaiting_response: false,
            manually_disconnected: false,
        }
    }

    fn restored(record: DeviceRecord) -> Self {
        Self {
            display_name: record.hostname,
            status: DeviceStatus::Disconnected,
            send_enabled: record.send_enabled,
            receive_enabled: record.receive_enabled,
            manually_disconnected: record.manually_disconnected,
            ..Self::new(record.address)
        }
    }

    pub fn is_paired(&self) -> bool {
        self.status == DeviceStatus::Paired
    }

    pub fn is_active(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() < timeout
    }

    /// Records inbound traffic. A name only replaces the current one when it
    /// carries information.
    fn touch(&mut self, name: Option<&str>) {
        self.last_seen = Instant::now();
        if let Some(name) = name.map(str::trim)
            && !name.is_empty()
            && name != UNKNOWN_DEVICE_NAME
        {
            self.display_name = name.to_owned();
        }
    }

    // Anything that has ever been paired is kept on disk; `Discovered` entries are not.
    fn durable_state(&self) -> (bool, Option<DeviceRecord>) {
        let record = (self.status != DeviceStatus::Discovered).then(|| DeviceRecord {
            address: self.address,
            hostname: self.display_name.clone(),
            send_enabled: self.send_enabled,
            receive_enabled: self.receive_enabled,
            manually_disconnected: self.manually_disconnected,
        });
        (self.is_paired(), record)
    }
}

/// What a discovery broadcast did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Known device, liveness refreshed.
    Refreshed,
    /// Previously paired device is back and was promoted to `Paired`.
    Reconnected(Device),
    /// First sighting; the caller should ask it to pair.
    Discovered(Device),
    /// Unknown device while discovery is off; nothing recorded.
    Ignored,
}

#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    devices: Mutex<HashMap<IpAddr, Device>>,
    store: Arc<dyn DeviceStore>,
    events: EventBus,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn DeviceStore>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                devices: Mutex::new(HashMap::new()),
                store,
                events,
            }),
        }
    }

    /// Restores persisted devices as `Disconnected` until they are seen again.
    pub fn load_persisted(&self) -> Result<usize, NodeError> {
        let records = self.inner.store.load()?;
        let count = records.len();
        {
            let mut devices = self.lock();
            for record in records {
                devices.insert(record.address, Device::restored(record));
            }
        }
        self.inner.events.device_list_changed();
        Ok(count)
    }

    pub fn get(&self, address: IpAddr) -> Option<Device> {
        self.lock().get(&address).cloned()
    }

    /// Snapshot of every device, ordered by address.
    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.lock().values().cloned().collect();
        devices.sort_by_key(|device| device.address);
        devices
    }

    /// Devices heard from within `timeout`, ordered by address.
    pub fn list_active(&self, timeout: Duration) -> Vec<Device> {
        self.list()
            .into_iter()
            .filter(|device| device.is_active(timeout))
            .collect()
    }

    /// Creates the device or refreshes its `last_seen`. The name is only
    /// overwritten by a meaningful value, the status only when supplied.
    pub fn upsert(
        &self,
        address: IpAddr,
        name: Option<&str>,
        status: Option<DeviceStatus>,
    ) -> Device {
        self.upsert_with(address, |device| {
            device.touch(name);
            if let Some(status) = status {
                device.status = status;
            }
            device.clone()
        })
    }

    /// Refreshes liveness of a known device. Returns false for strangers.
    pub fn touch(&self, address: IpAddr, name: Option<&str>) -> bool {
        self.update(address, |device| {
            device.touch(name);
            Ok(())
        })
        .is_ok()
    }

    pub fn remove(&self, address: IpAddr) -> Option<Device> {
        let mut devices = self.lock();
        let removed = devices.remove(&address)?;
        if removed.durable_state().1.is_some() {
            self.persist(&devices);
        }
        drop(devices);
        self.inner.events.device_list_changed();
        Some(removed)
    }

    pub fn set_send_enabled(&self, address: IpAddr, enabled: bool) -> Result<Device, NodeError> {
        self.update(address, |device| {
            if !device.is_paired() {
                return Err(NodeError::NotPaired(address));
            }
            device.send_enabled = enabled;
            Ok(device.clone())
        })
    }

    pub fn set_receive_enabled(&self, address: IpAddr, enabled: bool) -> Result<Device, NodeError> {
        self.update(address, |device| {
            if !device.is_paired() {
                return Err(NodeError::NotPaired(address));
            }
            device.receive_enabled = enabled;
            Ok(device.clone())
        })
    }

    /// May `address` push clipboard content to us?
    pub fn is_authorized_sender(&self, address: IpAddr) -> bool {
        self.lock()
            .get(&address)
            .is_some_and(|device| device.is_paired() && device.receive_enabled)
    }

    /// May we push clipboard content to `address`?
    pub fn is_authorized_recipient(&self, address: IpAddr) -> bool {
        self.lock()
            .get(&address)
            .is_some_and(|device| device.is_paired() && device.send_enabled)
    }

    /// Active devices that currently pass [`Self::is_authorized_recipient`].
    pub fn authorized_recipients(&self, timeout: Duration) -> Vec<Device> {
        self.list_active(timeout)
            .into_iter()
            .filter(|device| device.is_paired() && device.send_enabled)
            .collect()
    }

    /// Applies one discovery broadcast from `address` as a single atomic step.
    pub fn observe_discovery(
        &self,
        address: IpAddr,
        name: &str,
        discovery_enabled: bool,
    ) -> DiscoveryOutcome {
        let mut devices = self.lock();
        let outcome = match devices.get_mut(&address) {
            Some(device) => {
                let before = device.durable_state();
                device.touch(Some(name));
                let outcome = if device.status == DeviceStatus::Disconnected
                    && !device.manually_disconnected
                {
                    device.status = DeviceStatus::Paired;
                    DiscoveryOutcome::Reconnected(device.clone())
                } else {
                    DiscoveryOutcome::Refreshed
                };
                if device.durable_state() != before {
                    self.persist(&devices);
                }
                outcome
            }
            None if discovery_enabled => {
                let mut device = Device::new(address);
                device.touch(Some(name));
                devices.insert(address, device.clone());
                DiscoveryOutcome::Discovered(device)
            }
            None => return DiscoveryOutcome::Ignored,
        };
        drop(devices);
        self.inner.events.device_list_changed();
        outcome
    }

    /// Inbound pairing request: record the peer and flag the pending decision.
    pub fn mark_pairing_pending(&self, address: IpAddr, name: &str) -> Device {
        self.upsert_with(address, |device| {
            device.touch(Some(name));
            device.pairing_pending = true;
            device.clone()
        })
    }

    /// Outbound pairing request about to be sent. A human-initiated request
    /// also lifts a manual disconnect.
    pub fn begin_pairing_request(&self, address: IpAddr, clear_manual_disconnect: bool) -> Device {
        self.upsert_with(address, |device| {
            device.awaiting_response = true;
            if clear_manual_disconnect {
                device.manually_disconnected = false;
            }
            device.clone()
        })
    }

    /// The outbound request never reached the peer.
    pub fn cancel_pairing_request(&self, address: IpAddr) {
        let _ = self.update(address, |device| {
            device.awaiting_response = false;
            Ok(())
        });
    }

    /// Takes ownership of the pending inbound request so only one answer is
    /// ever sent for it. Fails with `NoPendingRequest` if another caller got
    /// there first.
    pub fn claim_pairing_request(&self, address: IpAddr) -> Result<Device, NodeError> {
        self.update(address, |device| {
            if !device.pairing_pending {
                return Err(NodeError::NoPendingRequest(address));
            }
            device.pairing_pending = false;
            Ok(device.clone())
        })
    }

    /// The answer to a claimed request never reached the peer: put the request
    /// back unless the device was disconnected meanwhile.
    pub fn release_pairing_request(&self, address: IpAddr) {
        let _ = self.update(address, |device| {
            if !device.manually_disconnected {
                device.pairing_pending = true;
            }
            Ok(())
        });
    }

    /// Commits a delivered acceptance of a claimed request: we become `Paired`.
    pub fn accept_pairing(&self, address: IpAddr) -> Result<Device, NodeError> {
        self.update(address, |device| {
            device.pairing_pending = false;
            device.manually_disconnected = false;
            device.status = DeviceStatus::Paired;
            info!(address = %address, name = %device.display_name, "paired (accepted locally)");
            Ok(device.clone())
        })
    }

    /// Local reject of an inbound request; status is left alone.
    pub fn reject_pairing(&self, address: IpAddr) -> Result<Device, NodeError> {
        self.update(address, |device| {
            device.pairing_pending = false;
            Ok(device.clone())
        })
    }

    /// The peer answered our request. Answers we never asked for are refused.
    pub fn complete_pairing(
        &self,
        address: IpAddr,
        name: &str,
        accepted: bool,
    ) -> Result<Device, NodeError> {
        self.update(address, |device| {
            if !device.awaiting_response {
                return Err(NodeError::AuthorizationDenied { address });
            }
            device.touch(Some(name));
            device.awaiting_response = false;
            if accepted {
                device.status = DeviceStatus::Paired;
                device.manually_disconnected = false;
                device.pairing_pending = false;
                info!(address = %address, name = %device.display_name, "paired (accepted by peer)");
            }
            Ok(device.clone())
        })
    }

    /// Human disconnect. Sticky until a new pairing request is issued.
    pub fn disconnect(&self, address: IpAddr) -> Result<Device, NodeError> {
        self.update(address, |device| {
            device.status = DeviceStatus::Disconnected;
            device.send_enabled = false;
            device.receive_enabled = false;
            device.pairing_pending = false;
            device.awaiting_response = false;
            device.manually_disconnected = true;
            info!(address = %address, "manually disconnected");
            Ok(device.clone())
        })
    }

    /// Demotes every `Paired` device silent for longer than `liveness`.
    /// Enable flags are kept so a reconnect restores them.
    pub fn demote_stale(&self, liveness: Duration) -> Vec<Device> {
        let mut devices = self.lock();
        let mut demoted = Vec::new();
        for device in devices.values_mut() {
            if device.is_paired() && !device.is_active(liveness) {
                device.status = DeviceStatus::Disconnected;
                demoted.push(device.clone());
            }
        }
        if demoted.is_empty() {
            return demoted;
        }
        self.persist(&devices);
        drop(devices);
        self.inner.events.device_list_changed();
        demoted
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, Device>> {
        self.inner
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn update<T>(
        &self,
        address: IpAddr,
        f: impl FnOnce(&mut Device) -> Result<T, NodeError>,
    ) -> Result<T, NodeError> {
        let mut devices = self.lock();
        let device = devices
            .get_mut(&address)
            .ok_or(NodeError::UnknownDevice(address))?;
        let before = device.durable_state();
        let out = f(device)?;
        if device.durable_state() != before {
            self.persist(&devices);
        }
        drop(devices);
        self.inner.events.device_list_changed();
        Ok(out)
    }

    fn upsert_with<T>(&self, address: IpAddr, f: impl FnOnce(&mut Device) -> T) -> T {
        let mut devices = self.lock();
        let device = devices
            .entry(address)
            .or_insert_with(|| Device::new(address));
        let before = device.durable_state();
        let out = f(device);
        if device.durable_state() != before {
            self.persist(&devices);
        }
        drop(devices);
        self.inner.events.device_list_changed();
        out
    }

    // Blocking file I/O under the registry lock, on whatever thread mutated the
    // registry (often a runtime worker). Saves stay ordered with the mutations;
    // the file holds one small record per paired device.
    fn persist(&self, devices: &HashMap<IpAddr, Device>) {
        let mut records: Vec<DeviceRecord> = devices
            .values()
            .filter_map(|device| device.durable_state().1)
            .collect();
        records.sort_by_key(|record| record.address);
        if let Err(err) = self.inner.store.save(&records) {
            warn!("failed to persist paired devices, keeping in-memory state: {err}");
        }
    }
}
