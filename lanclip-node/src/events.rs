use std::net::IpAddr;

use tokio::sync::broadcast;

use crate::error::Capability;

const EVENT_CAPACITY: usize = 256;

/// Everything the presentation layer can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Some device record changed; re-read the registry.
    DeviceListChanged,
    /// A peer asked to pair and is waiting for `Node::respond_to_pairing`.
    PairingRequested { address: IpAddr, name: String },
    Notice(Notice),
}

/// User-facing notification with a short title and a one-line message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    DeviceReconnected { address: IpAddr, name: String },
    DeviceDisconnected { address: IpAddr, name: String },
    PairingRequestSent { address: IpAddr },
    PairingAccepted { address: IpAddr, name: String },
    PairingRejected { address: IpAddr, name: String },
    PairingCompleted { address: IpAddr },
    ClipboardUpdated { address: IpAddr, name: String },
    ClipboardSent { address: IpAddr, name: String },
    CapabilityUnavailable { capability: Capability, reason: String },
}

impl Notice {
    pub fn title(&self) -> &'static str {
        match self {
            Notice::DeviceReconnected { .. } => "Device Reconnected",
            Notice::DeviceDisconnected { .. } => "Device Disconnected",
            Notice::PairingRequestSent { .. } => "Pairing Request Sent",
            Notice::PairingAccepted { .. } => "Pairing Accepted",
            Notice::PairingRejected { .. } => "Pairing Rejected",
            Notice::PairingCompleted { .. } => "Pairing Completed",
            Notice::ClipboardUpdated { .. } => "Clipboard Updated",
            Notice::ClipboardSent { .. } => "Clipboard Sent",
            Notice::CapabilityUnavailable { .. } => "Capability Unavailable",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Notice::DeviceReconnected { address, name } => {
                format!("{name} ({address}) is back online")
            }
            Notice::DeviceDisconnected { address, name } => {
                format!("{name} ({address}) is now offline")
            }
            Notice::PairingRequestSent { address } => {
                format!("Sent pairing request to {address}")
            }
            Notice::PairingAccepted { address, name } => {
                format!("{name} ({address}) accepted your pairing request")
            }
            Notice::PairingRejected { address, name } => {
                format!("{name} ({address}) rejected your pairing request")
            }
            Notice::PairingCompleted { address } => format!("You are now paired with {address}"),
            Notice::ClipboardUpdated { address, name } => {
                format!("Received clipboard from {name} ({address})")
            }
            Notice::ClipboardSent { address, name } => {
                format!("Sent clipboard to {name} ({address})")
            }
            Notice::CapabilityUnavailable { capability, reason } => {
                format!("{capability} unavailable: {reason}")
            }
        }
    }
}

/// Multi-subscriber fan-out of [`NodeEvent`]s. Delivery order across
/// subscribers is unspecified; slow subscribers may observe `Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: NodeEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn device_list_changed(&self) {
        self.publish(NodeEvent::DeviceListChanged);
    }

    pub fn notice(&self, notice: Notice) {
        self.publish(NodeEvent::Notice(notice));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_each_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.device_list_changed();

        assert_eq!(first.try_recv().unwrap(), NodeEvent::DeviceListChanged);
        assert_eq!(second.try_recv().unwrap(), NodeEvent::DeviceListChanged);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.notice(Notice::PairingCompleted {
            address: "10.0.0.2".parse().unwrap(),
        });
    }

    #[test]
    fn notice_text_names_the_device() {
        let notice = Notice::ClipboardUpdated {
            address: "10.0.0.7".parse().unwrap(),
            name: "laptop".to_owned(),
        };
        assert_eq!(notice.title(), "Clipboard Updated");
        assert_eq!(notice.message(), "Received clipboard from laptop (10.0.0.7)");
    }
}
