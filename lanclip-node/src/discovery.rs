use std::{net::SocketAddr, sync::Arc, time::Duration};

use lanclip_core::{MessageKind, Payload, decode_message, encode_message};
use tokio::{net::UdpSocket, time::interval};
use tracing::{debug, info, warn};

use crate::{
    NodeContext,
    error::{Capability, NodeError},
    events::Notice,
    net::bind_udp,
    pairing::PairingService,
    registry::DiscoveryOutcome,
};

/// Presence broadcaster plus the listener that turns peer broadcasts into
/// registry entries and automatic pairing requests.
#[derive(Clone)]
pub(crate) struct DiscoveryService {
    ctx: Arc<NodeContext>,
    pairing: PairingService,
}

impl DiscoveryService {
    pub(crate) fn new(ctx: Arc<NodeContext>, pairing: PairingService) -> Self {
        Self { ctx, pairing }
    }

    pub(crate) async fn run_broadcaster(self) {
        let mut ticker = interval(self.ctx.config.broadcast_interval);
        let mut socket: Option<UdpSocket> = None;

        loop {
            ticker.tick().await;
            if !self.ctx.discovery_enabled() {
                continue;
            }

            if socket.is_none() {
                match bind_udp(Capability::Discovery, self.ctx.config.bind_ip, 0).await {
                    Ok(bound) => socket = Some(bound),
                    Err(err) => {
                        warn!("cannot open broadcast socket: {err}");
                        continue;
                    }
                }
            }

            if let Some(socket) = socket.as_ref()
                && let Err(err) = self.broadcast_once(socket).await
            {
                debug!("presence broadcast failed: {err}");
            }
        }
    }

    async fn broadcast_once(&self, socket: &UdpSocket) -> Result<(), NodeError> {
        let frame = encode_message(&self.ctx.message(Payload::Discovery))?;
        let target = SocketAddr::new(self.ctx.config.broadcast_ip, self.ctx.config.discovery_port);
        socket
            .send_to(&frame, target)
            .await
            .map_err(|err| NodeError::PeerUnreachable {
                address: target,
                reason: err.to_string(),
            })?;
        Ok(())
    }

    pub(crate) async fn run_listener(self, socket: UdpSocket) {
        info!(
            "discovery listening on {}",
            socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_owned())
        );
        let mut buf = vec![0_u8; self.ctx.config.receive_buffer_size.max(1)];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    self.handle_datagram(&buf[..len], src);
                }
                Err(err) => {
                    warn!("discovery receive failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Returns `None` when the datagram was dropped before reaching the registry.
    pub(crate) fn handle_datagram(&self, data: &[u8], src: SocketAddr) -> Option<DiscoveryOutcome> {
        let address = src.ip();
        if address == self.ctx.identity.ip {
            return None;
        }

        let message = match decode_message(data) {
            Ok(message) => message,
            Err(err) => {
                debug!(%src, "dropping discovery datagram: {err}");
                return None;
            }
        };
        if message.kind() != MessageKind::Discovery {
            debug!(%src, kind = %message.kind(), "ignoring non-discovery datagram");
            return None;
        }

        let outcome = self.ctx.registry.observe_discovery(
            address,
            &message.sender_name,
            self.ctx.discovery_enabled(),
        );

        match &outcome {
            DiscoveryOutcome::Reconnected(device) => {
                info!(address = %address, name = %device.display_name, "device reconnected");
                self.ctx.events.notice(Notice::DeviceReconnected {
                    address,
                    name: device.display_name.clone(),
                });
            }
            DiscoveryOutcome::Discovered(device) => {
                info!(address = %address, name = %device.display_name, "discovered new device");
                let pairing = self.pairing.clone();
                tokio::spawn(async move {
                    if let Err(err) = pairing.request_pairing(address, false).await {
                        warn!(address = %address, "automatic pairing request failed: {err}");
                    }
                });
            }
            DiscoveryOutcome::Refreshed | DiscoveryOutcome::Ignored => {}
        }

        Some(outcome)
    }
}
