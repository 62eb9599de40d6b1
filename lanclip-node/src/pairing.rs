use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use lanclip_core::{Message, Payload};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::{
    NodeContext,
    error::NodeError,
    events::{NodeEvent, Notice},
    net::read_message,
    registry::Device,
};

/// Request/response handshake on the pairing port.
#[derive(Clone)]
pub(crate) struct PairingService {
    ctx: Arc<NodeContext>,
}

impl PairingService {
    pub(crate) fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn run_listener(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        service.handle_connection(stream, peer).await;
                    });
                }
                Err(err) => {
                    warn!("pairing accept failed: {err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let config = &self.ctx.config;
        let message =
            match read_message(stream, peer, config.max_message_bytes, config.read_timeout).await {
                Ok(message) => message,
                Err(err) => {
                    warn!(%peer, "dropping pairing connection: {err}");
                    return;
                }
            };

        if let Err(err) = self.handle_message(message, peer.ip()) {
            warn!(%peer, "pairing message refused: {err}");
        }
    }

    pub(crate) fn handle_message(&self, message: Message, address: IpAddr) -> Result<(), NodeError> {
        match message.payload {
            Payload::PairingRequest => {
                if !self.ctx.discovery_enabled() {
                    debug!(address = %address, "discovery off, ignoring pairing request");
                    return Ok(());
                }
                let device = self
                    .ctx
                    .registry
                    .mark_pairing_pending(address, &message.sender_name);
                info!(address = %address, name = %device.display_name, "pairing request received");
                self.ctx.events.publish(NodeEvent::PairingRequested {
                    address,
                    name: device.display_name,
                });
                Ok(())
            }
            Payload::PairingResponse { accepted } => {
                let device =
                    self.ctx
                        .registry
                        .complete_pairing(address, &message.sender_name, accepted)?;
                let name = device.display_name;
                if accepted {
                    self.ctx
                        .events
                        .notice(Notice::PairingAccepted { address, name });
                } else {
                    info!(address = %address, name = %name, "pairing request rejected by peer");
                    self.ctx
                        .events
                        .notice(Notice::PairingRejected { address, name });
                }
                Ok(())
            }
            other => {
                debug!(address = %address, kind = %other.kind(), "unexpected message on pairing port");
                Ok(())
            }
        }
    }

    /// Sends a pairing request. `clear_manual_disconnect` is set for requests
    /// a person asked for.
    pub(crate) async fn request_pairing(
        &self,
        address: IpAddr,
        clear_manual_disconnect: bool,
    ) -> Result<(), NodeError> {
        self.ctx
            .registry
            .begin_pairing_request(address, clear_manual_disconnect);

        let target = SocketAddr::new(address, self.ctx.config.pairing_port);
        let request = self.ctx.message(Payload::PairingRequest);
        if let Err(err) = self.ctx.send(target, &request).await {
            self.ctx.registry.cancel_pairing_request(address);
            return Err(err);
        }

        info!(address = %address, "pairing request sent");
        self.ctx
            .events
            .notice(Notice::PairingRequestSent { address });
        Ok(())
    }

    /// Answers a pending inbound request. The request is claimed before the
    /// answer is sent, so concurrent answers cannot both go out; it is put back
    /// if the answer cannot be delivered.
    pub(crate) async fn respond(&self, address: IpAddr, accept: bool) -> Result<Device, NodeError> {
        if self.ctx.registry.get(address).is_none() {
            return Err(NodeError::UnknownDevice(address));
        }
        self.ctx.registry.claim_pairing_request(address)?;

        let target = SocketAddr::new(address, self.ctx.config.pairing_port);
        let response = self
            .ctx
            .message(Payload::PairingResponse { accepted: accept });
        if let Err(err) = self.ctx.send(target, &response).await {
            self.ctx.registry.release_pairing_request(address);
            return Err(err);
        }

        if accept {
            let device = self.ctx.registry.accept_pairing(address)?;
            self.ctx
                .events
                .notice(Notice::PairingCompleted { address });
            Ok(device)
        } else {
            info!(address = %address, "pairing request rejected");
            self.ctx.registry.reject_pairing(address)
        }
    }
}

#[cfg(test)]
mod tests {
    use lanclip_core::Message;
    use tokio::net::TcpListener;

    use crate::{
        net::read_message,
        registry::DeviceStatus,
        test_support::{context, context_with, ip},
    };

    use super::*;

    fn request(name: &str) -> Message {
        Message::new(Payload::PairingRequest, "ignored", name)
    }

    fn response(accepted: bool) -> Message {
        Message::new(Payload::PairingResponse { accepted }, "ignored", "peer")
    }

    #[tokio::test]
    async fn inbound_request_marks_pending_and_asks_the_user() {
        let ctx = context();
        let pairing = PairingService::new(ctx.clone());
        let mut rx = ctx.events.subscribe();
        let peer = ip("10.2.0.2");

        pairing.handle_message(request("phone"), peer).unwrap();

        let device = ctx.registry.get(peer).unwrap();
        assert!(device.pairing_pending);
        assert_eq!(device.status, DeviceStatus::Discovered);

        let mut asked = false;
        while let Ok(event) = rx.try_recv() {
            if let NodeEvent::PairingRequested { address, name } = event {
                assert_eq!(address, peer);
                assert_eq!(name, "phone");
                asked = true;
            }
        }
        assert!(asked);
    }

    #[tokio::test]
    async fn inbound_request_is_ignored_with_discovery_off() {
        let ctx = context();
        ctx.set_discovery_enabled(false);
        let pairing = PairingService::new(ctx.clone());

        pairing.handle_message(request("phone"), ip("10.2.0.3")).unwrap();
        assert!(ctx.registry.get(ip("10.2.0.3")).is_none());
    }

    #[tokio::test]
    async fn solicited_acceptance_pairs_and_unsolicited_is_refused() {
        let ctx = context();
        let pairing = PairingService::new(ctx.clone());
        let peer = ip("10.2.0.4");
        ctx.registry.upsert(peer, Some("peer"), None);

        let err = pairing.handle_message(response(true), peer).unwrap_err();
        assert!(matches!(err, NodeError::AuthorizationDenied { .. }));
        assert!(!ctx.registry.get(peer).unwrap().is_paired());

        ctx.registry.begin_pairing_request(peer, false);
        pairing.handle_message(response(true), peer).unwrap();
        assert!(ctx.registry.get(peer).unwrap().is_paired());
    }

    #[tokio::test]
    async fn rejection_leaves_status_and_notifies() {
        let ctx = context();
        let pairing = PairingService::new(ctx.clone());
        let mut rx = ctx.events.subscribe();
        let peer = ip("10.2.0.5");
        ctx.registry.begin_pairing_request(peer, false);

        pairing.handle_message(response(false), peer).unwrap();
        let device = ctx.registry.get(peer).unwrap();
        assert_eq!(device.status, DeviceStatus::Discovered);
        assert!(!device.awaiting_response);

        let rejected = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|event| matches!(event, NodeEvent::Notice(Notice::PairingRejected { .. })));
        assert!(rejected);
    }

    #[tokio::test]
    async fn respond_without_pending_request_fails() {
        let ctx = context();
        let pairing = PairingService::new(ctx.clone());
        let peer = ip("10.2.0.6");

        assert!(matches!(
            pairing.respond(peer, true).await,
            Err(NodeError::UnknownDevice(_))
        ));
        ctx.registry.upsert(peer, Some("x"), None);
        assert!(matches!(
            pairing.respond(peer, true).await,
            Err(NodeError::NoPendingRequest(_))
        ));
    }

    #[tokio::test]
    async fn undeliverable_request_is_rolled_back() {
        let unused = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let ctx = context_with(|config| config.pairing_port = port);
        let pairing = PairingService::new(ctx.clone());
        let peer = ip("127.0.0.1");

        let err = pairing.request_pairing(peer, true).await.unwrap_err();
        assert!(matches!(err, NodeError::PeerUnreachable { .. }));
        assert!(!ctx.registry.get(peer).unwrap().awaiting_response);
    }

    #[tokio::test]
    async fn delivered_acceptance_pairs_locally() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let ctx = context_with(|config| config.pairing_port = port);
        let pairing = PairingService::new(ctx.clone());
        let peer = ip("127.0.0.1");
        ctx.registry.mark_pairing_pending(peer, "desk");

        let receive = async {
            let (stream, from) = listener.accept().await.unwrap();
            read_message(stream, from, 4096, Duration::from_secs(2))
                .await
                .unwrap()
        };
        let (answered, delivered) = tokio::join!(pairing.respond(peer, true), receive);

        assert!(answered.unwrap().is_paired());
        assert_eq!(delivered.payload, Payload::PairingResponse { accepted: true });
        assert!(!ctx.registry.get(peer).unwrap().pairing_pending);
    }

    #[tokio::test]
    async fn concurrent_answers_send_only_one_response() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let ctx = context_with(|config| config.pairing_port = port);
        let pairing = PairingService::new(ctx.clone());
        let peer = ip("127.0.0.1");
        ctx.registry.mark_pairing_pending(peer, "desk");

        let receive = async {
            let (stream, from) = listener.accept().await.unwrap();
            read_message(stream, from, 4096, Duration::from_secs(2))
                .await
                .unwrap()
        };
        let (first, second, delivered) =
            tokio::join!(pairing.respond(peer, true), pairing.respond(peer, false), receive);

        let answers = [first, second];
        assert_eq!(answers.iter().filter(|answer| answer.is_ok()).count(), 1);
        assert!(answers
            .iter()
            .any(|answer| matches!(answer, Err(NodeError::NoPendingRequest(_)))));
        assert!(matches!(delivered.payload, Payload::PairingResponse { .. }));

        let extra = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(extra.is_err(), "a second answer went out");
    }

    #[tokio::test]
    async fn undeliverable_answer_keeps_the_request_pending() {
        let unused = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let ctx = context_with(|config| config.pairing_port = port);
        let pairing = PairingService::new(ctx.clone());
        let peer = ip("127.0.0.1");
        ctx.registry.mark_pairing_pending(peer, "desk");

        let err = pairing.respond(peer, true).await.unwrap_err();
        assert!(matches!(err, NodeError::PeerUnreachable { .. }));
        let device = ctx.registry.get(peer).unwrap();
        assert!(device.pairing_pending);
        assert!(!device.is_paired());
    }
}
