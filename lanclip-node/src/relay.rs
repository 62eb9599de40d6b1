use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use lanclip_core::{CoreError, MAX_CLIPBOARD_TEXT_BYTES, Message, Payload};
use sha2::{Digest, Sha256};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{
    NodeContext,
    clipboard::{ClipboardAccess, ClipboardError},
    error::NodeError,
    events::Notice,
    net::read_message,
    registry::Device,
};

/// What happened to one inbound clipboard push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Applied,
    SyncDisabled,
    /// Same text we last wrote or sent; applying it again would echo.
    Duplicate,
}

#[derive(Debug, Default)]
struct Markers {
    last_sent: Option<[u8; 32]>,
    last_written: Option<[u8; 32]>,
}

/// Polls the local clipboard, pushes changes to authorized peers, and applies
/// pushes from authorized peers.
#[derive(Clone)]
pub(crate) struct ClipboardRelay {
    ctx: Arc<NodeContext>,
    clipboard: Arc<dyn ClipboardAccess>,
    markers: Arc<Mutex<Markers>>,
}

fn sha256(text: &str) -> [u8; 32] {
    Sha256::digest(text.as_bytes()).into()
}

fn short_digest(digest: &[u8; 32]) -> String {
    hex::encode(&digest[..6])
}

impl ClipboardRelay {
    pub(crate) fn new(ctx: Arc<NodeContext>, clipboard: Arc<dyn ClipboardAccess>) -> Self {
        Self {
            ctx,
            clipboard,
            markers: Arc::new(Mutex::new(Markers::default())),
        }
    }

    pub(crate) async fn run_listener(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let relay = self.clone();
                    tokio::spawn(async move {
                        relay.handle_connection(stream, peer).await;
                    });
                }
                Err(err) => {
                    warn!("relay accept failed: {err}");
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
                    warn!(%peer, "dropping relay connection: {err}");
                    return;
                }
            };

        match self.handle_message(message, peer.ip()).await {
            Ok(Delivery::Applied) => {}
            Ok(other) => debug!(%peer, "clipboard push not applied: {other:?}"),
            Err(NodeError::AuthorizationDenied { .. }) => {
                debug!(%peer, "clipboard push from unauthorized sender dropped");
            }
            Err(err) => warn!(%peer, "clipboard push failed: {err}"),
        }
    }

    pub(crate) async fn handle_message(
        &self,
        message: Message,
        address: IpAddr,
    ) -> Result<Delivery, NodeError> {
        let kind = message.kind();
        let Payload::ClipboardData { text } = message.payload else {
            return Err(CoreError::MalformedMessage(format!(
                "expected clipboard_data on relay port, got {kind}"
            ))
            .into());
        };
        self.ctx.registry.touch(address, Some(&message.sender_name));

        if !self.ctx.sync_enabled() {
            return Ok(Delivery::SyncDisabled);
        }
        if !self.ctx.registry.is_authorized_sender(address) {
            return Err(NodeError::AuthorizationDenied { address });
        }

        let digest = sha256(&text);
        let previous = {
            let mut markers = self.lock_markers();
            if markers.last_written == Some(digest) || markers.last_sent == Some(digest) {
                return Ok(Delivery::Duplicate);
            }
            markers.last_written.replace(digest)
        };

        if let Err(err) = self.write_clipboard(text).await {
            let mut markers = self.lock_markers();
            if markers.last_written == Some(digest) {
                markers.last_written = previous;
            }
            return Err(err);
        }
        // Received text must not bounce back out on the next poll.
        self.lock_markers().last_sent = Some(digest);

        let name = self
            .ctx
            .registry
            .get(address)
            .map(|device| device.display_name)
            .unwrap_or(message.sender_name);
        info!(address = %address, digest = %short_digest(&digest), "clipboard updated from {name}");
        self.ctx
            .events
            .notice(Notice::ClipboardUpdated { address, name });
        Ok(Delivery::Applied)
    }

    pub(crate) async fn run_sender(self) {
        let mut ticker = interval(self.ctx.config.clipboard_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.poll_once().await {
                Ok(0) => {}
                Ok(sent) => debug!("clipboard pushed to {sent} device(s)"),
                Err(err) => debug!("clipboard poll failed: {err}"),
            }
        }
    }

    /// One sender pass. Returns how many peers received the text.
    pub(crate) async fn poll_once(&self) -> Result<usize, NodeError> {
        if !self.ctx.sync_enabled() {
            return Ok(0);
        }
        let text = self.read_clipboard().await?;
        if text.is_empty() {
            return Ok(0);
        }

        let digest = sha256(&text);
        {
            let mut markers = self.lock_markers();
            if markers.last_sent == Some(digest) {
                return Ok(0);
            }
            markers.last_sent = Some(digest);
        }
        if text.len() > MAX_CLIPBOARD_TEXT_BYTES {
            warn!(
                "clipboard text is {} bytes, over the {MAX_CLIPBOARD_TEXT_BYTES} byte limit; not sending",
                text.len()
            );
            return Ok(0);
        }

        let recipients = self
            .ctx
            .registry
            .authorized_recipients(self.ctx.config.liveness_timeout);
        if recipients.is_empty() {
            return Ok(0);
        }

        debug!(digest = %short_digest(&digest), "clipboard changed, pushing to {} device(s)", recipients.len());
        let text: Arc<str> = Arc::from(text);
        let mut pushes = JoinSet::new();
        for device in recipients {
            let relay = self.clone();
            let text = Arc::clone(&text);
            pushes.spawn(async move { relay.push(&device, &text).await });
        }

        let mut delivered = 0;
        while let Some(joined) = pushes.join_next().await {
            match joined {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => warn!("clipboard push failed: {err}"),
                Err(err) => warn!("clipboard push task failed: {err}"),
            }
        }
        Ok(delivered)
    }

    /// Pushes the current clipboard to one device right away.
    pub(crate) async fn send_now(&self, address: IpAddr) -> Result<(), NodeError> {
        let device = self
            .ctx
            .registry
            .get(address)
            .ok_or(NodeError::UnknownDevice(address))?;
        if !self.ctx.registry.is_authorized_recipient(address) {
            return Err(NodeError::AuthorizationDenied { address });
        }

        let text = self.read_clipboard().await?;
        if text.is_empty() {
            return Ok(());
        }
        if text.len() > MAX_CLIPBOARD_TEXT_BYTES {
            return Err(CoreError::MessageTooLarge {
                size: text.len(),
                max: MAX_CLIPBOARD_TEXT_BYTES,
            }
            .into());
        }

        self.push(&device, &text).await?;
        self.lock_markers().last_sent = Some(sha256(&text));
        Ok(())
    }

    async fn push(&self, device: &Device, text: &str) -> Result<(), NodeError> {
        // The device may have been disconnected since the recipient list was built.
        if !self.ctx.registry.is_authorized_recipient(device.address) {
            return Err(NodeError::AuthorizationDenied {
                address: device.address,
            });
        }

        let target = SocketAddr::new(device.address, self.ctx.config.relay_port);
        let message = self.ctx.message(Payload::ClipboardData {
            text: text.to_owned(),
        });
        self.ctx.send(target, &message).await?;

        info!(address = %device.address, "clipboard sent to {}", device.display_name);
        self.ctx.events.notice(Notice::ClipboardSent {
            address: device.address,
            name: device.display_name.clone(),
        });
        Ok(())
    }

    async fn read_clipboard(&self) -> Result<String, NodeError> {
        let clipboard = Arc::clone(&self.clipboard);
        let text = tokio::task::spawn_blocking(move || clipboard.read())
            .await
            .map_err(|err| ClipboardError::Access(err.to_string()))??;
        Ok(text)
    }

    async fn write_clipboard(&self, text: String) -> Result<(), NodeError> {
        let clipboard = Arc::clone(&self.clipboard);
        tokio::task::spawn_blocking(move || clipboard.write(&text))
            .await
            .map_err(|err| ClipboardError::Access(err.to_string()))??;
        Ok(())
    }

    fn lock_markers(&self) -> MutexGuard<'_, Markers> {
        self.markers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
