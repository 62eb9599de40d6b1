//! A LAN clipboard-sharing node: presence broadcasts, a pairing handshake,
//! and clipboard relay between paired hosts.
//!
//! [`Node::start`] binds the three listeners and spawns the background
//! workers. Everything else is observed through [`NodeEvent`]s and driven
//! through the methods on [`Node`].

pub mod clipboard;
pub mod config;
pub mod console;
mod discovery;
pub mod error;
pub mod events;
mod monitor;
pub mod net;
mod pairing;
pub mod registry;
mod relay;
pub mod store;

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use lanclip_core::{Message, Payload};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{error, info, warn};

pub use crate::{
    clipboard::{ClipboardAccess, ClipboardError, MemoryClipboard, SystemClipboard},
    config::{LocalIdentity, NodeConfig},
    error::{Capability, NodeError},
    events::{EventBus, NodeEvent, Notice},
    registry::{Device, DeviceRegistry, DeviceStatus},
    store::{DeviceRecord, DeviceStore, JsonFileStore, MemoryStore, StoreError},
};

use crate::{
    discovery::DiscoveryService, monitor::TimeoutMonitor, net::send_message,
    pairing::PairingService, relay::ClipboardRelay,
};

/// State shared by every worker of one node.
pub(crate) struct NodeContext {
    pub(crate) config: NodeConfig,
    pub(crate) identity: LocalIdentity,
    pub(crate) registry: DeviceRegistry,
    pub(crate) events: EventBus,
    discovery_enabled: AtomicBool,
    sync_enabled: AtomicBool,
}

impl NodeContext {
    fn new(config: NodeConfig, registry: DeviceRegistry, events: EventBus) -> Self {
        let identity = config.resolve_identity();
        Self {
            discovery_enabled: AtomicBool::new(config.discovery_enabled),
            sync_enabled: AtomicBool::new(config.sync_enabled),
            config,
            identity,
            registry,
            events,
        }
    }

    pub(crate) fn discovery_enabled(&self) -> bool {
        self.discovery_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_discovery_enabled(&self, enabled: bool) {
        self.discovery_enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_sync_enabled(&self, enabled: bool) {
        self.sync_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Wraps `payload` with this node's sender fields.
    pub(crate) fn message(&self, payload: Payload) -> Message {
        Message::new(
            payload,
            self.identity.ip.to_string(),
            self.identity.name.clone(),
        )
    }

    pub(crate) async fn send(&self, target: SocketAddr, message: &Message) -> Result<(), NodeError> {
        send_message(
            target,
            message,
            self.config.bind_ip,
            self.config.connect_timeout,
        )
        .await
    }
}

/// A running node. Dropping it stops every background worker.
pub struct Node {
    ctx: Arc<NodeContext>,
    pairing: PairingService,
    relay: ClipboardRelay,
    unavailable: Vec<Capability>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Restores persisted devices, binds the listeners and spawns the
    /// workers. A listener that cannot bind only disables its capability.
    pub async fn start(
        config: NodeConfig,
        clipboard: Arc<dyn ClipboardAccess>,
        store: Arc<dyn DeviceStore>,
        events: EventBus,
    ) -> Node {
        let registry = DeviceRegistry::new(store, events.clone());
        match registry.load_persisted() {
            Ok(0) => {}
            Ok(count) => info!("restored {count} paired device(s)"),
            Err(err) => warn!("could not load paired devices, starting empty: {err}"),
        }

        let ctx = Arc::new(NodeContext::new(config, registry, events));
        let pairing = PairingService::new(ctx.clone());
        let relay = ClipboardRelay::new(ctx.clone(), clipboard);
        let discovery = DiscoveryService::new(ctx.clone(), pairing.clone());

        let bind_ip = ctx.config.bind_ip;
        let mut tasks = Vec::new();
        let mut unavailable = Vec::new();

        match net::bind_udp(Capability::Discovery, bind_ip, ctx.config.discovery_port).await {
            Ok(socket) => tasks.push(tokio::spawn(discovery.clone().run_listener(socket))),
            Err(err) => capability_lost(&ctx, Capability::Discovery, err, &mut unavailable),
        }
        match net::bind_tcp(Capability::Pairing, bind_ip, ctx.config.pairing_port).await {
            Ok(listener) => tasks.push(tokio::spawn(pairing.clone().run_listener(listener))),
            Err(err) => capability_lost(&ctx, Capability::Pairing, err, &mut unavailable),
        }
        match net::bind_tcp(Capability::ClipboardRelay, bind_ip, ctx.config.relay_port).await {
            Ok(listener) => tasks.push(tokio::spawn(relay.clone().run_listener(listener))),
            Err(err) => capability_lost(&ctx, Capability::ClipboardRelay, err, &mut unavailable),
        }

        tasks.push(tokio::spawn(discovery.run_broadcaster()));
        tasks.push(tokio::spawn(relay.clone().run_sender()));
        tasks.push(tokio::spawn(TimeoutMonitor::new(ctx.clone()).run()));

        info!(
            "node {} started as {} (bind {bind_ip})",
            ctx.identity.name, ctx.identity.ip
        );

        Node {
            ctx,
            pairing,
            relay,
            unavailable,
            tasks,
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.ctx.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.ctx.events.subscribe()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.ctx.registry
    }

    pub fn devices(&self) -> Vec<Device> {
        self.ctx.registry.list()
    }

    /// Capabilities whose listener failed to bind at startup.
    pub fn unavailable_capabilities(&self) -> &[Capability] {
        &self.unavailable
    }

    pub fn discovery_enabled(&self) -> bool {
        self.ctx.discovery_enabled()
    }

    /// With discovery off no broadcasts go out, unknown broadcasters are
    /// ignored and inbound pairing requests are dropped.
    pub fn set_discovery_enabled(&self, enabled: bool) {
        self.ctx.set_discovery_enabled(enabled);
        info!("discovery {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn sync_enabled(&self) -> bool {
        self.ctx.sync_enabled()
    }

    pub fn set_sync_enabled(&self, enabled: bool) {
        self.ctx.set_sync_enabled(enabled);
        info!("clipboard sync {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Answers the pending pairing request from `address`.
    pub async fn respond_to_pairing(&self, address: IpAddr, accept: bool) -> Result<Device, NodeError> {
        self.pairing.respond(address, accept).await
    }

    /// Asks `address` to pair. Lifts a previous manual disconnect.
    pub async fn request_pairing(&self, address: IpAddr) -> Result<(), NodeError> {
        self.pairing.request_pairing(address, true).await
    }

    pub fn disconnect(&self, address: IpAddr) -> Result<Device, NodeError> {
        self.ctx.registry.disconnect(address)
    }

    pub fn remove(&self, address: IpAddr) -> Result<Device, NodeError> {
        self.ctx
            .registry
            .remove(address)
            .ok_or(NodeError::UnknownDevice(address))
    }

    pub fn set_send_enabled(&self, address: IpAddr, enabled: bool) -> Result<Device, NodeError> {
        self.ctx.registry.set_send_enabled(address, enabled)
    }

    pub fn set_receive_enabled(&self, address: IpAddr, enabled: bool) -> Result<Device, NodeError> {
        self.ctx.registry.set_receive_enabled(address, enabled)
    }

    /// Pushes the current clipboard to `address` without waiting for a change.
    pub async fn send_clipboard_now(&self, address: IpAddr) -> Result<(), NodeError> {
        self.relay.send_now(address).await
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capability_lost(
    ctx: &NodeContext,
    capability: Capability,
    err: NodeError,
    unavailable: &mut Vec<Capability>,
) {
    error!("{err}");
    ctx.events.notice(Notice::CapabilityUnavailable {
        capability,
        reason: err.to_string(),
    });
    unavailable.push(capability);
}
