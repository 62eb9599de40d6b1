use std::{
    fs::{File, OpenOptions},
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use lanclip_core::{DEFAULT_DISCOVERY_PORT, DEFAULT_PAIRING_PORT, DEFAULT_RELAY_PORT};
use lanclip_node::{
    Device, EventBus, JsonFileStore, Node, NodeConfig, NodeEvent, SystemClipboard,
    console::{self, Command},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{Subscriber, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "lanclip", about = "Share clipboard text with paired hosts on the local network")]
struct NodeArgs {
    /// Address the listeners bind to.
    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: IpAddr,
    /// Address announced to peers (detected when omitted).
    #[arg(long)]
    advertise_ip: Option<IpAddr>,
    #[arg(long, default_value = "255.255.255.255")]
    broadcast_ip: IpAddr,
    /// Name shown to peers (host name when omitted).
    #[arg(long)]
    device_name: Option<String>,
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,
    #[arg(long, default_value_t = DEFAULT_PAIRING_PORT)]
    pairing_port: u16,
    #[arg(long, default_value_t = DEFAULT_RELAY_PORT)]
    relay_port: u16,
    #[arg(long, default_value_t = 5)]
    broadcast_interval_secs: u64,
    #[arg(long, default_value_t = 15)]
    liveness_timeout_secs: u64,
    /// Where paired_devices.json lives.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Accept every inbound pairing request without asking.
    #[arg(long)]
    auto_accept: bool,
    #[arg(long)]
    no_discovery: bool,
    #[arg(long)]
    no_sync: bool,
}

impl NodeArgs {
    fn to_config(&self) -> NodeConfig {
        let defaults = NodeConfig::default();
        NodeConfig {
            bind_ip: self.bind_ip,
            advertise_ip: self.advertise_ip,
            broadcast_ip: self.broadcast_ip,
            device_name: self.device_name.clone(),
            discovery_port: self.discovery_port,
            pairing_port: self.pairing_port,
            relay_port: self.relay_port,
            broadcast_interval: Duration::from_secs(self.broadcast_interval_secs.max(1)),
            liveness_timeout: Duration::from_secs(self.liveness_timeout_secs.max(1)),
            data_dir: self.data_dir.clone().unwrap_or(defaults.data_dir.clone()),
            discovery_enabled: !self.no_discovery,
            sync_enabled: !self.no_sync,
            ..defaults
        }
    }
}

fn init_logging(log_file: Option<&Path>) {
    let env_filter = EnvFilter::from_default_env();

    let Some(path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return;
    };
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file_subscriber(file, env_filter).init(),
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", path.display());
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }
}

fn file_subscriber(file: File, env_filter: EnvFilter) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .finish()
}

#[tokio::main]
async fn main() {
    let args = NodeArgs::parse();
    init_logging(args.log_file.as_deref());

    let config = args.to_config();
    let store = Arc::new(JsonFileStore::in_dir(&config.data_dir));
    info!("paired devices stored in {}", store.path().display());

    let events = EventBus::new();
    let event_rx = events.subscribe();
    let node = Arc::new(Node::start(config, Arc::new(SystemClipboard::new()), store, events).await);
    if node.unavailable_capabilities().len() == 3 {
        error!("no listener could be bound; exiting");
        std::process::exit(1);
    }

    let identity = node.identity();
    println!("lanclip running as {} ({}); type `help` for commands", identity.name, identity.ip);

    tokio::spawn(present_events(Arc::clone(&node), event_rx, args.auto_accept));
    run_console(&node).await;
}

async fn present_events(
    node: Arc<Node>,
    mut rx: tokio::sync::broadcast::Receiver<NodeEvent>,
    auto_accept: bool,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("event printer fell behind, skipped {skipped} event(s)");
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        match event {
            NodeEvent::DeviceListChanged => {}
            NodeEvent::PairingRequested { address, name } if auto_accept => {
                match node.respond_to_pairing(address, true).await {
                    Ok(_) => println!("auto-accepted pairing with {name} ({address})"),
                    Err(err) => println!("could not accept {name} ({address}): {err}"),
                }
            }
            NodeEvent::PairingRequested { address, name } => {
                println!(
                    "{name} ({address}) wants to pair: `accept {address}` or `reject {address}`"
                );
            }
            NodeEvent::Notice(notice) => println!("[{}] {}", notice.title(), notice.message()),
        }
    }
}

async fn run_console(node: &Node) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("console input failed: {err}");
                break;
            }
        };

        match console::parse(&line) {
            Ok(Some(Command::Quit)) => return,
            Ok(Some(command)) => execute(node, command).await,
            Ok(None) => {}
            Err(message) => println!("{message}"),
        }
    }

    // No interactive input (service or pipe): keep running until interrupted.
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("cannot wait for ctrl-c: {err}");
    }
}

async fn execute(node: &Node, command: Command) {
    let outcome = match command {
        Command::List => {
            print_devices(&node.devices());
            Ok(())
        }
        Command::Help => {
            println!("{}", console::HELP);
            Ok(())
        }
        Command::Accept(ip) => node.respond_to_pairing(ip, true).await.map(drop),
        Command::Reject(ip) => node.respond_to_pairing(ip, false).await.map(drop),
        Command::Pair(ip) => node.request_pairing(ip).await,
        Command::Disconnect(ip) => node.disconnect(ip).map(drop),
        Command::Remove(ip) => node.remove(ip).map(drop),
        Command::Send(ip, on) => node.set_send_enabled(ip, on).map(drop),
        Command::Receive(ip, on) => node.set_receive_enabled(ip, on).map(drop),
        Command::Push(ip) => node.send_clipboard_now(ip).await,
        Command::Discovery(on) => {
            node.set_discovery_enabled(on);
            Ok(())
        }
        Command::Sync(on) => {
            node.set_sync_enabled(on);
            Ok(())
        }
        Command::Quit => Ok(()),
    };
    if let Err(err) = outcome {
        println!("error: {err}");
    }
}

fn print_devices(devices: &[Device]) {
    if devices.is_empty() {
        println!("no devices");
        return;
    }
    for device in devices {
        let mut flags = Vec::new();
        if device.send_enabled {
            flags.push("send");
        }
        if device.receive_enabled {
            flags.push("receive");
        }
        if device.pairing_pending {
            flags.push("pending");
        }
        if device.manually_disconnected {
            flags.push("manual");
        }
        println!(
            "{:<16} {:<20} {:<13} {}",
            device.address,
            device.display_name,
            format!("{:?}", device.status),
            flags.join(",")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logging_appends_plain_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lanclip.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();

        let subscriber = file_subscriber(file, EnvFilter::new("info"));
        tracing::subscriber::with_default(subscriber, || {
            info!(address = "10.0.0.5", "pairing request sent");
            tracing::debug!("filtered out");
        });

        let logged = std::fs::read_to_string(&path).unwrap();
        assert!(logged.contains("pairing request sent"));
        assert!(logged.contains("address=\"10.0.0.5\""));
        assert!(!logged.contains("filtered out"));
        assert!(!logged.contains('\u{1b}'));
    }

    #[test]
    fn arguments_map_onto_node_config() {
        let args = NodeArgs::parse_from([
            "lanclip",
            "--bind-ip",
            "192.168.1.4",
            "--broadcast-interval-secs",
            "0",
            "--no-sync",
        ]);
        let config = args.to_config();
        assert_eq!(config.bind_ip, "192.168.1.4".parse::<IpAddr>().unwrap());
        assert_eq!(config.broadcast_interval, Duration::from_secs(1));
        assert!(!config.sync_enabled);
        assert!(config.discovery_enabled);
    }
}
