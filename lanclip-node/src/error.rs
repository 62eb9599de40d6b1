use std::{
    io,
    net::{IpAddr, SocketAddr},
};

use lanclip_core::CoreError;
use thiserror::Error;

use crate::{clipboard::ClipboardError, store::StoreError};

/// A listener-backed capability of the node. Losing one (bind failure) does not
/// take the others down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Discovery,
    Pairing,
    ClipboardRelay,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Discovery => f.write_str("discovery"),
            Capability::Pairing => f.write_str("pairing"),
            Capability::ClipboardRelay => f.write_str("clipboard relay"),
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Message(#[from] CoreError),
    #[error("peer {address} unreachable: {reason}")]
    PeerUnreachable { address: SocketAddr, reason: String },
    #[error("receive from {address} failed: {reason}")]
    Receive { address: SocketAddr, reason: String },
    #[error("{address} is not authorized for this exchange")]
    AuthorizationDenied { address: IpAddr },
    #[error("unknown device {0}")]
    UnknownDevice(IpAddr),
    #[error("device {0} is not paired")]
    NotPaired(IpAddr),
    #[error("no pairing request pending from {0}")]
    NoPendingRequest(IpAddr),
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),
    #[error("{capability} unavailable: failed to bind {address}: {source}")]
    BindFailure {
        capability: Capability,
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("clipboard error: {0}")]
    Clipboard(#[from] ClipboardError),
}
