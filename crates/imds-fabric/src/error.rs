//! Error types for the L2 fabric.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while setting up or operating the interception fabric.
///
/// Everything here is fatal at sidecar startup; the container exits and is
/// restarted by its pod. Transient ARP receive errors never surface as a
/// variant, they are swallowed inside the responder loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FabricError {
    /// Netlink request failed
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    /// No VM bridge present in the pod network namespace
    #[error("no VM bridge (k6t-*) found in this network namespace")]
    BridgeNotFound,

    /// More than one candidate VM bridge
    #[error("multiple VM bridges found, cannot auto-select: {0:?}")]
    AmbiguousBridge(Vec<String>),

    /// A link with the requested name exists but is not a bridge
    #[error("link {0} is not a bridge")]
    NotABridge(String),

    /// Gave up polling for the VM bridge
    #[error("timed out waiting for VM bridge after {0:?}")]
    BridgeWaitTimeout(Duration),

    /// A link that should exist could not be found
    #[error("link {0} not found")]
    LinkNotFound(String),

    /// A link unexpectedly has no hardware address
    #[error("link {0} has no MAC address")]
    MissingMac(String),

    /// No tap device attached to the VM bridge
    #[error("no tap device found on bridge {0}")]
    NoTapDevice(String),

    /// Writing a sysctl pseudo-file failed
    #[error("failed to write sysctl {path}: {source}")]
    Sysctl {
        /// The `/proc/sys` path that was being written
        path: String,
        /// The underlying IO error
        source: io::Error,
    },

    /// Creating or binding the raw ARP socket failed
    #[error("failed to open raw ARP socket: {0}")]
    ArpSocket(io::Error),

    /// The ARP receive loop hit a non-recoverable error
    #[error("ARP receive failed: {0}")]
    ArpReceive(io::Error),
}
