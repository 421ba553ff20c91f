//! VM bridge discovery.
//!
//! The bridge is created by the launcher's compute container some time after
//! the sidecar starts, so resolution polls: every attempt re-runs discovery
//! from scratch because the bridge may appear under any `k6t-*` suffix. An
//! explicit name override is authoritative and is the only name polled.

use std::time::Duration;

use futures::TryStreamExt;
use netlink_packet_route::link::InfoKind;
use rtnetlink::Handle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::link::{link_by_name, link_kind, link_name};
use crate::{FabricError, VM_BRIDGE_PREFIX};

/// How often bridge resolution retries.
pub const BRIDGE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Total budget for the bridge to appear before startup fails.
pub const BRIDGE_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// A resolved VM bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRef {
    /// Interface name, e.g. `k6t-eth0`.
    pub name: String,
    /// Interface index in the pod network namespace.
    pub index: u32,
}

/// Find the unique `k6t-*` bridge in the current network namespace.
pub async fn discover_bridge(handle: &Handle) -> Result<BridgeRef, FabricError> {
    let mut candidates = Vec::new();
    let mut links = handle.link().get().execute();
    while let Some(msg) = links.try_next().await? {
        let Some(name) = link_name(&msg) else {
            continue;
        };
        if !name.starts_with(VM_BRIDGE_PREFIX) {
            continue;
        }
        if link_kind(&msg) == Some(InfoKind::Bridge) {
            candidates.push(BridgeRef {
                name: name.to_string(),
                index: msg.header.index,
            });
        }
    }
    pick_unique_bridge(candidates)
}

/// Resolve a bridge by name, verifying it really is a bridge.
pub async fn get_bridge(handle: &Handle, name: &str) -> Result<BridgeRef, FabricError> {
    let msg = link_by_name(handle, name)
        .await?
        .ok_or_else(|| FabricError::LinkNotFound(name.to_string()))?;
    if link_kind(&msg) != Some(InfoKind::Bridge) {
        return Err(FabricError::NotABridge(name.to_string()));
    }
    Ok(BridgeRef {
        name: name.to_string(),
        index: msg.header.index,
    })
}

/// Wait for the VM bridge to appear.
///
/// With an override the same name is polled every attempt; without one,
/// auto-discovery re-runs each time. Returns [`FabricError::BridgeWaitTimeout`]
/// once the deadline is exhausted.
pub async fn resolve_bridge(
    handle: &Handle,
    override_name: Option<&str>,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<BridgeRef, FabricError> {
    let started = Instant::now();
    loop {
        let attempt = match override_name {
            Some(name) => get_bridge(handle, name).await,
            None => discover_bridge(handle).await,
        };
        match attempt {
            Ok(bridge) => {
                info!(bridge = %bridge.name, "VM bridge is ready");
                return Ok(bridge);
            }
            Err(err) => {
                if started.elapsed() >= timeout {
                    return Err(FabricError::BridgeWaitTimeout(started.elapsed()));
                }
                debug!(error = %err, "waiting for VM bridge");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

fn pick_unique_bridge(mut candidates: Vec<BridgeRef>) -> Result<BridgeRef, FabricError> {
    match candidates.len() {
        0 => Err(FabricError::BridgeNotFound),
        1 => Ok(candidates.remove(0)),
        _ => Err(FabricError::AmbiguousBridge(
            candidates.into_iter().map(|b| b.name).collect(),
        )),
    }
}
