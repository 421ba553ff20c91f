//! Veth pair management for the metadata address.
//!
//! The metadata address lives on the server side of a veth pair whose peer is
//! enslaved to the VM bridge. The pair is *ensured*, not recreated: tearing it
//! down on every restart would hand the metadata IP a fresh MAC and black-hole
//! guests whose ARP caches still hold the old one. Existing state is validated
//! and repaired in place; only unrecoverable state (missing peer, wrong
//! bridge) is destroyed and rebuilt.

use std::net::IpAddr;

use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use rtnetlink::Handle;
use tracing::{debug, info, warn};

use crate::bridge::BridgeRef;
use crate::link::{link_by_name, link_controller, link_mac, link_name};
use crate::{
    FabricError, MacAddr, IMDS_ADDRESS, LINK_LOCAL_NET, LINK_LOCAL_PREFIX, TAP_PREFIX, VETH_IMDS,
    VETH_IMDS_BRIDGE,
};

/// Fabric state after a successful ensure: the resolved bridge plus the
/// server-side veth the HTTP server and ARP responder answer from.
#[derive(Debug, Clone)]
pub struct FabricState {
    /// The VM bridge the pair is attached to.
    pub bridge: BridgeRef,
    /// Interface index of the server-side veth.
    pub imds_index: u32,
    /// Hardware address of the server-side veth, stable across restarts.
    pub imds_mac: MacAddr,
}

/// Validate the existing veth pair or create a new one.
pub async fn ensure_veth(handle: &Handle, bridge: &BridgeRef) -> Result<FabricState, FabricError> {
    let Some(imds_link) = link_by_name(handle, VETH_IMDS).await? else {
        return setup_veth(handle, bridge).await;
    };

    let Some(bridge_side) = link_by_name(handle, VETH_IMDS_BRIDGE).await? else {
        // Server side without its peer cannot be repaired.
        warn!(veth = VETH_IMDS_BRIDGE, "bridge-side veth missing, recreating pair");
        cleanup_veth(handle).await?;
        return setup_veth(handle, bridge).await;
    };

    if link_controller(&bridge_side) != Some(bridge.index) {
        warn!(
            veth = VETH_IMDS_BRIDGE,
            bridge = %bridge.name,
            "veth attached to the wrong bridge, recreating pair"
        );
        cleanup_veth(handle).await?;
        return setup_veth(handle, bridge).await;
    }

    debug!(veth = VETH_IMDS, "existing veth pair found, repairing in place");

    ensure_address(handle, imds_link.header.index).await?;
    handle.link().set(bridge_side.header.index).up().execute().await?;
    handle.link().set(imds_link.header.index).up().execute().await?;
    add_link_local_route(handle, imds_link.header.index).await?;
    configure_rp_filter(VETH_IMDS).await?;

    let imds_mac =
        link_mac(&imds_link).ok_or_else(|| FabricError::MissingMac(VETH_IMDS.to_string()))?;

    Ok(FabricState {
        bridge: bridge.clone(),
        imds_index: imds_link.header.index,
        imds_mac,
    })
}

/// Create the veth pair from scratch and wire it to the bridge.
pub async fn setup_veth(handle: &Handle, bridge: &BridgeRef) -> Result<FabricState, FabricError> {
    handle
        .link()
        .add()
        .veth(VETH_IMDS.to_string(), VETH_IMDS_BRIDGE.to_string())
        .execute()
        .await?;

    let bridge_side = link_by_name(handle, VETH_IMDS_BRIDGE)
        .await?
        .ok_or_else(|| FabricError::LinkNotFound(VETH_IMDS_BRIDGE.to_string()))?;
    let imds_link = link_by_name(handle, VETH_IMDS)
        .await?
        .ok_or_else(|| FabricError::LinkNotFound(VETH_IMDS.to_string()))?;

    handle
        .link()
        .set(bridge_side.header.index)
        .controller(bridge.index)
        .execute()
        .await?;
    handle.link().set(bridge_side.header.index).up().execute().await?;

    handle
        .address()
        .add(imds_link.header.index, IpAddr::V4(IMDS_ADDRESS), 32)
        .execute()
        .await?;
    handle.link().set(imds_link.header.index).up().execute().await?;

    add_link_local_route(handle, imds_link.header.index).await?;
    configure_rp_filter(VETH_IMDS).await?;

    let imds_mac =
        link_mac(&imds_link).ok_or_else(|| FabricError::MissingMac(VETH_IMDS.to_string()))?;

    info!(
        veth = VETH_IMDS,
        bridge = %bridge.name,
        mac = %imds_mac,
        "veth pair created and attached"
    );

    Ok(FabricState {
        bridge: bridge.clone(),
        imds_index: imds_link.header.index,
        imds_mac,
    })
}

/// Delete the veth pair if it exists. Deleting one end removes its peer.
pub async fn cleanup_veth(handle: &Handle) -> Result<(), FabricError> {
    if let Some(link) = link_by_name(handle, VETH_IMDS).await? {
        handle.link().del(link.header.index).execute().await?;
    }
    Ok(())
}

/// Find the guest's MAC: the first `tap*` link enslaved to the bridge.
pub async fn discover_vm_mac(handle: &Handle, bridge: &BridgeRef) -> Result<MacAddr, FabricError> {
    let mut links = handle.link().get().execute();
    while let Some(msg) = links.try_next().await? {
        if link_controller(&msg) != Some(bridge.index) {
            continue;
        }
        let Some(name) = link_name(&msg) else {
            continue;
        };
        if !name.starts_with(TAP_PREFIX) {
            continue;
        }
        if let Some(mac) = link_mac(&msg) {
            info!(tap = name, mac = %mac, "discovered VM tap device");
            return Ok(mac);
        }
    }
    Err(FabricError::NoTapDevice(bridge.name.clone()))
}

/// Add the metadata address to the server-side veth unless already present.
async fn ensure_address(handle: &Handle, link_index: u32) -> Result<(), FabricError> {
    let mut addrs = handle
        .address()
        .get()
        .set_link_index_filter(link_index)
        .execute();
    while let Some(msg) = addrs.try_next().await? {
        let present = msg.attributes.iter().any(
            |attr| matches!(attr, AddressAttribute::Address(IpAddr::V4(ip)) if *ip == IMDS_ADDRESS),
        );
        if present {
            return Ok(());
        }
    }
    handle
        .address()
        .add(link_index, IpAddr::V4(IMDS_ADDRESS), 32)
        .execute()
        .await?;
    Ok(())
}

/// Install (or replace) the scope-link route for 169.254.0.0/16 out of the
/// server-side veth, so replies to link-local-only guests have a route.
async fn add_link_local_route(handle: &Handle, link_index: u32) -> Result<(), FabricError> {
    handle
        .route()
        .add()
        .v4()
        .destination_prefix(LINK_LOCAL_NET, LINK_LOCAL_PREFIX)
        .output_interface(link_index)
        .scope(netlink_packet_route::route::RouteScope::Link)
        .replace()
        .execute()
        .await?;
    Ok(())
}

/// Zero reverse-path filtering for the interface.
///
/// The kernel applies max(interface, all), so both knobs must be written.
/// Without this, packets from guests whose link-local source has no return
/// route are dropped before they reach the listener.
async fn configure_rp_filter(ifname: &str) -> Result<(), FabricError> {
    let paths = [
        format!("/proc/sys/net/ipv4/conf/{ifname}/rp_filter"),
        "/proc/sys/net/ipv4/conf/all/rp_filter".to_string(),
    ];
    for path in paths {
        tokio::fs::write(&path, b"0")
            .await
            .map_err(|source| FabricError::Sysctl { path, source })?;
    }
    Ok(())
}
