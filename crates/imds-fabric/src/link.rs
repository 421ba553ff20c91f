//! Shared helpers for reading rtnetlink link dumps.

use futures::TryStreamExt;
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};
use rtnetlink::Handle;

use crate::{FabricError, MacAddr};

/// Fetch a single link by name, mapping "no such device" to `None`.
pub(crate) async fn link_by_name(
    handle: &Handle,
    name: &str,
) -> Result<Option<LinkMessage>, FabricError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(msg) => Ok(msg),
        Err(rtnetlink::Error::NetlinkError(err))
            if matches!(
                err.code.map(|c| -c.get()),
                Some(libc::ENODEV) | Some(libc::ENOENT)
            ) =>
        {
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn link_name(msg: &LinkMessage) -> Option<&str> {
    msg.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.as_str()),
        _ => None,
    })
}

/// Index of the link's controller (bridge it is enslaved to), if any.
pub(crate) fn link_controller(msg: &LinkMessage) -> Option<u32> {
    msg.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Controller(index) => Some(*index),
        _ => None,
    })
}

pub(crate) fn link_mac(msg: &LinkMessage) -> Option<MacAddr> {
    msg.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) => MacAddr::from_bytes(bytes),
        _ => None,
    })
}

pub(crate) fn link_kind(msg: &LinkMessage) -> Option<InfoKind> {
    msg.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::LinkInfo(infos) => infos.iter().find_map(|info| match info {
            LinkInfo::Kind(kind) => Some(kind.clone()),
            _ => None,
        }),
        _ => None,
    })
}
