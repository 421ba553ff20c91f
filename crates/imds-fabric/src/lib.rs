//! Link-local interception fabric for the per-VM instance metadata service.
//!
//! Every VM launcher pod contains a Linux bridge (`k6t-*`) connecting the
//! guest's tap device to the pod network. This crate makes the metadata
//! address `169.254.169.254` reachable from the guest at L2:
//!
//! - [`bridge`] discovers the VM bridge (with polling, since it is created by
//!   a peer container after we start),
//! - [`veth`] ensures a veth pair whose bridge side is enslaved to that
//!   bridge and whose server side owns the metadata address, preserving the
//!   server-side MAC across restarts so guest ARP caches stay valid,
//! - [`arp`] answers ARP requests for the metadata address from a raw socket
//!   bound to the bridge, which works even for guests that only have a
//!   self-assigned link-local address.

use std::fmt;
use std::net::Ipv4Addr;

pub mod arp;
pub mod bridge;
pub mod error;
mod link;
pub mod veth;

pub use error::FabricError;

/// Name of the veth interface the metadata server listens on.
pub const VETH_IMDS: &str = "veth-imds";

/// Name of the veth interface attached to the VM bridge.
pub const VETH_IMDS_BRIDGE: &str = "veth-imds-br";

/// The link-local metadata address.
pub const IMDS_ADDRESS: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// Name prefix of VM bridges created by the virtualization platform.
pub const VM_BRIDGE_PREFIX: &str = "k6t-";

/// Name prefix of the tap device backing the guest NIC.
pub const TAP_PREFIX: &str = "tap";

/// The link-local network routed out of the server-side veth.
pub const LINK_LOCAL_NET: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 0);

/// Prefix length of [`LINK_LOCAL_NET`].
pub const LINK_LOCAL_PREFIX: u8 = 16;

/// An ethernet hardware address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Build a MAC from a raw attribute payload; `None` unless exactly six
    /// bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.try_into().ok()?;
        Some(Self(octets))
    }

    /// The six octets of the address.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_from_bytes_requires_six_octets() {
        assert!(MacAddr::from_bytes(&[1, 2, 3, 4, 5]).is_none());
        assert!(MacAddr::from_bytes(&[1, 2, 3, 4, 5, 6, 7]).is_none());
        assert_eq!(
            MacAddr::from_bytes(&[0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc]),
            Some(MacAddr([0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc]))
        );
    }

    #[test]
    fn mac_display_is_lowercase_colon_separated() {
        let mac = MacAddr([0x52, 0x54, 0x00, 0x0a, 0x0b, 0xFF]);
        assert_eq!(mac.to_string(), "52:54:00:0a:0b:ff");
    }
}
