//! Userspace ARP responder for the metadata address.
//!
//! The kernel only answers ARP for an address on interfaces where that
//! address is assigned. The metadata IP lives on the server-side veth, but
//! guest ARP requests arrive on the *bridge* from the tap, so the kernel
//! stays silent. A raw `AF_PACKET` socket bound to the bridge observes every
//! broadcast ARP on the segment and crafts replies carrying the server-side
//! veth's MAC. This also serves guests with no IP at all (sender protocol
//! address 0.0.0.0).

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::BridgeRef;
use crate::{FabricError, MacAddr, IMDS_ADDRESS};

const ETHERNET_HEADER_LEN: usize = 14;
const ARP_PACKET_LEN: usize = 28;

/// Total length of an ethernet ARP frame.
pub const ARP_FRAME_LEN: usize = ETHERNET_HEADER_LEN + ARP_PACKET_LEN;

const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;
const ETH_P_ARP: u16 = 0x0806;

/// How long a single `recv` blocks before the loop re-checks cancellation.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// A parsed ARP request observed on the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpRequest {
    /// Requester's hardware address.
    pub sender_mac: MacAddr,
    /// Requester's protocol address; all-zeros for guests with no IP yet.
    pub sender_ip: Ipv4Addr,
    /// The address being resolved.
    pub target_ip: Ipv4Addr,
}

/// Parse an ethernet frame into an ARP *request*.
///
/// Returns `None` for anything that is not a well-formed IPv4-over-ethernet
/// ARP request: too short, wrong hardware/protocol type or length, or an ARP
/// reply. Such frames are silently dropped by the responder.
pub fn parse_arp_request(frame: &[u8]) -> Option<ArpRequest> {
    if frame.len() < ARP_FRAME_LEN {
        return None;
    }
    let arp = &frame[ETHERNET_HEADER_LEN..];

    let hardware_type = u16::from_be_bytes([arp[0], arp[1]]);
    let protocol_type = u16::from_be_bytes([arp[2], arp[3]]);
    let hardware_len = arp[4];
    let protocol_len = arp[5];
    let operation = u16::from_be_bytes([arp[6], arp[7]]);

    if hardware_type != ARP_HTYPE_ETHERNET
        || protocol_type != ARP_PTYPE_IPV4
        || hardware_len != 6
        || protocol_len != 4
        || operation != ARP_OP_REQUEST
    {
        return None;
    }

    Some(ArpRequest {
        sender_mac: MacAddr::from_bytes(&arp[8..14])?,
        sender_ip: Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]),
        target_ip: Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]),
    })
}

/// Build the 42-byte ARP reply frame announcing `imds_mac` for `imds_ip`.
///
/// The target fields echo the requester; a requester with no IP gets its
/// all-zeros address echoed back, which is what it expects.
pub fn build_arp_reply(
    imds_mac: MacAddr,
    imds_ip: Ipv4Addr,
    requester_mac: MacAddr,
    requester_ip: Ipv4Addr,
) -> [u8; ARP_FRAME_LEN] {
    let mut frame = [0u8; ARP_FRAME_LEN];

    // Ethernet header
    frame[0..6].copy_from_slice(&requester_mac.octets());
    frame[6..12].copy_from_slice(&imds_mac.octets());
    frame[12..14].copy_from_slice(&ETH_P_ARP.to_be_bytes());

    // ARP payload
    let arp = &mut frame[ETHERNET_HEADER_LEN..];
    arp[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    arp[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    arp[4] = 6;
    arp[5] = 4;
    arp[6..8].copy_from_slice(&ARP_OP_REPLY.to_be_bytes());
    arp[8..14].copy_from_slice(&imds_mac.octets());
    arp[14..18].copy_from_slice(&imds_ip.octets());
    arp[18..24].copy_from_slice(&requester_mac.octets());
    arp[24..28].copy_from_slice(&requester_ip.octets());

    frame
}

/// A raw packet socket bound to a bridge, filtered to ARP.
struct ArpSocket {
    fd: OwnedFd,
}

impl ArpSocket {
    /// Open an `AF_PACKET`/`SOCK_RAW` socket for ARP, set the receive
    /// timeout, and bind it to the bridge's ifindex.
    fn open(bridge_index: u32) -> io::Result<Self> {
        // SAFETY: plain socket(2) call; the returned fd is validated below.
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                i32::from(ETH_P_ARP.to_be()),
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by socket(2) and is owned only here.
        let socket = Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };
        socket.set_recv_timeout(RECV_TIMEOUT)?;
        socket.bind(bridge_index)?;
        Ok(socket)
    }

    fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: 0,
        };
        // SAFETY: fd is valid for the lifetime of self; tv outlives the call.
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                (&tv as *const libc::timeval).cast(),
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn bind(&self, ifindex: u32) -> io::Result<()> {
        // SAFETY: sockaddr_ll is plain-old-data; zeroing is a valid initializer.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = ETH_P_ARP.to_be();
        addr.sll_ifindex = ifindex as libc::c_int;
        // SAFETY: addr is fully initialized and the size matches its type.
        let rc = unsafe {
            libc::bind(
                self.fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_ll).cast(),
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn send_to(&self, frame: &[u8], ifindex: u32, dest: MacAddr) -> io::Result<()> {
        // SAFETY: sockaddr_ll is plain-old-data; zeroing is a valid initializer.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = ETH_P_ARP.to_be();
        addr.sll_ifindex = ifindex as libc::c_int;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&dest.octets());
        // SAFETY: frame and addr are valid for the duration of the call.
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr().cast(),
                frame.len(),
                0,
                (&addr as *const libc::sockaddr_ll).cast(),
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Answers ARP requests for the metadata address on the VM bridge.
///
/// [`ArpResponder::run`] is a blocking loop; drive it from
/// `tokio::task::spawn_blocking`. The receive timeout keeps cancellation
/// latency within one second.
pub struct ArpResponder {
    bridge: BridgeRef,
    imds_mac: MacAddr,
    imds_ip: Ipv4Addr,
    vm_mac: Option<MacAddr>,
    socket: Mutex<Option<Arc<ArpSocket>>>,
}

impl ArpResponder {
    /// Create a responder answering with `imds_mac` on the given bridge.
    ///
    /// When `vm_mac` is set, only requests from that sender are answered;
    /// other peers attached to the bridge are ignored.
    pub fn new(bridge: BridgeRef, imds_mac: MacAddr, vm_mac: Option<MacAddr>) -> Self {
        Self {
            bridge,
            imds_mac,
            imds_ip: IMDS_ADDRESS,
            vm_mac,
            socket: Mutex::new(None),
        }
    }

    /// Run the receive loop until cancellation, [`stop`](Self::stop), or a
    /// non-recoverable socket error.
    ///
    /// `EAGAIN`, `EWOULDBLOCK` and `EINTR` are receive-timeout noise and are
    /// ignored; any other receive error tears the loop down and is returned
    /// so the sidecar can exit.
    pub fn run(&self, shutdown: &CancellationToken) -> Result<(), FabricError> {
        let socket =
            Arc::new(ArpSocket::open(self.bridge.index).map_err(FabricError::ArpSocket)?);
        *self.lock_socket() = Some(Arc::clone(&socket));

        info!(
            bridge = %self.bridge.name,
            ip = %self.imds_ip,
            mac = %self.imds_mac,
            "ARP responder listening"
        );

        let mut buf = [0u8; 1500];
        let result = loop {
            if shutdown.is_cancelled() || self.lock_socket().is_none() {
                break Ok(());
            }
            match socket.recv(&mut buf) {
                Ok(n) => self.handle_frame(&socket, &buf[..n]),
                Err(err) if is_transient(&err) => continue,
                Err(err) => break Err(FabricError::ArpReceive(err)),
            }
        };

        self.lock_socket().take();
        result
    }

    /// Release the socket; the loop notices within one receive timeout.
    pub fn stop(&self) {
        self.lock_socket().take();
    }

    fn handle_frame(&self, socket: &ArpSocket, frame: &[u8]) {
        let Some(request) = parse_arp_request(frame) else {
            return;
        };
        if request.target_ip != self.imds_ip {
            return;
        }
        if let Some(vm_mac) = self.vm_mac {
            if request.sender_mac != vm_mac {
                debug!(
                    sender = %request.sender_mac,
                    expected = %vm_mac,
                    "ignoring ARP request from unexpected sender"
                );
                return;
            }
        }

        info!(
            target = %request.target_ip,
            sender_ip = %request.sender_ip,
            sender_mac = %request.sender_mac,
            "ARP request for metadata address"
        );

        let reply = build_arp_reply(
            self.imds_mac,
            self.imds_ip,
            request.sender_mac,
            request.sender_ip,
        );
        if let Err(err) = socket.send_to(&reply, self.bridge.index, request.sender_mac) {
            warn!(error = %err, "failed to send ARP reply");
            return;
        }

        info!(ip = %self.imds_ip, mac = %self.imds_mac, "ARP reply sent");
    }

    fn lock_socket(&self) -> std::sync::MutexGuard<'_, Option<Arc<ArpSocket>>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK || code == libc::EINTR
    )
}
