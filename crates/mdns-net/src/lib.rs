//! The multicast transport the querier and responder send and receive
//! through (component B/C of the design this crate implements).
//!
//! The core only ever talks to the `Transport` trait: joining the
//! multicast group, binding to a particular interface, and enumerating
//! local addresses are all treated as injected, platform-specific
//! concerns and live outside this crate.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::broadcast;

/// The mDNS UDP port (RFC 6762 section 3), same for both address families.
pub const MDNS_PORT: u16 = 5353;

/// The IPv4 mDNS multicast group (RFC 6762 section 3).
pub const MDNS_IPV4_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// The IPv6 mDNS multicast group (RFC 6762 section 3).
pub const MDNS_IPV6_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// Messages are kept under this size so `is_truncated` never needs to be
/// set (RFC 6762 section 17 notes the common convention of avoiding TC on
/// the local link).
pub const MAX_MESSAGE_SIZE: usize = 9000;

/// Which multicast group and address family a transport operates over.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn group(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(MDNS_IPV4_GROUP),
            Family::V6 => IpAddr::V6(MDNS_IPV6_GROUP),
        }
    }
}

/// Abstract multicast send/receive, loopback/TTL control, and own-address
/// detection (design component B). An `impl Transport` is shared between a
/// querier and a responder running against the same interface; sends are
/// independent of each other and the transport is responsible for
/// serialising concurrent access if the underlying socket requires it.
pub trait Transport: Send + Sync + 'static {
    /// Transmit a fully-encoded message to the mDNS group.
    fn send(&self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Wait for, and return, the next received datagram and its origin.
    fn receive(&self) -> impl Future<Output = io::Result<(Vec<u8>, SocketAddr)>> + Send;

    /// Enable or disable local loopback of our own multicast sends.
    fn set_loopback(&self, enabled: bool) -> io::Result<()>;

    /// Set the multicast TTL. A no-op for transports where this concept
    /// does not apply (e.g. IPv6, where hop limit is fixed at 255 per RFC
    /// 6762 section 11).
    fn set_ttl(&self, ttl: u32) -> io::Result<()>;

    /// True if `addr` names this machine, for ignoring loopback copies of
    /// our own traffic.
    fn is_own_address(&self, addr: &IpAddr) -> bool;

    fn family(&self) -> Family;
}

/// A `Transport` over a real `tokio::net::UdpSocket`, already bound and
/// joined to the relevant multicast group by the caller (platform-specific
/// socket setup is out of scope for this crate, per the design's own
/// framing of the transport as injected).
///
/// A single socket is read by one background task and fanned out over a
/// broadcast channel, so that every concurrent `receive()` caller sharing
/// this transport (the querier and responder routinely share one `Arc` of
/// it) sees every inbound datagram, rather than racing each other for the
/// one real `recv_from`.
pub struct UdpMulticastTransport {
    socket: Arc<tokio::net::UdpSocket>,
    family: Family,
    local_addresses: Vec<IpAddr>,
    inbound: broadcast::Sender<(Vec<u8>, SocketAddr)>,
    reader: tokio::task::JoinHandle<()>,
}

impl UdpMulticastTransport {
    /// Wrap an already-bound, already-joined socket. `local_addresses`
    /// should list every address this host could plausibly be seen
    /// sending from, for `is_own_address`.
    pub fn new(socket: tokio::net::UdpSocket, family: Family, local_addresses: Vec<IpAddr>) -> Self {
        let socket = Arc::new(socket);
        let (inbound, _) = broadcast::channel(1024);
        let reader = tokio::spawn(read_loop(Arc::clone(&socket), inbound.clone()));
        Self {
            socket,
            family,
            local_addresses,
            inbound,
            reader,
        }
    }
}

impl Drop for UdpMulticastTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(socket: Arc<tokio::net::UdpSocket>, inbound: broadcast::Sender<(Vec<u8>, SocketAddr)>) {
    let mut buf = vec![0u8; 65535];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                // no subscribers at all is not an error, just nobody listening yet
                let _ = inbound.send((buf[..len].to_vec(), from));
            }
            Err(err) => {
                tracing::warn!(?err, "multicast socket read error");
            }
        }
    }
}

impl Transport for UdpMulticastTransport {
    async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            tracing::warn!(length = bytes.len(), "outbound message over the practical size limit");
        }
        let target = SocketAddr::new(self.family.group(), MDNS_PORT);
        self.socket.send_to(bytes, target).await?;
        Ok(())
    }

    async fn receive(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut rx = self.inbound.subscribe();
        loop {
            match rx.recv().await {
                Ok(msg) => return Ok(msg),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "multicast reader task ended"))
                }
            }
        }
    }

    fn set_loopback(&self, enabled: bool) -> io::Result<()> {
        match self.family {
            Family::V4 => self.socket.set_multicast_loop_v4(enabled),
            Family::V6 => self.socket.set_multicast_loop_v6(enabled),
        }
    }

    fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        match self.family {
            Family::V4 => self.socket.set_multicast_ttl_v4(ttl),
            // IPv6 multicast hop limit is fixed by RFC 6762 section 11; this
            // is intentionally a no-op.
            Family::V6 => Ok(()),
        }
    }

    fn is_own_address(&self, addr: &IpAddr) -> bool {
        self.local_addresses.contains(addr)
    }

    fn family(&self) -> Family {
        self.family
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_groups_match_rfc6762() {
        assert_eq!(Family::V4.group(), IpAddr::V4(Ipv4Addr::new(224, 0, 0, 251)));
        assert_eq!(
            Family::V6.group(),
            IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb))
        );
    }
}

/// An in-memory transport for driving the querier and responder in tests
/// without real sockets, per the design's testing approach: a fake
/// shared wire with tokio's virtual clock standing in for real time.
#[cfg(any(feature = "test-util", test))]
pub mod test_util {
    use super::*;
    use tokio::sync::{broadcast, Mutex};

    /// A virtual wire: every `FakeTransport` made from the same
    /// `FakeNetwork` receives every other member's sends, including its
    /// own (mirroring real multicast loopback), leaving the `is_own_address`
    /// check to filter those out exactly as it would on a real link.
    pub struct FakeNetwork {
        tx: broadcast::Sender<(Vec<u8>, SocketAddr)>,
    }

    impl FakeNetwork {
        pub fn new() -> Self {
            let (tx, _) = broadcast::channel(1024);
            Self { tx }
        }

        pub fn transport(
            &self,
            address: SocketAddr,
            local_addresses: Vec<IpAddr>,
            family: Family,
        ) -> FakeTransport {
            FakeTransport {
                address,
                local_addresses,
                family,
                tx: self.tx.clone(),
                rx: Mutex::new(self.tx.subscribe()),
            }
        }
    }

    impl Default for FakeNetwork {
        fn default() -> Self {
            Self::new()
        }
    }

    pub struct FakeTransport {
        address: SocketAddr,
        local_addresses: Vec<IpAddr>,
        family: Family,
        tx: broadcast::Sender<(Vec<u8>, SocketAddr)>,
        rx: Mutex<broadcast::Receiver<(Vec<u8>, SocketAddr)>>,
    }

    impl FakeTransport {
        pub fn address(&self) -> SocketAddr {
            self.address
        }
    }

    impl Transport for FakeTransport {
        async fn send(&self, bytes: &[u8]) -> io::Result<()> {
            // no active subscribers is not an error for a fake wire
            let _ = self.tx.send((bytes.to_vec(), self.address));
            Ok(())
        }

        async fn receive(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
            let mut rx = self.rx.lock().await;
            loop {
                match rx.recv().await {
                    Ok(msg) => return Ok(msg),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "fake network closed"))
                    }
                }
            }
        }

        fn set_loopback(&self, _enabled: bool) -> io::Result<()> {
            Ok(())
        }

        fn set_ttl(&self, _ttl: u32) -> io::Result<()> {
            Ok(())
        }

        fn is_own_address(&self, addr: &IpAddr) -> bool {
            self.local_addresses.contains(addr)
        }

        fn family(&self) -> Family {
            self.family
        }
    }
}
