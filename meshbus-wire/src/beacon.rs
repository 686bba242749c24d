//! UDP broadcast beacon socket.
//!
//! Discovery owns a plain thread, so the beacon socket is a blocking pair:
//! an ephemeral sender with `SO_BROADCAST`, and a receiver bound to the
//! beacon port with `SO_REUSEADDR`/`SO_REUSEPORT` so several nodes on one
//! host can share the port (broadcast datagrams reach every member of a
//! reuse group). The receiver carries a read timeout; `recv` surfaces
//! timeouts as `Ok(None)` so the caller's loop can interleave advertising
//! and sweeping.
//!
//! Advertisements go to a target list: the limited broadcast address on a
//! real LAN, or explicit unicast addresses for single-host and seeded
//! deployments.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::Result;

/// Largest beacon datagram we accept.
pub const MAX_BEACON_LEN: usize = 2048;

/// The default advertisement target for `port`: limited broadcast.
#[must_use]
pub fn broadcast_target(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port))
}

pub struct BeaconSocket {
    sender: UdpSocket,
    receiver: UdpSocket,
    targets: Vec<SocketAddr>,
}

impl BeaconSocket {
    /// Open the beacon pair: receive on `port`, advertise to `targets`.
    pub fn open(port: u16, recv_timeout: Duration, targets: Vec<SocketAddr>) -> Result<Self> {
        let sender = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        sender.set_broadcast(true)?;

        let receiver = bind_reusable(port)?;
        receiver.set_read_timeout(Some(recv_timeout))?;

        Ok(Self {
            sender,
            receiver,
            targets,
        })
    }

    /// Advertise one beacon payload to every target.
    ///
    /// Per-target failures are reported only after the remaining targets
    /// were attempted.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let mut last_err = None;
        for target in &self.targets {
            if let Err(err) = self.sender.send_to(payload, target) {
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Receive one datagram, or `None` when the read timeout elapsed.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.receiver.recv_from(buf) {
            Ok((len, src)) => Ok(Some((len, src))),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Bind the receiving socket with address (and, off Windows, port) reuse,
/// set up via `socket2` before the bind so the options actually apply.
fn bind_reusable(port: u16) -> std::io::Result<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(err) = socket.set_reuse_address(true) {
        debug!(%err, "SO_REUSEADDR not available");
    }
    #[cfg(not(target_os = "windows"))]
    if let Err(err) = socket.set_reuse_port(true) {
        debug!(%err, "SO_REUSEPORT not available");
    }

    socket.bind(&socket2::SockAddr::from(addr))?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn unicast_roundtrip_between_two_sockets() {
        let port_a = portpicker::pick_unused_port().expect("free port");
        let port_b = portpicker::pick_unused_port().expect("free port");

        let a = BeaconSocket::open(port_a, Duration::from_millis(500), vec![loopback(port_b)])
            .expect("open a");
        let b = BeaconSocket::open(port_b, Duration::from_millis(500), vec![loopback(port_a)])
            .expect("open b");

        a.send(b"hello-mesh").expect("send");

        let mut buf = [0u8; MAX_BEACON_LEN];
        let (len, _src) = b.recv(&mut buf).expect("recv").expect("datagram");
        assert_eq!(&buf[..len], b"hello-mesh");

        b.send(b"hello-back").expect("send back");
        let (len, _src) = a.recv(&mut buf).expect("recv").expect("datagram");
        assert_eq!(&buf[..len], b"hello-back");
    }

    #[test]
    fn recv_timeout_is_none() {
        let port = portpicker::pick_unused_port().expect("free port");
        let sock = BeaconSocket::open(port, Duration::from_millis(50), vec![loopback(port)])
            .expect("open");
        let mut buf = [0u8; 64];
        assert!(sock.recv(&mut buf).expect("recv").is_none());
    }

    #[test]
    fn multiple_targets_fan_out() {
        let port_a = portpicker::pick_unused_port().expect("free port");
        let port_b = portpicker::pick_unused_port().expect("free port");
        let port_src = portpicker::pick_unused_port().expect("free port");

        let src = BeaconSocket::open(
            port_src,
            Duration::from_millis(500),
            vec![loopback(port_a), loopback(port_b)],
        )
        .expect("open src");
        let a = BeaconSocket::open(port_a, Duration::from_millis(500), vec![]).expect("open a");
        let b = BeaconSocket::open(port_b, Duration::from_millis(500), vec![]).expect("open b");

        src.send(b"fan").expect("send");

        let mut buf = [0u8; 64];
        assert!(a.recv(&mut buf).expect("recv a").is_some());
        assert!(b.recv(&mut buf).expect("recv b").is_some());
    }
}
