//! Mesh node identity records.

use std::net::UdpSocket;
use std::time::Instant;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MeshOptions;
use crate::error::{MeshError, Result};
use crate::topic::mesh_id_hash;

/// The local workstation name, resolved once per process.
static WORKSTATION: Lazy<String> = Lazy::new(|| {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned())
});

/// One peer of the mesh, including the local node itself.
///
/// This is also the beacon payload: the record travels MessagePack-encoded
/// in every advertisement. `is_self` and `last_seen` are local-only state
/// and never cross the wire — receivers stamp both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshContext {
    /// Stable node identifier: hash of host, application and pid.
    pub mesh_id: u64,
    /// Logical service name.
    pub application_name: String,
    /// Host identity, used by the Machine scope filter.
    pub workstation_name: String,
    /// IP literal peers can reach this node at. Receivers overwrite this
    /// with the beacon's source address.
    pub address: String,
    /// Command server router port; 0 until bound.
    pub rpc_port: u16,
    /// Event publisher port; 0 until bound.
    pub pub_port: u16,
    /// Logical group; empty = no cluster.
    pub cluster_name: String,

    /// True only on the record describing this process.
    #[serde(skip)]
    pub is_self: bool,

    /// When the last beacon for this record arrived.
    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
}

impl MeshContext {
    /// Build the local record. Ports must already be resolved: beacons are
    /// only valid once both servers are bound.
    #[must_use]
    pub fn local(options: &MeshOptions, rpc_port: u16, pub_port: u16) -> Self {
        let workstation = WORKSTATION.clone();
        let mesh_id = mesh_id_hash(&workstation, &options.application_name, std::process::id());
        Self {
            mesh_id,
            application_name: options.application_name.clone(),
            workstation_name: workstation,
            address: primary_address(),
            rpc_port,
            pub_port,
            cluster_name: options.cluster.cluster_name.clone(),
            is_self: true,
            last_seen: Instant::now(),
        }
    }

    /// Encode for a beacon datagram.
    pub fn to_beacon(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(MeshError::serialization)
    }

    /// Decode a beacon datagram. `is_self` comes back false and
    /// `last_seen` is stamped now; the caller fixes up `address`.
    pub fn from_beacon(payload: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(payload).map_err(MeshError::serialization)
    }

    /// `address:rpc_port`, the dealer connect target.
    #[must_use]
    pub fn rpc_endpoint(&self) -> String {
        format!("{}:{}", self.address, self.rpc_port)
    }

    /// `address:pub_port`, the subscriber connect target.
    #[must_use]
    pub fn pub_endpoint(&self) -> String {
        format!("{}:{}", self.address, self.pub_port)
    }
}

/// The local workstation name.
#[must_use]
pub fn workstation_name() -> &'static str {
    &WORKSTATION
}

/// Best-effort primary interface address via the UDP-connect trick (no
/// packet is sent). Falls back to loopback on isolated hosts.
fn primary_address() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    match probe() {
        Ok(addr) => addr,
        Err(err) => {
            debug!(%err, "primary address probe failed, using loopback");
            "127.0.0.1".to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MeshContext {
        MeshContext {
            mesh_id: 42,
            application_name: "billing".into(),
            workstation_name: "host-a".into(),
            address: "192.168.1.10".into(),
            rpc_port: 10_000,
            pub_port: 10_500,
            cluster_name: "prod".into(),
            is_self: true,
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn beacon_roundtrip_drops_local_state() {
        let ctx = sample();
        let beacon = ctx.to_beacon().expect("encode");
        let decoded = MeshContext::from_beacon(&beacon).expect("decode");

        assert_eq!(decoded.mesh_id, ctx.mesh_id);
        assert_eq!(decoded.application_name, ctx.application_name);
        assert_eq!(decoded.workstation_name, ctx.workstation_name);
        assert_eq!(decoded.rpc_port, ctx.rpc_port);
        assert_eq!(decoded.pub_port, ctx.pub_port);
        assert_eq!(decoded.cluster_name, ctx.cluster_name);
        // Local-only state never crosses the wire.
        assert!(!decoded.is_self);
    }

    #[test]
    fn malformed_beacon_is_an_error() {
        assert!(MeshContext::from_beacon(&[0xc1, 0xff, 0x00]).is_err());
    }

    #[test]
    fn local_record_is_self() {
        let ctx = MeshContext::local(&MeshOptions::default(), 1234, 5678);
        assert!(ctx.is_self);
        assert_eq!(ctx.rpc_port, 1234);
        assert_eq!(ctx.pub_port, 5678);
        assert_ne!(ctx.mesh_id, 0);
        assert!(!ctx.address.is_empty());
    }
}
