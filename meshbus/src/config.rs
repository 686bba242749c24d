//! Bus configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Base port the command server probes from when binding its router.
pub const DEFAULT_RPC_PORT: u16 = 10_000;
/// Base port the event publisher probes from.
pub const DEFAULT_PUBLISH_PORT: u16 = 10_500;
/// UDP port beacons are exchanged on.
pub const DEFAULT_BEACON_PORT: u16 = 9_100;

fn default_application_name() -> String {
    "meshbus".to_owned()
}

const fn default_rpc_port() -> u16 {
    DEFAULT_RPC_PORT
}

const fn default_publish_port() -> u16 {
    DEFAULT_PUBLISH_PORT
}

const fn default_beacon_port() -> u16 {
    DEFAULT_BEACON_PORT
}

const fn default_beacon_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_cleanup_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_inactive_threshold() -> Duration {
    Duration::from_secs(10)
}

const fn default_reply_pool_ceiling() -> usize {
    1024
}

/// Options controlling a mesh node.
///
/// Every field has a default; the zero-config path
/// (`MeshOptions::default()`) yields a working node on a trusted LAN.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshOptions {
    /// Logical service name advertised in beacons.
    pub application_name: String,

    /// First port probed for the command server's router endpoint.
    pub rpc_port: u16,

    /// First port probed for the event publisher endpoint.
    pub publish_port: u16,

    /// UDP port beacons are received on.
    pub beacon_port: u16,

    /// Extra advertisement destinations. Empty means limited broadcast to
    /// `beacon_port`; explicit entries support single-host meshes and
    /// seeded deployments.
    pub beacon_targets: Vec<SocketAddr>,

    /// How often the local context is advertised.
    pub beacon_interval: Duration,

    /// How often stale peers are swept from the repository.
    pub cleanup_interval: Duration,

    /// Age past which an unseen peer is evicted.
    pub inactive_threshold: Duration,

    /// Upper bound on pooled reply awaiters per scope.
    pub reply_pool_ceiling: usize,

    /// Cluster membership and filtering.
    pub cluster: ClusterOptions,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            application_name: default_application_name(),
            rpc_port: default_rpc_port(),
            publish_port: default_publish_port(),
            beacon_port: default_beacon_port(),
            beacon_targets: Vec::new(),
            beacon_interval: default_beacon_interval(),
            cleanup_interval: default_cleanup_interval(),
            inactive_threshold: default_inactive_threshold(),
            reply_pool_ceiling: default_reply_pool_ceiling(),
            cluster: ClusterOptions::default(),
        }
    }
}

/// Cluster scope filtering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    /// Logical group this node belongs to. Empty string = no cluster.
    pub cluster_name: String,

    /// When non-empty, only peers with one of these application names are
    /// admitted to the Cluster and Network scopes.
    pub applications: Vec<String>,

    /// When non-empty, only peers at one of these addresses are admitted
    /// to the Cluster and Network scopes.
    pub nodes: Vec<String>,
}
