//! Per-scope socket managers.
//!
//! Each command scope owns a manager that watches membership and keeps one
//! dealer per admitted peer. The dealer handle map is plain bookkeeping —
//! snapshots for the scatter path — while every byte of socket I/O stays
//! on the scope's scheduler thread.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use flume::Sender;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::warn;

use meshbus_wire::dealer::{run_dealer, DealerSocket};

use crate::config::ClusterOptions;
use crate::context::MeshContext;
use crate::membership::{MembershipEvent, MembershipHub, SubscriptionId};
use crate::scheduler::SchedulerHandle;

/// The four command scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Loopback to this node's own router.
    Local,
    /// Every node on the same workstation.
    Machine,
    /// Every node sharing the cluster name.
    Cluster,
    /// Every known node.
    Network,
}

impl ScopeKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Machine => "machine",
            Self::Cluster => "cluster",
            Self::Network => "network",
        }
    }
}

/// Decides which peers a scope connects to.
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    kind: ScopeKind,
    workstation: String,
    cluster: ClusterOptions,
}

impl ScopeFilter {
    #[must_use]
    pub fn new(kind: ScopeKind, workstation: String, cluster: ClusterOptions) -> Self {
        Self {
            kind,
            workstation,
            cluster,
        }
    }

    /// Scope membership test. Cluster includes the self record; Machine
    /// includes it through the workstation equality itself.
    #[must_use]
    pub fn includes(&self, peer: &MeshContext) -> bool {
        match self.kind {
            ScopeKind::Local => peer.is_self,
            ScopeKind::Machine => peer.workstation_name == self.workstation,
            ScopeKind::Cluster => {
                peer.cluster_name == self.cluster.cluster_name && self.allowed(peer)
            }
            ScopeKind::Network => self.allowed(peer),
        }
    }

    fn allowed(&self, peer: &MeshContext) -> bool {
        (self.cluster.applications.is_empty()
            || self.cluster.applications.contains(&peer.application_name))
            && (self.cluster.nodes.is_empty() || self.cluster.nodes.contains(&peer.address))
    }
}

/// Keeps a scope's dealer set in sync with membership.
pub struct SocketManager {
    scope: &'static str,
    filter: ScopeFilter,
    scheduler: SchedulerHandle,
    /// Where all of this scope's dealers deliver their inbound replies.
    inbound_tx: Sender<Vec<Bytes>>,
    sockets: RwLock<HashMap<u64, DealerSocket>>,
    hub: Weak<MembershipHub>,
}

impl SocketManager {
    #[must_use]
    pub fn new(
        filter: ScopeFilter,
        scheduler: SchedulerHandle,
        inbound_tx: Sender<Vec<Bytes>>,
        hub: &Arc<MembershipHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scope: filter.kind.label(),
            filter,
            scheduler,
            inbound_tx,
            sockets: RwLock::new(HashMap::new()),
            hub: Arc::downgrade(hub),
        })
    }

    /// Subscribe to membership. The returned id unhooks the manager at
    /// shutdown.
    pub fn attach(self: &Arc<Self>, hub: &Arc<MembershipHub>) -> SubscriptionId {
        let manager = Arc::clone(self);
        hub.subscribe(move |event| match event {
            MembershipEvent::Joined(ctx) => manager.on_joined(ctx),
            MembershipEvent::Removed(ctx) => manager.on_removed(ctx),
            MembershipEvent::SocketCreated { .. } | MembershipEvent::SocketClosed { .. } => {}
        })
    }

    /// Snapshot of the current dealer set, safe to iterate while the
    /// manager keeps mutating.
    #[must_use]
    pub fn all(&self) -> Vec<DealerSocket> {
        self.sockets.read().values().cloned().collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sockets.read().len()
    }

    fn on_joined(&self, peer: &MeshContext) {
        if !self.filter.includes(peer) {
            return;
        }
        let mesh_id = peer.mesh_id;
        if self.sockets.read().contains_key(&mesh_id) {
            return;
        }

        let identity = format!("{}-{}", self.scope, mesh_id);
        let (socket, cmd_rx) = DealerSocket::pair(Bytes::from(identity.into_bytes()));
        self.sockets.write().insert(mesh_id, socket.clone());

        let addr = peer.rpc_endpoint();
        let inbound = self.inbound_tx.clone();
        let scope = self.scope;
        self.scheduler.execute(move |ctx| {
            let task = compio::runtime::spawn(async move {
                if let Err(err) = run_dealer(&addr, socket, cmd_rx, inbound).await {
                    warn!(%err, scope, addr, "dealer connection failed");
                }
            });
            ctx.socket_tasks.insert(mesh_id, task);
        });

        self.notify(MembershipEvent::SocketCreated {
            scope: self.scope,
            mesh_id,
        });
    }

    fn on_removed(&self, peer: &MeshContext) {
        let mesh_id = peer.mesh_id;
        let Some(socket) = self.sockets.write().remove(&mesh_id) else {
            return;
        };

        self.scheduler.execute(move |ctx| {
            socket.close();
            ctx.socket_tasks.remove(&mesh_id);
        });

        self.notify(MembershipEvent::SocketClosed {
            scope: self.scope,
            mesh_id,
        });
    }

    fn notify(&self, event: MembershipEvent) {
        if let Some(hub) = self.hub.upgrade() {
            hub.publish(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ActorScheduler;
    use std::time::Instant;

    fn peer(mesh_id: u64, workstation: &str, cluster: &str) -> MeshContext {
        MeshContext {
            mesh_id,
            application_name: "app".into(),
            workstation_name: workstation.into(),
            address: "127.0.0.1".into(),
            rpc_port: 1,
            pub_port: 2,
            cluster_name: cluster.into(),
            is_self: false,
            last_seen: Instant::now(),
        }
    }

    fn cluster_options(name: &str) -> ClusterOptions {
        ClusterOptions {
            cluster_name: name.into(),
            ..ClusterOptions::default()
        }
    }

    #[test]
    fn local_scope_admits_only_self() {
        let filter = ScopeFilter::new(ScopeKind::Local, "host-a".into(), ClusterOptions::default());
        let mut own = peer(1, "host-a", "");
        own.is_self = true;
        assert!(filter.includes(&own));
        assert!(!filter.includes(&peer(2, "host-a", "")));
    }

    #[test]
    fn machine_scope_matches_workstation() {
        let filter =
            ScopeFilter::new(ScopeKind::Machine, "host-a".into(), ClusterOptions::default());
        assert!(filter.includes(&peer(1, "host-a", "")));
        assert!(!filter.includes(&peer(2, "host-b", "")));
    }

    #[test]
    fn cluster_scope_matches_cluster_name_including_self() {
        let filter = ScopeFilter::new(ScopeKind::Cluster, "host-a".into(), cluster_options("t"));
        let mut own = peer(1, "host-a", "t");
        own.is_self = true;
        assert!(filter.includes(&own));
        assert!(filter.includes(&peer(2, "host-b", "t")));
        assert!(!filter.includes(&peer(3, "host-b", "other")));
    }

    #[test]
    fn network_scope_admits_everyone_without_filters() {
        let filter =
            ScopeFilter::new(ScopeKind::Network, "host-a".into(), ClusterOptions::default());
        assert!(filter.includes(&peer(1, "x", "a")));
        assert!(filter.includes(&peer(2, "y", "b")));
    }

    #[test]
    fn allow_lists_restrict_cluster_and_network() {
        let cluster = ClusterOptions {
            cluster_name: "t".into(),
            applications: vec!["billing".into()],
            nodes: vec!["127.0.0.1".into()],
        };
        let filter = ScopeFilter::new(ScopeKind::Network, "host-a".into(), cluster);

        let mut admitted = peer(1, "x", "t");
        admitted.application_name = "billing".into();
        assert!(filter.includes(&admitted));

        let mut wrong_app = admitted.clone();
        wrong_app.application_name = "other".into();
        assert!(!filter.includes(&wrong_app));

        let mut wrong_node = admitted;
        wrong_node.address = "10.0.0.9".into();
        assert!(!filter.includes(&wrong_node));
    }

    #[test]
    fn snapshot_tracks_join_and_remove() {
        let mut scheduler = ActorScheduler::start("mgr-test").expect("scheduler");
        let hub = Arc::new(MembershipHub::new());
        let (inbound_tx, _inbound_rx) = flume::unbounded();

        let filter =
            ScopeFilter::new(ScopeKind::Network, "host-a".into(), ClusterOptions::default());
        let manager = SocketManager::new(filter, scheduler.handle(), inbound_tx, &hub);
        let subscription = manager.attach(&hub);

        hub.publish(&MembershipEvent::Joined(peer(1, "x", "")));
        hub.publish(&MembershipEvent::Joined(peer(2, "y", "")));
        assert_eq!(manager.count(), 2);

        // Duplicate joins do not duplicate sockets.
        hub.publish(&MembershipEvent::Joined(peer(1, "x", "")));
        assert_eq!(manager.count(), 2);

        hub.publish(&MembershipEvent::Removed(peer(1, "x", "")));
        assert_eq!(manager.count(), 1);
        assert_eq!(manager.all().len(), 1);

        // Removes for unknown peers are ignored.
        hub.publish(&MembershipEvent::Removed(peer(9, "z", "")));
        assert_eq!(manager.count(), 1);

        hub.unsubscribe(subscription);
        scheduler.shutdown();
    }
}
