//! In-memory set of known mesh peers.
//!
//! Single-writer by contract: only the discovery thread (plus the one-time
//! startup seed) mutates the map. Everyone else takes snapshots.

use hashbrown::HashMap;
use parking_lot::RwLock;
use std::time::{Duration, Instant};

use crate::context::MeshContext;

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First sighting of this mesh id.
    Joined,
    /// Known id; record refreshed in place.
    Refreshed,
}

#[derive(Debug, Default)]
pub struct MeshRepository {
    inner: RwLock<HashMap<u64, MeshContext>>,
}

impl MeshRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a record, keyed by `mesh_id`.
    pub fn upsert(&self, ctx: MeshContext) -> Upsert {
        let mut map = self.inner.write();
        match map.insert(ctx.mesh_id, ctx) {
            None => Upsert::Joined,
            Some(_) => Upsert::Refreshed,
        }
    }

    #[must_use]
    pub fn get(&self, mesh_id: u64) -> Option<MeshContext> {
        self.inner.read().get(&mesh_id).cloned()
    }

    /// Copy of every known record.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MeshContext> {
        self.inner.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Evict every record whose `last_seen` is older than `threshold`,
    /// returning the evicted contexts. The self record is never evicted —
    /// it is refreshed by construction, not by beacons.
    pub fn sweep(&self, threshold: Duration) -> Vec<MeshContext> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        let mut map = self.inner.write();
        map.retain(|_, ctx| {
            let keep = ctx.is_self || now.duration_since(ctx.last_seen) < threshold;
            if !keep {
                evicted.push(ctx.clone());
            }
            keep
        });
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(mesh_id: u64) -> MeshContext {
        MeshContext {
            mesh_id,
            application_name: "app".into(),
            workstation_name: "host".into(),
            address: "10.0.0.1".into(),
            rpc_port: 1,
            pub_port: 2,
            cluster_name: String::new(),
            is_self: false,
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn first_upsert_joins_then_refreshes() {
        let repo = MeshRepository::new();
        assert_eq!(repo.upsert(peer(1)), Upsert::Joined);
        assert_eq!(repo.upsert(peer(1)), Upsert::Refreshed);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn sweep_evicts_stale_records() {
        let repo = MeshRepository::new();
        let mut stale = peer(1);
        stale.last_seen = Instant::now() - Duration::from_secs(60);
        repo.upsert(stale);
        repo.upsert(peer(2));

        let evicted = repo.sweep(Duration::from_secs(10));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].mesh_id, 1);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn sweep_spares_the_self_record() {
        let repo = MeshRepository::new();
        let mut own = peer(7);
        own.is_self = true;
        own.last_seen = Instant::now() - Duration::from_secs(60);
        repo.upsert(own);

        assert!(repo.sweep(Duration::from_secs(10)).is_empty());
        assert!(repo.get(7).is_some());
    }

    #[test]
    fn rediscovery_after_eviction_joins_again() {
        let repo = MeshRepository::new();
        let mut stale = peer(1);
        stale.last_seen = Instant::now() - Duration::from_secs(60);
        repo.upsert(stale);
        repo.sweep(Duration::from_secs(10));

        assert_eq!(repo.upsert(peer(1)), Upsert::Joined);
    }
}
