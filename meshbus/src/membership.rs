//! In-process membership notifications.
//!
//! A tiny synchronous pub/sub used only for lifecycle traffic: peers
//! joining and leaving the repository, scope sockets opening and closing.
//! Delivery happens on the publisher's thread against a snapshot of the
//! subscriber list, so handlers subscribed during a publish are not invoked
//! for it and handlers removed mid-publish still finish their current
//! invocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::MeshContext;

/// Lifecycle events of the mesh.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// A new mesh id appeared in the repository.
    Joined(MeshContext),
    /// A stale record was evicted.
    Removed(MeshContext),
    /// A scope opened a client socket to a peer.
    SocketCreated { scope: &'static str, mesh_id: u64 },
    /// A scope tore a client socket down.
    SocketClosed { scope: &'static str, mesh_id: u64 },
}

type Handler = Arc<dyn Fn(&MembershipEvent) + Send + Sync>;

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct MembershipHub {
    subscribers: Mutex<Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

impl MembershipHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; it sees every event published after this call.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&MembershipEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, Arc::new(handler)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id.0);
    }

    /// Deliver `event` synchronously to all current subscribers in
    /// insertion order. A publish with zero subscribers is a no-op.
    pub fn publish(&self, event: &MembershipEvent) {
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}
