//! Subscriber interest table.
//!
//! The bus opens one catch-all subscriber per peer, so in the common case
//! every connected peer holds exactly the wildcard (empty prefix) and a
//! publication goes to all of them. Explicit prefixes — an application
//! narrowing a connection to a subset of event type names — are the rare
//! case. The table is shaped around that split: wildcard peers sit in a
//! flat list the publish path copies straight out, and explicit prefixes
//! live in a per-peer map so connection teardown is one removal, not a
//! scan of every prefix.
//!
//! Topics are UTF-8 event type names; an explicit prefix matches any
//! topic it starts (`b"Order"` matches `OrderShipped` and `OrderPaid`).

use bytes::Bytes;
use hashbrown::HashMap;
use smallvec::SmallVec;

/// Compact per-connection id used inside the table, allocated by the
/// publisher hub.
pub type PeerKey = u64;

#[derive(Debug, Default)]
pub struct SubscriptionTable {
    /// Peers holding the catch-all subscription.
    wildcard: SmallVec<[PeerKey; 8]>,
    /// Explicit name prefixes, keyed by peer.
    prefixed: HashMap<PeerKey, Vec<Bytes>>,
}

impl SubscriptionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wildcard.is_empty() && self.prefixed.is_empty()
    }

    /// Add `peer`'s subscription to `prefix`. The empty prefix is the
    /// wildcard. Idempotent per (peer, prefix).
    pub fn subscribe(&mut self, peer: PeerKey, prefix: Bytes) {
        if prefix.is_empty() {
            if !self.wildcard.contains(&peer) {
                self.wildcard.push(peer);
            }
            return;
        }
        let prefixes = self.prefixed.entry(peer).or_default();
        if !prefixes.contains(&prefix) {
            prefixes.push(prefix);
        }
    }

    /// Drop `peer`'s subscription to exactly `prefix`. Other prefixes the
    /// peer holds — the wildcard included — are untouched.
    pub fn unsubscribe(&mut self, peer: PeerKey, prefix: &[u8]) {
        if prefix.is_empty() {
            if let Some(pos) = self.wildcard.iter().position(|p| *p == peer) {
                self.wildcard.swap_remove(pos);
            }
            return;
        }
        let emptied = match self.prefixed.get_mut(&peer) {
            Some(prefixes) => {
                prefixes.retain(|p| p.as_ref() != prefix);
                prefixes.is_empty()
            }
            None => false,
        };
        if emptied {
            self.prefixed.remove(&peer);
        }
    }

    /// Forget `peer` entirely (connection teardown).
    pub fn remove_peer(&mut self, peer: PeerKey) {
        if let Some(pos) = self.wildcard.iter().position(|p| *p == peer) {
            self.wildcard.swap_remove(pos);
        }
        self.prefixed.remove(&peer);
    }

    /// Every peer whose subscription matches `topic`, each at most once.
    ///
    /// Wildcard peers match unconditionally; a prefixed peer matches when
    /// any of its prefixes starts the topic. A peer holding both is
    /// reported once.
    #[must_use]
    pub fn match_topic(&self, topic: &[u8]) -> SmallVec<[PeerKey; 16]> {
        let mut out: SmallVec<[PeerKey; 16]> = SmallVec::new();
        out.extend_from_slice(&self.wildcard);

        for (peer, prefixes) in &self.prefixed {
            if out.contains(peer) {
                // Already delivered through the wildcard list.
                continue;
            }
            if prefixes.iter().any(|prefix| topic.starts_with(prefix)) {
                out.push(*peer);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_all_peer_sees_every_topic() {
        let mut table = SubscriptionTable::new();
        table.subscribe(1, Bytes::new());

        assert_eq!(table.match_topic(b"OrderShipped").as_slice(), &[1]);
        assert_eq!(table.match_topic(b"InvoicePaid").as_slice(), &[1]);
        assert_eq!(table.match_topic(b"").as_slice(), &[1]);
    }

    #[test]
    fn explicit_prefix_narrows_a_connection() {
        let mut table = SubscriptionTable::new();
        table.subscribe(3, Bytes::from_static(b"Order"));

        assert_eq!(table.match_topic(b"OrderShipped").as_slice(), &[3]);
        assert_eq!(table.match_topic(b"OrderPaid").as_slice(), &[3]);
        assert!(table.match_topic(b"InvoicePaid").is_empty());
    }

    #[test]
    fn wildcard_plus_prefix_delivers_once() {
        let mut table = SubscriptionTable::new();
        table.subscribe(5, Bytes::new());
        table.subscribe(5, Bytes::from_static(b"Order"));

        assert_eq!(table.match_topic(b"OrderShipped").len(), 1);
    }

    #[test]
    fn unsubscribe_drops_only_the_named_prefix() {
        let mut table = SubscriptionTable::new();
        table.subscribe(2, Bytes::from_static(b"Order"));
        table.subscribe(2, Bytes::from_static(b"Invoice"));

        table.unsubscribe(2, b"Order");
        assert!(table.match_topic(b"OrderShipped").is_empty());
        assert_eq!(table.match_topic(b"InvoicePaid").as_slice(), &[2]);

        // Dropping a prefix never touches the wildcard.
        table.subscribe(2, Bytes::new());
        table.unsubscribe(2, b"Invoice");
        assert_eq!(table.match_topic(b"InvoicePaid").as_slice(), &[2]);
    }

    #[test]
    fn teardown_forgets_the_peer_in_one_call() {
        let mut table = SubscriptionTable::new();
        table.subscribe(1, Bytes::new());
        table.subscribe(2, Bytes::from_static(b"Order"));
        table.subscribe(2, Bytes::new());

        table.remove_peer(2);
        assert_eq!(table.match_topic(b"OrderShipped").as_slice(), &[1]);
        assert!(!table.is_empty());

        table.remove_peer(1);
        assert!(table.is_empty());
    }

    #[test]
    fn empty_table_matches_nothing() {
        let table = SubscriptionTable::new();
        assert!(table.is_empty());
        assert!(table.match_topic(b"OrderShipped").is_empty());
    }
}
