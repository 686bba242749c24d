//! Pending replies: pooled awaiters matched to responses by correlation id.
//!
//! A [`PendingReply`] is a reusable one-shot slot. Renting it from the
//! [`ReplyPool`] bumps its generation and clears its state; completions and
//! faults carry the generation they were issued for, so anything stale —
//! a reply straggling in after cancellation, a timer firing after reuse —
//! is rejected instead of corrupting the next request. A slot accepts
//! exactly one outcome per generation.
//!
//! The [`ReplyRouter`] owns liveness while a reply is in flight: inbound
//! dealer traffic resolves correlation ids through it, and ids it does not
//! know are dropped (their awaiter was already cancelled or satisfied).

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::MeshError;
use crate::topic::CorrelationGenerator;

/// Why an awaiter was released without a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    TimedOut,
    Cancelled,
}

impl From<Fault> for MeshError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::TimedOut => Self::TimedOut,
            Fault::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug)]
struct ReplyState {
    generation: u64,
    outcome: Option<Result<Bytes, Fault>>,
    waker: Option<Waker>,
}

/// A reusable awaiter slot. Always handled through `Arc`.
#[derive(Debug)]
pub struct PendingReply {
    state: Mutex<ReplyState>,
}

impl PendingReply {
    fn new() -> Self {
        Self {
            state: Mutex::new(ReplyState {
                generation: 0,
                outcome: None,
                waker: None,
            }),
        }
    }

    /// Deliver a payload for `generation`. Returns false when the slot has
    /// moved on (stale generation) or already holds an outcome.
    pub fn complete(&self, generation: u64, payload: Bytes) -> bool {
        self.resolve(generation, Ok(payload))
    }

    /// Fault the awaiter for `generation`. Same staleness rules as
    /// [`Self::complete`]; the first outcome wins.
    pub fn fault(&self, generation: u64, fault: Fault) -> bool {
        self.resolve(generation, Err(fault))
    }

    fn resolve(&self, generation: u64, outcome: Result<Bytes, Fault>) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        true
    }

    fn poll_ready(&self, generation: u64, cx: &mut Context<'_>) -> Poll<Result<Bytes, Fault>> {
        let mut state = self.state.lock();
        if state.generation != generation {
            // The slot was recycled under us; treat as cancellation.
            return Poll::Ready(Err(Fault::Cancelled));
        }
        match &state.outcome {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// One rented generation of a [`PendingReply`], bound to a correlation id.
#[derive(Debug)]
pub struct ReplyTicket {
    reply: Arc<PendingReply>,
    generation: u64,
    correlation_id: u64,
}

impl ReplyTicket {
    #[must_use]
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// A weak handle the timer and cancel tokens can fire without keeping
    /// the slot alive.
    #[must_use]
    pub fn fault_handle(&self) -> FaultHandle {
        FaultHandle {
            reply: Arc::downgrade(&self.reply),
            generation: self.generation,
        }
    }

    pub fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<Bytes, Fault>> {
        self.reply.poll_ready(self.generation, cx)
    }

    /// Await this ticket's outcome.
    #[must_use]
    pub fn wait(&self) -> ReplyWait<'_> {
        ReplyWait { ticket: self }
    }

    fn registered(&self) -> Registered {
        Registered {
            reply: Arc::clone(&self.reply),
            generation: self.generation,
        }
    }
}

/// Future resolving to a ticket's outcome.
#[derive(Debug)]
pub struct ReplyWait<'a> {
    ticket: &'a ReplyTicket,
}

impl Future for ReplyWait<'_> {
    type Output = Result<Bytes, Fault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.ticket.poll_ready(cx)
    }
}

/// Weak, generation-stamped faulting handle.
#[derive(Debug, Clone)]
pub struct FaultHandle {
    reply: Weak<PendingReply>,
    generation: u64,
}

impl FaultHandle {
    /// Fault the awaiter if it is still on this handle's generation.
    pub fn fire(&self, fault: Fault) {
        if let Some(reply) = self.reply.upgrade() {
            reply.fault(self.generation, fault);
        }
    }
}

/// Elastic pool of reply slots.
///
/// Grows on demand; slots returned beyond `ceiling` are dropped rather
/// than retained. Correlation ids come from the node-wide generator so
/// they stay unique across scopes.
pub struct ReplyPool {
    free: Mutex<Vec<Arc<PendingReply>>>,
    ceiling: usize,
    ids: Arc<CorrelationGenerator>,
}

impl ReplyPool {
    #[must_use]
    pub fn new(ceiling: usize, ids: Arc<CorrelationGenerator>) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            ceiling,
            ids,
        }
    }

    /// Rent a slot: fresh generation, fresh correlation id, cleared state.
    #[must_use]
    pub fn rent(&self) -> ReplyTicket {
        let reply = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(PendingReply::new()));

        let correlation_id = self.ids.next_id();
        let generation = {
            let mut state = reply.state.lock();
            state.generation += 1;
            state.outcome = None;
            state.waker = None;
            state.generation
        };

        ReplyTicket {
            reply,
            generation,
            correlation_id,
        }
    }

    /// Return a slot. Callers must have unregistered it first.
    pub fn give_back(&self, ticket: ReplyTicket) {
        let mut free = self.free.lock();
        if free.len() < self.ceiling {
            free.push(ticket.reply);
        }
        // Beyond the ceiling the slot is simply dropped.
    }
}

#[derive(Debug)]
struct Registered {
    reply: Arc<PendingReply>,
    generation: u64,
}

/// Correlation id → in-flight awaiter.
#[derive(Debug, Default)]
pub struct ReplyRouter {
    inflight: DashMap<u64, Registered>,
}

impl ReplyRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a rented ticket. Ids are monotonic, so collisions indicate a
    /// caller bug.
    pub fn register(&self, ticket: &ReplyTicket) {
        let previous = self
            .inflight
            .insert(ticket.correlation_id(), ticket.registered());
        debug_assert!(previous.is_none(), "correlation id reused while live");
    }

    /// Stop tracking without resolving (cleanup after cancellation).
    pub fn try_unregister(&self, correlation_id: u64) -> bool {
        self.inflight.remove(&correlation_id).is_some()
    }

    /// Resolve an inbound reply. Unknown ids — late replies for cancelled
    /// awaiters, or duplicate replies — are dropped.
    pub fn on_message(&self, correlation_id: u64, payload: Bytes) -> bool {
        match self.inflight.remove(&correlation_id) {
            Some((_, registered)) => registered.reply.complete(registered.generation, payload),
            None => {
                trace!(correlation_id, "reply for unknown correlation id dropped");
                false
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}
