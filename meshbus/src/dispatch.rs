//! Command scopes: the scatter/gather client API.
//!
//! All four scopes share one algorithm; only the socket set differs.
//! Scatter is synchronous — snapshot, serialize once, register awaiters,
//! queue the sends — and the caller then suspends only on the awaiters.
//! Gather yields replies in submission order (the snapshot order), never
//! arrival order, and recycles each awaiter before touching the next.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use tracing::{trace, warn};

use crate::error::Result;
use crate::manager::SocketManager;
use crate::pending::{Fault, FaultHandle, ReplyPool, ReplyRouter, ReplyTicket};
use crate::registry::Command;
use crate::scheduler::{ScheduleCommand, SchedulerHandle};
use crate::timer::{CancelToken, CancelWatch, TimerHandle};
use crate::topic::topic_hash;

/// The four scoped dispatchers of a node.
pub struct CommandDispatcher {
    local: CommandScope,
    machine: CommandScope,
    cluster: CommandScope,
    network: CommandScope,
}

impl CommandDispatcher {
    pub(crate) fn new(
        local: CommandScope,
        machine: CommandScope,
        cluster: CommandScope,
        network: CommandScope,
    ) -> Self {
        Self {
            local,
            machine,
            cluster,
            network,
        }
    }

    /// This node only.
    #[must_use]
    pub fn local(&self) -> &CommandScope {
        &self.local
    }

    /// Every node on this workstation.
    #[must_use]
    pub fn machine(&self) -> &CommandScope {
        &self.machine
    }

    /// Every node sharing this node's cluster name.
    #[must_use]
    pub fn cluster(&self) -> &CommandScope {
        &self.cluster
    }

    /// Every known node.
    #[must_use]
    pub fn network(&self) -> &CommandScope {
        &self.network
    }
}

/// One scope's scatter/gather client.
pub struct CommandScope {
    manager: Arc<SocketManager>,
    scheduler: SchedulerHandle,
    pool: Arc<ReplyPool>,
    replies: Arc<ReplyRouter>,
    timer: TimerHandle,
}

impl CommandScope {
    pub(crate) fn new(
        manager: Arc<SocketManager>,
        scheduler: SchedulerHandle,
        pool: Arc<ReplyPool>,
        replies: Arc<ReplyRouter>,
        timer: TimerHandle,
    ) -> Self {
        Self {
            manager,
            scheduler,
            pool,
            replies,
            timer,
        }
    }

    /// Number of peers currently in scope.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.manager.count()
    }

    /// Scatter `command` to every peer in scope and stream the replies
    /// back in scatter order. Peers that miss the deadline are skipped, so
    /// a fully timed-out call yields an empty stream.
    pub fn stream<C: Command>(
        &self,
        command: &C,
        timeout: Duration,
    ) -> Result<CommandStream<C::Reply>> {
        self.stream_with_cancel(command, timeout, None)
    }

    /// [`Self::stream`] with an external cancellation token.
    pub fn stream_with_cancel<C: Command>(
        &self,
        command: &C,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<CommandStream<C::Reply>> {
        let (tickets, cancel_watch) = self.scatter::<C>(command, timeout, cancel)?;
        Ok(CommandStream {
            tickets: tickets.into(),
            replies: Arc::clone(&self.replies),
            pool: Arc::clone(&self.pool),
            cancel_watch,
            _reply: PhantomData,
        })
    }

    /// Scatter a void command and resolve once every peer in scope
    /// acknowledged. Missing acknowledgements surface as
    /// [`MeshError::TimedOut`] / [`MeshError::Cancelled`].
    ///
    /// [`MeshError::TimedOut`]: crate::error::MeshError::TimedOut
    /// [`MeshError::Cancelled`]: crate::error::MeshError::Cancelled
    pub async fn send<C: Command>(&self, command: &C, timeout: Duration) -> Result<()> {
        self.send_with_cancel(command, timeout, None).await
    }

    /// [`Self::send`] with an external cancellation token.
    pub async fn send_with_cancel<C: Command>(
        &self,
        command: &C,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let (tickets, cancel_watch) = self.scatter::<C>(command, timeout, cancel)?;

        let mut failure: Option<Fault> = None;
        for ticket in &tickets {
            match ticket.wait().await {
                Ok(_ack) => {}
                Err(Fault::Cancelled) => failure = Some(Fault::Cancelled),
                Err(Fault::TimedOut) => {
                    failure = Some(match failure {
                        Some(Fault::Cancelled) => Fault::Cancelled,
                        _ => Fault::TimedOut,
                    });
                }
            }
            self.replies.try_unregister(ticket.correlation_id());
        }
        for ticket in tickets {
            self.pool.give_back(ticket);
        }
        // Batch resolved: release the token registration.
        drop(cancel_watch);

        match failure {
            None => Ok(()),
            Some(fault) => Err(fault.into()),
        }
    }

    /// The shared scatter step: serialize once, then per socket rent,
    /// register and queue — submission order defines gather order.
    fn scatter<C: Command>(
        &self,
        command: &C,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<(Vec<ReplyTicket>, Option<CancelWatch>)> {
        let sockets = self.manager.all();
        if sockets.is_empty() {
            return Ok((Vec::new(), None));
        }

        let payload = Bytes::from(
            rmp_serde::to_vec(command).map_err(crate::error::MeshError::serialization)?,
        );
        let topic = topic_hash(C::name());

        let mut tickets = Vec::with_capacity(sockets.len());
        for _ in 0..sockets.len() {
            let ticket = self.pool.rent();
            self.replies.register(&ticket);
            tickets.push(ticket);
        }

        let handles: Vec<FaultHandle> = tickets.iter().map(ReplyTicket::fault_handle).collect();
        if timeout.is_zero() {
            // A zero deadline must win against any reply, so fault before
            // the first send can even leave.
            for handle in &handles {
                handle.fire(Fault::TimedOut);
            }
        } else if let Some(deadline) = Instant::now().checked_add(timeout) {
            self.timer.arm(deadline, Fault::TimedOut, handles.clone());
        }
        let cancel_watch = cancel.and_then(|token| token.watch(&handles));

        for (socket, ticket) in sockets.into_iter().zip(&tickets) {
            self.scheduler.submit(ScheduleCommand {
                socket,
                topic,
                correlation_id: ticket.correlation_id(),
                payload: payload.clone(),
            });
        }

        Ok((tickets, cancel_watch))
    }
}

/// Gathered replies of one scatter, in submission order.
///
/// Each awaiter is unregistered and returned to the pool as it resolves;
/// dropping the stream early recycles the rest.
pub struct CommandStream<R> {
    tickets: VecDeque<ReplyTicket>,
    replies: Arc<ReplyRouter>,
    pool: Arc<ReplyPool>,
    /// Keeps the batch registered with its cancel token while replies are
    /// outstanding; released on exhaustion or drop.
    cancel_watch: Option<CancelWatch>,
    _reply: PhantomData<fn() -> R>,
}

impl<R> CommandStream<R> {
    /// Replies still outstanding.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.tickets.len()
    }
}

impl<R: DeserializeOwned + Default> Stream for CommandStream<R> {
    type Item = R;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(front) = this.tickets.front() else {
                // Batch resolved: release the token registration.
                this.cancel_watch = None;
                return Poll::Ready(None);
            };
            match front.poll_ready(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(outcome) => {
                    let ticket = this.tickets.pop_front().expect("front exists");
                    this.replies.try_unregister(ticket.correlation_id());
                    let item = match outcome {
                        Ok(payload) => decode::<R>(&payload),
                        Err(fault) => {
                            trace!(?fault, "awaiter faulted; skipping");
                            None
                        }
                    };
                    this.pool.give_back(ticket);
                    if let Some(item) = item {
                        return Poll::Ready(Some(item));
                    }
                }
            }
        }
    }
}

impl<R> Drop for CommandStream<R> {
    fn drop(&mut self) {
        for ticket in self.tickets.drain(..) {
            self.replies.try_unregister(ticket.correlation_id());
            self.pool.give_back(ticket);
        }
    }
}

/// Empty payloads decode to the default value: that is both the void-reply
/// and the no-handler path.
fn decode<R: DeserializeOwned + Default>(payload: &Bytes) -> Option<R> {
    if payload.is_empty() {
        return Some(R::default());
    }
    match rmp_serde::from_slice(payload) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(%err, "undecodable reply skipped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::CorrelationGenerator;
    use futures::StreamExt;

    fn fixtures() -> (Arc<ReplyPool>, Arc<ReplyRouter>) {
        (
            Arc::new(ReplyPool::new(16, Arc::new(CorrelationGenerator::new()))),
            Arc::new(ReplyRouter::new()),
        )
    }

    fn stream_of(
        pool: &Arc<ReplyPool>,
        replies: &Arc<ReplyRouter>,
        count: usize,
    ) -> (CommandStream<String>, Vec<u64>) {
        let mut tickets = VecDeque::new();
        let mut ids = Vec::new();
        for _ in 0..count {
            let ticket = pool.rent();
            replies.register(&ticket);
            ids.push(ticket.correlation_id());
            tickets.push_back(ticket);
        }
        (
            CommandStream {
                tickets,
                replies: Arc::clone(replies),
                pool: Arc::clone(pool),
                cancel_watch: None,
                _reply: PhantomData,
            },
            ids,
        )
    }

    fn encoded(value: &str) -> Bytes {
        Bytes::from(rmp_serde::to_vec(&value).expect("encode"))
    }

    #[test]
    fn yields_in_submission_order_not_arrival_order() {
        let (pool, replies) = fixtures();
        let (stream, ids) = stream_of(&pool, &replies, 3);

        // Complete in reverse arrival order.
        assert!(replies.on_message(ids[2], encoded("third")));
        assert!(replies.on_message(ids[0], encoded("first")));
        assert!(replies.on_message(ids[1], encoded("second")));

        let got: Vec<String> = futures::executor::block_on(stream.collect());
        assert_eq!(got, vec!["first", "second", "third"]);
    }

    #[test]
    fn faulted_awaiters_are_skipped() {
        let (pool, replies) = fixtures();
        let (stream, ids) = stream_of(&pool, &replies, 3);

        assert!(replies.on_message(ids[0], encoded("kept")));
        // Middle peer times out.
        replies.try_unregister(ids[1]);
        let faulted = stream.tickets[1].fault_handle();
        faulted.fire(Fault::TimedOut);
        assert!(replies.on_message(ids[2], encoded("also-kept")));

        let got: Vec<String> = futures::executor::block_on(stream.collect());
        assert_eq!(got, vec!["kept", "also-kept"]);
    }

    #[test]
    fn empty_stream_terminates_immediately() {
        let (pool, replies) = fixtures();
        let (stream, _ids) = stream_of(&pool, &replies, 0);
        let got: Vec<String> = futures::executor::block_on(stream.collect());
        assert!(got.is_empty());
    }

    #[test]
    fn empty_payload_decodes_to_default() {
        let (pool, replies) = fixtures();
        let (stream, ids) = stream_of(&pool, &replies, 1);
        assert!(replies.on_message(ids[0], Bytes::new()));

        let got: Vec<String> = futures::executor::block_on(stream.collect());
        assert_eq!(got, vec![String::new()]);
    }

    #[test]
    fn dropping_a_stream_recycles_its_awaiters() {
        let (pool, replies) = fixtures();
        let (stream, ids) = stream_of(&pool, &replies, 2);
        assert_eq!(replies.len(), 2);

        drop(stream);
        assert!(replies.is_empty());
        // Late replies find nothing to complete.
        assert!(!replies.on_message(ids[0], encoded("late")));
    }
}
