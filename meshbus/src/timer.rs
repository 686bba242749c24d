//! Deadline timing and cancellation for scatter batches.
//!
//! One timer thread serves the whole node: scatter calls arm it with a
//! deadline and the batch's fault handles; when the deadline passes, every
//! still-outstanding awaiter in the batch is faulted. Firing is idempotent
//! per awaiter — the generation stamp inside [`FaultHandle`] rejects
//! anything stale, so a timer firing after the caller finished (or after
//! the slot was recycled) is a no-op.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::pending::{Fault, FaultHandle};

enum TimerMsg {
    Arm {
        deadline: Instant,
        fault: Fault,
        handles: Vec<FaultHandle>,
    },
    Stop,
}

struct Entry {
    deadline: Instant,
    fault: Fault,
    handles: Vec<FaultHandle>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// Cloneable handle for arming the timer.
#[derive(Clone)]
pub struct TimerHandle {
    tx: Sender<TimerMsg>,
}

impl TimerHandle {
    /// Fault every handle in `handles` with `fault` once `deadline` passes.
    pub fn arm(&self, deadline: Instant, fault: Fault, handles: Vec<FaultHandle>) {
        if handles.is_empty() {
            return;
        }
        let _ = self.tx.send(TimerMsg::Arm {
            deadline,
            fault,
            handles,
        });
    }
}

/// The node-wide deadline thread.
pub struct DeadlineTimer {
    handle: TimerHandle,
    thread: Option<JoinHandle<()>>,
}

impl DeadlineTimer {
    pub fn start() -> std::io::Result<Self> {
        let (tx, rx) = flume::unbounded();
        let thread = std::thread::Builder::new()
            .name("meshbus-timer".to_owned())
            .spawn(move || run(&rx))?;
        Ok(Self {
            handle: TimerHandle { tx },
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.tx.send(TimerMsg::Stop);
            if thread.join().is_err() {
                debug!("timer thread panicked during shutdown");
            }
        }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(rx: &Receiver<TimerMsg>) {
    let mut queue: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();

    loop {
        // Fire everything already due.
        let now = Instant::now();
        while queue.peek().is_some_and(|Reverse(e)| e.deadline <= now) {
            let Reverse(entry) = queue.pop().expect("peeked");
            for handle in &entry.handles {
                handle.fire(entry.fault);
            }
        }

        let message = match queue.peek() {
            Some(Reverse(next)) => {
                let wait = next.deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(msg) => msg,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            },
        };

        match message {
            TimerMsg::Arm {
                deadline,
                fault,
                handles,
            } => queue.push(Reverse(Entry {
                deadline,
                fault,
                handles,
            })),
            TimerMsg::Stop => break,
        }
    }
}

/// Caller-owned cancellation.
///
/// Scatter calls register their batch with the token; `cancel()` faults
/// every still-outstanding awaiter with [`Fault::Cancelled`]. Batches
/// registered after cancellation fault immediately. A batch that resolves
/// without the token firing deregisters itself through its
/// [`CancelWatch`] guard, so a long-lived token shared across many calls
/// never accumulates resolved batches.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    fired: AtomicBool,
    next_batch: AtomicU64,
    watchers: Mutex<HashMap<u64, Vec<FaultHandle>>>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Fire the token: every watched awaiter faults with `Cancelled`.
    /// Idempotent.
    pub fn cancel(&self) {
        self.inner.fired.store(true, Ordering::Release);
        let watchers = std::mem::take(&mut *self.inner.watchers.lock());
        for (_, handles) in watchers {
            for handle in handles {
                handle.fire(Fault::Cancelled);
            }
        }
    }

    /// Watch one scatter batch. Returns the guard that deregisters the
    /// batch when its call resolves, or `None` when the token already
    /// fired (the batch was faulted on the spot).
    #[must_use = "dropping the watch deregisters the batch"]
    pub(crate) fn watch(&self, handles: &[FaultHandle]) -> Option<CancelWatch> {
        let mut watchers = self.inner.watchers.lock();
        // Deciding under the lock closes the race with a concurrent cancel.
        if self.inner.fired.load(Ordering::Acquire) {
            drop(watchers);
            for handle in handles {
                handle.fire(Fault::Cancelled);
            }
            return None;
        }
        let batch = self.inner.next_batch.fetch_add(1, Ordering::Relaxed);
        watchers.insert(batch, handles.to_vec());
        Some(CancelWatch {
            token: Arc::downgrade(&self.inner),
            batch,
        })
    }
}

/// Removes its batch from the token's watcher table on drop. Held by the
/// gather side for as long as the batch is outstanding.
pub(crate) struct CancelWatch {
    token: Weak<CancelInner>,
    batch: u64,
}

impl Drop for CancelWatch {
    fn drop(&mut self) {
        if let Some(inner) = self.token.upgrade() {
            inner.watchers.lock().remove(&self.batch);
        }
    }
}
