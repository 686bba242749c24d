//! Per-scope actor scheduler.
//!
//! One dedicated worker thread per scope, running a single-threaded compio
//! runtime. Two queues feed it: `Action` closures (socket lifecycle, any
//! touch of scope-owned I/O state) and [`ScheduleCommand`] records (the
//! scatter hot path). The worker drains both FIFO per queue; ordering
//! across the queues is unspecified. Socket actors are tasks on the same
//! runtime, so every send, connect and teardown for a scope's sockets
//! happens on its one thread. Submission never blocks.

use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use compio::runtime::Task;
use flume::{Receiver, Sender};
use hashbrown::HashMap;
use tracing::{debug, trace};

use meshbus_wire::dealer::DealerSocket;

use crate::error::{MeshError, Result};
use crate::frames;

const START_TIMEOUT: Duration = Duration::from_secs(10);

/// One queued command send: the socket to use, the wire header fields and
/// the shared serialized payload.
pub struct ScheduleCommand {
    pub socket: DealerSocket,
    pub topic: u64,
    pub correlation_id: u64,
    pub payload: Bytes,
}

/// Scope-owned state living on the worker thread. Actions get exclusive
/// access; nothing here is reachable from outside the thread.
#[derive(Default)]
pub struct SchedulerCtx {
    /// Connection task per peer, keyed by mesh id. Dropping a task tears
    /// the connection down.
    pub socket_tasks: HashMap<u64, Task<()>>,
    /// Long-lived tasks (hubs, inbound routers) pinned to this thread.
    pub service_tasks: Vec<Task<()>>,
    stopping: bool,
}

impl SchedulerCtx {
    /// Request worker shutdown after the current action returns.
    pub fn stop(&mut self) {
        self.stopping = true;
    }
}

type Action = Box<dyn FnOnce(&mut SchedulerCtx) + Send>;

/// Cloneable submission side of a scheduler. Sends are fire-and-forget:
/// after shutdown they are silently ignored.
#[derive(Clone)]
pub struct SchedulerHandle {
    action_tx: Sender<Action>,
    command_tx: Sender<ScheduleCommand>,
}

impl SchedulerHandle {
    /// Run a closure on the worker thread, inside the runtime context
    /// (so it may spawn tasks).
    pub fn execute<F>(&self, action: F)
    where
        F: FnOnce(&mut SchedulerCtx) + Send + 'static,
    {
        let _ = self.action_tx.send(Box::new(action));
    }

    /// Queue a command send.
    pub fn submit(&self, command: ScheduleCommand) {
        let _ = self.command_tx.send(command);
    }
}

/// A scope's worker thread plus its submission queues.
pub struct ActorScheduler {
    handle: SchedulerHandle,
    thread: Option<JoinHandle<()>>,
}

impl ActorScheduler {
    /// Spawn the worker. Fails if the thread or its runtime cannot start.
    pub fn start(name: &str) -> Result<Self> {
        let (action_tx, action_rx) = flume::unbounded::<Action>();
        let (command_tx, command_rx) = flume::unbounded::<ScheduleCommand>();
        let (ready_tx, ready_rx) = flume::bounded::<std::io::Result<()>>(1);

        let thread = std::thread::Builder::new()
            .name(format!("meshbus-{name}"))
            .spawn(move || {
                let runtime = match compio::runtime::Runtime::new() {
                    Ok(runtime) => {
                        let _ = ready_tx.send(Ok(()));
                        runtime
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                runtime.block_on(worker(action_rx, command_rx));
            })
            .map_err(MeshError::Transport)?;

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                handle: SchedulerHandle {
                    action_tx,
                    command_tx,
                },
                thread: Some(thread),
            }),
            Ok(Err(err)) => Err(MeshError::Transport(err)),
            Err(_) => Err(MeshError::config(format!(
                "scheduler {name} failed to report startup"
            ))),
        }
    }

    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stop the worker and join its thread. Sockets are closed in
    /// owner-thread context before the thread exits. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.execute(SchedulerCtx::stop);
            if thread.join().is_err() {
                debug!("scheduler thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ActorScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn worker(action_rx: Receiver<Action>, command_rx: Receiver<ScheduleCommand>) {
    use futures::FutureExt;

    let mut ctx = SchedulerCtx::default();

    loop {
        futures::select! {
            action = action_rx.recv_async().fuse() => match action {
                Ok(action) => {
                    action(&mut ctx);
                    if ctx.stopping {
                        break;
                    }
                }
                Err(_) => break,
            },
            command = command_rx.recv_async().fuse() => match command {
                Ok(command) => dispatch(&command),
                Err(_) => break,
            },
        }
    }

    // Drain sends already queued, then tear the sockets down in-thread.
    while let Ok(command) = command_rx.try_recv() {
        dispatch(&command);
    }
    ctx.socket_tasks.clear();
    ctx.service_tasks.clear();
}

fn dispatch(command: &ScheduleCommand) {
    let parts = frames::request(command.topic, command.correlation_id, command.payload.clone());
    if let Err(err) = command.socket.send_multipart(&parts) {
        trace!(%err, "command for closed socket dropped");
    }
}
