//! Command server: the node's request demultiplexer.
//!
//! Owns one scheduler thread for all router I/O plus a fixed pool of
//! handler workers. Requests come off the router, are validated, and jump
//! to the pool; workers run the registry thunk (with every failure mode
//! contained) and queue the response back through the router hub — the
//! hub task is the only writer of the router socket. The server itself
//! buffers nothing: backpressure lives in the socket queues and the OS.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use flume::Sender;
use tracing::{debug, warn};

use meshbus_wire::router::{bind, RouterSocket};
use meshbus_wire::PORT_PROBE_SPAN;

use crate::error::{MeshError, Result};
use crate::frames;
use crate::registry::HandlerRegistry;
use crate::scheduler::ActorScheduler;

const START_TIMEOUT: Duration = Duration::from_secs(10);

struct Job {
    identity: Bytes,
    topic: u64,
    correlation_id: u64,
    payload: Bytes,
}

pub struct CommandServer {
    scheduler: ActorScheduler,
    router: RouterSocket,
    workers: Vec<JoinHandle<()>>,
    job_tx: Option<Sender<Job>>,
    port: u16,
}

impl CommandServer {
    /// Bind the router by probing from `base_port` and start the handler
    /// pool. Failure to bind anywhere in the probe window is fatal.
    pub fn start(base_port: u16, registry: Arc<HandlerRegistry>) -> Result<Self> {
        let scheduler = ActorScheduler::start("server")?;

        let (startup_tx, startup_rx) = flume::bounded(1);
        let (inbound_tx, inbound_rx) = flume::unbounded::<Vec<Bytes>>();
        let (job_tx, job_rx) = flume::unbounded::<Job>();

        // Router hub: bind, report, then route until shutdown.
        scheduler.handle().execute(move |ctx| {
            let task = compio::runtime::spawn(async move {
                match bind(base_port, PORT_PROBE_SPAN, inbound_tx).await {
                    Ok((socket, hub, port)) => {
                        let _ = startup_tx.send(Ok((socket, port)));
                        hub.run().await;
                    }
                    Err(err) => {
                        let _ = startup_tx.send(Err(err));
                    }
                }
            });
            ctx.service_tasks.push(task);
        });

        let (router, port) = startup_rx
            .recv_timeout(START_TIMEOUT)
            .map_err(|_| MeshError::config("command server failed to report startup"))??;

        // Demux: validate inbound requests and hand them to the pool.
        let demux_jobs = job_tx.clone();
        scheduler.handle().execute(move |ctx| {
            let task = compio::runtime::spawn(async move {
                while let Ok(parts) = inbound_rx.recv_async().await {
                    match frames::parse_request(&parts) {
                        Ok(request) => {
                            let job = Job {
                                identity: request.identity,
                                topic: request.topic,
                                correlation_id: request.correlation_id,
                                payload: request.payload,
                            };
                            if demux_jobs.send(job).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%err, "malformed request dropped"),
                    }
                }
            });
            ctx.service_tasks.push(task);
        });

        // Handler pool: parallel execution off the I/O thread.
        let worker_count = num_cpus::get().max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let jobs = job_rx.clone();
            let registry = Arc::clone(&registry);
            let router = router.clone();
            let worker = std::thread::Builder::new()
                .name(format!("meshbus-handler-{index}"))
                .spawn(move || {
                    while let Ok(job) = jobs.recv() {
                        let reply = registry.handle_command(job.topic, &job.payload);
                        let parts = frames::response(
                            job.identity,
                            job.correlation_id,
                            Bytes::from(reply),
                        );
                        if router.send(parts).is_err() {
                            break;
                        }
                    }
                })
                .map_err(MeshError::Transport)?;
            workers.push(worker);
        }

        Ok(Self {
            scheduler,
            router,
            workers,
            job_tx: Some(job_tx),
            port,
        })
    }

    /// The resolved router port, written into the local context before any
    /// beacon goes out.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting, drain the pool, join everything. Idempotent.
    pub fn shutdown(&mut self) {
        if self.job_tx.take().is_none() {
            return;
        }
        self.router.close();
        self.scheduler.shutdown();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                debug!("handler worker panicked during shutdown");
            }
        }
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
