//! Event dispatch: one publisher per node, one subscriber per peer.
//!
//! Publishing serializes the event, takes the type's short name as the
//! topic, and schedules the two-frame send on the event scheduler, so all
//! publisher I/O stays on one thread and publication order is preserved.
//! Membership drives the inbound side: every peer — the self record
//! included — gets a wildcard subscriber connection, and inbound
//! `[topic][payload]` messages fan out through the handler registry on the
//! event thread.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flume::Sender;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{trace, warn};

use meshbus_wire::publisher::{bind as bind_publisher, PubSocket};
use meshbus_wire::subscriber::{run_subscriber, SubSocket};
use meshbus_wire::PORT_PROBE_SPAN;

use crate::context::MeshContext;
use crate::error::{MeshError, Result};
use crate::frames;
use crate::membership::{MembershipEvent, MembershipHub, SubscriptionId};
use crate::registry::{Event, HandlerRegistry};
use crate::scheduler::{ActorScheduler, SchedulerHandle};

const START_TIMEOUT: Duration = Duration::from_secs(10);

/// The publish side of the bus.
pub struct EventDispatcher {
    scheduler: SchedulerHandle,
    publisher: PubSocket,
}

impl EventDispatcher {
    /// Serialize `event` and schedule its fan-out. Fire-and-forget: a
    /// publish with zero subscribers is a no-op and never fails.
    pub fn publish<E: Event>(&self, event: &E) -> Result<()> {
        let payload = Bytes::from(rmp_serde::to_vec(event).map_err(MeshError::serialization)?);
        let parts = frames::event(E::name(), payload);
        let publisher = self.publisher.clone();
        self.scheduler.execute(move |_ctx| {
            if let Err(err) = publisher.publish(parts) {
                trace!(%err, "publish after shutdown dropped");
            }
        });
        Ok(())
    }
}

/// The event side of a node: scheduler thread, bound publisher, inbound
/// demux, and the per-peer subscriber set.
pub(crate) struct EventHost {
    scheduler: ActorScheduler,
    publisher: PubSocket,
    manager: Arc<SubscriberManager>,
    port: u16,
}

impl EventHost {
    /// Bind the publisher by probing from `base_port` and start the
    /// inbound demux.
    pub(crate) fn start(base_port: u16, registry: Arc<HandlerRegistry>) -> Result<Self> {
        let scheduler = ActorScheduler::start("events")?;

        let (publisher, pub_cmd_rx) = PubSocket::pair();
        let (startup_tx, startup_rx) = flume::bounded(1);
        scheduler.handle().execute(move |ctx| {
            let task = compio::runtime::spawn(async move {
                match bind_publisher(base_port, PORT_PROBE_SPAN, pub_cmd_rx).await {
                    Ok((hub, port)) => {
                        let _ = startup_tx.send(Ok(port));
                        hub.run().await;
                    }
                    Err(err) => {
                        let _ = startup_tx.send(Err(err));
                    }
                }
            });
            ctx.service_tasks.push(task);
        });
        let port = startup_rx
            .recv_timeout(START_TIMEOUT)
            .map_err(|_| MeshError::config("event publisher failed to report startup"))??;

        // Inbound demux: every subscriber connection delivers here; the
        // handler thunks run on this thread.
        let (inbound_tx, inbound_rx) = flume::unbounded::<Vec<Bytes>>();
        scheduler.handle().execute(move |ctx| {
            let task = compio::runtime::spawn(async move {
                while let Ok(parts) = inbound_rx.recv_async().await {
                    match frames::parse_event(&parts) {
                        Ok((topic, payload)) => registry.handle_event(&topic, &payload),
                        Err(err) => warn!(%err, "malformed event dropped"),
                    }
                }
            });
            ctx.service_tasks.push(task);
        });

        let manager = Arc::new(SubscriberManager {
            scheduler: scheduler.handle(),
            inbound_tx,
            sockets: RwLock::new(HashMap::new()),
        });

        Ok(Self {
            scheduler,
            publisher,
            manager,
            port,
        })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn dispatcher(&self) -> EventDispatcher {
        EventDispatcher {
            scheduler: self.scheduler.handle(),
            publisher: self.publisher.clone(),
        }
    }

    pub(crate) fn attach(&self, hub: &Arc<MembershipHub>) -> SubscriptionId {
        self.manager.attach(hub)
    }

    pub(crate) fn shutdown(&mut self) {
        self.publisher.close();
        self.scheduler.shutdown();
    }
}

/// Opens one wildcard subscriber per known peer.
struct SubscriberManager {
    scheduler: SchedulerHandle,
    inbound_tx: Sender<Vec<Bytes>>,
    sockets: RwLock<HashMap<u64, SubSocket>>,
}

impl SubscriberManager {
    fn attach(self: &Arc<Self>, hub: &Arc<MembershipHub>) -> SubscriptionId {
        let manager = Arc::clone(self);
        hub.subscribe(move |event| match event {
            MembershipEvent::Joined(ctx) => manager.on_joined(ctx),
            MembershipEvent::Removed(ctx) => manager.on_removed(ctx),
            MembershipEvent::SocketCreated { .. } | MembershipEvent::SocketClosed { .. } => {}
        })
    }

    fn on_joined(&self, peer: &MeshContext) {
        let mesh_id = peer.mesh_id;
        if self.sockets.read().contains_key(&mesh_id) {
            return;
        }

        let (socket, cmd_rx) = SubSocket::pair();
        self.sockets.write().insert(mesh_id, socket.clone());

        let addr = peer.pub_endpoint();
        let inbound = self.inbound_tx.clone();
        self.scheduler.execute(move |ctx| {
            let task = compio::runtime::spawn(async move {
                // Wildcard subscription: one empty prefix.
                let prefixes = vec![Bytes::new()];
                if let Err(err) = run_subscriber(&addr, socket, cmd_rx, prefixes, inbound).await {
                    warn!(%err, addr, "subscriber connection failed");
                }
            });
            ctx.socket_tasks.insert(mesh_id, task);
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
    }
}
