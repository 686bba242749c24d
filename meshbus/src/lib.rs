//! # Meshbus
//!
//! An in-process message bus for service meshes on a trusted LAN. Every
//! process embedding a [`MeshBus`] becomes a mesh node that:
//!
//! - advertises itself over UDP beacons and discovers peers,
//! - dispatches typed **commands** request/reply across four scopes
//!   (Local, Machine, Cluster, Network) with scatter/gather semantics,
//! - distributes fire-and-forget **events** publish/subscribe.
//!
//! ## Architecture
//!
//! - **`meshbus-wire`**: framed multipart TCP sockets (dealer/router/
//!   pub/sub) and UDP beacons
//! - **`meshbus`**: the messaging runtime and public API (this crate)
//!
//! Each of the seven owner threads (four scopes, event publisher, command
//! server, discovery) runs its sockets on a single-threaded runtime;
//! cross-thread submission is queue-based and never blocks.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use futures::StreamExt;
//! use meshbus::{Command, HandlerRegistry, MeshBus, MeshOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping {
//!     msg: String,
//! }
//!
//! impl Command for Ping {
//!     type Reply = String;
//! }
//!
//! # fn main() -> meshbus::Result<()> {
//! let mut registry = HandlerRegistry::new();
//! registry.on_command::<Ping, _>(|ping| format!("pong-{}", ping.msg));
//!
//! let bus = MeshBus::start(MeshOptions::default(), registry)?;
//!
//! let replies = bus
//!     .commands()
//!     .local()
//!     .stream(&Ping { msg: "hi".into() }, Duration::from_secs(1))?;
//! let replies: Vec<String> = futures::executor::block_on(replies.collect());
//! assert_eq!(replies, vec!["pong-hi".to_owned()]);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod context;
pub mod dev_tracing;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod frames;
pub mod manager;
pub mod membership;
pub mod pending;
pub mod registry;
pub mod repository;
pub mod scheduler;
pub mod server;
pub mod timer;
pub mod topic;

use std::sync::Arc;

pub use bytes::Bytes;
pub use config::{ClusterOptions, MeshOptions};
pub use context::MeshContext;
pub use dispatch::{CommandDispatcher, CommandScope, CommandStream};
pub use error::{MeshError, Result};
pub use events::EventDispatcher;
pub use membership::{MembershipEvent, MembershipHub};
pub use registry::{Command, Event, HandlerRegistry};
pub use timer::CancelToken;

use context::workstation_name;
use discovery::Discovery;
use events::EventHost;
use manager::{ScopeFilter, ScopeKind, SocketManager};
use membership::SubscriptionId;
use pending::{ReplyPool, ReplyRouter};
use repository::MeshRepository;
use scheduler::ActorScheduler;
use server::CommandServer;
use timer::{DeadlineTimer, TimerHandle};
use topic::CorrelationGenerator;

struct ScopeRuntime {
    scheduler: ActorScheduler,
    subscription: SubscriptionId,
}

/// A running mesh node.
///
/// Startup sequence: command server and event publisher bind (resolving
/// their ports), the local context is built, the scope runtimes subscribe
/// to membership, the self record is seeded, and only then does discovery
/// start advertising. Dropping the bus (or calling [`MeshBus::shutdown`])
/// tears everything down in reverse.
pub struct MeshBus {
    dispatcher: CommandDispatcher,
    events: EventDispatcher,
    context: MeshContext,
    repository: Arc<MeshRepository>,
    hub: Arc<MembershipHub>,
    scopes: Vec<ScopeRuntime>,
    subscriptions: Vec<SubscriptionId>,
    discovery: Option<Discovery>,
    event_host: Option<EventHost>,
    server: Option<CommandServer>,
    timer: Option<DeadlineTimer>,
}

impl MeshBus {
    /// Start a node with the given options and (from here on immutable)
    /// handler registry.
    pub fn start(options: MeshOptions, registry: HandlerRegistry) -> Result<Self> {
        let registry = Arc::new(registry);

        let timer = DeadlineTimer::start().map_err(MeshError::Transport)?;
        let server = CommandServer::start(options.rpc_port, Arc::clone(&registry))?;
        let event_host = EventHost::start(options.publish_port, Arc::clone(&registry))?;

        let context = MeshContext::local(&options, server.port(), event_host.port());
        let hub = Arc::new(MembershipHub::new());
        let repository = Arc::new(MeshRepository::new());
        let correlation_ids = Arc::new(CorrelationGenerator::new());

        let mut scopes = Vec::with_capacity(4);
        let mut build = |kind: ScopeKind| -> Result<CommandScope> {
            let (runtime, scope) =
                build_scope(kind, &options, &hub, &timer.handle(), &correlation_ids)?;
            scopes.push(runtime);
            Ok(scope)
        };
        let local = build(ScopeKind::Local)?;
        let machine = build(ScopeKind::Machine)?;
        let cluster = build(ScopeKind::Cluster)?;
        let network = build(ScopeKind::Network)?;
        let dispatcher = CommandDispatcher::new(local, machine, cluster, network);

        let mut subscriptions = vec![event_host.attach(&hub)];
        subscriptions.extend(scopes.iter().map(|scope| scope.subscription));

        // Seed the self record; managers react as for any other peer.
        repository.upsert(context.clone());
        hub.publish(&MembershipEvent::Joined(context.clone()));

        let discovery = Discovery::start(
            &options,
            &context,
            Arc::clone(&repository),
            Arc::clone(&hub),
        )?;

        Ok(Self {
            dispatcher,
            events: event_host.dispatcher(),
            context,
            repository,
            hub,
            scopes,
            subscriptions,
            discovery: Some(discovery),
            event_host: Some(event_host),
            server: Some(server),
            timer: Some(timer),
        })
    }

    /// The scoped command API.
    pub fn commands(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// The event publish API.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// The local node's own record (ports resolved).
    pub fn local_context(&self) -> &MeshContext {
        &self.context
    }

    /// Snapshot of every known peer, the self record included.
    pub fn peers(&self) -> Vec<MeshContext> {
        self.repository.snapshot()
    }

    /// The in-process membership hub, for lifecycle observation.
    pub fn membership(&self) -> &Arc<MembershipHub> {
        &self.hub
    }

    /// Stop discovery, join every owner thread, close all sockets in
    /// owner-thread context. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        if let Some(mut discovery) = self.discovery.take() {
            discovery.stop();
        }
        for subscription in self.subscriptions.drain(..) {
            self.hub.unsubscribe(subscription);
        }
        for scope in &mut self.scopes {
            scope.scheduler.shutdown();
        }
        if let Some(mut host) = self.event_host.take() {
            host.shutdown();
        }
        if let Some(mut server) = self.server.take() {
            server.shutdown();
        }
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
    }
}

impl Drop for MeshBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_scope(
    kind: ScopeKind,
    options: &MeshOptions,
    hub: &Arc<MembershipHub>,
    timer: &TimerHandle,
    correlation_ids: &Arc<CorrelationGenerator>,
) -> Result<(ScopeRuntime, CommandScope)> {
    let scheduler = ActorScheduler::start(kind.label())?;
    let pool = Arc::new(ReplyPool::new(
        options.reply_pool_ceiling,
        Arc::clone(correlation_ids),
    ));
    let replies = Arc::new(ReplyRouter::new());

    // Dealer inbound → pending-reply completion, on the scope's thread.
    let (inbound_tx, inbound_rx) = flume::unbounded::<Vec<Bytes>>();
    let reply_sink = Arc::clone(&replies);
    scheduler.handle().execute(move |ctx| {
        let task = compio::runtime::spawn(async move {
            while let Ok(parts) = inbound_rx.recv_async().await {
                match frames::parse_reply(&parts) {
                    Ok((correlation_id, payload)) => {
                        reply_sink.on_message(correlation_id, payload);
                    }
                    Err(err) => tracing::warn!(%err, "malformed reply dropped"),
                }
            }
        });
        ctx.service_tasks.push(task);
    });

    let filter = ScopeFilter::new(kind, workstation_name().to_owned(), options.cluster.clone());
    let manager = SocketManager::new(filter, scheduler.handle(), inbound_tx, hub);
    let subscription = manager.attach(hub);

    let scope = CommandScope::new(
        Arc::clone(&manager),
        scheduler.handle(),
        pool,
        replies,
        timer.clone(),
    );

    Ok((
        ScopeRuntime {
            scheduler,
            subscription,
        },
        scope,
    ))
}
