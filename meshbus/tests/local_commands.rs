//! Single-node end-to-end scenarios: everything here talks to the node's
//! own router over loopback.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use meshbus::{Command, HandlerRegistry, MeshBus, MeshOptions};

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    msg: String,
}

impl Command for Ping {
    type Reply = String;
}

#[derive(Debug, Serialize, Deserialize)]
struct SlowPing {
    msg: String,
}

impl Command for SlowPing {
    type Reply = String;
}

#[derive(Debug, Serialize, Deserialize)]
struct FaultyPing {
    msg: String,
}

impl Command for FaultyPing {
    type Reply = String;
}

#[derive(Debug, Serialize, Deserialize)]
struct UserCreated {
    name: String,
}

impl Command for UserCreated {
    type Reply = ();
}

/// Options for an isolated single-node bus: unique ports, loopback-only
/// beaconing.
fn test_options(application_name: &str) -> MeshOptions {
    let beacon_port = portpicker::pick_unused_port().expect("free beacon port");
    MeshOptions {
        application_name: application_name.to_owned(),
        rpc_port: portpicker::pick_unused_port().expect("free rpc port"),
        publish_port: portpicker::pick_unused_port().expect("free publish port"),
        beacon_port,
        beacon_targets: vec![SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            beacon_port,
        ))],
        beacon_interval: Duration::from_millis(100),
        cleanup_interval: Duration::from_millis(500),
        inactive_threshold: Duration::from_secs(2),
        ..MeshOptions::default()
    }
}

#[test]
fn single_peer_local_stream() {
    meshbus::dev_tracing::init_tracing();

    let mut registry = HandlerRegistry::new();
    registry.on_command::<Ping, _>(|ping| format!("pong-{}", ping.msg));

    let bus = MeshBus::start(test_options("local-stream"), registry).expect("start");
    assert_eq!(bus.commands().local().peer_count(), 1);

    let stream = bus
        .commands()
        .local()
        .stream(&Ping { msg: "hi".into() }, Duration::from_secs(5))
        .expect("scatter");
    let replies: Vec<String> = futures::executor::block_on(stream.collect());

    assert_eq!(replies, vec!["pong-hi".to_owned()]);
}

#[test]
fn slow_handler_times_out_with_empty_stream() {
    meshbus::dev_tracing::init_tracing();

    let mut registry = HandlerRegistry::new();
    registry.on_command::<SlowPing, _>(|ping| {
        std::thread::sleep(Duration::from_millis(1500));
        format!("pong-{}", ping.msg)
    });

    let bus = MeshBus::start(test_options("local-timeout"), registry).expect("start");

    let started = Instant::now();
    let stream = bus
        .commands()
        .local()
        .stream(&SlowPing { msg: "x".into() }, Duration::from_millis(300))
        .expect("scatter");
    let replies: Vec<String> = futures::executor::block_on(stream.collect());
    let elapsed = started.elapsed();

    assert!(replies.is_empty());
    assert!(
        elapsed < Duration::from_millis(1200),
        "timeout should release the caller well before the handler finishes ({elapsed:?})"
    );
}

#[test]
fn void_send_observes_side_effect_exactly_once() {
    meshbus::dev_tracing::init_tracing();

    let recorded = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&recorded);

    let mut registry = HandlerRegistry::new();
    registry.on_command::<UserCreated, _>(move |user| {
        sink.lock().push(user.name);
    });

    let bus = MeshBus::start(test_options("local-void"), registry).expect("start");

    futures::executor::block_on(
        bus.commands()
            .local()
            .send(&UserCreated { name: "A".into() }, Duration::from_secs(5)),
    )
    .expect("send acked");

    assert_eq!(*recorded.lock(), vec!["A".to_owned()]);
}

#[test]
fn zero_timeout_faults_everything_and_yields_nothing() {
    meshbus::dev_tracing::init_tracing();

    let mut registry = HandlerRegistry::new();
    registry.on_command::<Ping, _>(|ping| format!("pong-{}", ping.msg));

    let bus = MeshBus::start(test_options("local-zero-timeout"), registry).expect("start");

    let stream = bus
        .commands()
        .local()
        .stream(&Ping { msg: "x".into() }, Duration::ZERO)
        .expect("scatter");
    let replies: Vec<String> = futures::executor::block_on(stream.collect());
    assert!(replies.is_empty());
}

#[test]
fn empty_scope_completes_immediately() {
    meshbus::dev_tracing::init_tracing();

    let mut options = test_options("empty-scope");
    // Allow-list that matches nothing: even the self record is excluded
    // from the Network scope.
    options.cluster.applications = vec!["someone-else".to_owned()];

    let mut registry = HandlerRegistry::new();
    registry.on_command::<Ping, _>(|ping| format!("pong-{}", ping.msg));
    let bus = MeshBus::start(options, registry).expect("start");

    assert_eq!(bus.commands().network().peer_count(), 0);

    let stream = bus
        .commands()
        .network()
        .stream(&Ping { msg: "x".into() }, Duration::from_secs(1))
        .expect("scatter");
    let replies: Vec<String> = futures::executor::block_on(stream.collect());
    assert!(replies.is_empty());

    futures::executor::block_on(bus.commands().network().send(
        &UserCreated { name: "n".into() },
        Duration::from_secs(1),
    ))
    .expect("empty send completes");
}

#[test]
fn missing_handler_yields_default_reply() {
    meshbus::dev_tracing::init_tracing();

    // No Ping handler registered at all.
    let registry = HandlerRegistry::new();
    let bus = MeshBus::start(test_options("no-handler"), registry).expect("start");

    let stream = bus
        .commands()
        .local()
        .stream(&Ping { msg: "x".into() }, Duration::from_secs(5))
        .expect("scatter");
    let replies: Vec<String> = futures::executor::block_on(stream.collect());

    // The server replies with an empty payload; the caller sees a default.
    assert_eq!(replies, vec![String::new()]);
}

#[test]
fn panicking_handler_yields_default_reply_and_server_survives() {
    meshbus::dev_tracing::init_tracing();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let mut registry = HandlerRegistry::new();
    registry.on_command::<FaultyPing, _>(move |_| -> String {
        counter.fetch_add(1, Ordering::Relaxed);
        panic!("handler exploded");
    });
    registry.on_command::<Ping, _>(|ping| format!("pong-{}", ping.msg));

    let bus = MeshBus::start(test_options("panicky"), registry).expect("start");

    let stream = bus
        .commands()
        .local()
        .stream(&FaultyPing { msg: "x".into() }, Duration::from_secs(5))
        .expect("scatter");
    let replies: Vec<String> = futures::executor::block_on(stream.collect());
    assert_eq!(replies, vec![String::new()]);
    assert_eq!(attempts.load(Ordering::Relaxed), 1);

    // The server kept running: a healthy command still works.
    let stream = bus
        .commands()
        .local()
        .stream(&Ping { msg: "ok".into() }, Duration::from_secs(5))
        .expect("scatter");
    let replies: Vec<String> = futures::executor::block_on(stream.collect());
    assert_eq!(replies, vec!["pong-ok".to_owned()]);
}

#[test]
fn cancellation_token_releases_the_caller() {
    meshbus::dev_tracing::init_tracing();

    let mut registry = HandlerRegistry::new();
    registry.on_command::<SlowPing, _>(|ping| {
        std::thread::sleep(Duration::from_millis(1500));
        format!("pong-{}", ping.msg)
    });

    let bus = MeshBus::start(test_options("cancel"), registry).expect("start");
    let token = meshbus::CancelToken::new();

    let stream = bus
        .commands()
        .local()
        .stream_with_cancel(
            &SlowPing { msg: "x".into() },
            Duration::from_secs(10),
            Some(&token),
        )
        .expect("scatter");

    token.cancel();
    let replies: Vec<String> = futures::executor::block_on(stream.collect());
    assert!(replies.is_empty());
}

#[test]
fn shutdown_is_idempotent_and_releases_ports() {
    meshbus::dev_tracing::init_tracing();

    let options = test_options("shutdown");
    let mut registry = HandlerRegistry::new();
    registry.on_command::<Ping, _>(|ping| format!("pong-{}", ping.msg));

    let mut bus = MeshBus::start(options.clone(), registry).expect("start");
    let rpc_base = options.rpc_port;
    bus.shutdown();
    bus.shutdown();
    drop(bus);

    // A second node starts cleanly over the same configuration; the port
    // probe absorbs any lingering TIME_WAIT state.
    let mut registry = HandlerRegistry::new();
    registry.on_command::<Ping, _>(|ping| format!("pong-{}", ping.msg));
    let bus = MeshBus::start(options, registry).expect("restart");
    assert!(bus.local_context().rpc_port >= rpc_base);
}
