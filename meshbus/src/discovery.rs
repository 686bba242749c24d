//! Beacon discovery: advertise, receive, sweep.
//!
//! One dedicated thread owns all of it. Every `beacon_interval` the local
//! context goes out; inbound datagrams upsert the repository (new mesh id →
//! `Joined`); every `cleanup_interval` records older than
//! `inactive_threshold` are evicted with a `Removed` per peer. All
//! repository writes happen on this thread. Malformed datagrams are logged
//! and dropped — a hostile packet must never take the listener down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use meshbus_wire::beacon::{broadcast_target, BeaconSocket, MAX_BEACON_LEN};

use crate::config::MeshOptions;
use crate::context::MeshContext;
use crate::error::Result;
use crate::membership::{MembershipEvent, MembershipHub};
use crate::repository::{MeshRepository, Upsert};

struct Intervals {
    beacon: Duration,
    cleanup: Duration,
    inactive: Duration,
}

/// The discovery thread handle.
pub struct Discovery {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Discovery {
    /// Open the beacon sockets and start the thread. Bind failures are
    /// fatal and surface here, before anything is advertised.
    pub fn start(
        options: &MeshOptions,
        context: &MeshContext,
        repository: Arc<MeshRepository>,
        hub: Arc<MembershipHub>,
    ) -> Result<Self> {
        let targets = if options.beacon_targets.is_empty() {
            vec![broadcast_target(options.beacon_port)]
        } else {
            options.beacon_targets.clone()
        };

        // Receive timeout bounds the loop's reaction to stop/advertise
        // ticks; capped so short test intervals stay responsive.
        let recv_timeout = options
            .beacon_interval
            .min(Duration::from_millis(100))
            .max(Duration::from_millis(1));

        let socket = BeaconSocket::open(options.beacon_port, recv_timeout, targets)?;
        let payload = context.to_beacon()?;
        let self_id = context.mesh_id;
        let intervals = Intervals {
            beacon: options.beacon_interval,
            cleanup: options.cleanup_interval,
            inactive: options.inactive_threshold,
        };

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("meshbus-discovery".to_owned())
            .spawn(move || {
                run(
                    &socket,
                    &payload,
                    self_id,
                    &intervals,
                    &repository,
                    &hub,
                    &stop_flag,
                );
            })
            .map_err(crate::error::MeshError::Transport)?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop advertising and join the thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop.store(true, Ordering::Release);
            if thread.join().is_err() {
                debug!("discovery thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    socket: &BeaconSocket,
    payload: &[u8],
    self_id: u64,
    intervals: &Intervals,
    repository: &MeshRepository,
    hub: &MembershipHub,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; MAX_BEACON_LEN];
    let mut next_beacon = Instant::now();
    let mut next_sweep = Instant::now() + intervals.cleanup;

    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();

        if now >= next_beacon {
            if let Err(err) = socket.send(payload) {
                debug!(%err, "beacon send failed");
            }
            next_beacon = now + intervals.beacon;
        }

        if now >= next_sweep {
            for evicted in repository.sweep(intervals.inactive) {
                info!(mesh_id = evicted.mesh_id, "peer evicted");
                hub.publish(&MembershipEvent::Removed(evicted));
            }
            next_sweep = now + intervals.cleanup;
        }

        match socket.recv(&mut buf) {
            Ok(Some((len, src))) => handle_datagram(&buf[..len], src, self_id, repository, hub),
            Ok(None) => {}
            Err(err) => {
                warn!(%err, "beacon receive failed");
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Decode one beacon and fold it into the repository. The datagram source
/// address overrides whatever the peer advertised — it is what actually
/// reaches them.
fn handle_datagram(
    payload: &[u8],
    src: SocketAddr,
    self_id: u64,
    repository: &MeshRepository,
    hub: &MembershipHub,
) {
    match MeshContext::from_beacon(payload) {
        Ok(mut ctx) => {
            if ctx.mesh_id == self_id {
                return;
            }
            ctx.address = src.ip().to_string();
            ctx.is_self = false;
            ctx.last_seen = Instant::now();

            match repository.upsert(ctx.clone()) {
                Upsert::Joined => {
                    info!(
                        mesh_id = ctx.mesh_id,
                        application = %ctx.application_name,
                        address = %ctx.address,
                        "peer joined"
                    );
                    hub.publish(&MembershipEvent::Joined(ctx));
                }
                Upsert::Refreshed => {}
            }
        }
        Err(err) => debug!(%err, "malformed beacon dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshOptions;
    use std::sync::atomic::AtomicUsize;

    fn source() -> SocketAddr {
        "192.168.1.33:9100".parse().expect("addr")
    }

    fn beacon_for(mesh_id: u64) -> Vec<u8> {
        let mut ctx = MeshContext::local(&MeshOptions::default(), 10, 20);
        ctx.mesh_id = mesh_id;
        ctx.to_beacon().expect("encode")
    }

    #[test]
    fn new_peer_joins_once_then_refreshes() {
        let repository = MeshRepository::new();
        let hub = MembershipHub::new();
        let joins = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&joins);
        hub.subscribe(move |event| {
            if matches!(event, MembershipEvent::Joined(_)) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        let beacon = beacon_for(7);
        // Beacon flood: repeats refresh, never duplicate the join.
        for _ in 0..5 {
            handle_datagram(&beacon, source(), 99, &repository, &hub);
        }

        assert_eq!(joins.load(Ordering::Relaxed), 1);
        assert_eq!(repository.len(), 1);
    }

    #[test]
    fn own_beacon_is_ignored() {
        let repository = MeshRepository::new();
        let hub = MembershipHub::new();
        handle_datagram(&beacon_for(42), source(), 42, &repository, &hub);
        assert!(repository.is_empty());
    }

    #[test]
    fn source_address_overrides_advertised_address() {
        let repository = MeshRepository::new();
        let hub = MembershipHub::new();
        handle_datagram(&beacon_for(7), source(), 99, &repository, &hub);

        let peer = repository.get(7).expect("stored");
        assert_eq!(peer.address, "192.168.1.33");
        assert!(!peer.is_self);
    }

    #[test]
    fn garbage_datagram_is_dropped() {
        let repository = MeshRepository::new();
        let hub = MembershipHub::new();
        handle_datagram(&[0xde, 0xad, 0xbe, 0xef], source(), 99, &repository, &hub);
        assert!(repository.is_empty());
    }
}
