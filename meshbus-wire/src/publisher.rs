//! Publisher-style listening socket.
//!
//! One publisher per node. Subscriber connections are accepted here; their
//! SUBSCRIBE/UNSUBSCRIBE control frames feed the prefix table, and every
//! published message fans out (refcounted, no copies) to the peers whose
//! prefixes match frame 0.

use bytes::Bytes;
use compio::net::{TcpListener, TcpStream};
use compio::runtime::Task;
use flume::{Receiver, Sender};
use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::actor::{self, SocketCmd, SocketEvent};
use crate::codec::{self, Inbound, SUB_SUBSCRIBE, SUB_UNSUBSCRIBE};
use crate::error::{Result, WireError};
use crate::router::bind_probe;
use crate::subscription::{PeerKey, SubscriptionTable};

/// Commands from the application to the publisher hub.
#[derive(Debug)]
pub enum PubCmd {
    /// Fan a multipart message (frame 0 = topic) out to matching peers.
    Publish(Vec<Bytes>),
    /// Close all peers and stop the hub.
    Close,
}

/// Events from subscriber connection tasks to the hub.
#[derive(Debug)]
enum HubEvent {
    Subscribe { peer: PeerKey, prefix: Bytes },
    Unsubscribe { peer: PeerKey, prefix: Bytes },
    Down { peer: PeerKey },
}

/// Thread-safe handle to a publisher hub.
#[derive(Debug, Clone)]
pub struct PubSocket {
    cmd_tx: Sender<PubCmd>,
}

impl PubSocket {
    /// Create a handle and the queue its hub will drain. Publishes queue
    /// until the hub is bound and running.
    #[must_use]
    pub fn pair() -> (Self, Receiver<PubCmd>) {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        (Self { cmd_tx }, cmd_rx)
    }

    /// Queue a publication. Never blocks.
    pub fn publish(&self, parts: Vec<Bytes>) -> Result<()> {
        self.cmd_tx
            .send(PubCmd::Publish(parts))
            .map_err(|_| WireError::SocketClosed)
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(PubCmd::Close);
    }
}

/// Bind a publisher by probing from `base`; returns the hub to run on the
/// owning runtime and the resolved port.
pub async fn bind(base: u16, span: u16, cmd_rx: Receiver<PubCmd>) -> Result<(PubHub, u16)> {
    let (listener, port) = bind_probe(base, span).await?;
    let (event_tx, event_rx) = flume::unbounded();
    Ok((
        PubHub {
            listener: Some(listener),
            cmd_rx,
            event_tx,
            event_rx,
            table: SubscriptionTable::new(),
            peers: HashMap::new(),
            tasks: HashMap::new(),
            next_key: 1, // reserve 0
        },
        port,
    ))
}

/// The publisher supervisor: accept loop, prefix table, fan-out.
pub struct PubHub {
    listener: Option<TcpListener>,
    cmd_rx: Receiver<PubCmd>,
    event_tx: Sender<HubEvent>,
    event_rx: Receiver<HubEvent>,
    table: SubscriptionTable,
    peers: HashMap<PeerKey, Sender<SocketCmd>>,
    tasks: HashMap<PeerKey, Task<()>>,
    next_key: PeerKey,
}

impl PubHub {
    /// Run until [`PubCmd::Close`] or all handles are dropped.
    pub async fn run(mut self) {
        use futures::FutureExt;

        let (accept_tx, accept_rx) = flume::unbounded();
        let listener = self.listener.take().expect("hub runs once");
        let _accept_task = compio::runtime::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        if accept_tx.send(stream).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                        break;
                    }
                }
            }
        });

        loop {
            // Biased: subscription changes apply before any publication
            // queued behind them fans out.
            futures::select_biased! {
                event = self.event_rx.recv_async().fuse() => {
                    if let Ok(event) = event {
                        self.on_peer_event(event);
                    }
                },
                cmd = self.cmd_rx.recv_async().fuse() => match cmd {
                    Ok(PubCmd::Publish(parts)) => self.fan_out(parts),
                    Ok(PubCmd::Close) | Err(_) => break,
                },
                stream = accept_rx.recv_async().fuse() => match stream {
                    Ok(stream) => self.admit(stream),
                    Err(_) => break,
                },
            }
        }

        for (_, tx) in self.peers.drain() {
            let _ = tx.send(SocketCmd::Close);
        }
        self.tasks.clear();
    }

    fn admit(&mut self, stream: TcpStream) {
        let peer = self.next_key;
        self.next_key += 1;

        let (cmd_tx, cmd_rx) = flume::unbounded();
        let task = compio::runtime::spawn(serve_subscriber(
            peer,
            stream,
            cmd_rx,
            cmd_tx.clone(),
            self.event_tx.clone(),
        ));
        self.peers.insert(peer, cmd_tx);
        self.tasks.insert(peer, task);
    }

    fn on_peer_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Subscribe { peer, prefix } => {
                if self.peers.contains_key(&peer) {
                    self.table.subscribe(peer, prefix);
                }
            }
            HubEvent::Unsubscribe { peer, prefix } => {
                self.table.unsubscribe(peer, &prefix);
            }
            HubEvent::Down { peer } => {
                self.peers.remove(&peer);
                self.tasks.remove(&peer);
                self.table.remove_peer(peer);
            }
        }
    }

    fn fan_out(&mut self, parts: Vec<Bytes>) {
        if parts.is_empty() || self.table.is_empty() {
            return;
        }
        let keys = self.table.match_topic(&parts[0]);
        if keys.is_empty() {
            return;
        }
        // Encode once; the Bytes fan out refcounted.
        let wire = codec::encode_message(&parts);
        for key in keys {
            if let Some(tx) = self.peers.get(&key) {
                let _ = tx.send(SocketCmd::Send(wire.clone()));
            }
        }
    }
}

/// Serve one subscriber connection: control frames mutate the prefix table,
/// everything else is noise.
async fn serve_subscriber(
    peer: PeerKey,
    stream: TcpStream,
    cmd_rx: Receiver<SocketCmd>,
    cmd_tx: Sender<SocketCmd>,
    hub_tx: Sender<HubEvent>,
) {
    let (event_tx, event_rx) = flume::unbounded();
    let pumps = actor::run_connection(stream, cmd_rx, cmd_tx, event_tx);

    let demux = async move {
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                SocketEvent::Inbound(Inbound::Command(body)) => match parse_subscription(&body) {
                    Some((true, prefix)) => {
                        let _ = hub_tx.send(HubEvent::Subscribe { peer, prefix });
                    }
                    Some((false, prefix)) => {
                        let _ = hub_tx.send(HubEvent::Unsubscribe { peer, prefix });
                    }
                    None => debug!("malformed subscription frame ignored"),
                },
                SocketEvent::Inbound(Inbound::Message(_)) => {
                    trace!("unexpected data message from subscriber ignored");
                }
                SocketEvent::Disconnected => {
                    let _ = hub_tx.send(HubEvent::Down { peer });
                    break;
                }
            }
        }
    };

    futures::join!(pumps, demux);
}

fn parse_subscription(body: &Bytes) -> Option<(bool, Bytes)> {
    let op = *body.first()?;
    let prefix = body.slice(1..);
    match op {
        SUB_SUBSCRIBE => Some((true, prefix)),
        SUB_UNSUBSCRIBE => Some((false, prefix)),
        _ => None,
    }
}
