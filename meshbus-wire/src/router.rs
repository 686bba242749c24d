//! Router-style listening socket.
//!
//! The router accepts dealer connections, learns each peer's identity from
//! its announcement frame, and from then on:
//!
//! - inbound: delivers `[identity, frames…]` to the application queue;
//! - outbound: routes `[identity, frames…]` to the matching peer's write
//!   pump, silently dropping messages for unknown identities.
//!
//! One hub coordinates N peer connection tasks; the hub task is the only
//! place the peer table is touched.

use bytes::Bytes;
use compio::net::{TcpListener, TcpStream};
use compio::runtime::Task;
use flume::{Receiver, Sender};
use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::actor::{self, SocketCmd, SocketEvent};
use crate::codec::{self, Inbound};
use crate::error::{Result, WireError};

/// Commands from the application to the router hub.
#[derive(Debug)]
pub enum RouterCmd {
    /// Send `[identity, frames…]` to the named peer.
    Send(Vec<Bytes>),
    /// Close all peers and stop the hub.
    Close,
}

/// Events from peer connection tasks to the hub.
#[derive(Debug)]
enum HubEvent {
    Up {
        conn: u64,
        identity: Bytes,
        cmd_tx: Sender<SocketCmd>,
    },
    Down {
        conn: u64,
        identity: Option<Bytes>,
    },
}

/// Thread-safe handle to a router hub.
#[derive(Debug, Clone)]
pub struct RouterSocket {
    cmd_tx: Sender<RouterCmd>,
}

impl RouterSocket {
    /// Queue an outbound `[identity, frames…]` message. Never blocks.
    pub fn send(&self, parts: Vec<Bytes>) -> Result<()> {
        self.cmd_tx
            .send(RouterCmd::Send(parts))
            .map_err(|_| WireError::SocketClosed)
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(RouterCmd::Close);
    }
}

/// Probe `base..base+span` for the first bindable listener.
pub(crate) async fn bind_probe(base: u16, span: u16) -> Result<(TcpListener, u16)> {
    for port in base..base.saturating_add(span) {
        match TcpListener::bind(format!("0.0.0.0:{port}")).await {
            Ok(listener) => return Ok((listener, port)),
            Err(err) => trace!(port, %err, "port probe miss"),
        }
    }
    Err(WireError::NoPortAvailable { base, span })
}

/// Bind a router by probing from `base`; returns the handle, the hub to run
/// on the owning runtime, and the resolved port.
pub async fn bind(
    base: u16,
    span: u16,
    inbound_tx: Sender<Vec<Bytes>>,
) -> Result<(RouterSocket, RouterHub, u16)> {
    let (listener, port) = bind_probe(base, span).await?;
    let (cmd_tx, cmd_rx) = flume::unbounded();
    let (event_tx, event_rx) = flume::unbounded();
    let hub = RouterHub {
        listener: Some(listener),
        cmd_rx,
        inbound_tx,
        event_tx,
        event_rx,
        peers: HashMap::new(),
        conns: HashMap::new(),
        next_conn: 1,
    };
    Ok((RouterSocket { cmd_tx }, hub, port))
}

/// The router supervisor: accept loop, peer table, outbound routing.
pub struct RouterHub {
    listener: Option<TcpListener>,
    cmd_rx: Receiver<RouterCmd>,
    inbound_tx: Sender<Vec<Bytes>>,
    event_tx: Sender<HubEvent>,
    event_rx: Receiver<HubEvent>,
    /// identity → (owning connection serial, write queue)
    peers: HashMap<Bytes, (u64, Sender<SocketCmd>)>,
    conns: HashMap<u64, Task<()>>,
    next_conn: u64,
}

impl RouterHub {
    /// Run until [`RouterCmd::Close`] or all handles are dropped.
    pub async fn run(mut self) {
        use futures::FutureExt;

        // Dedicated accept task: new streams cross back over a channel so
        // the select below never cancels an in-flight accept.
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
            // Biased: lifecycle events first, so an identity registration
            // is never outrun by a reply already queued for that peer.
            futures::select_biased! {
                event = self.event_rx.recv_async().fuse() => {
                    // The hub keeps its own event sender, so recv cannot fail.
                    if let Ok(event) = event {
                        self.on_peer_event(event);
                    }
                },
                cmd = self.cmd_rx.recv_async().fuse() => match cmd {
                    Ok(RouterCmd::Send(parts)) => self.route_outbound(parts),
                    Ok(RouterCmd::Close) | Err(_) => break,
                },
                stream = accept_rx.recv_async().fuse() => match stream {
                    Ok(stream) => self.admit(stream),
                    Err(_) => break,
                },
            }
        }

        for (_, (_, tx)) in self.peers.drain() {
            let _ = tx.send(SocketCmd::Close);
        }
        self.conns.clear();
    }

    fn admit(&mut self, stream: TcpStream) {
        let conn = self.next_conn;
        self.next_conn += 1;
        let task = compio::runtime::spawn(serve_peer(
            conn,
            stream,
            self.event_tx.clone(),
            self.inbound_tx.clone(),
        ));
        self.conns.insert(conn, task);
    }

    fn on_peer_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Up {
                conn,
                identity,
                cmd_tx,
            } => {
                // A reconnect under the same identity replaces the stale
                // entry; the old connection dies on its own EOF.
                self.peers.insert(identity, (conn, cmd_tx));
            }
            HubEvent::Down { conn, identity } => {
                self.conns.remove(&conn);
                if let Some(id) = identity {
                    if self.peers.get(&id).is_some_and(|(owner, _)| *owner == conn) {
                        self.peers.remove(&id);
                    }
                }
            }
        }
    }

    fn route_outbound(&mut self, parts: Vec<Bytes>) {
        if parts.len() < 2 {
            debug!(frames = parts.len(), "outbound message too short; dropped");
            return;
        }
        match self.peers.get(&parts[0]) {
            Some((_, tx)) => {
                let _ = tx.send(SocketCmd::Send(codec::encode_message(&parts[1..])));
            }
            None => {
                // Unknown identity: drop silently, the peer is gone.
                trace!("outbound for unknown identity dropped");
            }
        }
    }
}

/// Serve one accepted connection: learn its identity, then shuttle
/// messages between the wire and the hub.
async fn serve_peer(
    conn: u64,
    stream: TcpStream,
    hub_tx: Sender<HubEvent>,
    inbound: Sender<Vec<Bytes>>,
) {
    let (cmd_tx, cmd_rx) = flume::unbounded();
    let (event_tx, event_rx) = flume::unbounded();
    let pumps = actor::run_connection(stream, cmd_rx, cmd_tx.clone(), event_tx);

    let demux = async move {
        let mut identity: Option<Bytes> = None;
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                SocketEvent::Inbound(Inbound::Command(body)) => {
                    if identity.is_none() && !body.is_empty() {
                        identity = Some(body.clone());
                        let _ = hub_tx.send(HubEvent::Up {
                            conn,
                            identity: body,
                            cmd_tx: cmd_tx.clone(),
                        });
                    } else {
                        trace!("redundant control frame ignored");
                    }
                }
                SocketEvent::Inbound(Inbound::Message(mut parts)) => match &identity {
                    Some(id) => {
                        parts.insert(0, id.clone());
                        if inbound.send(parts).is_err() {
                            break;
                        }
                    }
                    None => debug!("message before identity announcement; dropped"),
                },
                SocketEvent::Disconnected => {
                    let _ = hub_tx.send(HubEvent::Down {
                        conn,
                        identity: identity.clone(),
                    });
                    break;
                }
            }
        }
    };

    futures::join!(pumps, demux);
}
