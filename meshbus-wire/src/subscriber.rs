//! Subscriber-style client socket.
//!
//! Connects to a remote publisher, installs its prefix subscriptions
//! (empty prefix = wildcard), and forwards every matching `[topic][payload]`
//! message to the inbound queue.

use bytes::Bytes;
use compio::net::TcpStream;
use flume::{Receiver, Sender};
use tracing::trace;

use crate::actor::{self, SocketCmd, SocketEvent};
use crate::codec::{self, Inbound};
use crate::error::{Result, WireError};

/// Thread-safe handle to a subscriber connection.
#[derive(Debug, Clone)]
pub struct SubSocket {
    cmd_tx: Sender<SocketCmd>,
}

impl SubSocket {
    /// Create a handle and the command queue its connection will drain.
    #[must_use]
    pub fn pair() -> (Self, Receiver<SocketCmd>) {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        (Self { cmd_tx }, cmd_rx)
    }

    /// Add a prefix subscription on the live connection.
    pub fn subscribe(&self, prefix: &[u8]) -> Result<()> {
        self.cmd_tx
            .send(SocketCmd::Send(codec::encode_subscription(true, prefix)))
            .map_err(|_| WireError::SocketClosed)
    }

    /// Drop a prefix subscription on the live connection.
    pub fn unsubscribe(&self, prefix: &[u8]) -> Result<()> {
        self.cmd_tx
            .send(SocketCmd::Send(codec::encode_subscription(false, prefix)))
            .map_err(|_| WireError::SocketClosed)
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(SocketCmd::Close);
    }

    pub(crate) fn cmd_sender(&self) -> Sender<SocketCmd> {
        self.cmd_tx.clone()
    }
}

/// Connect and drive a subscriber until its connection closes.
///
/// `prefixes` are installed before any queued command; pass one empty
/// prefix for a wildcard subscription.
pub async fn run_subscriber(
    addr: &str,
    socket: SubSocket,
    cmds: Receiver<SocketCmd>,
    prefixes: Vec<Bytes>,
    inbound: Sender<Vec<Bytes>>,
) -> Result<()> {
    let mut stream = TcpStream::connect(addr).await?;

    // Install subscriptions ahead of anything already queued on the handle.
    for prefix in &prefixes {
        use compio::buf::BufResult;
        use compio::io::AsyncWriteExt;
        let frame = codec::encode_subscription(true, prefix);
        let BufResult(res, _) = stream.write_all(frame.to_vec()).await;
        res?;
    }

    let (event_tx, event_rx) = flume::unbounded();
    let pumps = actor::run_connection(stream, cmds, socket.cmd_sender(), event_tx);
    let route = async move {
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                SocketEvent::Inbound(Inbound::Message(parts)) => {
                    if inbound.send(parts).is_err() {
                        break;
                    }
                }
                SocketEvent::Inbound(Inbound::Command(_)) => {
                    trace!("ignoring control frame on subscriber");
                }
                SocketEvent::Disconnected => break,
            }
        }
    };

    futures::join!(pumps, route);
    Ok(())
}
