//! Dealer-style client socket.
//!
//! A dealer connects to one router endpoint, announces its logical identity
//! in a COMMAND frame, then exchanges multipart messages. The handle is a
//! cheap clone usable from any thread; all I/O runs in [`run_dealer`] on the
//! owning runtime thread.

use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::AsyncWriteExt;
use compio::net::TcpStream;
use flume::{Receiver, Sender};
use tracing::trace;

use crate::actor::{self, SocketCmd, SocketEvent};
use crate::codec::{self, Inbound};
use crate::error::{Result, WireError};

/// Thread-safe handle to a dealer connection.
#[derive(Debug, Clone)]
pub struct DealerSocket {
    identity: Bytes,
    cmd_tx: Sender<SocketCmd>,
}

impl DealerSocket {
    /// Create a handle and the command queue its connection will drain.
    ///
    /// The handle is usable immediately; messages queue until
    /// [`run_dealer`] has connected.
    #[must_use]
    pub fn pair(identity: impl Into<Bytes>) -> (Self, Receiver<SocketCmd>) {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        (
            Self {
                identity: identity.into(),
                cmd_tx,
            },
            cmd_rx,
        )
    }

    #[must_use]
    pub fn identity(&self) -> &Bytes {
        &self.identity
    }

    /// Queue a multipart message for transmission. Never blocks.
    pub fn send_multipart(&self, parts: &[Bytes]) -> Result<()> {
        self.cmd_tx
            .send(SocketCmd::Send(codec::encode_message(parts)))
            .map_err(|_| WireError::SocketClosed)
    }

    /// Ask the connection to stop writing and wind down.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(SocketCmd::Close);
    }

    pub(crate) fn cmd_sender(&self) -> Sender<SocketCmd> {
        self.cmd_tx.clone()
    }
}

/// Connect and drive a dealer until its connection closes.
///
/// Inbound multipart messages are forwarded to `inbound` in arrival order.
/// Must run on the thread that owns the scope's runtime.
pub async fn run_dealer(
    addr: &str,
    socket: DealerSocket,
    cmds: Receiver<SocketCmd>,
    inbound: Sender<Vec<Bytes>>,
) -> Result<()> {
    let mut stream = TcpStream::connect(addr).await?;

    // Identity announcement must precede any queued message.
    let hello = codec::encode_command(socket.identity());
    let BufResult(res, _) = stream.write_all(hello.to_vec()).await;
    res?;

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
                SocketEvent::Inbound(Inbound::Command(body)) => {
                    trace!(len = body.len(), "ignoring control frame on dealer");
                }
                SocketEvent::Disconnected => break,
            }
        }
    };

    futures::join!(pumps, route);
    Ok(())
}
