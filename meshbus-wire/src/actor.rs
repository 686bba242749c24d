//! Connection actor: split read/write pumps over one TCP stream.
//!
//! One actor == one TCP connection. The read pump moves bytes from the
//! kernel through the frame decoder and emits [`SocketEvent`]s; the write
//! pump drains a [`SocketCmd`] queue into the kernel. The two pumps share
//! nothing but the (cheaply cloned) stream, so neither direction can stall
//! the other. Routing and protocol semantics live in the layers above.

use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::TcpStream;
use compio::runtime::TryClone;
use flume::{Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::codec::{FrameDecoder, Inbound, MessageAssembler};

const RECV_CHUNK: usize = 16 * 1024;

/// Messages from the owning layer to a connection.
#[derive(Debug)]
pub enum SocketCmd {
    /// Write pre-encoded wire bytes.
    Send(Bytes),
    /// Stop writing and let the connection wind down.
    Close,
}

/// Events from a connection to the owning layer.
#[derive(Debug)]
pub enum SocketEvent {
    /// A complete message or control frame arrived.
    Inbound(Inbound),
    /// The connection is gone (EOF, IO error, or protocol violation).
    Disconnected,
}

/// Drive both pumps of a connection until it closes.
///
/// `cmd_tx` must be the sender side of `cmds`; the read pump uses it to
/// release the write pump when the peer disconnects first. Must run on the
/// thread that owns the connection's runtime.
pub async fn run_connection(
    stream: TcpStream,
    cmds: Receiver<SocketCmd>,
    cmd_tx: Sender<SocketCmd>,
    events: Sender<SocketEvent>,
) {
    let write_stream = stream.try_clone().expect("failed to clone connection socket");
    futures::join!(
        read_pump(stream, events, cmd_tx),
        write_pump(write_stream, cmds),
    );
}

/// Kernel → application. Emits one [`SocketEvent::Disconnected`] on exit.
async fn read_pump(mut stream: TcpStream, events: Sender<SocketEvent>, unblock: Sender<SocketCmd>) {
    let mut decoder = FrameDecoder::new();
    let mut assembler = MessageAssembler::new();

    'conn: loop {
        let BufResult(res, buf) = stream.read(Vec::with_capacity(RECV_CHUNK)).await;
        match res {
            Ok(0) => {
                trace!("connection EOF");
                break;
            }
            Ok(_) => {
                decoder.feed(&buf);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => {
                            if let Some(inbound) = assembler.push(frame) {
                                if events.send(SocketEvent::Inbound(inbound)).is_err() {
                                    break 'conn;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(%err, "dropping connection on protocol violation");
                            break 'conn;
                        }
                    }
                }
            }
            Err(err) => {
                debug!(%err, "read failed");
                break;
            }
        }
    }

    let _ = unblock.send(SocketCmd::Close);
    let _ = events.send(SocketEvent::Disconnected);
}

/// Application → kernel. Exits on [`SocketCmd::Close`] or write failure.
async fn write_pump(mut stream: TcpStream, cmds: Receiver<SocketCmd>) {
    while let Ok(cmd) = cmds.recv_async().await {
        match cmd {
            SocketCmd::Send(data) => {
                let BufResult(res, _) = stream.write_all(data.to_vec()).await;
                if let Err(err) = res {
                    debug!(%err, "write failed");
                    break;
                }
            }
            SocketCmd::Close => break,
        }
    }
}
