//! Unix stream socket hub.
//!
//! [`SocketServer`] accepts clients and spawns one reader and one writer task
//! per connection. Readers turn frames into [`SocketEvent`]s on a channel the
//! event loop consumes; writers drain a per-connection byte channel.
//! [`SocketHub`] keeps the writer channels and is the production
//! [`Outbound`] of the bus.
//!
//! No bus state is shared with the tasks. Everything crosses over unbounded
//! `tokio::sync::mpsc` channels as owned values.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use devstate_types::{CloseReason, DevStateError, Message, PeerCredentials};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{Outbound, Payload};
use crate::codec::{FrameError, FrameReader, FrameWriter};
use crate::endpoint::{ConnectionId, Endpoint};

/// Socket path used when neither configuration nor environment names one.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/devstate.sock";

/// What a connection reader reports to the event loop.
#[derive(Debug)]
pub enum SocketEvent {
    Received { from: Endpoint, payload: Payload },
    Closed { from: Endpoint, reason: CloseReason },
}

// ────────────────────────────────────────────────────────────────────────────
// Hub (outbound side)
// ────────────────────────────────────────────────────────────────────────────

/// Writer channels of every live connection.
#[derive(Debug, Default)]
pub struct SocketHub {
    peers: HashMap<ConnectionId, mpsc::UnboundedSender<Vec<u8>>>,
}

impl SocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, id: ConnectionId, writer: mpsc::UnboundedSender<Vec<u8>>) {
        self.peers.insert(id, writer);
    }

    /// Forget a connection. Dropping its channel stops the writer task.
    pub fn detach(&mut self, id: ConnectionId) -> bool {
        self.peers.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Outbound for SocketHub {
    fn broadcast(&mut self, msg: &Message) {
        let frame = msg.encode();
        self.peers.retain(|id, tx| {
            let alive = tx.send(frame.clone()).is_ok();
            if !alive {
                debug!(connection = id, "dropping peer with closed writer");
            }
            alive
        });
    }

    fn send(&mut self, connection: ConnectionId, msg: &Message) {
        match self.peers.get(&connection) {
            Some(tx) => {
                if tx.send(msg.encode()).is_err() {
                    self.peers.remove(&connection);
                }
            }
            None => debug!(connection, kind = ?msg.kind(), "reply to unknown connection dropped"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Server (accept side)
// ────────────────────────────────────────────────────────────────────────────

pub struct SocketServer {
    listener: UnixListener,
    path: PathBuf,
    events: mpsc::UnboundedSender<SocketEvent>,
    next_id: ConnectionId,
}

impl SocketServer {
    /// Bind `path`, replacing a stale socket file left by a previous run.
    pub fn bind(path: impl AsRef<Path>, events: mpsc::UnboundedSender<SocketEvent>) -> io::Result<Self> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            events,
            next_id: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one client and start its tasks.
    ///
    /// Returns the new connection id and the channel the hub should write to.
    pub async fn accept(&mut self) -> io::Result<(ConnectionId, mpsc::UnboundedSender<Vec<u8>>)> {
        let (stream, _addr) = self.listener.accept().await?;
        self.next_id += 1;
        let id = self.next_id;
        let credentials = peer_credentials(&stream);
        let from = Endpoint::Connection { id, credentials };
        info!(connection = id, pid = credentials.pid, uid = credentials.uid, "client connected");

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(FrameReader::new(read_half), from, self.events.clone()));
        tokio::spawn(write_loop(FrameWriter::new(write_half), id, rx));

        Ok((id, tx))
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn peer_credentials(stream: &UnixStream) -> PeerCredentials {
    match stream.peer_cred() {
        Ok(cred) => PeerCredentials {
            pid: cred.pid().unwrap_or(0),
            uid: cred.uid(),
            gid: cred.gid(),
        },
        Err(e) => {
            warn!(error = %e, "peer credentials unavailable");
            PeerCredentials::UNKNOWN
        }
    }
}

async fn read_loop<R>(mut reader: FrameReader<R>, from: Endpoint, events: mpsc::UnboundedSender<SocketEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let reason = loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => match Message::decode(&frame) {
                Ok((message, declared_size)) => {
                    let payload = Payload::with_declared_size(message, declared_size);
                    if events.send(SocketEvent::Received { from, payload }).is_err() {
                        return;
                    }
                }
                Err(DevStateError::UnknownType(type_id)) => {
                    debug!(%from, type_id = format_args!("0x{type_id:08x}"), "unknown message type dropped");
                }
                Err(e) => warn!(%from, error = %e, "malformed message dropped"),
            },
            Ok(None) => break CloseReason::Eof,
            Err(e) if e.is_protocol_violation() => {
                warn!(%from, error = %e, "closing out-of-sync connection");
                break CloseReason::OutOfSync;
            }
            Err(FrameError::Truncated) => break CloseReason::Eof,
            Err(e) => {
                warn!(%from, error = %e, "read failed");
                break CloseReason::Error;
            }
        }
    };
    let _ = events.send(SocketEvent::Closed { from, reason });
}

async fn write_loop<W>(mut writer: FrameWriter<W>, id: ConnectionId, mut frames: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_raw(&frame).await {
            debug!(connection = id, error = %e, "write failed");
            break;
        }
    }
}
