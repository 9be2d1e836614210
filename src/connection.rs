//! A live Mu connection.
//!
//! Every TCP stream, accepted or dialed, is split into a reader task and a
//! writer task. Senders never touch the socket: [`Connection::send`] encodes
//! the envelope and queues the finished frame for the writer task, so sends
//! on one connection keep their order on the wire and never block the caller.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use crate::codec;
use crate::error::{MuError, Result};
use crate::protocol::{Address, Envelope};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Receives every envelope decoded on a connection, in arrival order
pub trait EnvelopeHandler: Send + Sync + 'static {
    fn on_envelope(&self, envelope: Envelope, connection: &Connection);
}

/// Write-idle heartbeat attached to connections this process initiated
#[derive(Debug, Clone)]
pub struct Heartbeat {
    /// Address advertised to the peer
    pub address: Address,
    /// Write-idle interval after which another heartbeat is sent
    pub interval: Duration,
}

struct IdleHeartbeat {
    interval: Duration,
    frame: Bytes,
}

/// Cloneable handle to a live connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    peer_addr: SocketAddr,
    frames: mpsc::UnboundedSender<Bytes>,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Take ownership of `stream` and start its reader and writer tasks.
    ///
    /// With a `heartbeat`, one HEARTBEAT is queued before anything else and
    /// another whenever nothing was written for `heartbeat.interval`.
    pub fn spawn(
        stream: TcpStream,
        handler: Arc<dyn EnvelopeHandler>,
        heartbeat: Option<Heartbeat>,
    ) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let connection = Connection {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                frames: frames_tx,
                closed,
            }),
        };
        debug!("[CONNECTION_LIFECYCLE] OPENED connection #{} with {}", connection.id(), peer_addr);

        let idle_heartbeat = match heartbeat {
            Some(heartbeat) => {
                let frame = codec::encode(&Envelope::heartbeat(heartbeat.address))?;
                connection.send_frame(frame.clone())?;
                Some(IdleHeartbeat {
                    interval: heartbeat.interval,
                    frame,
                })
            }
            None => None,
        };

        tokio::spawn(write_loop(writer, frames_rx, idle_heartbeat, connection.clone()));
        tokio::spawn(read_loop(reader, handler, connection.clone()));

        Ok(connection)
    }

    /// Queue one envelope for writing
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let frame = codec::encode(envelope)?;
        self.send_frame(frame)
    }

    /// Queue a frame produced by [`codec::encode`]
    pub(crate) fn send_frame(&self, frame: Bytes) -> Result<()> {
        if !self.is_active() {
            return Err(MuError::ChannelInactive(self.inner.peer_addr.to_string()));
        }
        self.inner
            .frames
            .send(frame)
            .map_err(|_| MuError::ChannelInactive(self.inner.peer_addr.to_string()))
    }

    /// Close the connection. Both tasks stop and queued frames are discarded.
    pub fn close(&self) {
        if !self.inner.closed.send_replace(true) {
            debug!("[CONNECTION_LIFECYCLE] CLOSING connection #{} with {}", self.id(), self.peer_addr());
        }
    }

    /// Resolves once the connection is closed, from either side
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn is_active(&self) -> bool {
        !*self.inner.closed.borrow()
    }

    /// Process-unique id, used to tell a replaced registry entry from the current one
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn idle(heartbeat: Option<&IdleHeartbeat>) {
    match heartbeat {
        Some(heartbeat) => tokio::time::sleep(heartbeat.interval).await,
        None => std::future::pending().await,
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    heartbeat: Option<IdleHeartbeat>,
    connection: Connection,
) {
    loop {
        // The idle timer restarts on every iteration, so it only fires after
        // a full interval without writes.
        let frame = tokio::select! {
            biased;
            _ = connection.closed() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = idle(heartbeat.as_ref()) => match &heartbeat {
                Some(heartbeat) => {
                    trace!("Write idle on connection #{}, sending heartbeat", connection.id());
                    heartbeat.frame.clone()
                }
                None => continue,
            },
        };

        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            warn!("[CONNECTION_LIFECYCLE] Write to {} failed: {}", connection.peer_addr(), e);
            break;
        }
    }

    connection.close();
    let _ = writer.shutdown().await;
    debug!("[CONNECTION_LIFECYCLE] Writer for connection #{} ENDED", connection.id());
}

async fn read_loop(mut reader: OwnedReadHalf, handler: Arc<dyn EnvelopeHandler>, connection: Connection) {
    let mut buffer = BytesMut::with_capacity(8192);

    'read: loop {
        let read = tokio::select! {
            _ = connection.closed() => break,
            read = reader.read_buf(&mut buffer) => read,
        };

        match read {
            Ok(0) => {
                debug!("[CONNECTION_LIFECYCLE] Connection #{} closed by remote (EOF)", connection.id());
                break;
            }
            Ok(n) => {
                trace!("Read {} bytes from {} (buffer now {} bytes)", n, connection.peer_addr(), buffer.len());

                // Process any complete frames in the buffer
                loop {
                    match codec::decode(&mut buffer) {
                        Ok(Some(envelope)) => handler.on_envelope(envelope, &connection),
                        Ok(None) => break,
                        Err(e) => {
                            error!(
                                "[CONNECTION_LIFECYCLE] Closing connection #{} with {}: {}",
                                connection.id(),
                                connection.peer_addr(),
                                e
                            );
                            break 'read;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("[CONNECTION_LIFECYCLE] Error reading from {}: {}", connection.peer_addr(), e);
                break;
            }
        }
    }

    connection.close();
    debug!("[CONNECTION_LIFECYCLE] CLOSED connection #{} with {}", connection.id(), connection.peer_addr());
}
