//! Lazily dialed, pooled outbound connections.
//!
//! At most one dial per peer is in flight: concurrent callers for the same
//! peer subscribe to the same dial state and observe the same connection or
//! the same failure. The dial itself runs in its own task so it completes
//! even if every caller gives up.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::{Connection, EnvelopeHandler, Heartbeat};
use crate::error::{MuError, Result};
use crate::protocol::Address;

enum DialState {
    Pending,
    Ready(Connection),
    Failed(String),
    Closed,
}

impl DialState {
    fn outcome(&self, key: &str) -> Result<Connection> {
        match self {
            DialState::Ready(connection) => Ok(connection.clone()),
            DialState::Failed(reason) => Err(MuError::Dial {
                address: key.to_string(),
                reason: reason.clone(),
            }),
            DialState::Pending | DialState::Closed => Err(MuError::ManagerClosing),
        }
    }
}

pub struct ConnectionManager {
    connections: Arc<DashMap<String, Connection>>,
    pending_dials: DashMap<String, Arc<watch::Sender<DialState>>>,
    handler: Arc<dyn EnvelopeHandler>,
    heartbeat: Option<Heartbeat>,
    connect_timeout: Duration,
    closing: AtomicBool,
}

impl ConnectionManager {
    /// `heartbeat` is attached to every connection this manager dials
    pub fn new(handler: Arc<dyn EnvelopeHandler>, heartbeat: Option<Heartbeat>, connect_timeout: Duration) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            pending_dials: DashMap::new(),
            handler,
            heartbeat,
            connect_timeout,
            closing: AtomicBool::new(false),
        }
    }

    /// Pooled connection to `address`, dialing it first if needed
    pub async fn get_or_create(self: &Arc<Self>, address: &Address) -> Result<Connection> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(MuError::ManagerClosing);
        }

        let key = address.key();
        if let Some(connection) = self.pooled(&key) {
            return Ok(connection);
        }

        let mut state = match self.pending_dials.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!("Joining in-flight dial to {}", key);
                entry.get().subscribe()
            }
            Entry::Vacant(entry) => {
                // A dial may have completed between the pool lookup and taking the entry
                if let Some(connection) = self.pooled(&key) {
                    return Ok(connection);
                }
                let (sender, receiver) = watch::channel(DialState::Pending);
                let sender = Arc::new(sender);
                entry.insert(sender.clone());
                tokio::spawn(self.clone().dial(key.clone(), address.clone(), sender));
                receiver
            }
        };

        let outcome = match state.wait_for(|state| !matches!(state, DialState::Pending)).await {
            Ok(state) => state.outcome(&key),
            Err(_) => Err(MuError::ManagerClosing),
        };
        outcome
    }

    fn pooled(&self, key: &str) -> Option<Connection> {
        self.connections
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(Connection::is_active)
    }

    async fn dial(self: Arc<Self>, key: String, address: Address, state: Arc<watch::Sender<DialState>>) {
        debug!("[CONNECTION_LIFECYCLE] Dialing {}", key);

        let next = match self.connect(&address).await {
            Ok(connection) => {
                self.connections.insert(key.clone(), connection.clone());
                if self.closing.load(Ordering::SeqCst) {
                    self.connections.remove_if(&key, |_, pooled| pooled.id() == connection.id());
                    connection.close();
                    DialState::Closed
                } else {
                    info!("[CONNECTION_LIFECYCLE] Connected to {} (connection #{})", key, connection.id());
                    self.evict_on_close(key.clone(), &connection);
                    DialState::Ready(connection)
                }
            }
            Err(e) => {
                warn!("[CONNECTION_LIFECYCLE] Failed to connect to {}: {}", key, e);
                match e {
                    MuError::Dial { reason, .. } => DialState::Failed(reason),
                    other => DialState::Failed(other.to_string()),
                }
            }
        };

        // Pool first, then drop the pending entry, so a caller always finds one of the two
        self.pending_dials.remove_if(&key, |_, pending| Arc::ptr_eq(pending, &state));
        state.send_replace(next);
    }

    async fn connect(&self, address: &Address) -> Result<Connection> {
        let dial_error = |reason: String| MuError::Dial {
            address: address.key(),
            reason,
        };

        let stream = tokio::time::timeout(self.connect_timeout, open_stream(address))
            .await
            .map_err(|_| dial_error(format!("connect timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| dial_error(e.to_string()))?;

        Connection::spawn(stream, self.handler.clone(), self.heartbeat.clone())
    }

    fn evict_on_close(&self, key: String, connection: &Connection) {
        let connections = self.connections.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            connection.closed().await;
            let id = connection.id();
            if connections.remove_if(&key, |_, pooled| pooled.id() == id).is_some() {
                debug!("[CONNECTION_LIFECYCLE] Evicted pooled connection #{} to {}", id, key);
            }
        });
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close every pooled connection and fail every in-flight dial.
    /// The manager refuses new dials afterwards.
    pub fn close_all(&self) {
        self.closing.store(true, Ordering::SeqCst);

        let dials: Vec<String> = self.pending_dials.iter().map(|entry| entry.key().clone()).collect();
        for key in dials {
            if let Some((_, state)) = self.pending_dials.remove(&key) {
                state.send_replace(DialState::Closed);
            }
        }

        let keys: Vec<String> = self.connections.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, connection)) = self.connections.remove(&key) {
                connection.close();
            }
        }
    }
}

/// Outbound socket with SO_KEEPALIVE on, so a dead link is noticed between heartbeats
fn keepalive_socket(addr: &SocketAddr) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    Ok(socket)
}

/// Try every resolved address of `address` in turn
async fn open_stream(address: &Address) -> io::Result<TcpStream> {
    let mut last_error = None;
    for addr in lookup_host((address.host.as_str(), address.port)).await? {
        let connected = match keepalive_socket(&addr) {
            Ok(socket) => socket.connect(addr).await,
            Err(e) => Err(e),
        };
        match connected {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address resolved for {}", address))
    }))
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections.len())
            .field("pending_dials", &self.pending_dials.len())
            .field("heartbeat", &self.heartbeat)
            .field("closing", &self.closing.load(Ordering::SeqCst))
            .finish()
    }
}
