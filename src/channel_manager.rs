//! Channel registry: reverse channels to workers and pending `ask` slots.
//!
//! Both maps are only touched through single-entry atomic operations. A
//! pending request is completed by whoever removes it first, which makes the
//! removal the one arbitration point between a reply and a timeout.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{MuError, Result};
use crate::protocol::Address;

/// Reply slot handed to the `ask` that is waiting on it
pub type ReplyReceiver = oneshot::Receiver<Result<Option<Bytes>>>;

struct PendingRequest {
    reply: oneshot::Sender<Result<Option<Bytes>>>,
    expected: &'static str,
    /// `None` when the timeout reaches past what `Instant` can represent
    deadline: Option<Instant>,
}

#[derive(Default)]
pub struct ChannelManager {
    worker_channels: Arc<DashMap<String, Connection>>,
    pending_requests: DashMap<String, PendingRequest>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connection` the reverse channel for the worker at `address`.
    ///
    /// An entry holding the same connection is left alone. Otherwise the entry
    /// is replaced and removed again once `connection` closes, unless it was
    /// replaced by another connection in the meantime.
    pub fn register_worker_channel(&self, address: &Address, connection: &Connection) {
        let key = address.key();
        match self.worker_channels.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().id() == connection.id() {
                    return;
                }
                let previous = entry.insert(connection.clone());
                info!(
                    "Replaced worker channel for {}: connection #{} -> #{}",
                    key,
                    previous.id(),
                    connection.id()
                );
            }
            Entry::Vacant(entry) => {
                entry.insert(connection.clone());
                info!("Registered worker channel for {} (connection #{})", key, connection.id());
            }
        }

        let channels = self.worker_channels.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            connection.closed().await;
            let id = connection.id();
            if channels.remove_if(&key, |_, current| current.id() == id).is_some() {
                info!("Removed worker channel for {} (connection #{} closed)", key, id);
            }
        });
    }

    /// Live reverse channel for the worker at `address`, if any
    pub fn worker_channel(&self, address: &Address) -> Option<Connection> {
        self.worker_channels
            .get(&address.key())
            .map(|entry| entry.value().clone())
            .filter(Connection::is_active)
    }

    pub fn worker_channel_count(&self) -> usize {
        self.worker_channels.len()
    }

    /// Create the pending slot for a new `ask`
    pub fn register_pending(&self, request_id: impl Into<String>, expected: &'static str, timeout: Duration) -> ReplyReceiver {
        let (reply, receiver) = oneshot::channel();
        self.pending_requests.insert(
            request_id.into(),
            PendingRequest {
                reply,
                expected,
                deadline: Instant::now().checked_add(timeout),
            },
        );
        receiver
    }

    /// Complete a pending request with a reply payload.
    /// Returns `false` if no such request is pending (timed out, or a duplicate reply).
    pub fn complete_pending(&self, request_id: &str, payload: Option<Bytes>) -> bool {
        self.complete(request_id, Ok(payload))
    }

    /// Complete a pending request with a failure
    pub fn complete_pending_exceptionally(&self, request_id: &str, error: MuError) -> bool {
        self.complete(request_id, Err(error))
    }

    fn complete(&self, request_id: &str, outcome: Result<Option<Bytes>>) -> bool {
        match self.pending_requests.remove(request_id) {
            Some((_, pending)) => {
                match pending.deadline {
                    Some(deadline) => debug!(
                        "Completing request {} (expects {}, {:?} before deadline)",
                        request_id,
                        pending.expected,
                        deadline.saturating_duration_since(Instant::now())
                    ),
                    None => debug!("Completing request {} (expects {}, no deadline)", request_id, pending.expected),
                }
                // The asker may have gone away already; nothing else to do then
                let _ = pending.reply.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop a pending request without completing it.
    /// Returns `true` if this call removed it.
    pub fn remove_pending(&self, request_id: &str) -> bool {
        self.pending_requests.remove(request_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_requests.len()
    }

    /// Fail every pending request with [`MuError::Shutdown`]
    pub fn fail_all_pending(&self) {
        let request_ids: Vec<String> = self.pending_requests.iter().map(|entry| entry.key().clone()).collect();
        let failed = request_ids
            .iter()
            .filter(|request_id| self.complete_pending_exceptionally(request_id, MuError::Shutdown))
            .count();
        if failed > 0 {
            warn!("Failed {} pending request(s) on shutdown", failed);
        }
    }

    /// Close every registered reverse channel
    pub fn close_all(&self) {
        let keys: Vec<String> = self.worker_channels.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, connection)) = self.worker_channels.remove(&key) {
                connection.close();
            }
        }
    }
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("worker_channels", &self.worker_channels.len())
            .field("pending_requests", &self.pending_requests.len())
            .finish()
    }
}
