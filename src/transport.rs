use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::channel_manager::ChannelManager;
use crate::codec;
use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;
use crate::error::{MuError, Result};
use crate::protocol::{Destination, Envelope, ServerType, PROTOCOL};

/// Public send API of a Mu endpoint.
///
/// Routing depends on who sends to whom:
/// * a worker always goes through its connection manager (it is the dialing side);
/// * a server sending to a worker only uses the reverse channel that worker
///   registered with its heartbeats, and never dials;
/// * a server sending to another server dials like a worker would.
#[derive(Debug, Clone)]
pub struct MuTransporter {
    server_type: ServerType,
    connections: Arc<ConnectionManager>,
    channels: Arc<ChannelManager>,
    ask_timeout: Duration,
    runtime: Handle,
    shutdown_flag: Arc<AtomicBool>,
}

/// Removes the pending entry of an `ask` whose future is dropped before completion
struct PendingGuard<'a> {
    channels: &'a ChannelManager,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.channels.remove_pending(self.request_id) {
            trace!("Abandoned request {} removed", self.request_id);
        }
    }
}

impl MuTransporter {
    /// Must be called from within a tokio runtime; `tell` spawns onto it.
    pub(crate) fn new(
        server_type: ServerType,
        connections: Arc<ConnectionManager>,
        channels: Arc<ChannelManager>,
        ask_timeout: Duration,
    ) -> Self {
        Self {
            server_type,
            connections,
            channels,
            ask_timeout,
            runtime: Handle::current(),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Name of this transport for protocol selection
    pub fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// Timeout applied by [`MuTransporter::ask`]
    pub fn ask_timeout(&self) -> Duration {
        self.ask_timeout
    }

    /// Number of `ask`s currently waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.channels.pending_count()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    fn reverse_route(&self, destination: &Destination) -> bool {
        self.server_type == ServerType::Server && destination.server_type == ServerType::Worker
    }

    fn reverse_channel(&self, destination: &Destination) -> Result<Connection> {
        self.channels
            .worker_channel(&destination.address)
            .ok_or_else(|| MuError::NoActiveChannel(destination.address.key()))
    }

    async fn route(&self, destination: &Destination) -> Result<Connection> {
        if self.reverse_route(destination) {
            self.reverse_channel(destination)
        } else {
            self.connections.get_or_create(&destination.address).await
        }
    }

    /// Fire-and-forget send.
    ///
    /// Fails only for local reasons: the payload cannot be serialized or
    /// framed, or a server has no channel to the destination worker. Delivery
    /// problems after that point are logged and otherwise ignored.
    pub fn tell<T: Serialize + ?Sized>(&self, destination: &Destination, payload: &T) -> Result<()> {
        if self.is_shutdown() {
            return Err(MuError::Shutdown);
        }

        let payload = Bytes::from(serde_json::to_vec(payload)?);
        let frame = codec::encode(&Envelope::tell(destination.path(), Some(payload)))?;

        if self.reverse_route(destination) {
            return self.reverse_channel(destination)?.send_frame(frame);
        }

        let connections = self.connections.clone();
        let destination = destination.clone();
        self.runtime.spawn(async move {
            let sent = match connections.get_or_create(&destination.address).await {
                Ok(connection) => connection.send_frame(frame),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!("Tell operation --> {} failed: {}", destination, e);
            }
        });
        Ok(())
    }

    /// Request/response with the default timeout
    pub async fn ask<T, R>(&self, destination: &Destination, payload: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.ask_with_timeout(destination, payload, self.ask_timeout).await
    }

    /// Request/response with a specific timeout.
    ///
    /// The reply payload is decoded into `R`; an ERROR reply becomes
    /// [`MuError::Remote`]. A reply arriving after the timeout is dropped by
    /// the receiving side and the remote work is not cancelled.
    pub async fn ask_with_timeout<T, R>(&self, destination: &Destination, payload: &T, timeout_duration: Duration) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.is_shutdown() {
            return Err(MuError::Shutdown);
        }

        let payload = Bytes::from(serde_json::to_vec(payload)?);
        let request_id = Uuid::new_v4().to_string();
        let frame = codec::encode(&Envelope::ask(request_id.clone(), destination.path(), Some(payload)))?;

        let mut reply = self
            .channels
            .register_pending(request_id.clone(), std::any::type_name::<R>(), timeout_duration);
        let _guard = PendingGuard {
            channels: &self.channels,
            request_id: &request_id,
        };
        // close() may have failed the pending requests just before ours was registered
        if self.is_shutdown() {
            return Err(MuError::Shutdown);
        }

        debug!("Ask {} --> {}", request_id, destination);
        self.route(destination).await?.send_frame(frame)?;

        let outcome = match timeout(timeout_duration, &mut reply).await {
            Ok(outcome) => outcome,
            Err(_) => {
                if self.channels.remove_pending(&request_id) {
                    warn!("Ask {} --> {} timed out after {:?}", request_id, destination, timeout_duration);
                    return Err(MuError::Timeout(timeout_duration));
                }
                // A reply won the race against the timer
                reply.await
            }
        };

        let payload = outcome.map_err(|_| MuError::Shutdown)??;
        Ok(serde_json::from_slice(payload.as_deref().unwrap_or(b"null"))?)
    }

    /// Stop sending: pooled and registered connections are closed, pending
    /// dials fail with [`MuError::ManagerClosing`] and pending asks with
    /// [`MuError::Shutdown`]. Only the first call does anything.
    pub(crate) fn shutdown(&self) {
        if self
            .shutdown_flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("MuTransporter already shut down, ignoring duplicate shutdown call");
            return;
        }

        info!("Shutting down {} transporter ({})", PROTOCOL, self.server_type);
        self.connections.close_all();
        self.channels.close_all();
        self.channels.fail_all_pending();
    }
}
