use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::channel_manager::ChannelManager;
use crate::config::MuConfig;
use crate::connection::{Connection, EnvelopeHandler, Heartbeat};
use crate::connection_manager::ConnectionManager;
use crate::dispatch::{Actor, HandlerTable};
use crate::error::{MuError, Result};
use crate::inbound::MessageHandler;
use crate::protocol::{Address, ServerType};
use crate::transport::MuTransporter;

/// One Mu endpoint: listener, registries, handler table and transporter.
///
/// Both roles listen. A worker additionally attaches heartbeats to the
/// connections it dials so that servers can reach it over those connections.
#[derive(Debug)]
pub struct MuSystem {
    config: MuConfig,
    local_address: Address,
    handlers: Arc<HandlerTable>,
    transporter: MuTransporter,
    inbound: Arc<DashMap<u64, Connection>>,
    server_handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MuSystem {
    /// Bind the listener and start accepting connections.
    ///
    /// # Errors
    /// Returns `MuError::InvalidConfig` for a config that fails
    /// [`MuConfig::validate`], and `MuError::Connection` if the bind address
    /// is not available.
    pub async fn init(config: MuConfig) -> Result<Self> {
        config.validate()?;
        let bind_address = config.bind_address.clone();
        let listener = TcpListener::bind((bind_address.host.as_str(), bind_address.port))
            .await
            .map_err(|e| {
                MuError::Connection(std::io::Error::new(
                    e.kind(),
                    format!("Failed to bind MuSystem to [{}]: {}", bind_address, e),
                ))
            })?;

        let bound_port = listener.local_addr()?.port();
        let local_address = config
            .external_address
            .clone()
            .unwrap_or_else(|| Address::new(bind_address.host.clone(), bound_port));
        info!(
            "MuSystem ({}) listening on {}:{}, advertised as {}",
            config.server_type, bind_address.host, bound_port, local_address
        );

        let handlers = Arc::new(HandlerTable::new());
        let channels = Arc::new(ChannelManager::new());
        let message_handler: Arc<dyn EnvelopeHandler> = Arc::new(MessageHandler::new(
            config.server_type,
            handlers.clone(),
            channels.clone(),
        ));

        let heartbeat = match config.server_type {
            ServerType::Worker => Some(Heartbeat {
                address: local_address.clone(),
                interval: config.heartbeat_interval,
            }),
            ServerType::Server => None,
        };
        let connections = Arc::new(ConnectionManager::new(
            message_handler.clone(),
            heartbeat,
            config.connect_timeout,
        ));
        let transporter = MuTransporter::new(config.server_type, connections, channels, config.ask_timeout);

        let inbound = Arc::new(DashMap::new());
        let server_handle = tokio::spawn(run_server(listener, message_handler, inbound.clone()));

        Ok(Self {
            config,
            local_address,
            handlers,
            transporter,
            inbound,
            server_handle: Mutex::new(Some(server_handle)),
            closed: AtomicBool::new(false),
        })
    }

    /// Register the handlers of every actor
    pub fn bind_handlers(&self, actors: impl IntoIterator<Item = Actor>) {
        for actor in actors {
            debug!("Binding actor {}", actor.root_path());
            self.handlers.bind(actor);
        }
    }

    pub fn transporter(&self) -> &MuTransporter {
        &self.transporter
    }

    /// Address peers reach this endpoint at
    pub fn local_address(&self) -> &Address {
        &self.local_address
    }

    pub fn server_type(&self) -> ServerType {
        self.config.server_type
    }

    pub fn config(&self) -> &MuConfig {
        &self.config
    }

    /// Number of accepted connections still open
    pub fn inbound_connections(&self) -> usize {
        self.inbound.len()
    }

    /// Stop listening and release every connection.
    ///
    /// Pending asks fail with [`MuError::Shutdown`]. Calling this again has no effect.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("MuSystem already closed, ignoring duplicate close call");
            return;
        }

        info!("Closing MuSystem {} ({})", self.local_address, self.config.server_type);
        if let Some(handle) = self.server_handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        self.transporter.shutdown();

        let ids: Vec<u64> = self.inbound.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, connection)) = self.inbound.remove(&id) {
                connection.close();
            }
        }
        info!("MuSystem {} closed", self.local_address);
    }
}

async fn run_server(listener: TcpListener, handler: Arc<dyn EnvelopeHandler>, inbound: Arc<DashMap<u64, Connection>>) {
    debug!("Starting TCP server for incoming connections");

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Typically descriptor exhaustion; back off instead of spinning
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let connection = match Connection::spawn(stream, handler.clone(), None) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("[CONNECTION_LIFECYCLE] Cannot set up connection from {}: {}", addr, e);
                continue;
            }
        };
        debug!("[CONNECTION_LIFECYCLE] Accepted connection #{} from {}", connection.id(), addr);

        let id = connection.id();
        inbound.insert(id, connection.clone());
        let inbound = inbound.clone();
        tokio::spawn(async move {
            connection.closed().await;
            inbound.remove(&id);
        });
    }
}
