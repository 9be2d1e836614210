//! Inbound envelope processing, shared by both roles.
//!
//! The only role-specific step is HEARTBEAT handling: a server registers the
//! sending worker's reverse channel, a worker just notes the heartbeat.

use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::channel_manager::ChannelManager;
use crate::connection::{Connection, EnvelopeHandler};
use crate::dispatch::{Dispatch, HandlerTable};
use crate::error::MuError;
use crate::protocol::{Address, Envelope, ServerType};

#[derive(Debug)]
pub struct MessageHandler {
    server_type: ServerType,
    handlers: Arc<HandlerTable>,
    channels: Arc<ChannelManager>,
}

impl MessageHandler {
    pub fn new(server_type: ServerType, handlers: Arc<HandlerTable>, channels: Arc<ChannelManager>) -> Self {
        Self {
            server_type,
            handlers,
            channels,
        }
    }

    fn on_heartbeat(&self, sender_address: Option<Address>, connection: &Connection) {
        match (self.server_type, sender_address) {
            (ServerType::Server, Some(address)) => {
                self.channels.register_worker_channel(&address, connection);
            }
            (ServerType::Server, None) => {
                debug!("Heartbeat without sender address from {}", connection.peer_addr());
            }
            (ServerType::Worker, address) => {
                debug!("Received heartbeat from {} ({:?})", connection.peer_addr(), address);
            }
        }
    }

    fn on_tell(&self, path: &str, payload: Option<&[u8]>) {
        match self.handlers.dispatch(path, payload) {
            Dispatch::Found(_) | Dispatch::FoundButEmpty => {}
            Dispatch::NotFound => warn!("No handler found for path: {}, dropping TELL", path),
            Dispatch::Failed(e) => warn!("Handler for {} failed on TELL: {}", path, e),
        }
    }

    fn on_ask(&self, request_id: String, path: &str, payload: Option<&[u8]>, connection: &Connection) {
        let reply = match self.handlers.dispatch(path, payload) {
            Dispatch::Found(result) => Envelope::response(request_id.clone(), Some(result)),
            Dispatch::FoundButEmpty => Envelope::error(Some(request_id.clone()), "Handler returned no result"),
            Dispatch::NotFound => {
                warn!("No handler found for path: {}, answering ASK {} with an error", path, request_id);
                Envelope::error(Some(request_id.clone()), format!("No handler found for path: {}", path))
            }
            Dispatch::Failed(e) => Envelope::error(Some(request_id.clone()), format!("Handler failed: {}", e)),
        };

        match connection.send(&reply) {
            Ok(()) => {}
            // The reply itself could not be framed; tell the asker instead of leaving it to time out
            Err(e @ (MuError::Framing(_) | MuError::Protocol(_))) => {
                error!("Cannot send reply to ASK {} on {}: {}", request_id, path, e);
                let fallback = Envelope::error(Some(request_id), format!("Internal error: {}", e));
                if let Err(e) = connection.send(&fallback) {
                    warn!("Cannot send error reply to {}: {}", connection.peer_addr(), e);
                }
            }
            Err(e) => warn!("Cannot send reply to ASK {} to {}: {}", request_id, connection.peer_addr(), e),
        }
    }
}

impl EnvelopeHandler for MessageHandler {
    fn on_envelope(&self, envelope: Envelope, connection: &Connection) {
        match envelope {
            Envelope::Heartbeat { sender_address } => self.on_heartbeat(sender_address, connection),
            Envelope::Tell { path, payload } => self.on_tell(&path, payload.as_deref()),
            Envelope::Ask {
                request_id,
                path,
                payload,
            } => self.on_ask(request_id, &path, payload.as_deref(), connection),
            Envelope::Response { request_id, payload } => {
                if !self.channels.complete_pending(&request_id, payload) {
                    warn!("No pending request for response {}, dropping it", request_id);
                }
            }
            Envelope::Error {
                request_id: Some(request_id),
                message,
            } => {
                if !self.channels.complete_pending_exceptionally(&request_id, MuError::Remote(message)) {
                    warn!("No pending request for error reply {}, dropping it", request_id);
                }
            }
            Envelope::Error {
                request_id: None,
                message,
            } => warn!("Unsolicited error from {}: {}", connection.peer_addr(), message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::dispatch::{Actor, HandlerError};
    use bytes::{Bytes, BytesMut};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    struct Fixture {
        handler: MessageHandler,
        channels: Arc<ChannelManager>,
        connection: Connection,
        peer: TcpStream,
        buffer: BytesMut,
        tells: Arc<AtomicUsize>,
    }

    impl Fixture {
        async fn new(server_type: ServerType) -> Self {
            let tells = Arc::new(AtomicUsize::new(0));
            let tells_clone = tells.clone();
            let handlers = Arc::new(HandlerTable::new());
            handlers.bind(
                Actor::new("job")
                    .handler("double", |n: u64| Ok(n * 2))
                    .handler("run", move |_: String| {
                        tells_clone.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .handler("fail", |_: ()| -> Result<u64, HandlerError> { Err("disk full".into()) }),
            );
            let channels = Arc::new(ChannelManager::new());

            // The connection's own reader is unused here; envelopes are fed in directly
            struct Ignore;
            impl EnvelopeHandler for Ignore {
                fn on_envelope(&self, _envelope: Envelope, _connection: &Connection) {}
            }
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
            let (peer, _) = listener.accept().await.unwrap();
            let connection = Connection::spawn(stream, Arc::new(Ignore), None).unwrap();

            Fixture {
                handler: MessageHandler::new(server_type, handlers, channels.clone()),
                channels,
                connection,
                peer,
                buffer: BytesMut::new(),
                tells,
            }
        }

        fn feed(&self, envelope: Envelope) {
            self.handler.on_envelope(envelope, &self.connection);
        }

        async fn reply(&mut self) -> Envelope {
            let (peer, buffer) = (&mut self.peer, &mut self.buffer);
            timeout(Duration::from_secs(5), async {
                loop {
                    if let Some(envelope) = codec::decode(buffer).unwrap() {
                        return envelope;
                    }
                    assert!(peer.read_buf(buffer).await.unwrap() > 0);
                }
            })
            .await
            .expect("no reply written")
        }
    }

    #[tokio::test]
    async fn test_ask_found_replies_with_response() {
        let mut fixture = Fixture::new(ServerType::Worker).await;
        fixture.feed(Envelope::ask("q1", "job/double", Some(Bytes::from_static(b"21"))));

        assert_eq!(
            fixture.reply().await,
            Envelope::response("q1", Some(Bytes::from_static(b"42")))
        );
    }

    #[tokio::test]
    async fn test_ask_error_replies() {
        let mut fixture = Fixture::new(ServerType::Server).await;

        fixture.feed(Envelope::ask("q2", "job/missing", None));
        assert_eq!(
            fixture.reply().await,
            Envelope::error(Some("q2".to_string()), "No handler found for path: job/missing")
        );

        fixture.feed(Envelope::ask("q3", "job/run", Some(Bytes::from_static(br#""x""#))));
        assert_eq!(
            fixture.reply().await,
            Envelope::error(Some("q3".to_string()), "Handler returned no result")
        );

        fixture.feed(Envelope::ask("q4", "job/fail", None));
        assert_eq!(
            fixture.reply().await,
            Envelope::error(Some("q4".to_string()), "Handler failed: disk full")
        );

        fixture.feed(Envelope::ask("q5", "job/double", Some(Bytes::from_static(b"\"nan\""))));
        match fixture.reply().await {
            Envelope::Error {
                request_id: Some(id),
                message,
            } => {
                assert_eq!(id, "q5");
                assert!(message.starts_with("Handler failed: Cannot decode payload"), "{}", message);
            }
            other => panic!("Expected an error reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tell_dispatches_without_reply() {
        let mut fixture = Fixture::new(ServerType::Worker).await;
        fixture.feed(Envelope::tell("job/run", Some(Bytes::from_static(br#""go""#))));
        fixture.feed(Envelope::tell("job/fail", None));

        assert_eq!(fixture.tells.load(Ordering::SeqCst), 1);

        // Nothing was written for either TELL
        let mut buf = [0u8; 1];
        assert!(timeout(Duration::from_millis(100), fixture.peer.read(&mut buf)).await.is_err());
    }

    #[tokio::test]
    async fn test_replies_complete_pending_requests() {
        let fixture = Fixture::new(ServerType::Worker).await;
        let ok = fixture.channels.register_pending("p1", "u64", Duration::from_secs(30));
        let failed = fixture.channels.register_pending("p2", "u64", Duration::from_secs(30));

        fixture.feed(Envelope::response("p1", Some(Bytes::from_static(b"7"))));
        fixture.feed(Envelope::error(Some("p2".to_string()), "No handler found for path: x"));
        // Late duplicates and unsolicited errors are dropped
        fixture.feed(Envelope::response("p1", None));
        fixture.feed(Envelope::error(None, "whatever"));

        assert_eq!(ok.await.unwrap().unwrap(), Some(Bytes::from_static(b"7")));
        assert!(matches!(failed.await.unwrap(), Err(MuError::Remote(ref m)) if m.contains("No handler found")));
        assert_eq!(fixture.channels.pending_count(), 0);
        assert!(fixture.connection.is_active());
    }

    #[tokio::test]
    async fn test_heartbeat_registers_channel_only_on_server() {
        let worker_address = Address::new("10.9.8.7", 27777);

        let server = Fixture::new(ServerType::Server).await;
        server.feed(Envelope::heartbeat(worker_address.clone()));
        assert_eq!(
            server.channels.worker_channel(&worker_address).map(|c| c.id()),
            Some(server.connection.id())
        );

        let worker = Fixture::new(ServerType::Worker).await;
        worker.feed(Envelope::heartbeat(worker_address.clone()));
        assert!(worker.channels.worker_channel(&worker_address).is_none());
    }

    #[tokio::test]
    async fn test_dropped_tell_is_logged() {
        //<editor-fold desc="Log capturing preparations">
        use regex::Regex;
        use std::sync::mpsc;
        use std::sync::Mutex;

        let (log_sender, log_receiver) = mpsc::channel::<String>();
        let log_sender = Arc::new(Mutex::new(log_sender));

        struct LogCapture {
            sender: Arc<Mutex<mpsc::Sender<String>>>,
        }

        impl std::io::Write for LogCapture {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                let text = String::from_utf8_lossy(buf).to_string();
                if let Ok(sender) = self.sender.lock() {
                    let _ = sender.send(text);
                }
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || LogCapture { sender: log_sender.clone() })
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);
        //</editor-fold>

        let fixture = Fixture::new(ServerType::Worker).await;
        fixture.feed(Envelope::tell("job/unknown", None));
        fixture.feed(Envelope::tell("job/fail", None));

        let mut all_logs = Vec::<String>::new();
        while let Ok(line) = log_receiver.try_recv() {
            all_logs.push(line);
        }

        assert_eq!(2, all_logs.len(), "Log lines: {:?}", all_logs);
        let unknown = Regex::new(r"^\S+\s+WARN mu_remote::inbound: No handler found for path: job/unknown, dropping TELL").unwrap();
        let failed = Regex::new(r"^\S+\s+WARN mu_remote::inbound: Handler for job/fail failed on TELL: disk full").unwrap();
        assert!(unknown.is_match(&all_logs[0]), "Log lines: {:?}", all_logs);
        assert!(failed.is_match(&all_logs[1]), "Log lines: {:?}", all_logs);
    }
}
