//! # mu-remote
//!
//! The Mu transport: TCP messaging between a scheduling server and its workers.
//!
//! Workers dial servers and keep the connection registered with periodic
//! heartbeats, which lets a server push messages to a worker over that same
//! connection without ever dialing the worker. Servers dial each other
//! directly.
//!
//! ## Features
//!
//! - Length-prefixed protobuf frames with JSON application payloads
//! - `tell` (fire-and-forget) and `ask` (request/response with timeout)
//! - Path based handler dispatch
//! - Lazy, de-duplicated outbound connections and reverse channels
//!
//! ## Logging
//!
//! This library uses the `tracing` crate for logging. To see log output,
//! initialize a tracing subscriber in your application:
//!
//! ```rust
//! // For text output:
//! tracing_subscriber::fmt::init();
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mu_remote::{Actor, Address, Destination, HandlerLocation, MuConfig, MuSystem};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     tracing_subscriber::fmt::init();
//!
//!     let server = MuSystem::init(MuConfig::server("127.0.0.1:10010".parse()?)).await?;
//!     server.bind_handlers([Actor::new("server").handler("ping", |name: String| Ok(format!("pong, {}", name)))]);
//!
//!     let worker = MuSystem::init(MuConfig::worker("127.0.0.1:0".parse()?)).await?;
//!     let ping = Destination::server(server.local_address().clone(), HandlerLocation::new("server", "ping"));
//!     let reply: String = worker.transporter().ask(&ping, "worker-1").await?;
//!     println!("{}", reply);
//!
//!     worker.close().await;
//!     server.close().await;
//!     Ok(())
//! }
//! ```

pub mod channel_manager;
pub mod codec;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod dispatch;
pub mod error;
pub mod inbound;
pub mod mu_protobuf;
pub mod protobuf_conversions;
pub mod protocol;
pub mod system;
pub mod transport;


pub use config::MuConfig;
pub use dispatch::{Actor, Dispatch, Handler, HandlerError, HandlerTable};
pub use error::{MuError, Result};
pub use protocol::{Address, Destination, Envelope, HandlerLocation, MessageKind, ServerType, PROTOCOL};
pub use system::MuSystem;
pub use transport::MuTransporter;
