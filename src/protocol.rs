use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

use crate::error::{MuError, Result};

/// Protocol name used for pluggable-protocol selection upstream
pub const PROTOCOL: &str = "MU";

/// Network address of a peer (`host:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Identity key used by every registry (`"host:port"`)
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = MuError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| MuError::InvalidAddress(format!("Port number not specified: {}", s)))?;

        if host.is_empty() {
            return Err(MuError::InvalidAddress(format!("Empty host name: {}", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| MuError::InvalidAddress(format!("Invalid port: {}", port)))?;

        Ok(Address::new(host, port))
    }
}

impl From<std::net::SocketAddr> for Address {
    fn from(addr: std::net::SocketAddr) -> Self {
        Address::new(addr.ip().to_string(), addr.port())
    }
}

/// Role of a process in the scheduling cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerType {
    Server,
    Worker,
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerType::Server => write!(f, "SERVER"),
            ServerType::Worker => write!(f, "WORKER"),
        }
    }
}

/// Location of a handler inside a process: actor root path + handler path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerLocation {
    pub root_path: String,
    pub method_path: String,
}

impl HandlerLocation {
    pub fn new(root_path: impl Into<String>, method_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            method_path: method_path.into(),
        }
    }

    /// Path string a handler is registered and addressed under (`root/method`)
    pub fn to_path(&self) -> String {
        let root = self.root_path.trim_matches('/');
        let method = self.method_path.trim_matches('/');
        match (root.is_empty(), method.is_empty()) {
            (true, _) => method.to_string(),
            (false, true) => root.to_string(),
            (false, false) => format!("{}/{}", root, method),
        }
    }
}

impl fmt::Display for HandlerLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_path())
    }
}

/// Logical target of an outbound message: which peer, which handler, which role the peer plays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub address: Address,
    pub location: HandlerLocation,
    pub server_type: ServerType,
}

impl Destination {
    pub fn new(address: Address, location: HandlerLocation, server_type: ServerType) -> Self {
        Self {
            address,
            location,
            server_type,
        }
    }

    /// Destination on a coordinator process
    pub fn server(address: Address, location: HandlerLocation) -> Self {
        Self::new(address, location, ServerType::Server)
    }

    /// Destination on a worker process
    pub fn worker(address: Address, location: HandlerLocation) -> Self {
        Self::new(address, location, ServerType::Worker)
    }

    pub fn path(&self) -> String {
        self.location.to_path()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "mu://{}/{} ({})", self.address, self.path(), self.server_type)
    }
}

/// Kind of an envelope on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Tell,
    Ask,
    Response,
    Heartbeat,
    Error,
}

/// The message unit exchanged over a Mu connection.
///
/// Each variant carries exactly the fields its kind allows, so an envelope
/// that violates the wire invariants cannot be constructed.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Fire-and-forget message for the handler at `path`
    Tell { path: String, payload: Option<Bytes> },
    /// Request expecting exactly one `Response` or `Error` with the same id
    Ask {
        request_id: String,
        path: String,
        payload: Option<Bytes>,
    },
    /// Successful answer to an `Ask`
    Response {
        request_id: String,
        payload: Option<Bytes>,
    },
    /// Keep-alive carrying the sender's externally reachable address
    Heartbeat { sender_address: Option<Address> },
    /// Failed answer to an `Ask`, or an unsolicited error when `request_id` is absent
    Error {
        request_id: Option<String>,
        message: String,
    },
}

impl Envelope {
    pub fn tell(path: impl Into<String>, payload: Option<Bytes>) -> Self {
        Envelope::Tell {
            path: path.into(),
            payload,
        }
    }

    pub fn ask(request_id: impl Into<String>, path: impl Into<String>, payload: Option<Bytes>) -> Self {
        Envelope::Ask {
            request_id: request_id.into(),
            path: path.into(),
            payload,
        }
    }

    pub fn response(request_id: impl Into<String>, payload: Option<Bytes>) -> Self {
        Envelope::Response {
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn heartbeat(sender_address: Address) -> Self {
        Envelope::Heartbeat {
            sender_address: Some(sender_address),
        }
    }

    pub fn error(request_id: Option<String>, message: impl Into<String>) -> Self {
        Envelope::Error {
            request_id,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::Tell { .. } => MessageKind::Tell,
            Envelope::Ask { .. } => MessageKind::Ask,
            Envelope::Response { .. } => MessageKind::Response,
            Envelope::Heartbeat { .. } => MessageKind::Heartbeat,
            Envelope::Error { .. } => MessageKind::Error,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Envelope::Ask { request_id, .. } | Envelope::Response { request_id, .. } => Some(request_id),
            Envelope::Error { request_id, .. } => request_id.as_deref(),
            Envelope::Tell { .. } | Envelope::Heartbeat { .. } => None,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Envelope::Tell { path, .. } | Envelope::Ask { path, .. } => Some(path),
            _ => None,
        }
    }
}
