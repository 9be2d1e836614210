//! Path based handler dispatch.
//!
//! Handlers are registered up front under a path string and looked up by
//! exact match when a TELL or ASK arrives. Each handler declares one payload
//! type; the raw payload is deserialized into it before the handler runs.

use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::protocol::HandlerLocation;

/// Error type returned by application handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of dispatching one payload
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Handler ran and produced a serialized result
    Found(Bytes),
    /// Handler ran but produced no result
    FoundButEmpty,
    /// No handler registered under the path
    NotFound,
    /// Payload could not be decoded, or the handler failed or panicked
    Failed(String),
}

/// A registered handler: decodes a raw payload and invokes the application code
pub trait Handler: Send + Sync + 'static {
    fn invoke(&self, payload: Option<&[u8]>) -> Dispatch;

    /// Name of the payload type this handler expects, for diagnostics
    fn payload_type(&self) -> &'static str;
}

/// Adapter turning a typed closure into a [`Handler`]
pub struct TypedHandler<T, R, F> {
    f: F,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R, F> TypedHandler<T, R, F>
where
    T: DeserializeOwned + 'static,
    R: Serialize + 'static,
    F: Fn(T) -> Result<R, HandlerError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<T, R, F> Handler for TypedHandler<T, R, F>
where
    T: DeserializeOwned + 'static,
    R: Serialize + 'static,
    F: Fn(T) -> Result<R, HandlerError> + Send + Sync + 'static,
{
    fn invoke(&self, payload: Option<&[u8]>) -> Dispatch {
        // An absent payload decodes as JSON null, which suits `()` and `Option<_>` handlers.
        let request: T = match serde_json::from_slice(payload.unwrap_or(b"null")) {
            Ok(request) => request,
            Err(e) => {
                return Dispatch::Failed(format!(
                    "Cannot decode payload as {}: {}",
                    std::any::type_name::<T>(),
                    e
                ))
            }
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| (self.f)(request))) {
            Ok(outcome) => outcome,
            Err(panic) => return Dispatch::Failed(format!("Handler panicked: {}", panic_message(&panic))),
        };

        match outcome {
            Ok(response) => match serde_json::to_vec(&response) {
                // `()` and `None` both serialize to null: the handler returned nothing.
                Ok(bytes) if bytes == b"null" => Dispatch::FoundButEmpty,
                Ok(bytes) => Dispatch::Found(Bytes::from(bytes)),
                Err(e) => Dispatch::Failed(format!("Cannot encode handler result: {}", e)),
            },
            Err(e) => Dispatch::Failed(e.to_string()),
        }
    }

    fn payload_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A named group of handlers sharing one root path
pub struct Actor {
    root_path: String,
    handlers: Vec<(HandlerLocation, Arc<dyn Handler>)>,
}

impl Actor {
    pub fn new(root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            handlers: Vec::new(),
        }
    }

    /// Add a handler reachable at `<root>/<name>`
    pub fn handler<T, R, F>(self, name: impl Into<String>, f: F) -> Self
    where
        T: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(T) -> Result<R, HandlerError> + Send + Sync + 'static,
    {
        self.raw_handler(name, TypedHandler::new(f))
    }

    /// Add an already constructed [`Handler`]
    pub fn raw_handler(mut self, name: impl Into<String>, handler: impl Handler) -> Self {
        let location = HandlerLocation::new(self.root_path.clone(), name);
        self.handlers.push((location, Arc::new(handler)));
        self
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn locations(&self) -> impl Iterator<Item = &HandlerLocation> {
        self.handlers.iter().map(|(location, _)| location)
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Actor")
            .field("root_path", &self.root_path)
            .field("handlers", &self.locations().map(|l| l.to_path()).collect::<Vec<_>>())
            .finish()
    }
}

/// Path -> handler table shared by every connection of a process
#[derive(Default)]
pub struct HandlerTable {
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `path`, replacing any previous registration
    pub fn register(&self, path: impl Into<String>, handler: Arc<dyn Handler>) {
        let path = path.into();
        info!("Bound handler: {} ({})", path, handler.payload_type());
        if self.handlers.insert(path.clone(), handler).is_some() {
            warn!("Handler for path {} was replaced", path);
        }
    }

    /// Register every handler of an actor
    pub fn bind(&self, actor: Actor) {
        for (location, handler) in actor.handlers {
            self.register(location.to_path(), handler);
        }
    }

    pub fn dispatch(&self, path: &str, payload: Option<&[u8]>) -> Dispatch {
        // Clone the handler out so no map shard stays locked while it runs
        let handler = match self.handlers.get(path) {
            Some(entry) => entry.value().clone(),
            None => return Dispatch::NotFound,
        };

        debug!("Dispatching to handler {}", path);
        handler.invoke(payload)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.handlers.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HandlerTable").field("handlers", &self.handlers.len()).finish()
    }
}
