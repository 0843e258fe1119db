//! Out-of-band callbacks.
//!
//! The service may ask the client to decide something mid-session. Each callback
//! kind has its own payload type with server-provided inputs and one output field
//! the handler fills in. The handler receives `&mut` access to the payload; the
//! result travels back to the service in a callback reply frame.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Export is being initialized; the handler decides whether to keep it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInitialization {
    pub export: String,
    pub rva: u64,
    /// Output: keep the export in the mutated image
    pub keep: bool,
}

/// Export value is about to be remapped; the handler may substitute the value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRemap {
    pub export: String,
    pub original: u64,
    /// Output: value to use, defaults to `original`
    pub remapped: u64,
}

/// The account subscription is about to expire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionExpiration {
    /// Unix timestamp (seconds) of expiry
    pub expires_at: u64,
    /// Output: client has seen the notice
    pub acknowledged: bool,
}

/// Callback kinds; one handler per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    ExportInitialization,
    ExportRemap,
    SubscriptionExpiration,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallbackKind::ExportInitialization => "export_initialization",
            CallbackKind::ExportRemap => "export_remap",
            CallbackKind::SubscriptionExpiration => "subscription_expiration",
        };
        f.write_str(name)
    }
}

/// Tagged callback payload as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackPayload {
    ExportInitialization(ExportInitialization),
    ExportRemap(ExportRemap),
    SubscriptionExpiration(SubscriptionExpiration),
}

impl CallbackPayload {
    pub fn kind(&self) -> CallbackKind {
        match self {
            CallbackPayload::ExportInitialization(_) => CallbackKind::ExportInitialization,
            CallbackPayload::ExportRemap(_) => CallbackKind::ExportRemap,
            CallbackPayload::SubscriptionExpiration(_) => CallbackKind::SubscriptionExpiration,
        }
    }
}

type Handler<T> = Box<dyn Fn(u32, &mut T) + Send + Sync + 'static>;

/// A handler bound to exactly one callback kind. The closure receives the
/// session id and the kind's payload.
pub enum CallbackHandler {
    ExportInitialization(Handler<ExportInitialization>),
    ExportRemap(Handler<ExportRemap>),
    SubscriptionExpiration(Handler<SubscriptionExpiration>),
}

impl CallbackHandler {
    pub fn export_initialization<F>(f: F) -> Self
    where
        F: Fn(u32, &mut ExportInitialization) + Send + Sync + 'static,
    {
        CallbackHandler::ExportInitialization(Box::new(f))
    }

    pub fn export_remap<F>(f: F) -> Self
    where
        F: Fn(u32, &mut ExportRemap) + Send + Sync + 'static,
    {
        CallbackHandler::ExportRemap(Box::new(f))
    }

    pub fn subscription_expiration<F>(f: F) -> Self
    where
        F: Fn(u32, &mut SubscriptionExpiration) + Send + Sync + 'static,
    {
        CallbackHandler::SubscriptionExpiration(Box::new(f))
    }

    pub fn kind(&self) -> CallbackKind {
        match self {
            CallbackHandler::ExportInitialization(_) => CallbackKind::ExportInitialization,
            CallbackHandler::ExportRemap(_) => CallbackKind::ExportRemap,
            CallbackHandler::SubscriptionExpiration(_) => CallbackKind::SubscriptionExpiration,
        }
    }

    /// Run against a payload of the same kind; false if the kinds differ
    pub fn apply(&self, session_id: u32, payload: &mut CallbackPayload) -> bool {
        match (self, payload) {
            (CallbackHandler::ExportInitialization(f), CallbackPayload::ExportInitialization(p)) => {
                f(session_id, p)
            }
            (CallbackHandler::ExportRemap(f), CallbackPayload::ExportRemap(p)) => f(session_id, p),
            (
                CallbackHandler::SubscriptionExpiration(f),
                CallbackPayload::SubscriptionExpiration(p),
            ) => f(session_id, p),
            _ => return false,
        }
        true
    }
}

impl fmt::Debug for CallbackHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallbackHandler").field(&self.kind()).finish()
    }
}

/// Registry keyed by callback kind
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    handlers: HashMap<CallbackKind, Arc<CallbackHandler>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler, returning the one it replaced
    pub fn register(&mut self, handler: CallbackHandler) -> Option<Arc<CallbackHandler>> {
        self.handlers.insert(handler.kind(), Arc::new(handler))
    }

    pub fn unregister(&mut self, kind: CallbackKind) -> Option<Arc<CallbackHandler>> {
        self.handlers.remove(&kind)
    }

    pub fn contains(&self, kind: CallbackKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Shared handle to the handler for `kind`, so it can run outside any lock
    pub fn handler(&self, kind: CallbackKind) -> Option<Arc<CallbackHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Run the handler for the payload's kind. Returns false when none is
    /// registered, leaving the payload untouched.
    pub fn invoke(&self, session_id: u32, payload: &mut CallbackPayload) -> bool {
        match self.handlers.get(&payload.kind()) {
            Some(handler) => handler.apply(session_id, payload),
            None => false,
        }
    }
}
