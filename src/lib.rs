//! # mutator-client
//!
//! Blocking session client for the remote binary mutator service.
//!
//! The client keeps one WebSocket connection per [`Client`], speaks a compact
//! `[type byte][bincode payload]` protocol over it, and exposes the service as a
//! short sequence of calls: authenticate, initialize with settings and inputs,
//! create sessions, request mutations. Results for sessions arrive as pushes
//! delivered to handlers installed on the client.
//!
//! ## Modules
//! - [`core`]: frame codec and payload serialization
//! - [`protocol`]: messages, settings, the blocking bridge, sessions and dispatch
//! - [`transport`]: WebSocket connection on a dedicated I/O thread
//! - [`service`]: the [`Client`] tying it all together
//! - [`input`]: loading the binary, symbols and protected binary
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics

pub mod config;
pub mod core;
pub mod error;
pub mod input;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::{ClientConfig, LoggingConfig, MutatorConfig};
pub use error::{ProtocolError, Result};
pub use input::InputSet;
pub use protocol::callback::{
    CallbackHandler, CallbackKind, CallbackPayload, ExportInitialization, ExportRemap,
    SubscriptionExpiration,
};
pub use protocol::message::{ImportedModule, LaunchData, MapperData, ResolvedAddresses};
pub use protocol::session::{SessionHandlers, SessionInfo, SessionRole, SessionState};
pub use protocol::settings::{MutatorOption, MutatorSettings, SettingsBuilder, VmType};
pub use service::Client;
pub use utils::logging::init_logging;
