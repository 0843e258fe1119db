//! # Protocol Layer
//!
//! Message types and the session machinery built on top of the codec.
//!
//! ## Components
//! - **Message**: request and server message enums with their payloads
//! - **Settings**: option accumulator frozen into an immutable snapshot
//! - **Bridge**: single-slot rendezvous turning replies into blocking calls
//! - **Session**: per-session role, state and scoped handlers
//! - **Callback**: typed out-of-band callback payloads and their handlers
//! - **Dispatcher**: routes pushes to session, global and callback handlers
//!
//! ## Message Flow
//! ```text
//! Auth / Init          client ──request──> service ──status──> bridge ──> caller
//! CreateInstance       client ──request──> service ──push────> dispatcher ──> handler
//! Mutate               client ──request──> service ──push────> dispatcher ──> handler
//! Callback             service ──push────> dispatcher ──> handler ──reply──> service
//! ```

pub mod bridge;
pub mod callback;
pub mod dispatcher;
pub mod message;
pub mod session;
pub mod settings;
