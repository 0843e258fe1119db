//! Transport layer.
//!
//! A transport owns one WebSocket connection and reports what happens on it
//! through an [`EventSink`]. Every sink hook runs on the transport's I/O thread.

pub mod ws;

pub use ws::WsTransport;

use bytes::Bytes;

/// Receiver of connection events
pub trait EventSink: Send + Sync {
    /// The connection is open and `send` will accept frames
    fn on_open(&self);

    /// A complete inbound frame
    fn on_message(&self, frame: Bytes);

    /// The connection is gone. Fires exactly once per connection, including
    /// when the connect attempt itself fails.
    fn on_close(&self, reason: Option<String>);
}
