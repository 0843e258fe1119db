//! WebSocket transport on a dedicated I/O thread.
//!
//! Callers stay synchronous: [`WsTransport::connect`] spawns a `mutator-io` OS
//! thread that drives a current-thread tokio runtime. Outbound frames are queued
//! on an unbounded channel, so `send` never blocks. Inbound frames and lifecycle
//! events are handed to the [`EventSink`] on the I/O thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::EventSink;
use crate::utils::timeout::{with_timeout_error, SHUTDOWN_TIMEOUT};

/// Name of the thread that owns the socket
pub const IO_THREAD_NAME: &str = "mutator-io";

enum Command {
    Frame(Bytes),
    Close,
}

/// One WebSocket connection owned by a background I/O thread
pub struct WsTransport {
    commands: mpsc::UnboundedSender<Command>,
    open: Arc<AtomicBool>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
    io_thread_id: ThreadId,
}

impl WsTransport {
    /// Start connecting to `config.endpoint` with the given extra request headers.
    ///
    /// Returns once the I/O thread is running. The outcome of the connect attempt
    /// is reported through `sink`: `on_open` on success, `on_close` otherwise.
    #[instrument(skip(config, headers, sink), fields(endpoint = %config.endpoint))]
    pub fn connect(
        config: &ClientConfig,
        headers: Vec<(String, String)>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let request = build_request(&config.endpoint, headers)?;
        install_crypto_provider();
        let connect_timeout = config.connect_timeout;
        let open = Arc::new(AtomicBool::new(false));
        let (commands, receiver) = mpsc::unbounded_channel();

        let thread_open = Arc::clone(&open);
        let handle = thread::Builder::new()
            .name(IO_THREAD_NAME.to_string())
            .spawn(move || io_thread(request, connect_timeout, thread_open, receiver, sink))
            .map_err(|e| {
                ProtocolError::Transport(format!("{}: {e}", constants::ERR_IO_THREAD_SPAWN))
            })?;
        let io_thread_id = handle.thread().id();

        Ok(Self {
            commands,
            open,
            io_thread: Mutex::new(Some(handle)),
            io_thread_id,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// True when called from this transport's I/O thread
    pub fn is_io_thread(&self) -> bool {
        thread::current().id() == self.io_thread_id
    }

    /// Queue a frame for sending as a binary WebSocket message
    pub fn send(&self, frame: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(ProtocolError::NotConnected);
        }
        self.commands
            .send(Command::Frame(frame))
            .map_err(|_| ProtocolError::NotConnected)
    }

    /// Close the connection and wait for the I/O thread to finish.
    ///
    /// Safe to call repeatedly. Called from the I/O thread itself (for example
    /// from a handler) it only signals the thread and returns.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        // the receiver is gone once the thread has exited
        let _ = self.commands.send(Command::Close);

        let handle = match self.io_thread.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                warn!("{}", constants::ERR_LOCK_POISONED);
                None
            }
        };

        if let Some(handle) = handle {
            if self.is_io_thread() {
                debug!("close requested from I/O thread; not joining");
                return;
            }
            if handle.join().is_err() {
                warn!("I/O thread panicked");
            }
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("open", &self.is_open())
            .finish()
    }
}

fn build_request(endpoint: &str, headers: Vec<(String, String)>) -> Result<Request> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|e| ProtocolError::ConfigError(format!("Invalid endpoint {endpoint}: {e}")))?;

    for (name, value) in headers {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid value for {name}: {e}")))?;
        request.headers_mut().insert(header, value);
    }
    Ok(request)
}

/// Make `ring` the process-wide rustls provider unless one is already set.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider already installed");
        }
    });
}

/// Reports the end of the I/O thread exactly once, including on unwind.
struct CloseGuard {
    open: Arc<AtomicBool>,
    sink: Arc<dyn EventSink>,
    reason: Option<String>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.open.store(false, Ordering::Release);
        let reason = if thread::panicking() {
            warn!("{}", constants::ERR_IO_THREAD_PANICKED);
            Some(constants::ERR_IO_THREAD_PANICKED.to_string())
        } else {
            self.reason.take()
        };
        self.sink.on_close(reason);
    }
}

fn io_thread(
    request: Request,
    connect_timeout: Duration,
    open: Arc<AtomicBool>,
    commands: mpsc::UnboundedReceiver<Command>,
    sink: Arc<dyn EventSink>,
) {
    let mut guard = CloseGuard {
        open: Arc::clone(&open),
        sink: Arc::clone(&sink),
        reason: None,
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            guard.reason = Some(format!("{}: {e}", constants::ERR_RUNTIME_BUILD));
            return;
        }
    };

    guard.reason = runtime.block_on(run_connection(
        request,
        connect_timeout,
        &open,
        commands,
        sink.as_ref(),
    ));
}

/// Connect and pump frames until either side closes. Returns the close reason.
async fn run_connection(
    request: Request,
    connect_timeout: Duration,
    open: &AtomicBool,
    mut commands: mpsc::UnboundedReceiver<Command>,
    sink: &dyn EventSink,
) -> Option<String> {
    let connecting = async {
        connect_async(request)
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))
    };
    let stream = match with_timeout_error(connecting, connect_timeout).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!(error = %e, "connect failed");
            return Some(e.to_string());
        }
    };

    info!("connection open");
    let (mut ws_tx, mut ws_rx) = stream.split();
    open.store(true, Ordering::Release);
    sink.on_open();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Frame(frame)) => {
                    if let Err(e) = ws_tx.send(Message::Binary(frame)).await {
                        warn!(error = %e, "send failed");
                        return Some(e.to_string());
                    }
                }
                Some(Command::Close) | None => {
                    let goodbye = async {
                        ws_tx
                            .send(Message::Close(None))
                            .await
                            .map_err(|e| ProtocolError::Transport(e.to_string()))
                    };
                    if let Err(e) = with_timeout_error(goodbye, SHUTDOWN_TIMEOUT).await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    info!("connection closed locally");
                    return None;
                }
            },
            message = ws_rx.next() => match message {
                Some(Ok(Message::Binary(frame))) => sink.on_message(frame),
                Some(Ok(Message::Text(text))) => {
                    sink.on_message(Bytes::copy_from_slice(text.as_bytes()))
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string());
                    info!(?reason, "connection closed by peer");
                    return reason;
                }
                // ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "receive failed");
                    return Some(e.to_string());
                }
                None => return None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        closes: Mutex<Vec<Option<String>>>,
    }

    impl EventSink for RecordingSink {
        fn on_open(&self) {}
        fn on_message(&self, _frame: Bytes) {}
        fn on_close(&self, reason: Option<String>) {
            self.closes.lock().expect("closes").push(reason);
        }
    }

    fn guarded(open: &Arc<AtomicBool>, sink: &Arc<RecordingSink>) -> CloseGuard {
        let sink: Arc<dyn EventSink> = Arc::clone(sink) as Arc<dyn EventSink>;
        CloseGuard {
            open: Arc::clone(open),
            sink,
            reason: None,
        }
    }

    #[test]
    fn close_guard_reports_the_close_reason() {
        let open = Arc::new(AtomicBool::new(true));
        let sink = Arc::new(RecordingSink::default());

        let mut guard = guarded(&open, &sink);
        guard.reason = Some("going away".to_string());
        drop(guard);

        assert!(!open.load(Ordering::Acquire));
        assert_eq!(
            *sink.closes.lock().expect("closes"),
            vec![Some("going away".to_string())]
        );
    }

    #[test]
    fn close_guard_fires_when_the_thread_panics() {
        let open = Arc::new(AtomicBool::new(true));
        let sink = Arc::new(RecordingSink::default());

        let guard = guarded(&open, &sink);
        let worker = thread::spawn(move || {
            let _guard = guard;
            panic!("boom");
        });
        assert!(worker.join().is_err());

        assert!(!open.load(Ordering::Acquire));
        assert_eq!(
            *sink.closes.lock().expect("closes"),
            vec![Some(constants::ERR_IO_THREAD_PANICKED.to_string())]
        );
    }

    #[test]
    fn crypto_provider_is_installed_on_connect() {
        install_crypto_provider();
        install_crypto_provider();
        assert!(rustls::crypto::CryptoProvider::get_default().is_some());
    }

    #[test]
    fn auth_header_is_attached() {
        let request = build_request(
            "ws://127.0.0.1:9000/mutator/",
            vec![("auth-token".to_string(), "T1".to_string())],
        )
        .expect("request");
        assert_eq!(
            request.headers().get("auth-token").map(|v| v.as_bytes()),
            Some(&b"T1"[..])
        );
    }

    #[test]
    fn bad_endpoint_is_a_config_error() {
        let result = build_request("not a url", Vec::new());
        assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    }

    #[test]
    fn bad_header_value_is_a_config_error() {
        let result = build_request(
            "ws://127.0.0.1:9000/",
            vec![("auth-token".to_string(), "line\nbreak".to_string())],
        );
        assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    }
}
