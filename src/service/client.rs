//! Blocking session client.
//!
//! [`Client`] owns one connection to the mutator service. Authentication and
//! initialization block the calling thread until the service replies; session
//! creation and mutation requests are fire-and-forget and answered by pushes
//! delivered to the handlers installed on the client.
//!
//! Handlers run on the connection's I/O thread and receive a `&Client`, so they
//! can issue further fire-and-forget requests. Blocking calls from a handler are
//! rejected, since the reply they wait for could only arrive on that same thread.
//!
//! ```no_run
//! use mutator_client::{Client, ClientConfig, InputSet, MutatorOption, SettingsBuilder};
//!
//! # fn main() -> mutator_client::Result<()> {
//! let client = Client::new(ClientConfig::default())?;
//! client.ensure_authenticated("token")?;
//!
//! let settings = SettingsBuilder::new()
//!     .with(MutatorOption::Shuffle(true))
//!     .finalize();
//! client.initialize(settings, InputSet::from_directory("./input")?)?;
//!
//! client.on_mutated(|_client, id, binaries, _launch| {
//!     println!("session {id}: {} binaries", binaries.len());
//! })?;
//! client.create_builder(1)?;
//! client.request_mutation(1, None)?;
//! # Ok(())
//! # }
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::core::codec::MessageCodec;
use crate::error::{constants, ProtocolError, Result};
use crate::input::InputSet;
use crate::protocol::bridge::{ReplyKind, RequestBridge};
use crate::protocol::callback::{CallbackHandler, CallbackKind};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::message::{
    AuthRequest, InitializationRequest, InstanceRequest, LaunchData, MapperData, MutatorRequest,
    Request, ResolvedAddresses, ServerMessage, StatusReply, STATUS_OK,
};
use crate::protocol::session::{SessionHandlers, SessionInfo, SessionRole, SessionState};
use crate::protocol::settings::MutatorSettings;
use crate::transport::{EventSink, WsTransport};
use crate::utils::metrics::{Metrics, MetricsSnapshot, Timer};

struct Shared {
    config: ClientConfig,
    codec: MessageCodec,
    bridge: RequestBridge,
    dispatcher: Dispatcher<Client>,
    transport: Mutex<Option<WsTransport>>,
    last_status: AtomicU32,
    authenticated: AtomicBool,
    metrics: Metrics,
}

impl Shared {
    fn transport(&self) -> Result<MutexGuard<'_, Option<WsTransport>>> {
        self.transport
            .lock()
            .map_err(|_| ProtocolError::Transport(constants::ERR_LOCK_POISONED.to_string()))
    }

    fn send_frame(&self, frame: Bytes) -> Result<()> {
        let len = frame.len();
        match self.transport()?.as_ref() {
            Some(transport) => transport.send(frame)?,
            None => return Err(ProtocolError::NotConnected),
        }
        self.metrics.message_sent(len as u64);
        Ok(())
    }

    fn send(&self, request: &Request) -> Result<()> {
        let frame = request.encode(&self.codec)?;
        debug!(kind = %request.message_type(), bytes = frame.len(), "sending");
        self.send_frame(frame)
    }

    fn on_io_thread(&self) -> bool {
        self.transport
            .lock()
            .map(|t| t.as_ref().is_some_and(WsTransport::is_io_thread))
            .unwrap_or(false)
    }
}

/// Handle to one connection with the mutator service.
///
/// Cloning is cheap and every clone refers to the same connection. The
/// connection closes when [`Client::close`] is called or the last clone drops.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Create a disconnected client
    pub fn new(config: ClientConfig) -> Result<Self> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(ProtocolError::ConfigError(problems.join("; ")));
        }

        let codec = MessageCodec::new(config.max_frame_size);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                codec,
                bridge: RequestBridge::new(),
                dispatcher: Dispatcher::new(),
                transport: Mutex::new(None),
                last_status: AtomicU32::new(STATUS_OK),
                authenticated: AtomicBool::new(false),
                metrics: Metrics::new(),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Open the connection, sending `token` in the auth header, and block until
    /// it is open. Does nothing when already connected.
    #[instrument(skip(self, token), fields(endpoint = %self.shared.config.endpoint))]
    pub fn connect(&self, token: &str) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.reject_on_io_thread()?;

        let shared = &self.shared;
        let headers = vec![(shared.config.auth_header.clone(), token.to_string())];
        let sink: Arc<dyn EventSink> = Arc::new(InboundSink {
            shared: Arc::downgrade(shared),
        });

        shared.metrics.blocking_call();
        let _timer = Timer::start(ReplyKind::Open.name());
        shared.bridge.call(ReplyKind::Open, None, || {
            let transport = WsTransport::connect(&shared.config, headers, sink)?;
            let previous = shared.transport()?.replace(transport);
            // a stale transport has already stopped; dropping it joins its thread
            drop(previous);
            Ok(())
        })?;

        info!("connected");
        Ok(())
    }

    /// Authenticate with `token`, connecting first if needed.
    ///
    /// Returns whether the service accepted the token. A rejection leaves the
    /// connection open; the status is available from [`Client::last_status`].
    #[instrument(skip(self, token))]
    pub fn authenticate(&self, token: &str) -> Result<bool> {
        self.connect(token)?;

        let status = self.blocking(
            ReplyKind::Auth,
            &Request::Auth(AuthRequest {
                auth_token: token.to_string(),
            }),
        )?;

        let accepted = status == STATUS_OK;
        self.shared.authenticated.store(accepted, Ordering::Release);
        if accepted {
            info!("authenticated");
        } else {
            warn!(status, "authentication rejected");
        }
        Ok(accepted)
    }

    /// Like [`Client::authenticate`], with rejection as [`ProtocolError::AuthRejected`]
    pub fn ensure_authenticated(&self, token: &str) -> Result<()> {
        if self.authenticate(token)? {
            Ok(())
        } else {
            Err(ProtocolError::AuthRejected(self.last_status()))
        }
    }

    /// Send settings and inputs and block until the service accepts them
    #[instrument(skip(self, settings, inputs), fields(inputs = ?inputs))]
    pub fn initialize(&self, settings: MutatorSettings, inputs: InputSet) -> Result<()> {
        if !self.is_authenticated() {
            warn!("initializing before a successful authentication");
        }

        let InputSet {
            binary,
            symbols,
            protected_binary,
        } = inputs;
        let status = self.blocking(
            ReplyKind::Init,
            &Request::Init(InitializationRequest {
                settings,
                binary,
                symbols,
                protected_binary,
            }),
        )?;

        if status != STATUS_OK {
            warn!(status, "initialization failed");
            return Err(ProtocolError::InitFailed(status));
        }
        info!("initialized");
        Ok(())
    }

    /// Ask the service to create session `id`. The outcome arrives as a
    /// session-created push.
    pub fn create_session(&self, id: u32, role: SessionRole) -> Result<()> {
        self.create_session_with(id, role, SessionHandlers::new())
    }

    /// Like [`Client::create_session`], with handlers that only fire for this session
    #[instrument(skip(self, handlers))]
    pub fn create_session_with(
        &self,
        id: u32,
        role: SessionRole,
        handlers: SessionHandlers<Client>,
    ) -> Result<()> {
        let dispatcher = &self.shared.dispatcher;
        if let Some(previous) = dispatcher.track_session(id, role, handlers)? {
            warn!(
                id,
                previous_role = %previous.role,
                "session id already in use; the service may not answer"
            );
        }

        let sent = self.shared.send(&Request::CreateInstance(InstanceRequest {
            unique_key: id,
            mapper: role.is_mapper(),
        }));
        if sent.is_err() {
            dispatcher.forget_session(id)?;
        }
        sent
    }

    pub fn create_mapper(&self, id: u32) -> Result<()> {
        self.create_session(id, SessionRole::Mapper)
    }

    pub fn create_builder(&self, id: u32) -> Result<()> {
        self.create_session(id, SessionRole::Builder)
    }

    /// Ask the service to mutate session `id`. Mapper sessions need the
    /// resolved bases and imports; builder sessions pass `None`.
    #[instrument(skip(self, resolved))]
    pub fn request_mutation(&self, id: u32, resolved: Option<ResolvedAddresses>) -> Result<()> {
        let dispatcher = &self.shared.dispatcher;
        let unresolved = resolved.as_ref().map_or(true, ResolvedAddresses::is_empty);
        match dispatcher.session(id) {
            Some(info) if info.role.is_mapper() && unresolved => {
                warn!(id, "mapper session mutated without resolved addresses");
            }
            Some(_) => {}
            None => debug!(id, "mutation requested for untracked session"),
        }

        // set before sending so a fast mutated push is not overwritten
        let previous = dispatcher.session(id).map(|info| info.state);
        dispatcher.set_session_state(id, SessionState::MutateRequested)?;
        let sent = self.shared.send(&Request::Mutate(MutatorRequest {
            unique_key: id,
            resolved: resolved.unwrap_or_default(),
        }));
        if sent.is_err() {
            if let Some(state) = previous {
                dispatcher.set_session_state(id, state)?;
            }
        }
        sent
    }

    /// Handler for session-created pushes without a session-scoped handler
    pub fn on_session_created<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&Client, u32, Option<MapperData>) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on_session_created(handler)
    }

    /// Handler for mutated pushes without a session-scoped handler
    pub fn on_mutated<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&Client, u32, Vec<Vec<u8>>, Option<LaunchData>) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on_mutated(handler)
    }

    pub fn register_callback(&self, handler: CallbackHandler) -> Result<()> {
        self.shared.dispatcher.register_callback(handler)
    }

    pub fn unregister_callback(&self, kind: CallbackKind) -> Result<bool> {
        self.shared.dispatcher.unregister_callback(kind)
    }

    pub fn session(&self, id: u32) -> Option<SessionInfo> {
        self.shared.dispatcher.session(id)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared.dispatcher.sessions()
    }

    /// Stop tracking a session; later pushes for it go to the global handlers
    pub fn forget_session(&self, id: u32) -> Result<Option<SessionInfo>> {
        self.shared.dispatcher.forget_session(id)
    }

    /// Status carried by the most recent authentication or initialization reply
    pub fn last_status(&self) -> u32 {
        self.shared.last_status.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .transport
            .lock()
            .map(|t| t.as_ref().is_some_and(WsTransport::is_open))
            .unwrap_or(false)
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Close the connection and stop the I/O thread. A caller blocked on a
    /// reply gets [`ProtocolError::ConnectionClosed`]. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub fn close(&self) -> Result<()> {
        let transport = self.shared.transport()?.take();
        self.shared.authenticated.store(false, Ordering::Release);
        if let Some(transport) = transport {
            transport.close();
            self.shared.metrics.log_metrics();
        }
        Ok(())
    }

    fn blocking(&self, kind: ReplyKind, request: &Request) -> Result<u32> {
        self.reject_on_io_thread()?;
        debug_assert!(request.message_type().is_blocking());
        let frame = request.encode(&self.shared.codec)?;
        self.shared.metrics.blocking_call();
        let _timer = Timer::start(kind.name());
        let status = self
            .shared
            .bridge
            .call(kind, self.shared.config.reply_timeout, || {
                self.shared.send_frame(frame)
            })?;
        // only replies matched to this call count; late ones are dropped by the bridge
        self.shared.last_status.store(status, Ordering::Release);
        Ok(status)
    }

    fn reject_on_io_thread(&self) -> Result<()> {
        if self.shared.on_io_thread() {
            return Err(ProtocolError::Transport(
                constants::ERR_BLOCKING_ON_IO_THREAD.to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.shared.config.endpoint)
            .field("connected", &self.is_connected())
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

/// Routes transport events into the bridge and dispatcher
struct InboundSink {
    shared: Weak<Shared>,
}

impl InboundSink {
    fn handle(&self, shared: Arc<Shared>, message: ServerMessage) {
        match message {
            ServerMessage::Auth(StatusReply { status }) => {
                shared.bridge.resolve(ReplyKind::Auth, status);
            }
            ServerMessage::Init(StatusReply { status }) => {
                shared.bridge.resolve(ReplyKind::Init, status);
            }
            ServerMessage::SessionCreated(push) => {
                shared.metrics.push_dispatched();
                let client = Client { shared };
                client.shared.dispatcher.dispatch_session_created(&client, push);
            }
            ServerMessage::Mutated(push) => {
                shared.metrics.push_dispatched();
                let client = Client { shared };
                client.shared.dispatcher.dispatch_mutated(&client, push);
            }
            ServerMessage::Callback(push) => {
                let reply = shared.dispatcher.dispatch_callback(push);
                let call_id = reply.call_id;
                match shared.send(&Request::CallbackResult(reply)) {
                    Ok(()) => shared.metrics.callback_answered(),
                    Err(e) => warn!(call_id, error = %e, "callback reply not sent"),
                }
            }
        }
    }
}

impl EventSink for InboundSink {
    fn on_open(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.metrics.connection_established();
            shared.bridge.resolve(ReplyKind::Open, STATUS_OK);
        }
    }

    fn on_message(&self, frame: Bytes) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.metrics.message_received(frame.len() as u64);

        match ServerMessage::decode(&shared.codec, &frame) {
            Ok(message) => {
                let kind = message.message_type();
                debug!(%kind, bytes = frame.len(), "received");
                // a panicking handler loses its message, not the connection
                let handled =
                    panic::catch_unwind(AssertUnwindSafe(|| self.handle(shared, message)));
                if handled.is_err() {
                    warn!(%kind, "{}", constants::ERR_HANDLER_PANICKED);
                }
            }
            Err(e) => {
                shared.metrics.decode_error();
                warn!(error = %e, bytes = frame.len(), "dropping undecodable frame");
            }
        }
    }

    fn on_close(&self, reason: Option<String>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        info!(?reason, "connection closed");
        shared.metrics.connection_closed();
        shared.authenticated.store(false, Ordering::Release);
        shared.bridge.connection_closed();
    }
}
