use crate::error::{constants, ProtocolError, Result};
use crate::protocol::callback::{CallbackHandler, CallbackKind, CallbackRegistry};
use crate::protocol::message::{
    CallbackPush, CallbackReply, LaunchData, MapperData, MutatedPush, SessionCreatedPush,
    STATUS_OK,
};
use crate::protocol::session::{
    MutatedHandler, SessionCreatedHandler, SessionHandlers, SessionInfo, SessionRegistry,
    SessionRole, SessionState,
};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Routes server pushes to registered handlers.
///
/// `C` is the context handed to session handlers (the client in production).
/// Handlers are cloned out of their lock before running, so a handler may
/// register handlers or create sessions without deadlocking.
///
/// Handlers run synchronously on the thread that calls `dispatch_*`, which is
/// the I/O thread for a live client: a slow handler delays every message
/// behind it.
pub struct Dispatcher<C> {
    on_session_created: RwLock<Option<SessionCreatedHandler<C>>>,
    on_mutated: RwLock<Option<MutatedHandler<C>>>,
    callbacks: RwLock<CallbackRegistry>,
    sessions: RwLock<SessionRegistry<C>>,
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> ProtocolError {
    ProtocolError::Transport(constants::ERR_LOCK_POISONED.to_string())
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            on_session_created: RwLock::new(None),
            on_mutated: RwLock::new(None),
            callbacks: RwLock::new(CallbackRegistry::new()),
            sessions: RwLock::new(SessionRegistry::new()),
        }
    }

    /// Install the client-wide session-created handler, replacing any prior one
    pub fn on_session_created<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&C, u32, Option<MapperData>) + Send + Sync + 'static,
    {
        *self.on_session_created.write().map_err(|_| poisoned())? = Some(Arc::new(handler));
        Ok(())
    }

    /// Install the client-wide mutated handler, replacing any prior one
    pub fn on_mutated<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&C, u32, Vec<Vec<u8>>, Option<LaunchData>) + Send + Sync + 'static,
    {
        *self.on_mutated.write().map_err(|_| poisoned())? = Some(Arc::new(handler));
        Ok(())
    }

    /// Install a callback handler for its kind, replacing any prior one
    pub fn register_callback(&self, handler: CallbackHandler) -> Result<()> {
        let kind = handler.kind();
        let replaced = self
            .callbacks
            .write()
            .map_err(|_| poisoned())?
            .register(handler);
        debug!(%kind, replaced = replaced.is_some(), "callback handler registered");
        Ok(())
    }

    pub fn unregister_callback(&self, kind: CallbackKind) -> Result<bool> {
        Ok(self
            .callbacks
            .write()
            .map_err(|_| poisoned())?
            .unregister(kind)
            .is_some())
    }

    /// Start tracking a session. Returns the displaced entry on an id collision.
    pub fn track_session(
        &self,
        id: u32,
        role: SessionRole,
        handlers: SessionHandlers<C>,
    ) -> Result<Option<SessionInfo>> {
        Ok(self
            .sessions
            .write()
            .map_err(|_| poisoned())?
            .insert(id, role, handlers))
    }

    pub fn set_session_state(&self, id: u32, state: SessionState) -> Result<bool> {
        Ok(self
            .sessions
            .write()
            .map_err(|_| poisoned())?
            .set_state(id, state))
    }

    pub fn session(&self, id: u32) -> Option<SessionInfo> {
        self.sessions.read().ok().and_then(|s| s.get(id))
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().map(|s| s.list()).unwrap_or_default()
    }

    pub fn forget_session(&self, id: u32) -> Result<Option<SessionInfo>> {
        Ok(self.sessions.write().map_err(|_| poisoned())?.remove(id))
    }

    /// Deliver a session-created push. Returns whether a handler ran.
    pub fn dispatch_session_created(&self, ctx: &C, push: SessionCreatedPush) -> bool {
        let SessionCreatedPush {
            session_id,
            status,
            mapper_data,
        } = push;

        self.record_push_state(session_id, status, SessionState::DataReady);

        let handler = self
            .sessions
            .read()
            .ok()
            .and_then(|s| s.created_handler(session_id))
            .or_else(|| self.on_session_created.read().ok().and_then(|h| h.clone()));

        match handler {
            Some(handler) => {
                handler(ctx, session_id, mapper_data);
                true
            }
            None => {
                warn!(session_id, "session created but no handler installed");
                false
            }
        }
    }

    /// Deliver a mutated push. Returns whether a handler ran.
    pub fn dispatch_mutated(&self, ctx: &C, push: MutatedPush) -> bool {
        let MutatedPush {
            session_id,
            status,
            binaries,
            launch_data,
        } = push;

        self.record_push_state(session_id, status, SessionState::Mutated);
        debug!(session_id, binaries = binaries.len(), "mutation output received");

        let handler = self
            .sessions
            .read()
            .ok()
            .and_then(|s| s.mutated_handler(session_id))
            .or_else(|| self.on_mutated.read().ok().and_then(|h| h.clone()));

        match handler {
            Some(handler) => {
                handler(ctx, session_id, binaries, launch_data);
                true
            }
            None => {
                warn!(session_id, "session mutated but no handler installed");
                false
            }
        }
    }

    /// Run the callback handler for the push and build the reply to send back.
    /// Without a handler the payload is echoed unchanged.
    pub fn dispatch_callback(&self, push: CallbackPush) -> CallbackReply {
        let CallbackPush {
            call_id,
            session_id,
            mut payload,
        } = push;
        let kind = payload.kind();

        let handler = self.callbacks.read().ok().and_then(|r| r.handler(kind));
        match handler {
            Some(handler) => {
                handler.apply(session_id, &mut payload);
            }
            None => debug!(%kind, call_id, "no callback handler; echoing payload"),
        }

        CallbackReply {
            call_id,
            session_id,
            payload,
        }
    }

    fn record_push_state(&self, session_id: u32, status: u32, next: SessionState) {
        let state = if status == STATUS_OK {
            next
        } else {
            warn!(session_id, status, "service reported failure for session");
            SessionState::Failed(status)
        };

        let tracked = self
            .sessions
            .write()
            .map(|mut s| s.set_state(session_id, state))
            .unwrap_or(false);
        if !tracked {
            debug!(session_id, "push for untracked session");
        }
    }
}

impl<C> std::fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sessions", &self.sessions())
            .finish()
    }
}
