//! Blocking request/response bridge.
//!
//! Turns asynchronous delivery on the I/O thread into sequential blocking calls
//! on the caller's thread. Each call arms a typed one-shot slot for the reply kind
//! it expects; only an event of that kind can complete it. At most one call may
//! be outstanding per connection.

use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};

/// What a blocking call is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// The transport reporting the connection as open
    Open,
    Auth,
    Init,
}

impl ReplyKind {
    pub fn name(self) -> &'static str {
        match self {
            ReplyKind::Open => "open",
            ReplyKind::Auth => "auth",
            ReplyKind::Init => "init",
        }
    }
}

struct Pending {
    kind: ReplyKind,
    reply: oneshot::Sender<Result<u32>>,
}

/// Single-slot rendezvous between the caller thread and the I/O thread
#[derive(Default)]
pub struct RequestBridge {
    pending: Mutex<Option<Pending>>,
}

impl RequestBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kind of the outstanding call, if any
    pub fn pending_kind(&self) -> Option<ReplyKind> {
        self.pending
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|p| p.kind))
    }

    /// Arm the slot, run `send`, then block until the reply, a close, or `timeout`.
    ///
    /// Returns the status carried by the reply (`0` for `Open`).
    pub fn call<F>(&self, kind: ReplyKind, timeout: Option<Duration>, send: F) -> Result<u32>
    where
        F: FnOnce() -> Result<()>,
    {
        let receiver = self.arm(kind)?;

        if let Err(e) = send() {
            self.disarm(kind);
            return Err(e);
        }

        debug!(?kind, "waiting for reply");
        let outcome = match timeout {
            None => receiver
                .recv()
                .map_err(|_| ProtocolError::ConnectionClosed)
                .and_then(|r| r),
            Some(limit) => match receiver.recv_timeout(limit) {
                Ok(result) => result,
                Err(oneshot::RecvTimeoutError::Timeout) => {
                    self.disarm(kind);
                    Err(ProtocolError::Timeout)
                }
                Err(oneshot::RecvTimeoutError::Disconnected) => {
                    Err(ProtocolError::ConnectionClosed)
                }
            },
        };

        if let Err(ref e) = outcome {
            debug!(?kind, error = %e, "blocking call failed");
        }
        outcome
    }

    fn arm(&self, kind: ReplyKind) -> Result<oneshot::Receiver<Result<u32>>> {
        let mut slot = self.lock()?;
        if let Some(existing) = slot.as_ref() {
            warn!(pending = ?existing.kind, requested = ?kind, "blocking call already in flight");
            return Err(ProtocolError::CallInFlight);
        }
        let (reply, receiver) = oneshot::channel();
        *slot = Some(Pending { kind, reply });
        Ok(receiver)
    }

    fn disarm(&self, kind: ReplyKind) {
        if let Ok(mut slot) = self.pending.lock() {
            if slot.as_ref().map(|p| p.kind) == Some(kind) {
                slot.take();
            }
        }
    }

    /// Complete the outstanding call if it expects `kind`.
    ///
    /// Returns false (and leaves any pending call armed) on a kind mismatch or
    /// when nothing is pending.
    pub fn resolve(&self, kind: ReplyKind, status: u32) -> bool {
        let Ok(mut slot) = self.pending.lock() else {
            return false;
        };

        match slot.as_ref() {
            Some(pending) if pending.kind == kind => {}
            Some(pending) => {
                warn!(expected = ?pending.kind, received = ?kind, "reply does not match pending call; dropped");
                return false;
            }
            None => {
                debug!(received = ?kind, "reply with no pending call; dropped");
                return false;
            }
        }

        match slot.take() {
            Some(pending) => pending.reply.send(Ok(status)).is_ok(),
            None => false,
        }
    }

    /// Fail any outstanding call with [`ProtocolError::ConnectionClosed`]
    pub fn connection_closed(&self) {
        let pending = self.pending.lock().ok().and_then(|mut slot| slot.take());
        if let Some(pending) = pending {
            debug!(kind = ?pending.kind, "unblocking caller after close");
            let _ = pending.reply.send(Err(ProtocolError::ConnectionClosed));
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Pending>>> {
        self.pending.lock().map_err(|_| {
            ProtocolError::Transport(crate::error::constants::ERR_LOCK_POISONED.to_string())
        })
    }
}

impl std::fmt::Debug for RequestBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBridge")
            .field("pending", &self.pending_kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn spawn_resolver<F>(bridge: &Arc<RequestBridge>, f: F) -> thread::JoinHandle<()>
    where
        F: FnOnce(&RequestBridge) + Send + 'static,
    {
        let bridge = Arc::clone(bridge);
        thread::spawn(move || {
            // wait until the caller has armed the slot
            while bridge.pending_kind().is_none() {
                thread::sleep(Duration::from_millis(1));
            }
            f(&bridge);
        })
    }

    #[test]
    fn matching_reply_resolves_with_status() {
        let bridge = Arc::new(RequestBridge::new());
        let resolver = spawn_resolver(&bridge, |b| {
            assert!(b.resolve(ReplyKind::Auth, 7));
        });

        let status = bridge.call(ReplyKind::Auth, None, || Ok(())).expect("reply");
        assert_eq!(status, 7);
        resolver.join().expect("resolver thread");
        assert_eq!(bridge.pending_kind(), None);
    }

    #[test]
    fn non_matching_reply_does_not_resolve() {
        let bridge = Arc::new(RequestBridge::new());
        let resolver = spawn_resolver(&bridge, |b| {
            assert!(!b.resolve(ReplyKind::Init, 1));
            assert!(!b.resolve(ReplyKind::Open, 0));
            assert!(b.resolve(ReplyKind::Auth, 0));
        });

        let status = bridge.call(ReplyKind::Auth, None, || Ok(())).expect("reply");
        assert_eq!(status, 0);
        resolver.join().expect("resolver thread");
    }

    #[test]
    fn close_unblocks_pending_call() {
        let bridge = Arc::new(RequestBridge::new());
        let resolver = spawn_resolver(&bridge, |b| b.connection_closed());

        let result = bridge.call(ReplyKind::Init, None, || Ok(()));
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
        resolver.join().expect("resolver thread");
    }

    #[test]
    fn second_call_while_pending_is_rejected() {
        let bridge = Arc::new(RequestBridge::new());
        let inner = Arc::clone(&bridge);
        let resolver = spawn_resolver(&bridge, move |b| {
            let nested = inner.call(ReplyKind::Init, None, || Ok(()));
            assert!(matches!(nested, Err(ProtocolError::CallInFlight)));
            b.resolve(ReplyKind::Auth, 0);
        });

        bridge.call(ReplyKind::Auth, None, || Ok(())).expect("reply");
        resolver.join().expect("resolver thread");
    }

    #[test]
    fn send_failure_disarms_slot() {
        let bridge = RequestBridge::new();
        let result = bridge.call(ReplyKind::Auth, None, || Err(ProtocolError::NotConnected));
        assert!(matches!(result, Err(ProtocolError::NotConnected)));
        assert_eq!(bridge.pending_kind(), None);
    }

    #[test]
    fn timeout_clears_slot_for_next_call() {
        let bridge = RequestBridge::new();
        let result = bridge.call(ReplyKind::Init, Some(Duration::from_millis(20)), || Ok(()));
        assert!(matches!(result, Err(ProtocolError::Timeout)));
        assert_eq!(bridge.pending_kind(), None);
        // a late reply finds nothing to resolve
        assert!(!bridge.resolve(ReplyKind::Init, 0));
    }

    #[test]
    fn reply_without_pending_call_is_dropped() {
        let bridge = RequestBridge::new();
        assert!(!bridge.resolve(ReplyKind::Auth, 0));
        bridge.connection_closed();
    }
}
