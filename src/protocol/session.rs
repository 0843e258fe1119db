//! Session registry.
//!
//! Tracks sessions created by this client, their role and lifecycle state, and
//! any handlers scoped to a single session.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::protocol::message::{LaunchData, MapperData};

/// Handler for session-created pushes: `(context, session_id, mapper_data)`
pub type SessionCreatedHandler<C> = Arc<dyn Fn(&C, u32, Option<MapperData>) + Send + Sync>;

/// Handler for mutated pushes: `(context, session_id, binaries, launch_data)`
pub type MutatedHandler<C> = Arc<dyn Fn(&C, u32, Vec<Vec<u8>>, Option<LaunchData>) + Send + Sync>;

/// What the service should produce for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Position-independent image; the caller resolves imports and bases
    Mapper,
    /// Self-contained executable; nothing to resolve
    Builder,
}

impl SessionRole {
    pub fn is_mapper(self) -> bool {
        self == SessionRole::Mapper
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Mapper => f.write_str("mapper"),
            SessionRole::Builder => f.write_str("builder"),
        }
    }
}

/// Lifecycle of a session as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// CreateInstance sent, waiting for the service
    Created,
    /// Service reported the session ready (mapper data may be attached)
    DataReady,
    /// Mutate sent, waiting for output
    MutateRequested,
    /// Output delivered
    Mutated,
    /// Service reported a non-zero status in a push
    Failed(u32),
}

/// Snapshot of a tracked session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u32,
    pub role: SessionRole,
    pub state: SessionState,
}

/// Handlers that only fire for one session; they take precedence over the
/// client-wide handlers.
pub struct SessionHandlers<C> {
    pub(crate) on_created: Option<SessionCreatedHandler<C>>,
    pub(crate) on_mutated: Option<MutatedHandler<C>>,
}

impl<C> Default for SessionHandlers<C> {
    fn default() -> Self {
        Self {
            on_created: None,
            on_mutated: None,
        }
    }
}

impl<C> SessionHandlers<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_created<F>(mut self, f: F) -> Self
    where
        F: Fn(&C, u32, Option<MapperData>) + Send + Sync + 'static,
    {
        self.on_created = Some(Arc::new(f));
        self
    }

    pub fn on_mutated<F>(mut self, f: F) -> Self
    where
        F: Fn(&C, u32, Vec<Vec<u8>>, Option<LaunchData>) + Send + Sync + 'static,
    {
        self.on_mutated = Some(Arc::new(f));
        self
    }
}

impl<C> fmt::Debug for SessionHandlers<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandlers")
            .field("on_created", &self.on_created.is_some())
            .field("on_mutated", &self.on_mutated.is_some())
            .finish()
    }
}

struct SessionEntry<C> {
    role: SessionRole,
    state: SessionState,
    handlers: SessionHandlers<C>,
}

/// Sessions keyed by their caller-supplied id
pub struct SessionRegistry<C> {
    sessions: HashMap<u32, SessionEntry<C>>,
}

impl<C> Default for SessionRegistry<C> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }
}

impl<C> SessionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new session. Returns the entry it displaced when the id was
    /// already in use.
    pub fn insert(
        &mut self,
        id: u32,
        role: SessionRole,
        handlers: SessionHandlers<C>,
    ) -> Option<SessionInfo> {
        let previous = self.get(id);
        self.sessions.insert(
            id,
            SessionEntry {
                role,
                state: SessionState::Created,
                handlers,
            },
        );
        previous
    }

    pub fn get(&self, id: u32) -> Option<SessionInfo> {
        self.sessions.get(&id).map(|entry| SessionInfo {
            id,
            role: entry.role,
            state: entry.state,
        })
    }

    /// Move a session to `state`; false if the id is not tracked
    pub fn set_state(&mut self, id: u32, state: SessionState) -> bool {
        match self.sessions.get_mut(&id) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: u32) -> Option<SessionInfo> {
        self.sessions.remove(&id).map(|entry| SessionInfo {
            id,
            role: entry.role,
            state: entry.state,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Tracked sessions, ordered by id
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut list: Vec<_> = self.sessions.keys().filter_map(|id| self.get(*id)).collect();
        list.sort_by_key(|info| info.id);
        list
    }

    pub fn created_handler(&self, id: u32) -> Option<SessionCreatedHandler<C>> {
        self.sessions
            .get(&id)
            .and_then(|entry| entry.handlers.on_created.clone())
    }

    pub fn mutated_handler(&self, id: u32) -> Option<MutatedHandler<C>> {
        self.sessions
            .get(&id)
            .and_then(|entry| entry.handlers.on_mutated.clone())
    }
}

impl<C> fmt::Debug for SessionRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sessions_start_created() {
        let mut registry = SessionRegistry::<()>::new();
        assert!(registry.insert(42, SessionRole::Mapper, SessionHandlers::new()).is_none());

        let info = registry.get(42).expect("tracked");
        assert_eq!(info.role, SessionRole::Mapper);
        assert_eq!(info.state, SessionState::Created);
    }

    #[test]
    fn duplicate_id_returns_displaced_entry() {
        let mut registry = SessionRegistry::<()>::new();
        registry.insert(1, SessionRole::Builder, SessionHandlers::new());
        registry.set_state(1, SessionState::Mutated);

        let displaced = registry
            .insert(1, SessionRole::Mapper, SessionHandlers::new())
            .expect("displaced");
        assert_eq!(displaced.state, SessionState::Mutated);
        assert_eq!(registry.get(1).map(|i| i.role), Some(SessionRole::Mapper));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn state_transitions_only_apply_to_tracked_ids() {
        let mut registry = SessionRegistry::<()>::new();
        assert!(!registry.set_state(5, SessionState::DataReady));
        registry.insert(5, SessionRole::Builder, SessionHandlers::new());
        assert!(registry.set_state(5, SessionState::DataReady));
        assert_eq!(registry.get(5).map(|i| i.state), Some(SessionState::DataReady));
    }

    #[test]
    fn scoped_handlers_are_per_session() {
        let mut registry = SessionRegistry::<()>::new();
        registry.insert(
            1,
            SessionRole::Mapper,
            SessionHandlers::new().on_mutated(|_, _, _, _| {}),
        );
        registry.insert(2, SessionRole::Mapper, SessionHandlers::new());

        assert!(registry.mutated_handler(1).is_some());
        assert!(registry.mutated_handler(2).is_none());
        assert!(registry.created_handler(1).is_none());
    }

    #[test]
    fn list_is_sorted_and_remove_forgets() {
        let mut registry = SessionRegistry::<()>::new();
        for id in [9, 3, 7] {
            registry.insert(id, SessionRole::Builder, SessionHandlers::new());
        }
        let ids: Vec<_> = registry.list().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![3, 7, 9]);

        assert!(registry.remove(7).is_some());
        assert!(registry.get(7).is_none());
        assert_eq!(registry.len(), 2);
    }
}
