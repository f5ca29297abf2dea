use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::event::SessionListener;
use super::state::{InstallSession, SessionState, SessionStatus};
use crate::error::{ErrorCode, Result, SplitError};
use crate::installer::InstallResult;

#[derive(Default)]
struct Inner {
    sessions: BTreeMap<u32, InstallSession>,
    listeners: Vec<Arc<dyn SessionListener>>,
}

/// Table of live install sessions.
///
/// Every operation holds the registry lock only for a short, I/O-free
/// critical section. Listeners are called after the lock is released.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `session` unless its id is zero or already taken.
    pub fn put(&self, session: InstallSession) -> bool {
        if session.id == 0 {
            log::warn!("Ignoring session with id 0");
            return false;
        }
        let mut inner = self.lock();
        if inner.sessions.contains_key(&session.id) {
            return false;
        }
        inner.sessions.insert(session.id, session);
        true
    }

    /// Check capacity and overlap, then register, all under one lock.
    pub fn try_register(&self, session: InstallSession) -> Result<SessionState> {
        let names = session.module_names();
        let mut inner = self.lock();

        if Self::at_capacity(&inner) {
            return Err(SplitError::ActiveSessionsLimitExceeded);
        }
        if let Some((session_id, modules)) = Self::overlap(&inner, &names) {
            return Err(SplitError::IncompatibleWithExistingSession { session_id, modules });
        }
        if session.id == 0 || inner.sessions.contains_key(&session.id) {
            return Err(SplitError::InvalidRequest(format!(
                "session {} cannot be registered",
                session.id
            )));
        }

        let state = session.snapshot();
        inner.sessions.insert(session.id, session);
        Ok(state)
    }

    pub fn get(&self, id: u32) -> Option<SessionState> {
        self.lock().sessions.get(&id).map(InstallSession::snapshot)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.lock().sessions.contains_key(&id)
    }

    /// Run `f` against a session while holding the lock.
    pub fn with_session<R>(&self, id: u32, f: impl FnOnce(&InstallSession) -> R) -> Option<R> {
        self.lock().sessions.get(&id).map(f)
    }

    /// Move a session to `status`. Terminal statuses remove the session.
    pub fn transition(&self, id: u32, status: SessionStatus, error_code: ErrorCode) -> Result<SessionState> {
        let mut inner = self.lock();
        let session = inner.sessions.get_mut(&id).ok_or(SplitError::SessionNotFound(id))?;

        if !session.status.can_transition_to(status) {
            return Err(SplitError::InvalidRequest(format!(
                "session {} cannot move from {} to {}",
                id, session.status, status
            )));
        }

        log::debug!("Session {}: {} -> {}", id, session.status, status);
        session.status = status;
        session.error_code = error_code;
        if status != SessionStatus::RequiresUserConfirmation {
            session.confirmation = None;
        }
        let state = session.snapshot();

        if status.is_terminal() {
            inner.sessions.remove(&id);
        }
        Ok(state)
    }

    /// Record cumulative download progress.
    pub fn update_progress(&self, id: u32, bytes_downloaded: u64) -> Option<SessionState> {
        let mut inner = self.lock();
        let session = inner.sessions.get_mut(&id)?;
        session.bytes_downloaded = bytes_downloaded;
        Some(session.snapshot())
    }

    /// Attach install results, reported with the next snapshot.
    pub fn set_results(&self, id: u32, results: Vec<InstallResult>) -> bool {
        match self.lock().sessions.get_mut(&id) {
            Some(session) => {
                session.results = results;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: u32) -> Option<InstallSession> {
        self.lock().sessions.remove(&id)
    }

    fn at_capacity(inner: &Inner) -> bool {
        inner
            .sessions
            .values()
            .any(|s| s.status == SessionStatus::Downloading)
    }

    fn overlap(inner: &Inner, names: &[String]) -> Option<(u32, Vec<String>)> {
        inner
            .sessions
            .values()
            .filter(|s| s.status != SessionStatus::RequiresUserConfirmation)
            .find_map(|s| {
                let shared = s.targets_any(names);
                (!shared.is_empty()).then_some((s.id, shared))
            })
    }

    /// Whether some session is downloading.
    pub fn is_at_capacity(&self) -> bool {
        Self::at_capacity(&self.lock())
    }

    /// Whether a live session, other than one waiting for confirmation,
    /// already targets one of `names`.
    pub fn is_incompatible(&self, names: &[String]) -> bool {
        Self::overlap(&self.lock(), names).is_some()
    }

    /// The first session overlapping `names` and the shared modules.
    pub fn incompatible_with(&self, names: &[String]) -> Option<(u32, Vec<String>)> {
        Self::overlap(&self.lock(), names)
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.lock().listeners.push(listener);
    }

    /// Publish a snapshot to every listener.
    pub fn broadcast(&self, state: &SessionState) {
        let listeners = self.lock().listeners.clone();
        for listener in listeners {
            listener.on_state_update(state);
        }
    }

    pub fn active_sessions(&self) -> Vec<SessionState> {
        self.lock().sessions.values().map(InstallSession::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
