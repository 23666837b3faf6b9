//! Session registry: per-customer conversation state and current owner
//!
//! The registry exclusively owns every [`Session`]. Other components hold
//! only [`SessionId`] references and go through the operations here, which
//! are internally synchronized; ownership changes additionally flow through
//! the transfer coordinator so the transfer history stays consistent.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{HelplineError, Result};
use crate::items::{Message, Owner, ResponderKind, SessionId, SessionStatus, TransferRecord};

/// One customer conversation: ordered message history, current owner, and
/// the transfer log. History and transfer log are append-only.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub history: Vec<Message>,
    pub owner: Owner,
    pub status: SessionStatus,
    pub transfers: Vec<TransferRecord>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            history: Vec::new(),
            owner: Owner::Responder(ResponderKind::Triage),
            status: SessionStatus::Active,
            transfers: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Internally synchronized store of all sessions.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<SessionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a session, creating it (owned by triage, active, empty
    /// history) on first call. Idempotent: a second call with the same id
    /// returns the same session and never resets history.
    pub fn get_or_create(&self, id: &SessionId) -> Session {
        let mut map = self.inner.lock().unwrap();
        map.entry(id.clone())
            .or_insert_with(|| {
                debug!(session = %id, "Session created");
                Session::new(id.clone())
            })
            .clone()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().unwrap().contains_key(id)
    }

    pub fn owner(&self, id: &SessionId) -> Result<Owner> {
        self.read(id, |s| s.owner.clone())
    }

    pub fn status(&self, id: &SessionId) -> Result<SessionStatus> {
        self.read(id, |s| s.status)
    }

    /// Change the session's owner and log the transfer.
    ///
    /// Rejects a no-op change (`new_owner` equal to the current owner) with
    /// `InvalidTransition` so the transfer history never collects duplicate
    /// entries. A session waiting for a human becomes active again once an
    /// owner is assigned.
    pub fn update_owner(
        &self,
        id: &SessionId,
        new_owner: Owner,
        reason: Option<String>,
    ) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        let session = map
            .get_mut(id)
            .ok_or_else(|| HelplineError::UnknownSession(id.clone()))?;
        if session.status == SessionStatus::Closed {
            return Err(HelplineError::SessionClosed(id.clone()));
        }
        if session.owner == new_owner {
            return Err(HelplineError::invalid_transition(format!(
                "session {id} already owned by {new_owner}"
            )));
        }
        let from = std::mem::replace(&mut session.owner, new_owner.clone());
        session
            .transfers
            .push(TransferRecord::new(from, new_owner.clone(), reason));
        if session.status == SessionStatus::WaitingForHuman && new_owner != Owner::Unassigned {
            session.status = SessionStatus::Active;
        }
        Ok(())
    }

    /// Append to the ordered history. Past entries are never mutated.
    pub fn append_message(&self, id: &SessionId, message: Message) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        let session = map
            .get_mut(id)
            .ok_or_else(|| HelplineError::UnknownSession(id.clone()))?;
        if session.status == SessionStatus::Closed {
            return Err(HelplineError::SessionClosed(id.clone()));
        }
        session.history.push(message);
        Ok(())
    }

    /// Close the session. Idempotent; later appends and owner changes fail
    /// with `SessionClosed`.
    pub fn close(&self, id: &SessionId) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        let session = map
            .get_mut(id)
            .ok_or_else(|| HelplineError::UnknownSession(id.clone()))?;
        session.status = SessionStatus::Closed;
        Ok(())
    }

    /// Set a non-closed session's status (used when an owning operator
    /// disconnects and the session reverts to `WaitingForHuman`).
    pub fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        let session = map
            .get_mut(id)
            .ok_or_else(|| HelplineError::UnknownSession(id.clone()))?;
        if session.status == SessionStatus::Closed {
            return Err(HelplineError::SessionClosed(id.clone()));
        }
        session.status = status;
        Ok(())
    }

    /// Full ordered history.
    pub fn history(&self, id: &SessionId) -> Result<Vec<Message>> {
        self.read(id, |s| s.history.clone())
    }

    /// The most recent `limit` history entries, oldest first. Any owner
    /// taking over resumes from this window.
    pub fn context_window(&self, id: &SessionId, limit: usize) -> Result<Vec<Message>> {
        self.read(id, |s| {
            let skip = s.history.len().saturating_sub(limit);
            s.history[skip..].to_vec()
        })
    }

    /// The ordered transfer log.
    pub fn transfer_log(&self, id: &SessionId) -> Result<Vec<TransferRecord>> {
        self.read(id, |s| s.transfers.clone())
    }

    /// Snapshot of the whole session.
    pub fn snapshot(&self, id: &SessionId) -> Result<Session> {
        self.read(id, |s| s.clone())
    }

    /// Number of sessions that are not closed.
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.status != SessionStatus::Closed)
            .count()
    }

    /// Number of sessions waiting for a human owner.
    pub fn waiting_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.status == SessionStatus::WaitingForHuman)
            .count()
    }

    fn read<T>(&self, id: &SessionId, f: impl FnOnce(&Session) -> T) -> Result<T> {
        let map = self.inner.lock().unwrap();
        map.get(id)
            .map(f)
            .ok_or_else(|| HelplineError::UnknownSession(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::OperatorId;
    use pretty_assertions::assert_eq;

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = sid("s-1");

        let first = registry.get_or_create(&id);
        assert_eq!(first.owner, Owner::Responder(ResponderKind::Triage));
        assert_eq!(first.status, SessionStatus::Active);

        registry
            .append_message(&id, Message::customer("hello"))
            .unwrap();

        let second = registry.get_or_create(&id);
        assert_eq!(second.history.len(), 1);
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn update_owner_rejects_noop() {
        let registry = SessionRegistry::new();
        let id = sid("s-2");
        registry.get_or_create(&id);

        let err = registry
            .update_owner(&id, Owner::Responder(ResponderKind::Triage), None)
            .unwrap_err();
        assert!(matches!(err, HelplineError::InvalidTransition { .. }));
        assert!(registry.transfer_log(&id).unwrap().is_empty());
    }

    #[test]
    fn update_owner_records_transfer() {
        let registry = SessionRegistry::new();
        let id = sid("s-3");
        registry.get_or_create(&id);

        registry
            .update_owner(
                &id,
                Owner::Responder(ResponderKind::Technical),
                Some("boot issue".to_string()),
            )
            .unwrap();

        assert_eq!(
            registry.owner(&id).unwrap(),
            Owner::Responder(ResponderKind::Technical)
        );
        let log = registry.transfer_log(&id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].from, Owner::Responder(ResponderKind::Triage));
        assert_eq!(log[0].to, Owner::Responder(ResponderKind::Technical));
        assert_eq!(log[0].reason.as_deref(), Some("boot issue"));
    }

    #[test]
    fn unknown_session_is_surfaced() {
        let registry = SessionRegistry::new();
        let err = registry.owner(&sid("missing")).unwrap_err();
        assert!(matches!(err, HelplineError::UnknownSession(_)));
    }

    #[test]
    fn closed_session_refuses_messages_and_owner_changes() {
        let registry = SessionRegistry::new();
        let id = sid("s-4");
        registry.get_or_create(&id);
        registry.close(&id).unwrap();
        // close is idempotent
        registry.close(&id).unwrap();

        let err = registry
            .append_message(&id, Message::customer("anyone there?"))
            .unwrap_err();
        assert!(matches!(err, HelplineError::SessionClosed(_)));

        let err = registry
            .update_owner(&id, Owner::Responder(ResponderKind::Sales), None)
            .unwrap_err();
        assert!(matches!(err, HelplineError::SessionClosed(_)));
    }

    #[test]
    fn waiting_session_reactivates_on_assignment() {
        let registry = SessionRegistry::new();
        let id = sid("s-5");
        registry.get_or_create(&id);

        registry
            .update_owner(&id, Owner::Operator(OperatorId::from("op-1")), None)
            .unwrap();
        registry.update_owner(&id, Owner::Unassigned, None).unwrap();
        registry
            .set_status(&id, SessionStatus::WaitingForHuman)
            .unwrap();
        assert_eq!(registry.waiting_count(), 1);

        registry
            .update_owner(&id, Owner::Operator(OperatorId::from("op-2")), None)
            .unwrap();
        assert_eq!(registry.status(&id).unwrap(), SessionStatus::Active);
        assert_eq!(registry.waiting_count(), 0);
    }

    #[test]
    fn context_window_returns_most_recent() {
        let registry = SessionRegistry::new();
        let id = sid("s-6");
        registry.get_or_create(&id);
        for i in 0..15 {
            registry
                .append_message(&id, Message::customer(format!("msg {i}")))
                .unwrap();
        }

        let window = registry.context_window(&id, 10).unwrap();
        assert_eq!(window.len(), 10);
        assert_eq!(window[0].content, "msg 5");
        assert_eq!(window[9].content, "msg 14");

        let all = registry.context_window(&id, 100).unwrap();
        assert_eq!(all.len(), 15);
    }
}
