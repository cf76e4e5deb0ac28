//! Monitoring session store
//!
//! Keyed store of every monitoring session plus a per-call owner index. The
//! owner index holds at most one session per call; a session in it is either
//! Active or Pending awaiting platform confirmation. Every mutation that
//! touches the owner index runs inside one `parking_lot` critical section, so
//! claiming a call, ending a session and handing a call from one session to
//! another are each atomic with respect to all other store operations.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use super::types::{
    EndReason, MonitorMode, MonitoringSession, MonitoringSessionId, RevokedReason, SessionStatus, SupervisorId,
};
use crate::call::types::CallId;
use crate::error::{MonitorError, Result};

/// Identity of the session currently holding a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentOwner {
    pub session_id: MonitoringSessionId,
    pub supervisor_id: SupervisorId,
    pub mode: MonitorMode,
    pub status: SessionStatus,
}

impl From<&MonitoringSession> for CurrentOwner {
    fn from(session: &MonitoringSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            supervisor_id: session.supervisor_id.clone(),
            mode: session.mode,
            status: session.status,
        }
    }
}

/// Result of trying to claim a call
#[derive(Debug, Clone, PartialEq)]
pub enum SetActiveOutcome {
    /// The session now holds the call
    Accepted(MonitoringSession),
    /// Another session already holds the call
    Conflict(CurrentOwner),
}

/// Result of ending a session
#[derive(Debug, Clone, PartialEq)]
pub struct EndOutcome {
    pub session: MonitoringSession,
    pub previous_status: SessionStatus,
    /// `false` when the session was already terminal
    pub changed: bool,
}

/// Result of handing a call to a takeover challenger
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// The expected owner was revoked and the challenger activated
    Transferred {
        revoked: MonitoringSession,
        /// Status the owner had before the revoke (Pending if never confirmed)
        owner_was: SessionStatus,
        activated: MonitoringSession,
    },
    /// The owner had already let go; the challenger took the free call
    Vacant { activated: MonitoringSession },
    /// A different session holds the call now
    OwnerChanged(CurrentOwner),
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<MonitoringSessionId, MonitoringSession>,
    owners: HashMap<CallId, MonitoringSessionId>,
}

impl StoreState {
    fn session(&self, session_id: &MonitoringSessionId) -> Result<&MonitoringSession> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| MonitorError::SessionNotFound(session_id.clone()))
    }

    fn session_mut(&mut self, session_id: &MonitoringSessionId) -> Result<&mut MonitoringSession> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| MonitorError::SessionNotFound(session_id.clone()))
    }

    fn release_owner(&mut self, call_id: &CallId, session_id: &MonitoringSessionId) {
        if self.owners.get(call_id) == Some(session_id) {
            self.owners.remove(call_id);
        }
    }

    fn claim(&mut self, mut session: MonitoringSession, status: SessionStatus) -> Result<SetActiveOutcome> {
        if session.is_terminal() {
            return Err(MonitorError::SessionNotOwned {
                session_id: session.session_id.clone(),
                status: session.status,
            });
        }
        if let Some(owner_id) = self.owners.get(&session.call_id) {
            if owner_id != &session.session_id {
                let owner = self.session(owner_id)?;
                return Ok(SetActiveOutcome::Conflict(CurrentOwner::from(owner)));
            }
        }
        if let Some(existing) = self.sessions.get(&session.session_id) {
            if existing.is_terminal() {
                return Err(MonitorError::SessionNotOwned {
                    session_id: existing.session_id.clone(),
                    status: existing.status,
                });
            }
        }

        session.status = status;
        session.updated_at = Utc::now();
        self.owners.insert(session.call_id.clone(), session.session_id.clone());
        self.sessions.insert(session.session_id.clone(), session.clone());
        Ok(SetActiveOutcome::Accepted(session))
    }
}

/// Store of monitoring sessions guaranteeing one owner per call
pub struct MonitoringSessionStore {
    state: Arc<Mutex<StoreState>>,
}

impl MonitoringSessionStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
        }
    }

    /// The Active session on a call, if any
    pub fn get_active_session(&self, call_id: &CallId) -> Option<MonitoringSession> {
        let state = self.state.lock();
        state
            .owners
            .get(call_id)
            .and_then(|id| state.sessions.get(id))
            .filter(|session| session.is_active())
            .cloned()
    }

    /// The session holding a call, Active or Pending
    pub fn owner_of(&self, call_id: &CallId) -> Option<MonitoringSession> {
        let state = self.state.lock();
        state.owners.get(call_id).and_then(|id| state.sessions.get(id)).cloned()
    }

    /// Claim the call for `session` and make it Active
    ///
    /// This compare-and-swap is the only way a session becomes the first owner
    /// of a call. Of any number of concurrent claims on one call exactly one is
    /// accepted; the rest get the winner as [`SetActiveOutcome::Conflict`].
    pub fn try_set_active(&self, session: MonitoringSession) -> Result<SetActiveOutcome> {
        let outcome = self.state.lock().claim(session, SessionStatus::Active)?;
        if let SetActiveOutcome::Accepted(session) = &outcome {
            debug!("Store accepted {} as active on call {}", session.session_id, session.call_id);
        }
        Ok(outcome)
    }

    /// Claim the call for `session` but leave it Pending until [`confirm`](Self::confirm)
    pub fn try_reserve(&self, session: MonitoringSession) -> Result<SetActiveOutcome> {
        let outcome = self.state.lock().claim(session, SessionStatus::Pending)?;
        if let SetActiveOutcome::Accepted(session) = &outcome {
            debug!("Store reserved call {} for pending {}", session.call_id, session.session_id);
        }
        Ok(outcome)
    }

    /// Promote a reserved Pending session to Active
    pub fn confirm(&self, session_id: &MonitoringSessionId) -> Result<MonitoringSession> {
        let mut state = self.state.lock();
        let owns_call = {
            let session = state.session(session_id)?;
            state.owners.get(&session.call_id) == Some(session_id)
        };
        let session = state.session_mut(session_id)?;
        if session.status != SessionStatus::Pending || !owns_call {
            return Err(MonitorError::SessionNotOwned {
                session_id: session_id.clone(),
                status: session.status,
            });
        }
        session.status = SessionStatus::Active;
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    /// Record a Pending session that does not claim its call (a takeover challenger)
    pub fn record_pending(&self, session: MonitoringSession) -> Result<()> {
        let mut state = self.state.lock();
        if state.sessions.contains_key(&session.session_id) {
            return Err(MonitorError::internal(format!(
                "session {} already recorded",
                session.session_id
            )));
        }
        state.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    pub fn get(&self, session_id: &MonitoringSessionId) -> Option<MonitoringSession> {
        self.state.lock().sessions.get(session_id).cloned()
    }

    /// Change the mode of the session holding its call, returning it with its previous mode
    ///
    /// The holder is either Active or Pending awaiting confirmation. A Pending
    /// takeover challenger does not hold the call and is refused.
    pub fn update_mode(
        &self,
        session_id: &MonitoringSessionId,
        mode: MonitorMode,
    ) -> Result<(MonitoringSession, MonitorMode)> {
        let mut state = self.state.lock();
        let holds_call = state
            .session(session_id)
            .map(|session| state.owners.get(&session.call_id) == Some(session_id))?;
        let session = state.session_mut(session_id)?;
        if !holds_call || session.is_terminal() {
            return Err(MonitorError::SessionNotOwned {
                session_id: session_id.clone(),
                status: session.status,
            });
        }
        let previous = session.mode;
        session.mode = mode;
        session.updated_at = Utc::now();
        Ok((session.clone(), previous))
    }

    /// End a session and free its call. Ending a terminal session changes nothing.
    pub fn mark_ended(&self, session_id: &MonitoringSessionId, reason: EndReason) -> Result<EndOutcome> {
        let mut state = self.state.lock();
        let session = state.session_mut(session_id)?;
        let previous_status = session.status;
        if session.is_terminal() {
            return Ok(EndOutcome {
                session: session.clone(),
                previous_status,
                changed: false,
            });
        }
        session.status = SessionStatus::Ended;
        session.end_reason = Some(reason);
        session.updated_at = Utc::now();
        let ended = session.clone();
        state.release_owner(&ended.call_id, session_id);
        Ok(EndOutcome {
            session: ended,
            previous_status,
            changed: true,
        })
    }

    /// End a session only if it is still Pending
    pub fn end_if_pending(&self, session_id: &MonitoringSessionId, reason: EndReason) -> Option<MonitoringSession> {
        let mut state = self.state.lock();
        let session = state.sessions.get_mut(session_id)?;
        if session.status != SessionStatus::Pending {
            return None;
        }
        session.status = SessionStatus::Ended;
        session.end_reason = Some(reason);
        session.updated_at = Utc::now();
        let ended = session.clone();
        state.release_owner(&ended.call_id, session_id);
        Some(ended)
    }

    /// Revoke a live session and free its call
    pub fn revoke(&self, session_id: &MonitoringSessionId, reason: RevokedReason) -> Result<MonitoringSession> {
        let mut state = self.state.lock();
        let session = state.session_mut(session_id)?;
        if session.is_terminal() {
            return Err(MonitorError::SessionNotOwned {
                session_id: session_id.clone(),
                status: session.status,
            });
        }
        session.status = SessionStatus::Revoked;
        session.revoked_reason = Some(reason);
        session.updated_at = Utc::now();
        let revoked = session.clone();
        state.release_owner(&revoked.call_id, session_id);
        Ok(revoked)
    }

    /// Revoke `expected_owner` and activate `challenger` as one transaction
    ///
    /// The challenger must still be Pending. If the call has no owner any more
    /// the challenger simply takes it.
    pub fn transfer_ownership(
        &self,
        call_id: &CallId,
        expected_owner: &MonitoringSessionId,
        challenger: &MonitoringSessionId,
        reason: RevokedReason,
    ) -> Result<TransferOutcome> {
        let mut state = self.state.lock();
        let challenger_status = state.session(challenger)?.status;
        if challenger_status != SessionStatus::Pending {
            return Err(MonitorError::SessionNotOwned {
                session_id: challenger.clone(),
                status: challenger_status,
            });
        }

        let revoked = match state.owners.get(call_id).cloned() {
            Some(owner_id) if &owner_id == expected_owner => {
                let now = Utc::now();
                let owner = state.session_mut(&owner_id)?;
                let owner_was = owner.status;
                owner.status = SessionStatus::Revoked;
                owner.revoked_reason = Some(reason);
                owner.updated_at = now;
                Some((owner.clone(), owner_was))
            }
            Some(owner_id) => {
                let owner = state.session(&owner_id)?;
                return Ok(TransferOutcome::OwnerChanged(CurrentOwner::from(owner)));
            }
            None => None,
        };

        let activated = {
            let session = state.session_mut(challenger)?;
            session.status = SessionStatus::Active;
            session.updated_at = Utc::now();
            session.clone()
        };
        state.owners.insert(call_id.clone(), challenger.clone());

        Ok(match revoked {
            Some((revoked, owner_was)) => TransferOutcome::Transferred {
                revoked,
                owner_was,
                activated,
            },
            None => TransferOutcome::Vacant { activated },
        })
    }

    /// Every session ever recorded for a call, oldest first
    pub fn sessions_for_call(&self, call_id: &CallId) -> Vec<MonitoringSession> {
        let mut sessions: Vec<_> = self
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| &s.call_id == call_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn sessions_for_supervisor(&self, supervisor_id: &SupervisorId) -> Vec<MonitoringSession> {
        let mut sessions: Vec<_> = self
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| &s.supervisor_id == supervisor_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn active_sessions(&self) -> Vec<MonitoringSession> {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    /// Number of Active records for a call, counted from the records themselves
    pub fn active_count(&self, call_id: &CallId) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| &s.call_id == call_id && s.is_active())
            .count()
    }

    /// Drop the terminal audit records of a call that nobody holds any more
    ///
    /// Returns how many records were removed; nothing is removed while the
    /// call still has an owner.
    pub fn purge_call(&self, call_id: &CallId) -> usize {
        let mut state = self.state.lock();
        if state.owners.contains_key(call_id) {
            return 0;
        }
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, s| !(&s.call_id == call_id && s.is_terminal()));
        before - state.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

impl Default for MonitoringSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MonitoringSessionStore {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(supervisor: &str, call: &str, mode: MonitorMode) -> MonitoringSession {
        MonitoringSession::pending(SupervisorId::from(supervisor), CallId::from(call), mode)
    }

    fn accepted(outcome: SetActiveOutcome) -> MonitoringSession {
        match outcome {
            SetActiveOutcome::Accepted(s) => s,
            SetActiveOutcome::Conflict(owner) => panic!("unexpected conflict with {:?}", owner),
        }
    }

    #[test]
    fn test_second_claim_conflicts_with_owner() {
        let store = MonitoringSessionStore::new();
        let first = accepted(store.try_set_active(session("s1", "c1", MonitorMode::Listen)).unwrap());
        assert_eq!(first.status, SessionStatus::Active);

        match store.try_set_active(session("s2", "c1", MonitorMode::Listen)).unwrap() {
            SetActiveOutcome::Conflict(owner) => {
                assert_eq!(owner.session_id, first.session_id);
                assert_eq!(owner.supervisor_id, SupervisorId::from("s1"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(store.active_count(&CallId::from("c1")), 1);
    }

    #[test]
    fn test_distinct_calls_do_not_contend() {
        let store = MonitoringSessionStore::new();
        accepted(store.try_set_active(session("s1", "c1", MonitorMode::Listen)).unwrap());
        accepted(store.try_set_active(session("s1", "c2", MonitorMode::Whisper)).unwrap());
        assert_eq!(store.active_sessions().len(), 2);
        assert_eq!(store.sessions_for_supervisor(&SupervisorId::from("s1")).len(), 2);
    }

    #[test]
    fn test_concurrent_claims_yield_one_winner() {
        let store = MonitoringSessionStore::new();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .try_set_active(session(&format!("s{}", i), "c1", MonitorMode::Listen))
                        .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = outcomes
            .iter()
            .filter(|o| matches!(o, SetActiveOutcome::Accepted(_)))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.active_count(&CallId::from("c1")), 1);
    }

    #[test]
    fn test_mark_ended_is_idempotent_and_frees_call() {
        let store = MonitoringSessionStore::new();
        let s = accepted(store.try_set_active(session("s1", "c1", MonitorMode::Listen)).unwrap());

        let first = store.mark_ended(&s.session_id, EndReason::Stopped).unwrap();
        assert!(first.changed);
        assert_eq!(first.previous_status, SessionStatus::Active);
        let second = store.mark_ended(&s.session_id, EndReason::CallEnded).unwrap();
        assert!(!second.changed);
        assert_eq!(second.session, first.session);
        assert_eq!(second.session.end_reason, Some(EndReason::Stopped));

        accepted(store.try_set_active(session("s2", "c1", MonitorMode::Listen)).unwrap());
    }

    #[test]
    fn test_revoked_session_never_reactivates() {
        let store = MonitoringSessionStore::new();
        let s = accepted(store.try_set_active(session("s1", "c1", MonitorMode::Listen)).unwrap());
        store
            .revoke(&s.session_id, RevokedReason::Takeover { by: SupervisorId::from("s2") })
            .unwrap();

        let mut again = store.get(&s.session_id).unwrap();
        again.status = SessionStatus::Pending;
        assert!(matches!(store.try_set_active(again), Err(MonitorError::SessionNotOwned { .. })));
        assert!(store.update_mode(&s.session_id, MonitorMode::Whisper).is_err());
        assert!(store.revoke(&s.session_id, RevokedReason::Takeover { by: SupervisorId::from("s3") }).is_err());
    }

    #[test]
    fn test_reserve_then_confirm() {
        let store = MonitoringSessionStore::new();
        let s = accepted(store.try_reserve(session("s1", "c1", MonitorMode::Join)).unwrap());
        assert_eq!(s.status, SessionStatus::Pending);
        assert!(store.get_active_session(&CallId::from("c1")).is_none());
        assert!(matches!(
            store.try_set_active(session("s2", "c1", MonitorMode::Listen)).unwrap(),
            SetActiveOutcome::Conflict(_)
        ));

        let confirmed = store.confirm(&s.session_id).unwrap();
        assert_eq!(confirmed.status, SessionStatus::Active);
        assert!(store.confirm(&s.session_id).is_err());
    }

    #[test]
    fn test_update_mode_only_for_the_call_holder() {
        let store = MonitoringSessionStore::new();
        let reserved = accepted(store.try_reserve(session("s1", "c1", MonitorMode::Whisper)).unwrap());
        let challenger = session("s2", "c1", MonitorMode::Whisper);
        store.record_pending(challenger.clone()).unwrap();

        let (downgraded, previous) = store.update_mode(&reserved.session_id, MonitorMode::Listen).unwrap();
        assert_eq!(previous, MonitorMode::Whisper);
        assert_eq!(downgraded.mode, MonitorMode::Listen);
        assert_eq!(downgraded.status, SessionStatus::Pending);

        assert!(matches!(
            store.update_mode(&challenger.session_id, MonitorMode::Listen),
            Err(MonitorError::SessionNotOwned { status: SessionStatus::Pending, .. })
        ));
    }

    #[test]
    fn test_end_if_pending_only_touches_pending() {
        let store = MonitoringSessionStore::new();
        let pending = accepted(store.try_reserve(session("s1", "c1", MonitorMode::Listen)).unwrap());
        let active = accepted(store.try_set_active(session("s2", "c2", MonitorMode::Listen)).unwrap());

        assert!(store.end_if_pending(&active.session_id, EndReason::Abandoned).is_none());
        let ended = store.end_if_pending(&pending.session_id, EndReason::Abandoned).unwrap();
        assert_eq!(ended.end_reason, Some(EndReason::Abandoned));
        assert!(store.owner_of(&CallId::from("c1")).is_none());
    }

    #[test]
    fn test_transfer_ownership_is_atomic_swap() {
        let store = MonitoringSessionStore::new();
        let owner = accepted(store.try_set_active(session("s1", "c1", MonitorMode::Listen)).unwrap());
        let challenger = session("s2", "c1", MonitorMode::Listen);
        store.record_pending(challenger.clone()).unwrap();

        let outcome = store
            .transfer_ownership(
                &CallId::from("c1"),
                &owner.session_id,
                &challenger.session_id,
                RevokedReason::TakeoverTimedOut { by: SupervisorId::from("s2") },
            )
            .unwrap();
        match outcome {
            TransferOutcome::Transferred { revoked, owner_was, activated } => {
                assert_eq!(owner_was, SessionStatus::Active);
                assert_eq!(revoked.status, SessionStatus::Revoked);
                assert_eq!(revoked.supervisor_id, SupervisorId::from("s1"));
                assert_eq!(activated.session_id, challenger.session_id);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(store.active_count(&CallId::from("c1")), 1);
        assert_eq!(
            store.get_active_session(&CallId::from("c1")).unwrap().session_id,
            challenger.session_id
        );
    }

    #[test]
    fn test_transfer_to_vacant_call_and_owner_changed() {
        let store = MonitoringSessionStore::new();
        let owner = accepted(store.try_set_active(session("s1", "c1", MonitorMode::Listen)).unwrap());
        let challenger = session("s2", "c1", MonitorMode::Listen);
        store.record_pending(challenger.clone()).unwrap();
        store.mark_ended(&owner.session_id, EndReason::Stopped).unwrap();
        let third = accepted(store.try_set_active(session("s3", "c1", MonitorMode::Listen)).unwrap());

        let outcome = store
            .transfer_ownership(
                &CallId::from("c1"),
                &owner.session_id,
                &challenger.session_id,
                RevokedReason::Takeover { by: SupervisorId::from("s2") },
            )
            .unwrap();
        assert!(matches!(outcome, TransferOutcome::OwnerChanged(ref o) if o.session_id == third.session_id));

        store.mark_ended(&third.session_id, EndReason::Stopped).unwrap();
        let outcome = store
            .transfer_ownership(
                &CallId::from("c1"),
                &owner.session_id,
                &challenger.session_id,
                RevokedReason::Takeover { by: SupervisorId::from("s2") },
            )
            .unwrap();
        assert!(matches!(outcome, TransferOutcome::Vacant { .. }));
    }

    #[test]
    fn test_purge_keeps_owned_calls() {
        let store = MonitoringSessionStore::new();
        let s = accepted(store.try_set_active(session("s1", "c1", MonitorMode::Listen)).unwrap());
        assert_eq!(store.purge_call(&CallId::from("c1")), 0);
        store.mark_ended(&s.session_id, EndReason::Stopped).unwrap();
        assert_eq!(store.purge_call(&CallId::from("c1")), 1);
        assert_eq!(store.len(), 0);
    }
}
