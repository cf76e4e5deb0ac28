//! Takeover protocol
//!
//! Mediates handing a monitored call from its current owner to a challenging
//! supervisor.
//!
//! ```text
//!            request_takeover
//!   Idle ───────────────────────► RequestSent
//!                                   │  │  │
//!            owner accepts ─────────┘  │  └───────── grace period expires
//!                   │                  │                     │
//!                   ▼          owner rejects                 ▼
//!               Accepted               │                 TimedOut
//!                                      ▼
//!                                  Rejected
//! ```
//!
//! `Accepted` and `TimedOut` have the same effect: the owner's session is
//! revoked and the challenger's pending session becomes Active, in a single
//! store transaction. They differ only in the owner's
//! [`RevokedReason`](super::types::RevokedReason). A request that cannot
//! complete for other reasons (challenger gave up, call ended, mode no longer
//! valid, someone else got the call first) resolves as `Aborted`.
//!
//! Exactly one resolver wins per request. Handing the call over is done with
//! the call's registry guard held so the mode is validated against the call
//! state at the moment of the swap.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{MonitorEvent, MonitorEventBus, TransitionCause};
use super::interest::SessionInterest;
use super::policy;
use super::store::{CurrentOwner, MonitoringSessionStore, TransferOutcome};
use super::types::{EndReason, MonitorMode, MonitoringSession, MonitoringSessionId, RevokedReason, SessionStatus, SupervisorId};
use crate::call::registry::AgentCallRegistry;
use crate::call::types::CallId;
use crate::error::{MonitorError, Result};

/// Extra time a waiting challenger allows past the deadline before resolving the request itself
const RESOLUTION_SLACK: Duration = Duration::from_millis(250);

/// Identifier of one takeover request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TakeoverId(pub String);

impl TakeoverId {
    pub fn new() -> Self {
        Self(format!("tko-{}", Uuid::new_v4()))
    }
}

impl Default for TakeoverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TakeoverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a request resolved without the owner's decision or the timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The challenger ended its pending session
    ChallengerCancelled,
    /// The call ended before the handover
    CallEnded,
    /// The requested mode is not valid for the call any more
    ModeNotAllowed,
    /// Another session got the call first
    OwnerChanged,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::ChallengerCancelled => "challenger cancelled",
            AbortReason::CallEnded => "call ended",
            AbortReason::ModeNotAllowed => "mode no longer allowed",
            AbortReason::OwnerChanged => "call owner changed",
        };
        f.write_str(s)
    }
}

/// Takeover request state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TakeoverState {
    Idle,
    RequestSent,
    Accepted,
    TimedOut,
    Rejected,
    Aborted(AbortReason),
}

impl TakeoverState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, TakeoverState::Idle | TakeoverState::RequestSent)
    }

    /// Whether the challenger ended up owning the call
    pub fn is_granted(&self) -> bool {
        matches!(self, TakeoverState::Accepted | TakeoverState::TimedOut)
    }
}

/// Owner's answer to a takeover request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TakeoverDecision {
    Accept,
    Reject,
}

/// What a challenger holds while its request is open
#[derive(Debug, Clone, PartialEq)]
pub struct TakeoverTicket {
    pub request_id: TakeoverId,
    pub call_id: CallId,
    pub owner: CurrentOwner,
    /// The challenger's Pending session; Active once the takeover is granted
    pub challenger_session: MonitoringSessionId,
    pub deadline: DateTime<Utc>,
}

struct TakeoverEntry {
    request_id: TakeoverId,
    call_id: CallId,
    mode: MonitorMode,
    owner: CurrentOwner,
    challenger: SupervisorId,
    challenger_session: MonitoringSessionId,
    deadline: DateTime<Utc>,
    /// Set by the single resolver that wins the request
    resolving: AtomicBool,
    resolved_at: Mutex<Option<DateTime<Utc>>>,
    state: watch::Sender<TakeoverState>,
}

impl TakeoverEntry {
    fn current(&self) -> TakeoverState {
        *self.state.borrow()
    }

    fn claim_resolution(&self) -> bool {
        !self.resolving.swap(true, Ordering::AcqRel)
    }

    fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    fn ticket(&self) -> TakeoverTicket {
        TakeoverTicket {
            request_id: self.request_id.clone(),
            call_id: self.call_id.clone(),
            owner: self.owner.clone(),
            challenger_session: self.challenger_session.clone(),
            deadline: self.deadline,
        }
    }
}

/// Takeover state machine over the session store
pub struct TakeoverProtocol {
    requests: Arc<DashMap<TakeoverId, Arc<TakeoverEntry>>>,
    /// Challenger session -> its request
    by_challenger: Arc<DashMap<MonitoringSessionId, TakeoverId>>,
    store: MonitoringSessionStore,
    registry: AgentCallRegistry,
    bus: MonitorEventBus,
    interest: Arc<SessionInterest>,
    grace_period: Duration,
    /// Resolved requests are dropped this long after resolution
    retention: Duration,
}

impl TakeoverProtocol {
    pub(crate) fn new(
        store: MonitoringSessionStore,
        registry: AgentCallRegistry,
        bus: MonitorEventBus,
        interest: Arc<SessionInterest>,
        grace_period: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
            by_challenger: Arc::new(DashMap::new()),
            store,
            registry,
            bus,
            interest,
            grace_period,
            retention,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Send a request to `owner` on behalf of a recorded Pending challenger session
    ///
    /// Notifies the owner on the event feed and arms the grace timer.
    pub(crate) fn open(&self, owner: CurrentOwner, challenger: &MonitoringSession) -> TakeoverTicket {
        let grace = chrono::Duration::from_std(self.grace_period).unwrap_or_else(|_| chrono::Duration::zero());
        let (state, _) = watch::channel(TakeoverState::Idle);
        let entry = Arc::new(TakeoverEntry {
            request_id: TakeoverId::new(),
            call_id: challenger.call_id.clone(),
            mode: challenger.mode,
            owner,
            challenger: challenger.supervisor_id.clone(),
            challenger_session: challenger.session_id.clone(),
            deadline: Utc::now() + grace,
            resolving: AtomicBool::new(false),
            resolved_at: Mutex::new(None),
            state,
        });
        self.requests.insert(entry.request_id.clone(), entry.clone());
        self.by_challenger
            .insert(entry.challenger_session.clone(), entry.request_id.clone());
        entry.state.send_replace(TakeoverState::RequestSent);

        self.bus.publish(MonitorEvent::TakeoverRequested {
            request_id: entry.request_id.clone(),
            call_id: entry.call_id.clone(),
            owner: entry.owner.supervisor_id.clone(),
            challenger: entry.challenger.clone(),
            mode: entry.mode,
            deadline: entry.deadline,
        });

        let protocol = self.clone();
        let request_id = entry.request_id.clone();
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            if let Err(e) = protocol.expire(&request_id).await {
                warn!("Takeover {} expiry failed: {}", request_id, e);
            }
        });

        entry.ticket()
    }

    pub fn state(&self, request_id: &TakeoverId) -> Result<TakeoverState> {
        Ok(self.entry(request_id)?.current())
    }

    pub fn ticket(&self, request_id: &TakeoverId) -> Result<TakeoverTicket> {
        Ok(self.entry(request_id)?.ticket())
    }

    /// Requests that have not resolved yet
    pub fn open_requests(&self) -> Vec<TakeoverTicket> {
        self.requests
            .iter()
            .filter(|entry| !entry.current().is_resolved())
            .map(|entry| entry.ticket())
            .collect()
    }

    /// The owner's explicit answer
    ///
    /// Answering after the grace period has elapsed yields
    /// [`MonitorError::TakeoverTimedOut`]: the challenger already has the call.
    pub async fn respond(
        &self,
        request_id: &TakeoverId,
        responder: &SupervisorId,
        decision: TakeoverDecision,
    ) -> Result<TakeoverState> {
        let entry = self.entry(request_id)?;
        if responder != &entry.owner.supervisor_id {
            return Err(MonitorError::SessionNotOwned {
                session_id: entry.owner.session_id.clone(),
                status: self
                    .store
                    .get(&entry.owner.session_id)
                    .map(|s| s.status)
                    .unwrap_or(SessionStatus::Active),
            });
        }

        let state = if entry.remaining().is_zero() {
            self.hand_over(&entry, TakeoverState::TimedOut).await?
        } else {
            match decision {
                TakeoverDecision::Accept => self.hand_over(&entry, TakeoverState::Accepted).await?,
                TakeoverDecision::Reject => match self.refuse(&entry, TakeoverState::Rejected)? {
                    state if state.is_resolved() => state,
                    _ => self.settled(&entry).await?,
                },
            }
        };

        match state {
            TakeoverState::TimedOut => Err(MonitorError::TakeoverTimedOut {
                request_id: entry.request_id.clone(),
                challenger: entry.challenger.clone(),
            }),
            TakeoverState::Aborted(reason) => Err(MonitorError::TakeoverAborted {
                request_id: entry.request_id.clone(),
                reason,
            }),
            other => Ok(other),
        }
    }

    /// Wait for the request to resolve, as the challenger
    ///
    /// Returns the challenger's session once it owns the call. Never waits
    /// much past the deadline: if the grace timer has not fired by then the
    /// waiter resolves the request itself.
    pub async fn wait(&self, request_id: &TakeoverId) -> Result<MonitoringSession> {
        let entry = self.entry(request_id)?;
        let mut rx = entry.state.subscribe();
        let bound = entry.remaining() + RESOLUTION_SLACK;
        let waited = tokio::time::timeout(bound, async {
            rx.wait_for(|state| state.is_resolved()).await.map(|state| *state)
        })
        .await;

        let state = match waited {
            Ok(Ok(state)) => state,
            _ => self.hand_over(&entry, TakeoverState::TimedOut).await?,
        };

        match state {
            TakeoverState::Accepted | TakeoverState::TimedOut => self
                .store
                .get(&entry.challenger_session)
                .ok_or_else(|| MonitorError::SessionNotFound(entry.challenger_session.clone())),
            TakeoverState::Rejected => Err(MonitorError::TakeoverRejected {
                call_id: entry.call_id.clone(),
                owner: entry.owner.supervisor_id.clone(),
            }),
            TakeoverState::Aborted(reason) => Err(MonitorError::TakeoverAborted {
                request_id: entry.request_id.clone(),
                reason,
            }),
            TakeoverState::Idle | TakeoverState::RequestSent => {
                Err(MonitorError::internal(format!("takeover {} did not resolve", request_id)))
            }
        }
    }

    /// Resolve an expired request as timed out; no-op once resolved
    pub(crate) async fn expire(&self, request_id: &TakeoverId) -> Result<TakeoverState> {
        let entry = self.entry(request_id)?;
        self.hand_over(&entry, TakeoverState::TimedOut).await
    }

    /// The challenger's pending session ended outside the protocol
    ///
    /// Must not take the call's registry guard; this runs from call listeners.
    pub(crate) fn challenger_ended(&self, session_id: &MonitoringSessionId, reason: AbortReason) {
        let request_id = match self.by_challenger.get(session_id) {
            Some(request_id) => request_id.clone(),
            None => return,
        };
        if let Ok(entry) = self.entry(&request_id) {
            if let Err(e) = self.refuse(&entry, TakeoverState::Aborted(reason)) {
                warn!("Failed to abort takeover {}: {}", request_id, e);
            }
        }
    }

    /// Drop resolved requests older than `max_age`
    pub fn prune_resolved(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let stale: Vec<Arc<TakeoverEntry>> = self
            .requests
            .iter()
            .filter(|entry| matches!(*entry.resolved_at.lock(), Some(at) if at <= cutoff))
            .map(|entry| entry.value().clone())
            .collect();
        for entry in &stale {
            self.requests.remove(&entry.request_id);
            self.by_challenger.remove(&entry.challenger_session);
        }
        stale.len()
    }

    /// Grant the call to the challenger as `granted` (Accepted or TimedOut)
    async fn hand_over(&self, entry: &TakeoverEntry, granted: TakeoverState) -> Result<TakeoverState> {
        if entry.current().is_resolved() {
            return Ok(entry.current());
        }
        let guard = match self.registry.lock_call(&entry.call_id).await {
            Ok(guard) => Some(guard),
            Err(MonitorError::CallNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if !entry.claim_resolution() {
            drop(guard);
            return self.settled(entry).await;
        }

        let precondition = match &guard {
            None => Err(AbortReason::CallEnded),
            Some(guard) => match policy::check_attach(guard.call(), entry.mode) {
                Ok(()) => Ok(()),
                Err(MonitorError::CallEnded(_)) => Err(AbortReason::CallEnded),
                Err(_) => Err(AbortReason::ModeNotAllowed),
            },
        };
        if let Err(reason) = precondition {
            drop(guard);
            return Ok(self.finish_refusal(entry, TakeoverState::Aborted(reason)));
        }

        let reason = match granted {
            TakeoverState::Accepted => RevokedReason::Takeover { by: entry.challenger.clone() },
            _ => RevokedReason::TakeoverTimedOut { by: entry.challenger.clone() },
        };
        let outcome = self.store.transfer_ownership(
            &entry.call_id,
            &entry.owner.session_id,
            &entry.challenger_session,
            reason.clone(),
        );
        drop(guard);

        let activated = match outcome {
            Ok(TransferOutcome::Transferred { revoked, owner_was, activated }) => {
                self.interest.release(&revoked.session_id);
                self.bus.session_changed(
                    &revoked,
                    Some(owner_was),
                    revoked.mode,
                    TransitionCause::Revoked(reason),
                );
                info!(
                    "🔁 Session {} of {} revoked on call {} ({})",
                    revoked.session_id,
                    revoked.supervisor_id,
                    entry.call_id,
                    revoked.revoked_reason.as_ref().map(|r| r.to_string()).unwrap_or_default()
                );
                activated
            }
            Ok(TransferOutcome::Vacant { activated }) => activated,
            Ok(TransferOutcome::OwnerChanged(_)) => {
                return Ok(self.finish_refusal(entry, TakeoverState::Aborted(AbortReason::OwnerChanged)));
            }
            Err(MonitorError::SessionNotOwned { .. }) => {
                return Ok(self.finish_refusal(entry, TakeoverState::Aborted(AbortReason::ChallengerCancelled)));
            }
            Err(e) => {
                self.finish_refusal(entry, TakeoverState::Aborted(AbortReason::ChallengerCancelled));
                return Err(e);
            }
        };

        self.bus.session_changed(
            &activated,
            Some(SessionStatus::Pending),
            activated.mode,
            TransitionCause::TakeoverGranted,
        );
        info!(
            "🔁 Supervisor {} now monitors call {} in {} mode",
            activated.supervisor_id, entry.call_id, activated.mode
        );
        Ok(self.finish(entry, granted))
    }

    /// Resolve without handing over (Rejected or Aborted)
    fn refuse(&self, entry: &TakeoverEntry, state: TakeoverState) -> Result<TakeoverState> {
        if !entry.claim_resolution() {
            // Another resolver holds the request; may still read RequestSent.
            return Ok(entry.current());
        }
        Ok(self.finish_refusal(entry, state))
    }

    fn finish_refusal(&self, entry: &TakeoverEntry, state: TakeoverState) -> TakeoverState {
        if let Some(ended) = self.store.end_if_pending(&entry.challenger_session, EndReason::TakeoverFailed) {
            self.interest.release(&ended.session_id);
            self.bus.session_changed(
                &ended,
                Some(SessionStatus::Pending),
                ended.mode,
                TransitionCause::Ended(EndReason::TakeoverFailed),
            );
        }
        self.finish(entry, state)
    }

    fn finish(&self, entry: &TakeoverEntry, state: TakeoverState) -> TakeoverState {
        *entry.resolved_at.lock() = Some(Utc::now());
        entry.state.send_replace(state);
        self.by_challenger.remove(&entry.challenger_session);
        self.bus.publish(MonitorEvent::TakeoverResolved {
            request_id: entry.request_id.clone(),
            call_id: entry.call_id.clone(),
            state,
        });
        self.forget_later(entry.request_id.clone());
        state
    }

    fn forget_later(&self, request_id: TakeoverId) {
        let requests = Arc::downgrade(&self.requests);
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if let Some(requests) = requests.upgrade() {
                if requests.remove(&request_id).is_some() {
                    debug!("Takeover request {} dropped after {:?}", request_id, retention);
                }
            }
        });
    }

    /// Wait for another resolver to publish its result
    async fn settled(&self, entry: &TakeoverEntry) -> Result<TakeoverState> {
        let mut rx = entry.state.subscribe();
        let state = rx
            .wait_for(|state| state.is_resolved())
            .await
            .map(|state| *state)
            .map_err(|_| MonitorError::internal("takeover state channel closed"))?;
        Ok(state)
    }

    fn entry(&self, request_id: &TakeoverId) -> Result<Arc<TakeoverEntry>> {
        self.requests
            .get(request_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MonitorError::TakeoverNotFound(request_id.clone()))
    }
}

impl Clone for TakeoverProtocol {
    fn clone(&self) -> Self {
        Self {
            requests: Arc::clone(&self.requests),
            by_challenger: Arc::clone(&self.by_challenger),
            store: self.store.clone(),
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            interest: Arc::clone(&self.interest),
            grace_period: self.grace_period,
            retention: self.retention,
        }
    }
}
