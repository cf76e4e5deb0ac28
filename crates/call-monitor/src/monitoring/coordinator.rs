//! Monitoring coordinator
//!
//! The single entry point supervisor-side callers use. It validates every
//! command against the call's state at the moment of acting, claims calls
//! through the [`MonitoringSessionStore`], routes contention into the
//! [`TakeoverProtocol`] and keeps each live session subscribed to its call so
//! that call transitions drive automatic downgrades and endings.
//!
//! Commands that validate against the call (`start_session`, `change_mode`,
//! `confirm_session`, `request_takeover`) hold the call's registry guard from
//! validation to commit, so no call transition can slip in between.
//!
//! # Example
//!
//! ```
//! use rvoip_call_monitor::prelude::*;
//!
//! # async fn example() -> rvoip_call_monitor::Result<()> {
//! let registry = AgentCallRegistry::new();
//! let platform = LoopbackCallPlatform::new(registry.clone(), vec![AgentId::from("alice")], "support");
//! let coordinator = MonitoringCoordinator::new(MonitorConfig::default(), registry)?;
//!
//! let call_id = platform.create_call("+15550100").await?;
//! platform.answer_call(&call_id).await?;
//!
//! match coordinator.start_session(SupervisorId::from("sup-1"), &call_id, MonitorMode::Whisper).await? {
//!     StartOutcome::Started(session) => assert!(session.is_active()),
//!     StartOutcome::TakeoverRequired { current_owner, .. } => {
//!         println!("call already monitored by {}", current_owner.supervisor_id)
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::events::{MonitorEventBus, MonitorEventSubscriber, TransitionCause};
use super::interest::SessionInterest;
use super::policy::{self, SessionReaction};
use super::store::{CurrentOwner, MonitoringSessionStore, SetActiveOutcome};
use super::takeover::{AbortReason, TakeoverDecision, TakeoverId, TakeoverProtocol, TakeoverState, TakeoverTicket};
use super::types::{EndReason, MonitorMode, MonitoringSession, MonitoringSessionId, SessionStatus, SupervisorId};
use crate::call::registry::{AgentCallRegistry, CallStateListener, SubscriptionControl};
use crate::call::types::{CallId, CallTransition};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};

/// Result of [`MonitoringCoordinator::start_session`]
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// The supervisor holds the call (Active, or Pending awaiting confirmation)
    Started(MonitoringSession),
    /// Someone else holds the call; a takeover is needed to get it
    TakeoverRequired {
        call_id: CallId,
        current_owner: CurrentOwner,
    },
}

/// Result of [`MonitoringCoordinator::request_takeover`]
#[derive(Debug, Clone, PartialEq)]
pub enum TakeoverStart {
    /// The owner has been asked; follow up with `await_takeover`
    Requested(TakeoverTicket),
    /// Nobody held the call any more, so it was claimed directly
    Granted(MonitoringSession),
}

/// Supervisor monitoring coordinator
#[derive(Clone)]
pub struct MonitoringCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: MonitorConfig,
    registry: AgentCallRegistry,
    store: MonitoringSessionStore,
    bus: MonitorEventBus,
    interest: Arc<SessionInterest>,
    takeover: TakeoverProtocol,
}

impl MonitoringCoordinator {
    /// Create a coordinator over `registry`
    pub fn new(config: MonitorConfig, registry: AgentCallRegistry) -> Result<Self> {
        config.validate()?;
        let store = MonitoringSessionStore::new();
        let bus = MonitorEventBus::new(config.event_buffer_size);
        let interest = Arc::new(SessionInterest::new(registry.clone()));
        let takeover = TakeoverProtocol::new(
            store.clone(),
            registry.clone(),
            bus.clone(),
            interest.clone(),
            config.takeover_grace_period(),
            config.resolved_takeover_retention(),
        );
        info!(
            "Monitoring coordinator ready (grace {:?}, pending timeout {:?}, confirmation {})",
            config.takeover_grace_period(),
            config.pending_timeout(),
            if config.require_platform_confirmation { "required" } else { "implicit" }
        );
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                config,
                registry,
                store,
                bus,
                interest,
                takeover,
            }),
        })
    }

    /// Attach `supervisor_id` to a call in `mode`
    ///
    /// Fails with `CallNotFound`, `CallEnded` or `InvalidModeTransition` when
    /// the call cannot carry the mode right now. Contention is never retried:
    /// the loser gets [`StartOutcome::TakeoverRequired`] naming the owner.
    pub async fn start_session(
        &self,
        supervisor_id: SupervisorId,
        call_id: &CallId,
        mode: MonitorMode,
    ) -> Result<StartOutcome> {
        let guard = self.inner.registry.lock_call(call_id).await?;
        policy::check_attach(guard.call(), mode)?;

        let outcome = self.claim(MonitoringSession::pending(supervisor_id, call_id.clone(), mode))?;
        drop(guard);

        Ok(match outcome {
            SetActiveOutcome::Accepted(session) => StartOutcome::Started(session),
            SetActiveOutcome::Conflict(current_owner) => {
                info!(
                    "Call {} already monitored by {} ({}), takeover required",
                    call_id, current_owner.supervisor_id, current_owner.mode
                );
                StartOutcome::TakeoverRequired {
                    call_id: call_id.clone(),
                    current_owner,
                }
            }
        })
    }

    /// Switch an Active session to `mode`
    ///
    /// The mode's precondition is checked against the call as it is now, not
    /// as it was when the session started.
    pub async fn change_mode(&self, session_id: &MonitoringSessionId, mode: MonitorMode) -> Result<MonitoringSession> {
        let session = self.owned_session(session_id)?;
        let guard = self.inner.registry.lock_call(&session.call_id).await?;
        policy::check_change(guard.call(), mode)?;

        // Re-read under the guard; a downgrade may have landed while we waited.
        let session = self.owned_session(session_id)?;
        if session.mode == mode {
            return Ok(session);
        }
        let (updated, previous_mode) = self.inner.store.update_mode(session_id, mode)?;
        drop(guard);

        info!(
            "🎧 Session {} on call {} changed {} -> {}",
            session_id, updated.call_id, previous_mode, mode
        );
        self.inner
            .bus
            .session_changed(&updated, Some(SessionStatus::Active), previous_mode, TransitionCause::ModeChanged);
        Ok(updated)
    }

    /// Stop a session
    ///
    /// Always succeeds for a known session. Ending an Ended or Revoked session
    /// returns its terminal record unchanged. A challenger ending its pending
    /// session withdraws its takeover request.
    pub async fn end_session(&self, session_id: &MonitoringSessionId) -> Result<MonitoringSession> {
        let outcome = self.inner.store.mark_ended(session_id, EndReason::Stopped)?;
        if !outcome.changed {
            debug!("Session {} already {}", session_id, outcome.session.status);
            return Ok(outcome.session);
        }

        self.inner.interest.release(session_id);
        self.inner
            .takeover
            .challenger_ended(session_id, AbortReason::ChallengerCancelled);
        info!(
            "🎧 Session {} of {} on call {} stopped",
            session_id, outcome.session.supervisor_id, outcome.session.call_id
        );
        self.inner.bus.session_changed(
            &outcome.session,
            Some(outcome.previous_status),
            outcome.session.mode,
            TransitionCause::Ended(EndReason::Stopped),
        );
        Ok(outcome.session)
    }

    /// Promote a Pending session once the platform has set up its audio path
    ///
    /// Confirming an Active session is a no-op. If the call can no longer
    /// carry the session's mode, the session is ended and the validation error
    /// returned.
    pub async fn confirm_session(&self, session_id: &MonitoringSessionId) -> Result<MonitoringSession> {
        let session = self.session(session_id)?;
        match session.status {
            SessionStatus::Active => return Ok(session),
            SessionStatus::Pending => {}
            status => {
                return Err(MonitorError::SessionNotOwned {
                    session_id: session_id.clone(),
                    status,
                })
            }
        }

        let guard = match self.inner.registry.lock_call(&session.call_id).await {
            Ok(guard) => guard,
            Err(MonitorError::CallNotFound(call_id)) => {
                self.inner.end_pending(session_id, EndReason::CallEnded);
                return Err(MonitorError::CallEnded(call_id));
            }
            Err(e) => return Err(e),
        };
        // The session already holds the call, so this is checked like a mode
        // change: a Listen reservation downgraded on an ended call still confirms.
        if let Err(e) = policy::check_change(guard.call(), session.mode) {
            let reason = match e {
                MonitorError::CallEnded(_) => EndReason::CallEnded,
                _ => EndReason::PreconditionFailed,
            };
            drop(guard);
            warn!("Session {} failed confirmation: {}", session_id, e);
            self.inner.end_pending(session_id, reason);
            return Err(e);
        }
        let confirmed = self.inner.store.confirm(session_id)?;
        drop(guard);

        info!(
            "🎧 Session {} confirmed on call {} in {} mode",
            session_id, confirmed.call_id, confirmed.mode
        );
        self.inner.bus.session_changed(
            &confirmed,
            Some(SessionStatus::Pending),
            confirmed.mode,
            TransitionCause::Confirmed,
        );
        Ok(confirmed)
    }

    /// Ask the current owner of a call to hand it to `challenger`
    ///
    /// The challenger's attempt is recorded as a Pending session right away;
    /// it becomes Active if the owner accepts or stays silent for the grace
    /// period. A call nobody holds any more is claimed directly.
    pub async fn request_takeover(
        &self,
        challenger: SupervisorId,
        call_id: &CallId,
        mode: MonitorMode,
    ) -> Result<TakeoverStart> {
        let guard = self.inner.registry.lock_call(call_id).await?;
        policy::check_attach(guard.call(), mode)?;

        let owner = match self
            .claim(MonitoringSession::pending(challenger.clone(), call_id.clone(), mode))?
        {
            SetActiveOutcome::Accepted(session) => return Ok(TakeoverStart::Granted(session)),
            SetActiveOutcome::Conflict(owner) => owner,
        };

        let attempt = MonitoringSession::pending(challenger, call_id.clone(), mode);
        self.inner.store.record_pending(attempt.clone())?;
        if let Err(e) = self.watch(&attempt) {
            self.inner.store.end_if_pending(&attempt.session_id, EndReason::TakeoverFailed);
            return Err(e);
        }
        self.inner
            .bus
            .session_changed(&attempt, None, attempt.mode, TransitionCause::Started);
        let ticket = self.inner.takeover.open(owner, &attempt);
        drop(guard);
        Ok(TakeoverStart::Requested(ticket))
    }

    /// The owner's answer to a takeover request
    ///
    /// Answering after the grace period yields `TakeoverTimedOut`.
    pub async fn respond_to_takeover(
        &self,
        request_id: &TakeoverId,
        responder: &SupervisorId,
        decision: TakeoverDecision,
    ) -> Result<TakeoverState> {
        self.inner.takeover.respond(request_id, responder, decision).await
    }

    /// Wait, as the challenger, for a takeover to resolve
    ///
    /// Returns the now Active session, or `TakeoverRejected` /
    /// `TakeoverAborted`. Bounded by the grace period.
    pub async fn await_takeover(&self, request_id: &TakeoverId) -> Result<MonitoringSession> {
        self.inner.takeover.wait(request_id).await
    }

    pub fn takeover_state(&self, request_id: &TakeoverId) -> Result<TakeoverState> {
        self.inner.takeover.state(request_id)
    }

    /// Takeover requests still waiting on their owner
    pub fn open_takeovers(&self) -> Vec<TakeoverTicket> {
        self.inner.takeover.open_requests()
    }

    /// Drop the terminal records of a call the registry no longer tracks
    ///
    /// Ended and Revoked sessions are audit records and stay until the host
    /// purges them. Resolved takeover requests expire on their own after
    /// `resolved_takeover_retention_ms`.
    pub fn purge_call(&self, call_id: &CallId) -> usize {
        if self.inner.registry.contains(call_id) {
            return 0;
        }
        let purged = self.inner.store.purge_call(call_id);
        debug!("Purged {} session records of call {}", purged, call_id);
        purged
    }

    /// Forget takeover requests resolved more than `max_age` ago
    pub fn prune_takeovers(&self, max_age: std::time::Duration) -> usize {
        self.inner.takeover.prune_resolved(max_age)
    }

    pub fn get_active_session(&self, call_id: &CallId) -> Option<MonitoringSession> {
        self.inner.store.get_active_session(call_id)
    }

    pub fn get_session(&self, session_id: &MonitoringSessionId) -> Option<MonitoringSession> {
        self.inner.store.get(session_id)
    }

    pub fn sessions_for_call(&self, call_id: &CallId) -> Vec<MonitoringSession> {
        self.inner.store.sessions_for_call(call_id)
    }

    pub fn sessions_for_supervisor(&self, supervisor_id: &SupervisorId) -> Vec<MonitoringSession> {
        self.inner.store.sessions_for_supervisor(supervisor_id)
    }

    pub fn active_sessions(&self) -> Vec<MonitoringSession> {
        self.inner.store.active_sessions()
    }

    pub fn active_count(&self, call_id: &CallId) -> usize {
        self.inner.store.active_count(call_id)
    }

    /// Subscribe to session transitions and takeover traffic
    pub fn subscribe(&self) -> MonitorEventSubscriber {
        self.inner.bus.subscribe()
    }

    pub fn registry(&self) -> &AgentCallRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &MonitoringSessionStore {
        &self.inner.store
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Claim a call for a fresh session; the caller holds the call's guard
    fn claim(&self, session: MonitoringSession) -> Result<SetActiveOutcome> {
        let outcome = if self.inner.config.require_platform_confirmation {
            self.inner.store.try_reserve(session)?
        } else {
            self.inner.store.try_set_active(session)?
        };
        let session = match &outcome {
            SetActiveOutcome::Accepted(session) => session.clone(),
            SetActiveOutcome::Conflict(_) => return Ok(outcome),
        };

        if let Err(e) = self.watch(&session) {
            self.inner.store.mark_ended(&session.session_id, EndReason::Stopped)?;
            return Err(e);
        }
        if session.status == SessionStatus::Pending {
            self.arm_pending_expiry(session.session_id.clone());
        }
        info!(
            "🎧 Supervisor {} attached to call {} in {} mode ({})",
            session.supervisor_id, session.call_id, session.mode, session.status
        );
        self.inner
            .bus
            .session_changed(&session, None, session.mode, TransitionCause::Started);
        Ok(outcome)
    }

    fn watch(&self, session: &MonitoringSession) -> Result<()> {
        let listener = Arc::new(SessionCallListener {
            session_id: session.session_id.clone(),
            inner: Arc::downgrade(&self.inner),
        });
        self.inner.interest.register(session, listener)
    }

    fn arm_pending_expiry(&self, session_id: MonitoringSessionId) {
        let inner = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.pending_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                if inner.end_pending(&session_id, EndReason::Abandoned) {
                    warn!("Session {} never confirmed within {:?}, abandoned", session_id, timeout);
                }
            }
        });
    }

    fn session(&self, session_id: &MonitoringSessionId) -> Result<MonitoringSession> {
        self.inner
            .store
            .get(session_id)
            .ok_or_else(|| MonitorError::SessionNotFound(session_id.clone()))
    }

    fn owned_session(&self, session_id: &MonitoringSessionId) -> Result<MonitoringSession> {
        let session = self.session(session_id)?;
        if !session.is_active() {
            return Err(MonitorError::SessionNotOwned {
                session_id: session_id.clone(),
                status: session.status,
            });
        }
        Ok(session)
    }
}

impl CoordinatorInner {
    /// End a session that is still Pending; returns whether it did
    fn end_pending(&self, session_id: &MonitoringSessionId, reason: EndReason) -> bool {
        match self.store.end_if_pending(session_id, reason) {
            Some(ended) => {
                self.interest.release(session_id);
                self.bus.session_changed(
                    &ended,
                    Some(SessionStatus::Pending),
                    ended.mode,
                    TransitionCause::Ended(reason),
                );
                true
            }
            None => false,
        }
    }

    fn holds_call(&self, session: &MonitoringSession) -> bool {
        self.store
            .owner_of(&session.call_id)
            .map_or(false, |owner| owner.session_id == session.session_id)
    }

    /// React to a transition of the call `session_id` is attached to
    ///
    /// Runs inside the registry's notification of the call, so it must not
    /// wait for the call's guard.
    fn handle_call_transition(&self, session_id: &MonitoringSessionId, transition: &CallTransition) -> SubscriptionControl {
        let session = match self.store.get(session_id) {
            Some(session) if !session.is_terminal() => session,
            _ => {
                self.interest.forget(session_id);
                return SubscriptionControl::Unsubscribe;
            }
        };

        // A Pending takeover challenger does not hold the call yet; only the
        // call ending concerns it. A Pending session reserving the call reacts
        // like an Active one.
        if session.status == SessionStatus::Pending && !self.holds_call(&session) {
            if !transition.new_state().is_ended() {
                return SubscriptionControl::Keep;
            }
            if let Some(ended) = self.store.end_if_pending(session_id, EndReason::CallEnded) {
                info!("🎧 Pending session {} ended with call {}", session_id, transition.call_id);
                self.bus.session_changed(
                    &ended,
                    Some(SessionStatus::Pending),
                    ended.mode,
                    TransitionCause::Ended(EndReason::CallEnded),
                );
            }
            self.takeover.challenger_ended(session_id, AbortReason::CallEnded);
            self.interest.forget(session_id);
            return SubscriptionControl::Unsubscribe;
        }

        match policy::reaction(session.mode, transition) {
            SessionReaction::Unaffected => SubscriptionControl::Keep,
            SessionReaction::DowngradeToListen(cause) => {
                match self.store.update_mode(session_id, MonitorMode::Listen) {
                    Ok((downgraded, previous_mode)) => {
                        warn!(
                            "⬇️ Session {} of {} on call {} downgraded {} -> {} ({})",
                            session_id,
                            downgraded.supervisor_id,
                            transition.call_id,
                            previous_mode,
                            MonitorMode::Listen,
                            cause
                        );
                        self.bus.session_changed(
                            &downgraded,
                            Some(downgraded.status),
                            previous_mode,
                            TransitionCause::Downgraded(cause),
                        );
                    }
                    Err(e) => debug!("Skipping downgrade of {}: {}", session_id, e),
                }
                SubscriptionControl::Keep
            }
            SessionReaction::End => {
                match self.store.mark_ended(session_id, EndReason::CallEnded) {
                    Ok(outcome) if outcome.changed => {
                        info!(
                            "🎧 Session {} ({} mode) ended with call {}",
                            session_id, outcome.session.mode, transition.call_id
                        );
                        self.bus.session_changed(
                            &outcome.session,
                            Some(outcome.previous_status),
                            outcome.session.mode,
                            TransitionCause::Ended(EndReason::CallEnded),
                        );
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Session {} vanished while its call ended: {}", session_id, e),
                }
                self.interest.forget(session_id);
                SubscriptionControl::Unsubscribe
            }
        }
    }
}

/// Registry listener attached on behalf of one session
struct SessionCallListener {
    session_id: MonitoringSessionId,
    inner: Weak<CoordinatorInner>,
}

#[async_trait]
impl CallStateListener for SessionCallListener {
    async fn on_call_transition(&self, transition: &CallTransition) -> SubscriptionControl {
        match self.inner.upgrade() {
            Some(inner) => inner.handle_call_transition(&self.session_id, transition),
            None => SubscriptionControl::Unsubscribe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::types::{AgentId, CallPlatformEvent, CallState};
    use crate::monitoring::events::MonitorEvent;
    use std::time::Duration;

    async fn setup(config: MonitorConfig) -> (MonitoringCoordinator, CallId) {
        let registry = AgentCallRegistry::new();
        let call_id = CallId::from("call-1");
        registry
            .apply(CallPlatformEvent::CallCreated {
                call_id: call_id.clone(),
                agent_id: AgentId::from("agent-1"),
                skill_id: "sales".into(),
            })
            .await
            .unwrap();
        registry
            .apply(CallPlatformEvent::Ringing { call_id: call_id.clone() })
            .await
            .unwrap();
        (MonitoringCoordinator::new(config, registry).unwrap(), call_id)
    }

    async fn answer(coordinator: &MonitoringCoordinator, call_id: &CallId) {
        coordinator
            .registry()
            .apply(CallPlatformEvent::Answered { call_id: call_id.clone() })
            .await
            .unwrap();
    }

    fn started(outcome: StartOutcome) -> MonitoringSession {
        match outcome {
            StartOutcome::Started(session) => session,
            other => panic!("expected a session, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_requires_talking() {
        let (coordinator, call_id) = setup(MonitorConfig::default()).await;
        let err = coordinator
            .start_session(SupervisorId::from("s1"), &call_id, MonitorMode::Join)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidModeTransition { state: CallState::Ringing, .. }));
        assert!(coordinator.sessions_for_call(&call_id).is_empty());

        answer(&coordinator, &call_id).await;
        let session = started(
            coordinator
                .start_session(SupervisorId::from("s1"), &call_id, MonitorMode::Join)
                .await
                .unwrap(),
        );
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_unknown_call_is_not_found() {
        let (coordinator, _) = setup(MonitorConfig::default()).await;
        let err = coordinator
            .start_session(SupervisorId::from("s1"), &CallId::from("nope"), MonitorMode::Listen)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::CallNotFound(_)));
    }

    #[tokio::test]
    async fn test_change_mode_uses_current_call_state() {
        let (coordinator, call_id) = setup(MonitorConfig::default()).await;
        answer(&coordinator, &call_id).await;
        let session = started(
            coordinator
                .start_session(SupervisorId::from("s1"), &call_id, MonitorMode::Listen)
                .await
                .unwrap(),
        );
        coordinator
            .registry()
            .apply(CallPlatformEvent::Held { call_id: call_id.clone() })
            .await
            .unwrap();

        let err = coordinator.change_mode(&session.session_id, MonitorMode::Join).await.unwrap_err();
        assert!(matches!(err, MonitorError::InvalidModeTransition { state: CallState::Hold, .. }));
        let whisper = coordinator
            .change_mode(&session.session_id, MonitorMode::Whisper)
            .await
            .unwrap();
        assert_eq!(whisper.mode, MonitorMode::Whisper);
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent() {
        let (coordinator, call_id) = setup(MonitorConfig::default()).await;
        let session = started(
            coordinator
                .start_session(SupervisorId::from("s1"), &call_id, MonitorMode::Listen)
                .await
                .unwrap(),
        );
        let mut events = coordinator.subscribe();

        let first = coordinator.end_session(&session.session_id).await.unwrap();
        let second = coordinator.end_session(&session.session_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.end_reason, Some(EndReason::Stopped));
        assert_eq!(events.drain().len(), 1);

        let err = coordinator
            .change_mode(&session.session_id, MonitorMode::Whisper)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::SessionNotOwned { status: SessionStatus::Ended, .. }));
    }

    #[tokio::test]
    async fn test_listen_session_ends_with_call_and_call_is_evicted() {
        let (coordinator, call_id) = setup(MonitorConfig::default()).await;
        answer(&coordinator, &call_id).await;
        let session = started(
            coordinator
                .start_session(SupervisorId::from("s1"), &call_id, MonitorMode::Listen)
                .await
                .unwrap(),
        );
        coordinator
            .registry()
            .apply(CallPlatformEvent::Ended { call_id: call_id.clone() })
            .await
            .unwrap();

        let ended = coordinator.get_session(&session.session_id).unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
        assert_eq!(ended.end_reason, Some(EndReason::CallEnded));
        assert!(!coordinator.registry().contains(&call_id));
        assert!(!coordinator.inner.interest.holds(&session.session_id));
    }

    #[tokio::test]
    async fn test_whisper_downgrade_keeps_call_tracked_until_session_stops() {
        let (coordinator, call_id) = setup(MonitorConfig::default()).await;
        answer(&coordinator, &call_id).await;
        let session = started(
            coordinator
                .start_session(SupervisorId::from("s1"), &call_id, MonitorMode::Whisper)
                .await
                .unwrap(),
        );
        let mut events = coordinator.subscribe();
        coordinator
            .registry()
            .apply(CallPlatformEvent::Ended { call_id: call_id.clone() })
            .await
            .unwrap();

        let downgraded = coordinator.get_active_session(&call_id).unwrap();
        assert_eq!(downgraded.session_id, session.session_id);
        assert_eq!(downgraded.mode, MonitorMode::Listen);
        match events.try_recv() {
            Some(MonitorEvent::SessionStateChanged(change)) => {
                assert_eq!(change.previous_mode, MonitorMode::Whisper);
                assert_eq!(
                    change.cause,
                    TransitionCause::Downgraded(policy::DowngradeCause::CallEnded)
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(coordinator.registry().contains(&call_id));

        coordinator.end_session(&session.session_id).await.unwrap();
        assert!(!coordinator.registry().contains(&call_id));
    }

    #[tokio::test]
    async fn test_unconfirmed_session_is_abandoned() {
        let config = MonitorConfig::default()
            .with_platform_confirmation(true)
            .with_pending_timeout(Duration::from_millis(30));
        let (coordinator, call_id) = setup(config).await;
        let session = started(
            coordinator
                .start_session(SupervisorId::from("s1"), &call_id, MonitorMode::Listen)
                .await
                .unwrap(),
        );
        assert_eq!(session.status, SessionStatus::Pending);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let abandoned = coordinator.get_session(&session.session_id).unwrap();
        assert_eq!(abandoned.end_reason, Some(EndReason::Abandoned));
        assert!(coordinator.store().owner_of(&call_id).is_none());
        assert!(matches!(
            coordinator.confirm_session(&session.session_id).await,
            Err(MonitorError::SessionNotOwned { .. })
        ));
    }

    #[tokio::test]
    async fn test_confirm_revalidates_join() {
        let config = MonitorConfig::default().with_platform_confirmation(true);
        let (coordinator, call_id) = setup(config).await;
        answer(&coordinator, &call_id).await;
        let session = started(
            coordinator
                .start_session(SupervisorId::from("s1"), &call_id, MonitorMode::Join)
                .await
                .unwrap(),
        );
        coordinator
            .registry()
            .apply(CallPlatformEvent::Held { call_id: call_id.clone() })
            .await
            .unwrap();

        let err = coordinator.confirm_session(&session.session_id).await.unwrap_err();
        assert!(matches!(err, MonitorError::InvalidModeTransition { .. }));
        let failed = coordinator.get_session(&session.session_id).unwrap();
        assert_eq!(failed.end_reason, Some(EndReason::PreconditionFailed));
        assert!(coordinator.store().owner_of(&call_id).is_none());
    }

    #[tokio::test]
    async fn test_takeover_of_vacant_call_is_granted() {
        let (coordinator, call_id) = setup(MonitorConfig::default()).await;
        match coordinator
            .request_takeover(SupervisorId::from("s2"), &call_id, MonitorMode::Listen)
            .await
            .unwrap()
        {
            TakeoverStart::Granted(session) => assert!(session.is_active()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
