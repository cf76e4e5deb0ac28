//! Monitoring event feed
//!
//! Every session transition publishes a [`SessionStateChanged`] on a
//! `tokio::sync::broadcast` channel. Takeover requests and their outcomes
//! travel on the same feed, which is how an owning supervisor learns that
//! someone wants its call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::policy::DowngradeCause;
use super::takeover::{TakeoverId, TakeoverState};
use super::types::{EndReason, MonitorMode, MonitoringSession, RevokedReason, SessionStatus, SupervisorId};
use crate::call::types::CallId;

/// Why a session changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionCause {
    /// Session accepted by the store
    Started,
    /// Pending session confirmed by the platform
    Confirmed,
    /// Explicit mode change by the supervisor
    ModeChanged,
    /// Automatic privilege reduction driven by the call
    Downgraded(DowngradeCause),
    /// Challenger's session activated by a takeover
    TakeoverGranted,
    Ended(EndReason),
    Revoked(RevokedReason),
}

/// One observed session transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStateChanged {
    /// Session after the transition
    pub session: MonitoringSession,
    /// `None` when the session was just created
    pub previous_status: Option<SessionStatus>,
    pub previous_mode: MonitorMode,
    pub cause: TransitionCause,
    pub at: DateTime<Utc>,
}

/// Everything published on the monitoring feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MonitorEvent {
    SessionStateChanged(SessionStateChanged),
    /// Someone asked to take over `owner`'s session
    TakeoverRequested {
        request_id: TakeoverId,
        call_id: CallId,
        owner: SupervisorId,
        challenger: SupervisorId,
        mode: MonitorMode,
        deadline: DateTime<Utc>,
    },
    TakeoverResolved {
        request_id: TakeoverId,
        call_id: CallId,
        state: TakeoverState,
    },
}

impl MonitorEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            MonitorEvent::SessionStateChanged(change) => &change.session.call_id,
            MonitorEvent::TakeoverRequested { call_id, .. } | MonitorEvent::TakeoverResolved { call_id, .. } => call_id,
        }
    }
}

/// Broadcast publisher for [`MonitorEvent`]s
#[derive(Debug, Clone)]
pub struct MonitorEventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl MonitorEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: MonitorEvent) {
        match &event {
            MonitorEvent::SessionStateChanged(change) => debug!(
                "Session {} {:?} -> {} ({:?})",
                change.session.session_id, change.previous_status, change.session.status, change.cause
            ),
            MonitorEvent::TakeoverRequested { request_id, call_id, owner, challenger, .. } => info!(
                "🔁 Takeover {} requested on call {}: {} -> {}",
                request_id, call_id, owner, challenger
            ),
            MonitorEvent::TakeoverResolved { request_id, state, .. } => {
                info!("🔁 Takeover {} resolved as {:?}", request_id, state)
            }
        }
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening for monitor event");
        }
    }

    /// Convenience for the common session transition event
    pub(crate) fn session_changed(
        &self,
        session: &MonitoringSession,
        previous_status: Option<SessionStatus>,
        previous_mode: MonitorMode,
        cause: TransitionCause,
    ) {
        self.publish(MonitorEvent::SessionStateChanged(SessionStateChanged {
            session: session.clone(),
            previous_status,
            previous_mode,
            cause,
            at: Utc::now(),
        }));
    }

    pub fn subscribe(&self) -> MonitorEventSubscriber {
        MonitorEventSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving side of the monitoring feed
pub struct MonitorEventSubscriber {
    receiver: broadcast::Receiver<MonitorEvent>,
}

impl MonitorEventSubscriber {
    /// Next event, or `None` once the bus is gone
    ///
    /// A lagging subscriber skips what it missed and keeps receiving.
    pub async fn recv(&mut self) -> Option<MonitorEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Monitor event subscriber lagged, skipped {} events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<MonitorEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!("Monitor event subscriber lagged, skipped {} events", missed);
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}
