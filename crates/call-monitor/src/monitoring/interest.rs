//! Call subscriptions held on behalf of monitoring sessions
//!
//! Every non-terminal session keeps one registry subscription on its call.
//! An ended call stays in the registry until all of these are released, which
//! is what lets a downgraded Whisper session keep monitoring past call end.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::types::{MonitoringSession, MonitoringSessionId};
use crate::call::registry::{AgentCallRegistry, CallStateListener, SubscriptionId};
use crate::call::types::CallId;
use crate::error::Result;

pub(crate) struct SessionInterest {
    registry: AgentCallRegistry,
    subscriptions: DashMap<MonitoringSessionId, (CallId, SubscriptionId)>,
}

impl SessionInterest {
    pub(crate) fn new(registry: AgentCallRegistry) -> Self {
        Self {
            registry,
            subscriptions: DashMap::new(),
        }
    }

    pub(crate) fn register(&self, session: &MonitoringSession, listener: Arc<dyn CallStateListener>) -> Result<()> {
        let subscription = self.registry.subscribe(&session.call_id, listener)?;
        self.subscriptions
            .insert(session.session_id.clone(), (session.call_id.clone(), subscription));
        Ok(())
    }

    /// Drop the session's subscription, possibly letting an ended call go
    pub(crate) fn release(&self, session_id: &MonitoringSessionId) {
        if let Some((_, (call_id, subscription))) = self.subscriptions.remove(session_id) {
            debug!("Releasing call {} for session {}", call_id, session_id);
            self.registry.unsubscribe(&call_id, subscription);
        }
    }

    /// Forget a subscription the registry is already dropping
    pub(crate) fn forget(&self, session_id: &MonitoringSessionId) {
        self.subscriptions.remove(session_id);
    }

    #[cfg(test)]
    pub(crate) fn holds(&self, session_id: &MonitoringSessionId) -> bool {
        self.subscriptions.contains_key(session_id)
    }
}
