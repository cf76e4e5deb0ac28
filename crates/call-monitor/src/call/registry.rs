//! Agent call registry
//!
//! Tracks the lifecycle of every live call from the platform feed and fans
//! out each applied transition to the listeners subscribed to that call.
//!
//! Transitions of a single call are serialized: the registry applies an event
//! and finishes notifying every listener before the next event for the same
//! call is applied. Listeners run without any registry map guard held, so they
//! may freely read the registry (the monitoring coordinator re-reads
//! [`AgentCallRegistry::current`] when it acts). Listeners must not feed
//! events for the call they are being notified about.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{AgentCall, AgentId, CallId, CallPlatformEvent, CallState, CallTransition};
use crate::error::{MonitorError, Result};

/// What a listener wants after handling a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionControl {
    Keep,
    Unsubscribe,
}

/// Receives call-state transitions for the calls it subscribed to
#[async_trait]
pub trait CallStateListener: Send + Sync {
    async fn on_call_transition(&self, transition: &CallTransition) -> SubscriptionControl;
}

/// Adapter so plain closures can be used as listeners
struct FnListener<F>(F);

#[async_trait]
impl<F> CallStateListener for FnListener<F>
where
    F: Fn(&CallTransition) -> SubscriptionControl + Send + Sync,
{
    async fn on_call_transition(&self, transition: &CallTransition) -> SubscriptionControl {
        (self.0)(transition)
    }
}

/// Handle returned by [`AgentCallRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct CallEntry {
    call: AgentCall,
    subscribers: Vec<(SubscriptionId, Arc<dyn CallStateListener>)>,
    /// Held for the whole apply-and-notify of one event
    sequencer: Arc<tokio::sync::Mutex<()>>,
}

/// Exclusive turn on one call
///
/// While a guard is held no transition of that call can be applied, so the
/// snapshot it carries stays current until the guard is dropped. Never hold
/// one inside a [`CallStateListener`]; the registry already holds the call's
/// turn while it notifies.
pub struct CallGuard {
    call: AgentCall,
    _turn: tokio::sync::OwnedMutexGuard<()>,
}

impl CallGuard {
    pub fn call(&self) -> &AgentCall {
        &self.call
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_created: u64,
    pub total_ended: u64,
    pub total_evicted: u64,
    pub rejected_events: u64,
}

/// Registry of live agent calls
pub struct AgentCallRegistry {
    calls: Arc<DashMap<CallId, CallEntry>>,
    next_subscription: Arc<AtomicU64>,
    stats: Arc<Mutex<RegistryStats>>,
}

impl AgentCallRegistry {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            next_subscription: Arc::new(AtomicU64::new(1)),
            stats: Arc::new(Mutex::new(RegistryStats::default())),
        }
    }

    /// Current snapshot of a call
    pub fn current(&self, call_id: &CallId) -> Result<AgentCall> {
        self.calls
            .get(call_id)
            .map(|entry| entry.call.clone())
            .ok_or_else(|| MonitorError::CallNotFound(call_id.clone()))
    }

    /// Wait for exclusive use of a call and read it
    pub async fn lock_call(&self, call_id: &CallId) -> Result<CallGuard> {
        let turn = self.sequencer(call_id)?.lock_owned().await;
        let call = self.current(call_id)?;
        Ok(CallGuard { call, _turn: turn })
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.calls.contains_key(call_id)
    }

    /// All tracked calls handled by `agent_id`, including ended calls not yet evicted
    pub fn calls_for_agent(&self, agent_id: &AgentId) -> Vec<AgentCall> {
        self.calls
            .iter()
            .filter(|entry| &entry.call.agent_id == agent_id)
            .map(|entry| entry.call.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats.lock().clone()
    }

    /// Subscribe to transitions of one call
    pub fn subscribe(
        &self,
        call_id: &CallId,
        listener: Arc<dyn CallStateListener>,
    ) -> Result<SubscriptionId> {
        let mut entry = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| MonitorError::CallNotFound(call_id.clone()))?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        entry.subscribers.push((id, listener));
        debug!("Subscription {:?} added for call {}", id, call_id);
        Ok(id)
    }

    /// Subscribe a closure to transitions of one call
    pub fn subscribe_fn<F>(&self, call_id: &CallId, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&CallTransition) -> SubscriptionControl + Send + Sync + 'static,
    {
        self.subscribe(call_id, Arc::new(FnListener(callback)))
    }

    /// Drop a subscription. An ended call with no subscribers left is evicted.
    ///
    /// Unknown calls or subscriptions are ignored.
    pub fn unsubscribe(&self, call_id: &CallId, subscription: SubscriptionId) {
        if let Some(mut entry) = self.calls.get_mut(call_id) {
            entry.subscribers.retain(|(id, _)| *id != subscription);
        }
        self.evict_if_unobserved(call_id);
    }

    /// Apply one platform event and notify the call's listeners
    ///
    /// Returns the call snapshot after the event was applied.
    pub async fn apply(&self, event: CallPlatformEvent) -> Result<AgentCall> {
        let (target_state, completes_transfer) = match event.target() {
            Some(target) => target,
            None => return self.insert(event),
        };
        let call_id = event.call_id().clone();

        let sequencer = self.sequencer(&call_id)?;
        let _turn = sequencer.lock().await;

        let (transition, listeners) = {
            let mut entry = match self.calls.get_mut(&call_id) {
                Some(entry) => entry,
                None => return Err(MonitorError::CallNotFound(call_id)),
            };
            let previous_state = entry.call.state;
            if !previous_state.can_transition_to(target_state) || !event.applies_from(previous_state) {
                self.stats.lock().rejected_events += 1;
                return Err(MonitorError::InvalidCallTransition {
                    call_id,
                    from: previous_state,
                    to: target_state,
                });
            }

            let transfer_completed = completes_transfer && !entry.call.has_transferred;
            entry.call.state = target_state;
            entry.call.last_transition_at = Utc::now();
            if completes_transfer {
                entry.call.has_transferred = true;
            }

            let transition = CallTransition {
                call_id: call_id.clone(),
                previous_state,
                call: entry.call.clone(),
                transfer_completed,
            };
            (transition, entry.subscribers.clone())
        };

        if target_state.is_ended() {
            self.stats.lock().total_ended += 1;
        }
        info!(
            "📞 Call {} {} -> {}{}",
            call_id,
            transition.previous_state,
            target_state,
            if transition.transfer_completed { " (transfer completed)" } else { "" }
        );

        let mut dropped = Vec::new();
        for (id, listener) in listeners {
            if listener.on_call_transition(&transition).await == SubscriptionControl::Unsubscribe {
                dropped.push(id);
            }
        }
        if !dropped.is_empty() {
            if let Some(mut entry) = self.calls.get_mut(&call_id) {
                entry.subscribers.retain(|(id, _)| !dropped.contains(id));
            }
        }
        self.evict_if_unobserved(&call_id);

        Ok(transition.call)
    }

    /// Consume a platform feed in the background until the sender closes
    ///
    /// Rejected events are logged and skipped.
    pub fn spawn_feed(&self, mut feed: mpsc::Receiver<CallPlatformEvent>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(event) = feed.recv().await {
                if let Err(e) = registry.apply(event.clone()).await {
                    warn!("Dropping platform event {:?}: {}", event, e);
                }
            }
            debug!("Call platform feed closed");
        })
    }

    fn insert(&self, event: CallPlatformEvent) -> Result<AgentCall> {
        let CallPlatformEvent::CallCreated { call_id, agent_id, skill_id } = event else {
            return Err(MonitorError::internal("insert called with a non-creation event"));
        };
        match self.calls.entry(call_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                self.stats.lock().rejected_events += 1;
                Err(MonitorError::CallAlreadyExists(call_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let call = AgentCall::new(call_id.clone(), agent_id, skill_id);
                slot.insert(CallEntry {
                    call: call.clone(),
                    subscribers: Vec::new(),
                    sequencer: Arc::new(tokio::sync::Mutex::new(())),
                });
                self.stats.lock().total_created += 1;
                info!("📞 Call {} queued for agent {} (skill {})", call_id, call.agent_id, call.skill_id);
                Ok(call)
            }
        }
    }

    fn sequencer(&self, call_id: &CallId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        self.calls
            .get(call_id)
            .map(|entry| entry.sequencer.clone())
            .ok_or_else(|| MonitorError::CallNotFound(call_id.clone()))
    }

    fn evict_if_unobserved(&self, call_id: &CallId) {
        let evicted = self
            .calls
            .remove_if(call_id, |_, entry| {
                entry.call.state == CallState::Ended && entry.subscribers.is_empty()
            })
            .is_some();
        if evicted {
            self.stats.lock().total_evicted += 1;
            debug!("Evicted ended call {}", call_id);
        }
    }
}

impl Default for AgentCallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for AgentCallRegistry {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
            next_subscription: Arc::clone(&self.next_subscription),
            stats: Arc::clone(&self.stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn created(id: &str) -> CallPlatformEvent {
        CallPlatformEvent::CallCreated {
            call_id: CallId::from(id),
            agent_id: AgentId::from("agent-1"),
            skill_id: "support".to_string(),
        }
    }

    async fn talking_call(registry: &AgentCallRegistry, id: &str) -> CallId {
        let call_id = CallId::from(id);
        registry.apply(created(id)).await.unwrap();
        registry.apply(CallPlatformEvent::Ringing { call_id: call_id.clone() }).await.unwrap();
        registry.apply(CallPlatformEvent::Answered { call_id: call_id.clone() }).await.unwrap();
        call_id
    }

    #[tokio::test]
    async fn test_lifecycle_and_current() {
        let registry = AgentCallRegistry::new();
        let call_id = talking_call(&registry, "c1").await;

        let call = registry.current(&call_id).unwrap();
        assert_eq!(call.state, CallState::Talking);
        assert!(!call.has_transferred);
        assert_eq!(registry.stats().total_created, 1);
    }

    #[tokio::test]
    async fn test_duplicate_creation_rejected() {
        let registry = AgentCallRegistry::new();
        registry.apply(created("c1")).await.unwrap();
        let err = registry.apply(created("c1")).await.unwrap_err();
        assert!(matches!(err, MonitorError::CallAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let registry = AgentCallRegistry::new();
        registry.apply(created("c1")).await.unwrap();
        let err = registry
            .apply(CallPlatformEvent::Held { call_id: CallId::from("c1") })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MonitorError::InvalidCallTransition { from: CallState::Queued, to: CallState::Hold, .. }
        ));
        assert_eq!(registry.stats().rejected_events, 1);
    }

    async fn hold(registry: &AgentCallRegistry, call_id: &CallId) {
        registry.apply(CallPlatformEvent::Held { call_id: call_id.clone() }).await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_completion_rejected_outside_transfer_hold() {
        let registry = AgentCallRegistry::new();
        let call_id = talking_call(&registry, "c1").await;
        hold(&registry, &call_id).await;

        let err = registry
            .apply(CallPlatformEvent::TransferCompleted { call_id: call_id.clone() })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MonitorError::InvalidCallTransition { from: CallState::Hold, to: CallState::Talking, .. }
        ));
        let call = registry.current(&call_id).unwrap();
        assert_eq!(call.state, CallState::Hold);
        assert!(!call.has_transferred);

        let blind = talking_call(&registry, "c2").await;
        registry
            .apply(CallPlatformEvent::BlindTransferred { call_id: blind.clone(), target: "sip:q@cc".into() })
            .await
            .unwrap();
        let err = registry
            .apply(CallPlatformEvent::TransferCompleted { call_id: blind.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidCallTransition { from: CallState::Transferred, .. }));
        assert_eq!(registry.stats().rejected_events, 2);
    }

    #[tokio::test]
    async fn test_transfer_cancel_rejected_from_plain_hold() {
        let registry = AgentCallRegistry::new();
        let call_id = talking_call(&registry, "c1").await;
        hold(&registry, &call_id).await;

        let err = registry
            .apply(CallPlatformEvent::TransferCancelled { call_id: call_id.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidCallTransition { from: CallState::Hold, .. }));
        let err = registry
            .apply(CallPlatformEvent::Answered { call_id: call_id.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidCallTransition { from: CallState::Hold, .. }));

        registry.apply(CallPlatformEvent::Resumed { call_id: call_id.clone() }).await.unwrap();
        assert_eq!(registry.current(&call_id).unwrap().state, CallState::Talking);
    }

    #[tokio::test]
    async fn test_resume_rejected_from_transfer_hold() {
        let registry = AgentCallRegistry::new();
        let call_id = talking_call(&registry, "c1").await;
        registry
            .apply(CallPlatformEvent::TransferInitiated { call_id: call_id.clone(), target: "sip:bob@cc".into() })
            .await
            .unwrap();

        let err = registry
            .apply(CallPlatformEvent::Resumed { call_id: call_id.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidCallTransition { from: CallState::TransferHold, .. }));
        assert_eq!(registry.current(&call_id).unwrap().state, CallState::TransferHold);
    }

    #[tokio::test]
    async fn test_transfer_completion_latches_flag() {
        let registry = AgentCallRegistry::new();
        let call_id = talking_call(&registry, "c1").await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry
            .subscribe_fn(&call_id, move |t| {
                sink.lock().push((t.new_state(), t.transfer_completed));
                SubscriptionControl::Keep
            })
            .unwrap();

        registry
            .apply(CallPlatformEvent::TransferInitiated { call_id: call_id.clone(), target: "sip:bob@cc".into() })
            .await
            .unwrap();
        let call = registry
            .apply(CallPlatformEvent::TransferCompleted { call_id: call_id.clone() })
            .await
            .unwrap();
        assert!(call.has_transferred);

        assert_eq!(
            *seen.lock(),
            vec![(CallState::TransferHold, false), (CallState::Talking, true)]
        );
    }

    #[tokio::test]
    async fn test_ended_call_evicted_without_subscribers() {
        let registry = AgentCallRegistry::new();
        let call_id = talking_call(&registry, "c1").await;
        registry.apply(CallPlatformEvent::Ended { call_id: call_id.clone() }).await.unwrap();
        assert!(matches!(registry.current(&call_id), Err(MonitorError::CallNotFound(_))));
        assert_eq!(registry.stats().total_evicted, 1);
    }

    #[tokio::test]
    async fn test_ended_call_kept_until_last_subscriber_leaves() {
        let registry = AgentCallRegistry::new();
        let call_id = talking_call(&registry, "c1").await;
        let sub = registry.subscribe_fn(&call_id, |_| SubscriptionControl::Keep).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry
            .subscribe_fn(&call_id, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                SubscriptionControl::Unsubscribe
            })
            .unwrap();

        registry.apply(CallPlatformEvent::Ended { call_id: call_id.clone() }).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.current(&call_id).unwrap().state, CallState::Ended);

        registry.unsubscribe(&call_id, sub);
        assert!(!registry.contains(&call_id));
    }

    #[tokio::test]
    async fn test_lock_call_holds_back_transitions() {
        let registry = AgentCallRegistry::new();
        let call_id = talking_call(&registry, "c1").await;

        let guard = registry.lock_call(&call_id).await.unwrap();
        assert_eq!(guard.call().state, CallState::Talking);

        let pending = {
            let registry = registry.clone();
            let call_id = call_id.clone();
            tokio::spawn(async move { registry.apply(CallPlatformEvent::Held { call_id }).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(registry.current(&call_id).unwrap().state, CallState::Talking);

        drop(guard);
        pending.await.unwrap().unwrap();
        assert_eq!(registry.current(&call_id).unwrap().state, CallState::Hold);
    }

    #[tokio::test]
    async fn test_feed_pump_applies_events_in_order() {
        let registry = AgentCallRegistry::new();
        let (tx, rx) = mpsc::channel(16);
        let pump = registry.spawn_feed(rx);
        let call_id = CallId::from("c1");
        tx.send(created("c1")).await.unwrap();
        tx.send(CallPlatformEvent::Ringing { call_id: call_id.clone() }).await.unwrap();
        // Rejected and skipped
        tx.send(CallPlatformEvent::Held { call_id: call_id.clone() }).await.unwrap();
        tx.send(CallPlatformEvent::Answered { call_id: call_id.clone() }).await.unwrap();
        drop(tx);
        pump.await.unwrap();

        assert_eq!(registry.current(&call_id).unwrap().state, CallState::Talking);
        assert_eq!(registry.stats().rejected_events, 1);
    }
}
