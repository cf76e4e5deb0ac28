//! Call platform collaborator
//!
//! The monitoring core never places or mixes calls itself. It consumes the
//! platform's call-state feed and exposes the platform's call controls behind
//! [`CallPlatform`] so hosts and tests can drive calls the same way.
//!
//! [`LoopbackCallPlatform`] is an in-process implementation that turns each
//! control into the matching [`CallPlatformEvent`] and applies it to an
//! [`AgentCallRegistry`] directly.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::registry::AgentCallRegistry;
use super::types::{AgentId, CallId, CallPlatformEvent};
use crate::error::{MonitorError, Result};

/// Call controls offered by the call platform
#[async_trait]
pub trait CallPlatform: Send + Sync {
    /// Place a new inbound call from `number` and route it to an agent
    async fn create_call(&self, number: &str) -> Result<CallId>;

    async fn answer_call(&self, call_id: &CallId) -> Result<()>;

    /// Start an assisted transfer of the call to `target`
    async fn transfer_call(&self, call_id: &CallId, target: &str) -> Result<()>;

    async fn drop_call(&self, call_id: &CallId) -> Result<()>;
}

/// In-process platform that feeds a registry directly
///
/// Calls are routed round-robin over the configured agents and start ringing
/// immediately.
///
/// ```
/// use rvoip_call_monitor::call::{AgentCallRegistry, CallPlatform, CallState, LoopbackCallPlatform};
///
/// # async fn example() -> rvoip_call_monitor::Result<()> {
/// let registry = AgentCallRegistry::new();
/// let platform = LoopbackCallPlatform::new(registry.clone(), vec!["agent-1".into()], "support");
///
/// let call_id = platform.create_call("+15551234567").await?;
/// platform.answer_call(&call_id).await?;
/// assert_eq!(registry.current(&call_id)?.state, CallState::Talking);
/// # Ok(())
/// # }
/// ```
pub struct LoopbackCallPlatform {
    registry: AgentCallRegistry,
    agents: Vec<AgentId>,
    skill_id: String,
    next_agent: AtomicUsize,
}

impl LoopbackCallPlatform {
    pub fn new(registry: AgentCallRegistry, agents: Vec<AgentId>, skill_id: impl Into<String>) -> Self {
        Self {
            registry,
            agents,
            skill_id: skill_id.into(),
            next_agent: AtomicUsize::new(0),
        }
    }

    /// Place a call for a specific agent instead of round-robin routing
    pub async fn create_call_for(&self, number: &str, agent_id: AgentId) -> Result<CallId> {
        let call_id = CallId::new();
        debug!("Loopback platform: {} dialing in as {} for agent {}", number, call_id, agent_id);
        self.registry
            .apply(CallPlatformEvent::CallCreated {
                call_id: call_id.clone(),
                agent_id,
                skill_id: self.skill_id.clone(),
            })
            .await?;
        self.registry
            .apply(CallPlatformEvent::Ringing { call_id: call_id.clone() })
            .await?;
        Ok(call_id)
    }

    pub async fn hold(&self, call_id: &CallId) -> Result<()> {
        self.emit(CallPlatformEvent::Held { call_id: call_id.clone() }).await
    }

    pub async fn resume(&self, call_id: &CallId) -> Result<()> {
        self.emit(CallPlatformEvent::Resumed { call_id: call_id.clone() }).await
    }

    /// Finish an assisted transfer started with [`CallPlatform::transfer_call`]
    pub async fn complete_transfer(&self, call_id: &CallId) -> Result<()> {
        self.emit(CallPlatformEvent::TransferCompleted { call_id: call_id.clone() }).await
    }

    pub async fn cancel_transfer(&self, call_id: &CallId) -> Result<()> {
        self.emit(CallPlatformEvent::TransferCancelled { call_id: call_id.clone() }).await
    }

    pub async fn blind_transfer(&self, call_id: &CallId, target: &str) -> Result<()> {
        self.emit(CallPlatformEvent::BlindTransferred {
            call_id: call_id.clone(),
            target: target.to_string(),
        })
        .await
    }

    fn route(&self) -> Result<AgentId> {
        if self.agents.is_empty() {
            return Err(MonitorError::configuration("loopback platform has no agents to route to"));
        }
        let index = self.next_agent.fetch_add(1, Ordering::Relaxed) % self.agents.len();
        Ok(self.agents[index].clone())
    }

    async fn emit(&self, event: CallPlatformEvent) -> Result<()> {
        self.registry.apply(event).await.map(|_| ())
    }
}

#[async_trait]
impl CallPlatform for LoopbackCallPlatform {
    async fn create_call(&self, number: &str) -> Result<CallId> {
        let agent_id = self.route()?;
        self.create_call_for(number, agent_id).await
    }

    async fn answer_call(&self, call_id: &CallId) -> Result<()> {
        self.emit(CallPlatformEvent::Answered { call_id: call_id.clone() }).await
    }

    async fn transfer_call(&self, call_id: &CallId, target: &str) -> Result<()> {
        self.emit(CallPlatformEvent::TransferInitiated {
            call_id: call_id.clone(),
            target: target.to_string(),
        })
        .await
    }

    async fn drop_call(&self, call_id: &CallId) -> Result<()> {
        self.emit(CallPlatformEvent::Ended { call_id: call_id.clone() }).await
    }
}
