//! Call data model
//!
//! An [`AgentCall`] is one routed phone interaction between a customer and an
//! agent. Its lifecycle is driven exclusively by the call platform feed
//! ([`CallPlatformEvent`]) and owned by the
//! [`AgentCallRegistry`](super::registry::AgentCallRegistry); every other
//! component only ever sees cloned snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a call on the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    /// Allocate a fresh random call id
    pub fn new() -> Self {
        Self(format!("call-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of the agent handling a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of an agent call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Waiting in a queue for an agent
    Queued,
    /// Offered to an agent, not yet answered
    Ringing,
    /// Agent and customer are connected
    Talking,
    /// Customer placed on hold by the agent
    Hold,
    /// Customer on hold while the agent consults a transfer target
    TransferHold,
    /// Call handed off to another party (blind transfer)
    Transferred,
    /// Call is over
    Ended,
}

impl CallState {
    /// Whether the platform may move a call from `self` to `next`
    ///
    /// `Ended` is terminal. Every live state may end at any time.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Ended, _) => false,
            (_, Ended) => true,
            (Queued, Ringing) => true,
            (Ringing, Talking) => true,
            (Talking, Hold) | (Talking, TransferHold) | (Talking, Transferred) => true,
            (Hold, Talking) | (Hold, TransferHold) => true,
            (TransferHold, Talking) | (TransferHold, Transferred) => true,
            (Transferred, Talking) => true,
            _ => false,
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, CallState::Ended)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Queued => "Queued",
            CallState::Ringing => "Ringing",
            CallState::Talking => "Talking",
            CallState::Hold => "Hold",
            CallState::TransferHold => "TransferHold",
            CallState::Transferred => "Transferred",
            CallState::Ended => "Ended",
        };
        f.write_str(s)
    }
}

/// Snapshot of a call as tracked by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCall {
    pub call_id: CallId,
    pub agent_id: AgentId,
    pub skill_id: String,
    pub state: CallState,
    pub last_transition_at: DateTime<Utc>,
    /// Latches to `true` once any transfer has completed; never resets
    pub has_transferred: bool,
}

impl AgentCall {
    pub fn new(call_id: CallId, agent_id: AgentId, skill_id: impl Into<String>) -> Self {
        Self {
            call_id,
            agent_id,
            skill_id: skill_id.into(),
            state: CallState::Queued,
            last_transition_at: Utc::now(),
            has_transferred: false,
        }
    }
}

/// Events emitted by the call platform's state feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPlatformEvent {
    /// A new call entered the system and is queued for `agent_id`
    CallCreated {
        call_id: CallId,
        agent_id: AgentId,
        skill_id: String,
    },
    /// The call is being offered to its agent
    Ringing { call_id: CallId },
    /// The agent answered (or a transferred call was picked up)
    Answered { call_id: CallId },
    Held { call_id: CallId },
    Resumed { call_id: CallId },
    /// Assisted transfer started; the customer waits on transfer hold
    TransferInitiated { call_id: CallId, target: String },
    /// Assisted transfer finished; the customer now talks to the target
    TransferCompleted { call_id: CallId },
    /// Assisted transfer abandoned; the customer is back with the agent
    TransferCancelled { call_id: CallId },
    /// Blind transfer handed the call straight to `target`
    BlindTransferred { call_id: CallId, target: String },
    /// Hangup from either side
    Ended { call_id: CallId },
}

impl CallPlatformEvent {
    pub fn call_id(&self) -> &CallId {
        match self {
            CallPlatformEvent::CallCreated { call_id, .. }
            | CallPlatformEvent::Ringing { call_id }
            | CallPlatformEvent::Answered { call_id }
            | CallPlatformEvent::Held { call_id }
            | CallPlatformEvent::Resumed { call_id }
            | CallPlatformEvent::TransferInitiated { call_id, .. }
            | CallPlatformEvent::TransferCompleted { call_id }
            | CallPlatformEvent::TransferCancelled { call_id }
            | CallPlatformEvent::BlindTransferred { call_id, .. }
            | CallPlatformEvent::Ended { call_id } => call_id,
        }
    }

    /// Whether the event may be applied to a call currently in `from`
    ///
    /// Several events lead to `Talking`, so the state table alone cannot tell
    /// a resume from a transfer completion.
    pub fn applies_from(&self, from: CallState) -> bool {
        use CallState::*;
        match self {
            CallPlatformEvent::CallCreated { .. } => false,
            CallPlatformEvent::Ringing { .. } => from == Queued,
            CallPlatformEvent::Answered { .. } => matches!(from, Ringing | Transferred),
            CallPlatformEvent::Held { .. } => from == Talking,
            CallPlatformEvent::Resumed { .. } => from == Hold,
            CallPlatformEvent::TransferInitiated { .. } => matches!(from, Talking | Hold),
            CallPlatformEvent::TransferCompleted { .. } | CallPlatformEvent::TransferCancelled { .. } => {
                from == TransferHold
            }
            CallPlatformEvent::BlindTransferred { .. } => matches!(from, Talking | TransferHold),
            CallPlatformEvent::Ended { .. } => !from.is_ended(),
        }
    }

    /// Target state and whether the event completes a transfer.
    ///
    /// `CallCreated` has no target state; the registry handles it as an insert.
    pub(crate) fn target(&self) -> Option<(CallState, bool)> {
        match self {
            CallPlatformEvent::CallCreated { .. } => None,
            CallPlatformEvent::Ringing { .. } => Some((CallState::Ringing, false)),
            CallPlatformEvent::Answered { .. } => Some((CallState::Talking, false)),
            CallPlatformEvent::Held { .. } => Some((CallState::Hold, false)),
            CallPlatformEvent::Resumed { .. } => Some((CallState::Talking, false)),
            CallPlatformEvent::TransferInitiated { .. } => Some((CallState::TransferHold, false)),
            CallPlatformEvent::TransferCompleted { .. } => Some((CallState::Talking, true)),
            CallPlatformEvent::TransferCancelled { .. } => Some((CallState::Talking, false)),
            CallPlatformEvent::BlindTransferred { .. } => Some((CallState::Transferred, true)),
            CallPlatformEvent::Ended { .. } => Some((CallState::Ended, false)),
        }
    }
}

/// One applied call-state transition, as delivered to listeners
#[derive(Debug, Clone, PartialEq)]
pub struct CallTransition {
    pub call_id: CallId,
    pub previous_state: CallState,
    /// The call after the transition was applied
    pub call: AgentCall,
    /// `has_transferred` flipped from false to true on this transition
    pub transfer_completed: bool,
}

impl CallTransition {
    pub fn new_state(&self) -> CallState {
        self.call.state
    }
}
