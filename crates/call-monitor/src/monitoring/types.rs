//! Monitoring session data model

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::call::types::CallId;

/// Identifier of a supervisor
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SupervisorId(pub String);

impl fmt::Display for SupervisorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SupervisorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one monitoring attempt; never reused
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonitoringSessionId(pub String);

impl MonitoringSessionId {
    pub fn new() -> Self {
        Self(format!("mon-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MonitoringSessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MonitoringSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monitoring privilege, in escalating order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MonitorMode {
    /// Silent tap on both legs
    Listen,
    /// One-way coaching audio heard by the agent only
    Whisper,
    /// Full three-way bridge with agent and customer
    Join,
}

impl fmt::Display for MonitorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorMode::Listen => "Listen",
            MonitorMode::Whisper => "Whisper",
            MonitorMode::Join => "Join",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for MonitorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "listen" => Ok(MonitorMode::Listen),
            "whisper" => Ok(MonitorMode::Whisper),
            "join" | "barge" => Ok(MonitorMode::Join),
            other => Err(format!("unknown monitor mode: {}", other)),
        }
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
    Revoked,
}

impl SessionStatus {
    /// `Ended` and `Revoked` records are immutable
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Revoked)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "Pending",
            SessionStatus::Active => "Active",
            SessionStatus::Ended => "Ended",
            SessionStatus::Revoked => "Revoked",
        };
        f.write_str(s)
    }
}

/// Why a session lost its call to another supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevokedReason {
    /// The owner accepted the takeover request
    Takeover { by: SupervisorId },
    /// The owner did not answer within the grace period
    TakeoverTimedOut { by: SupervisorId },
}

impl RevokedReason {
    /// Supervisor that displaced the session
    pub fn displaced_by(&self) -> &SupervisorId {
        match self {
            RevokedReason::Takeover { by } | RevokedReason::TakeoverTimedOut { by } => by,
        }
    }
}

impl fmt::Display for RevokedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevokedReason::Takeover { by } => write!(f, "taken over by {}", by),
            RevokedReason::TakeoverTimedOut { by } => write!(f, "taken over by {} after timeout", by),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Explicit stop by the supervisor or host
    Stopped,
    /// The monitored call ended
    CallEnded,
    /// Never confirmed by the platform within the pending timeout
    Abandoned,
    /// Confirmation found the mode no longer valid for the call
    PreconditionFailed,
    /// A challenger's attempt that did not win its takeover
    TakeoverFailed,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::Stopped => "stopped",
            EndReason::CallEnded => "call ended",
            EndReason::Abandoned => "abandoned",
            EndReason::PreconditionFailed => "precondition failed",
            EndReason::TakeoverFailed => "takeover failed",
        };
        f.write_str(s)
    }
}

/// A supervisor's attachment to one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSession {
    pub session_id: MonitoringSessionId,
    pub supervisor_id: SupervisorId,
    pub call_id: CallId,
    pub mode: MonitorMode,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set only when `status == Revoked`
    pub revoked_reason: Option<RevokedReason>,
    /// Set only when `status == Ended`
    pub end_reason: Option<EndReason>,
}

impl MonitoringSession {
    /// Fresh `Pending` session with a newly allocated id
    pub fn pending(supervisor_id: SupervisorId, call_id: CallId, mode: MonitorMode) -> Self {
        let now = Utc::now();
        Self {
            session_id: MonitoringSessionId::new(),
            supervisor_id,
            call_id,
            mode,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            revoked_reason: None,
            end_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_escalate() {
        assert!(MonitorMode::Listen < MonitorMode::Whisper);
        assert!(MonitorMode::Whisper < MonitorMode::Join);
        assert_eq!("barge".parse::<MonitorMode>(), Ok(MonitorMode::Join));
        assert!("shout".parse::<MonitorMode>().is_err());
    }

    #[test]
    fn test_pending_sessions_get_fresh_ids() {
        let a = MonitoringSession::pending(SupervisorId::from("s1"), CallId::from("c1"), MonitorMode::Listen);
        let b = MonitoringSession::pending(SupervisorId::from("s1"), CallId::from("c1"), MonitorMode::Listen);
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(a.status, SessionStatus::Pending);
        assert!(!a.is_terminal());
    }

    #[test]
    fn test_revoked_reason_keeps_displacer() {
        let reason = RevokedReason::TakeoverTimedOut { by: SupervisorId::from("s2") };
        assert_eq!(reason.displaced_by(), &SupervisorId::from("s2"));
        assert_eq!(reason.to_string(), "taken over by s2 after timeout");
    }
}
