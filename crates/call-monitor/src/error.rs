use thiserror::Error;

use crate::call::types::{CallId, CallState};
use crate::monitoring::takeover::{AbortReason, TakeoverId};
use crate::monitoring::types::{MonitorMode, MonitoringSessionId, SessionStatus, SupervisorId};

/// Error categories used when reporting and auditing failures
///
/// Every [`MonitorError`] belongs to exactly one category. Validation and
/// ownership failures are synchronous and terminal for the operation that
/// raised them; consistency failures only mean an expected state was not
/// observed in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Precondition failures (unknown call, ended call, mode not allowed)
    Validation,
    /// Session ownership failures (not owner, takeover rejected or expired)
    Ownership,
    /// Expected state not observed in time by a boundary waiter
    Consistency,
    /// The call platform feed delivered something the registry refuses
    Platform,
    /// Configuration or internal failures
    Internal,
}

/// Errors raised by the supervisor monitoring core
///
/// # Examples
///
/// ```
/// use rvoip_call_monitor::{MonitorError, ErrorCategory};
/// use rvoip_call_monitor::call::CallId;
///
/// let err = MonitorError::CallNotFound(CallId::from("call-42"));
/// assert_eq!(err.category(), ErrorCategory::Validation);
/// assert_eq!(err.to_string(), "Call not found: call-42");
/// ```
#[derive(Error, Debug)]
pub enum MonitorError {
    /// The call is unknown to the registry (never seen, or already evicted)
    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    /// The call has already ended; no new monitoring can attach to it
    #[error("Call has ended: {0}")]
    CallEnded(CallId),

    /// The requested mode is not allowed in the call's current state
    #[error("Mode {mode} not allowed on call {call_id} in state {state}: {reason}")]
    InvalidModeTransition {
        call_id: CallId,
        mode: MonitorMode,
        state: CallState,
        reason: String,
    },

    /// No session record exists for this id
    #[error("Monitoring session not found: {0}")]
    SessionNotFound(MonitoringSessionId),

    /// The session is not Active (or not held by the caller), so it cannot be driven
    #[error("Monitoring session {session_id} is not owned (status {status})")]
    SessionNotOwned {
        session_id: MonitoringSessionId,
        status: SessionStatus,
    },

    /// The current owner explicitly refused the takeover
    #[error("Takeover of call {call_id} rejected by supervisor {owner}")]
    TakeoverRejected { call_id: CallId, owner: SupervisorId },

    /// The takeover grace period already elapsed; reported to the original owner
    #[error("Takeover request {request_id} already timed out; session was handed to {challenger}")]
    TakeoverTimedOut {
        request_id: TakeoverId,
        challenger: SupervisorId,
    },

    /// Unknown takeover request id
    #[error("Takeover request not found: {0}")]
    TakeoverNotFound(TakeoverId),

    /// The takeover could not complete for a reason other than the owner's decision
    #[error("Takeover request {request_id} aborted: {reason}")]
    TakeoverAborted {
        request_id: TakeoverId,
        reason: AbortReason,
    },

    /// The platform feed tried an illegal call-state transition
    #[error("Invalid call transition on {call_id}: {from} -> {to}")]
    InvalidCallTransition {
        call_id: CallId,
        from: CallState,
        to: CallState,
    },

    /// The platform announced a call id that is already tracked
    #[error("Call already exists: {0}")]
    CallAlreadyExists(CallId),

    /// An eventual-consistency wait expired before the expected state was observed
    #[error("Timed out after {waited_ms}ms waiting for {what}")]
    Timeout { what: String, waited_ms: u64 },

    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unexpected internal state
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    /// Map the error onto its reporting category
    pub fn category(&self) -> ErrorCategory {
        match self {
            MonitorError::CallNotFound(_)
            | MonitorError::CallEnded(_)
            | MonitorError::InvalidModeTransition { .. } => ErrorCategory::Validation,
            MonitorError::SessionNotFound(_)
            | MonitorError::SessionNotOwned { .. }
            | MonitorError::TakeoverRejected { .. }
            | MonitorError::TakeoverTimedOut { .. }
            | MonitorError::TakeoverNotFound(_)
            | MonitorError::TakeoverAborted { .. } => ErrorCategory::Ownership,
            MonitorError::Timeout { .. } => ErrorCategory::Consistency,
            MonitorError::InvalidCallTransition { .. } | MonitorError::CallAlreadyExists(_) => {
                ErrorCategory::Platform
            }
            MonitorError::Configuration(_) | MonitorError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether a caller may reasonably retry its own wait with fresh parameters
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Consistency
    }

    /// Create a new Configuration error with the provided message
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new Internal error with the provided message
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    pub(crate) fn invalid_mode<S: Into<String>>(
        call_id: &CallId,
        mode: MonitorMode,
        state: CallState,
        reason: S,
    ) -> Self {
        Self::InvalidModeTransition {
            call_id: call_id.clone(),
            mode,
            state,
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for MonitorError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result type for monitoring operations
pub type Result<T> = std::result::Result<T, MonitorError>;
