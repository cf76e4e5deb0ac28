//! Mode rules
//!
//! Which monitoring modes a call can carry in each of its states, and how a
//! session reacts when its call changes underneath it. The coordinator and the
//! takeover protocol both evaluate these against the call snapshot read at the
//! moment they act.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::MonitorMode;
use crate::call::types::{AgentCall, CallState, CallTransition};
use crate::error::{MonitorError, Result};

/// What triggered an automatic downgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DowngradeCause {
    CallEnded,
    CallTransferred,
}

impl fmt::Display for DowngradeCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DowngradeCause::CallEnded => f.write_str("CallEnded"),
            DowngradeCause::CallTransferred => f.write_str("CallTransferred"),
        }
    }
}

/// How a live session reacts to one call transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionReaction {
    /// Nothing to do
    Unaffected,
    /// Drop to `Listen`; the session stays Active
    DowngradeToListen(DowngradeCause),
    /// The session is over because its call is
    End,
}

/// Validate a new attachment (start or takeover) in `mode`
pub fn check_attach(call: &AgentCall, mode: MonitorMode) -> Result<()> {
    if call.state.is_ended() {
        return Err(MonitorError::CallEnded(call.call_id.clone()));
    }
    check_mode(call, mode)
}

/// Validate switching a live session to `mode`
///
/// Dropping to `Listen` is always allowed, including on an ended call, since a
/// silent tap never needs a live audio path back to the agent.
pub fn check_change(call: &AgentCall, mode: MonitorMode) -> Result<()> {
    if mode == MonitorMode::Listen {
        return Ok(());
    }
    if call.state.is_ended() {
        return Err(MonitorError::CallEnded(call.call_id.clone()));
    }
    check_mode(call, mode)
}

fn check_mode(call: &AgentCall, mode: MonitorMode) -> Result<()> {
    match mode {
        MonitorMode::Listen => Ok(()),
        MonitorMode::Whisper if call.has_transferred => Err(MonitorError::invalid_mode(
            &call.call_id,
            mode,
            call.state,
            "whisper path to the original agent is gone after a transfer",
        )),
        MonitorMode::Whisper => Ok(()),
        MonitorMode::Join if call.state == CallState::Talking => Ok(()),
        MonitorMode::Join => Err(MonitorError::invalid_mode(
            &call.call_id,
            mode,
            call.state,
            "join requires the call to be talking",
        )),
    }
}

/// Reaction of a live session in `mode` to `transition`
///
/// Whisper drops to Listen when its call ends or a transfer completes,
/// whatever caused the change. Listen and Join sessions end with the call.
pub fn reaction(mode: MonitorMode, transition: &CallTransition) -> SessionReaction {
    let ended = transition.new_state() == CallState::Ended;
    match mode {
        MonitorMode::Whisper if ended => SessionReaction::DowngradeToListen(DowngradeCause::CallEnded),
        MonitorMode::Whisper if transition.transfer_completed => {
            SessionReaction::DowngradeToListen(DowngradeCause::CallTransferred)
        }
        _ if ended => SessionReaction::End,
        _ => SessionReaction::Unaffected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::types::{AgentId, CallId};

    fn call_in(state: CallState) -> AgentCall {
        let mut call = AgentCall::new(CallId::from("c1"), AgentId::from("a1"), "support");
        call.state = state;
        call
    }

    fn transition(from: CallState, call: AgentCall, transfer_completed: bool) -> CallTransition {
        CallTransition {
            call_id: call.call_id.clone(),
            previous_state: from,
            call,
            transfer_completed,
        }
    }

    #[test]
    fn test_join_requires_talking() {
        assert!(matches!(
            check_attach(&call_in(CallState::Ringing), MonitorMode::Join),
            Err(MonitorError::InvalidModeTransition { .. })
        ));
        assert!(check_attach(&call_in(CallState::Talking), MonitorMode::Join).is_ok());
        assert!(check_change(&call_in(CallState::Hold), MonitorMode::Join).is_err());
    }

    #[test]
    fn test_ended_call_rejects_attach_but_allows_listen_change() {
        let ended = call_in(CallState::Ended);
        assert!(matches!(check_attach(&ended, MonitorMode::Listen), Err(MonitorError::CallEnded(_))));
        assert!(check_change(&ended, MonitorMode::Listen).is_ok());
        assert!(matches!(check_change(&ended, MonitorMode::Whisper), Err(MonitorError::CallEnded(_))));
    }

    #[test]
    fn test_whisper_blocked_after_transfer() {
        let mut call = call_in(CallState::Talking);
        call.has_transferred = true;
        assert!(check_attach(&call, MonitorMode::Whisper).is_err());
        assert!(check_attach(&call, MonitorMode::Listen).is_ok());
    }

    #[test]
    fn test_reactions() {
        let ended = transition(CallState::Talking, call_in(CallState::Ended), false);
        assert_eq!(
            reaction(MonitorMode::Whisper, &ended),
            SessionReaction::DowngradeToListen(DowngradeCause::CallEnded)
        );
        assert_eq!(reaction(MonitorMode::Listen, &ended), SessionReaction::End);
        assert_eq!(reaction(MonitorMode::Join, &ended), SessionReaction::End);

        let mut transferred = call_in(CallState::Talking);
        transferred.has_transferred = true;
        let completed = transition(CallState::TransferHold, transferred, true);
        assert_eq!(
            reaction(MonitorMode::Whisper, &completed),
            SessionReaction::DowngradeToListen(DowngradeCause::CallTransferred)
        );
        assert_eq!(reaction(MonitorMode::Listen, &completed), SessionReaction::Unaffected);

        let held = transition(CallState::Talking, call_in(CallState::TransferHold), false);
        assert_eq!(reaction(MonitorMode::Whisper, &held), SessionReaction::Unaffected);
    }
}
