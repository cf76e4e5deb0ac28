//! # Supervisor Monitoring
//!
//! Supervisors attach to agent calls in one of three escalating modes:
//! [`Listen`](MonitorMode::Listen), [`Whisper`](MonitorMode::Whisper) and
//! [`Join`](MonitorMode::Join). At most one session per call is Active at any
//! time; a second supervisor gets the call only through the takeover protocol.
//!
//! - **[`coordinator`]**: [`MonitoringCoordinator`], the entry point for every supervisor command
//! - **[`store`]**: [`MonitoringSessionStore`], the one-owner-per-call session table
//! - **[`takeover`]**: [`TakeoverProtocol`], request / accept / reject / time out
//! - **[`policy`]**: which modes a call state allows, and automatic downgrades
//! - **[`events`]**: the [`MonitorEvent`] feed
//! - **[`types`]**: session data model
//!
//! ## Session lifecycle
//!
//! ```text
//!   Pending ──confirm──► Active ──end_session / call ended──► Ended
//!      │                   │
//!      │ timeout           └──────── lost a takeover ───────► Revoked
//!      ▼
//!    Ended (abandoned)
//! ```
//!
//! An Active Whisper session drops to Listen when its call ends or a transfer
//! completes, and keeps monitoring.

pub mod coordinator;
pub mod events;
pub(crate) mod interest;
pub mod policy;
pub mod store;
pub mod takeover;
pub mod types;

pub use coordinator::{MonitoringCoordinator, StartOutcome, TakeoverStart};
pub use events::{MonitorEvent, MonitorEventBus, MonitorEventSubscriber, SessionStateChanged, TransitionCause};
pub use policy::{DowngradeCause, SessionReaction};
pub use store::{CurrentOwner, EndOutcome, MonitoringSessionStore, SetActiveOutcome, TransferOutcome};
pub use takeover::{AbortReason, TakeoverDecision, TakeoverId, TakeoverProtocol, TakeoverState, TakeoverTicket};
pub use types::{
    EndReason, MonitorMode, MonitoringSession, MonitoringSessionId, RevokedReason, SessionStatus, SupervisorId,
};
