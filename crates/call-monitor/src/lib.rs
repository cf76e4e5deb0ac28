//! # RVOIP Call Monitor
//!
//! Supervisor call monitoring for the RVOIP call center: listening in on
//! agent calls, coaching the agent with whisper audio, joining as a third
//! party, and taking a monitored call over from another supervisor.
//!
//! ## Overview
//!
//! - **Call tracking**: [`AgentCallRegistry`] follows every agent call through
//!   the platform's state feed and notifies interested sessions in order
//! - **Single owner per call**: [`MonitoringSessionStore`] admits at most one
//!   Active session per call through an atomic compare-and-swap
//! - **Takeover**: a second supervisor asks the owner for the call; the owner
//!   accepts, rejects, or loses it after a grace period
//! - **Automatic downgrades**: Whisper drops to Listen when the call ends or a
//!   transfer completes
//! - **Boundary waiting**: [`EventualConsistencyWaiter`] for callers that
//!   need to observe the effect of a command
//!
//! ## Architecture
//!
//! ```text
//!   Supervisor callers                         Call platform feed
//!          │                                           │
//!          ▼                                           ▼
//! ┌───────────────────────┐  subscribe   ┌─────────────────────────┐
//! │ MonitoringCoordinator │─────────────►│    AgentCallRegistry    │
//! └───────────────────────┘◄─────────────└─────────────────────────┘
//!      │            │        transitions
//!      ▼            ▼
//! ┌──────────┐ ┌──────────────────┐
//! │ Takeover │►│ MonitoringSession│
//! │ Protocol │ │      Store       │
//! └──────────┘ └──────────────────┘
//!      │
//!      ▼
//!  MonitorEvent feed (SessionStateChanged, TakeoverRequested, TakeoverResolved)
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use rvoip_call_monitor::prelude::*;
//!
//! # async fn example() -> rvoip_call_monitor::Result<()> {
//! let registry = AgentCallRegistry::new();
//! let platform = LoopbackCallPlatform::new(registry.clone(), vec![AgentId::from("alice")], "support");
//! let coordinator = MonitoringCoordinator::new(MonitorConfig::default(), registry)?;
//! let mut events = coordinator.subscribe();
//!
//! let call_id = platform.create_call("+15550100").await?;
//! platform.answer_call(&call_id).await?;
//!
//! if let StartOutcome::Started(session) = coordinator
//!     .start_session(SupervisorId::from("sup-1"), &call_id, MonitorMode::Listen)
//!     .await?
//! {
//!     coordinator.change_mode(&session.session_id, MonitorMode::Whisper).await?;
//!     coordinator.end_session(&session.session_id).await?;
//! }
//! assert_eq!(events.drain().len(), 3);
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod config;
pub mod consistency;
pub mod error;
pub mod logging;
pub mod monitoring;

pub use call::{AgentCallRegistry, CallPlatform, LoopbackCallPlatform};
pub use config::MonitorConfig;
pub use consistency::EventualConsistencyWaiter;
pub use error::{ErrorCategory, MonitorError, Result};
pub use monitoring::{MonitoringCoordinator, MonitoringSessionStore, TakeoverProtocol};

/// Prelude module for convenient imports
///
/// ```
/// use rvoip_call_monitor::prelude::*;
/// ```
pub mod prelude {
    pub use crate::call::{
        AgentCall, AgentCallRegistry, AgentId, CallId, CallPlatform, CallPlatformEvent, CallState, CallStateListener,
        CallTransition, LoopbackCallPlatform, SubscriptionControl,
    };
    pub use crate::config::{MonitorConfig, WaiterConfig};
    pub use crate::consistency::EventualConsistencyWaiter;
    pub use crate::error::{ErrorCategory, MonitorError, Result};
    pub use crate::logging::{setup_logging, LoggingConfig};
    pub use crate::monitoring::{
        AbortReason, CurrentOwner, DowngradeCause, EndReason, MonitorEvent, MonitorEventSubscriber, MonitorMode,
        MonitoringCoordinator, MonitoringSession, MonitoringSessionId, RevokedReason, SessionStateChanged,
        SessionStatus, StartOutcome, SupervisorId, TakeoverDecision, TakeoverId, TakeoverStart, TakeoverState,
        TakeoverTicket, TransitionCause,
    };
}
