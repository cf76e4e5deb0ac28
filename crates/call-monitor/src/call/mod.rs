//! # Agent Call Tracking
//!
//! Call lifecycle state as reported by the call platform. The registry is the
//! only writer; monitoring reads snapshots and subscribes to transitions.
//!
//! - **[`types`]**: [`AgentCall`], [`CallState`] and the platform event feed
//! - **[`registry`]**: [`AgentCallRegistry`], per-call ordered transitions and listeners
//! - **[`platform`]**: the [`CallPlatform`] control surface and an in-process loopback

pub mod platform;
pub mod registry;
pub mod types;

pub use platform::{CallPlatform, LoopbackCallPlatform};
pub use registry::{AgentCallRegistry, CallGuard, CallStateListener, RegistryStats, SubscriptionControl, SubscriptionId};
pub use types::{AgentCall, AgentId, CallId, CallPlatformEvent, CallState, CallTransition};
