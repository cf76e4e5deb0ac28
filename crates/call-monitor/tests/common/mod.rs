//! Shared fixtures for the monitoring integration tests

#![allow(dead_code)]

use std::time::Duration;

use rvoip_call_monitor::prelude::*;

pub struct Harness {
    pub coordinator: MonitoringCoordinator,
    pub platform: LoopbackCallPlatform,
    pub waiter: EventualConsistencyWaiter,
}

/// Coordinator over a loopback platform with one agent and short timers
pub fn harness(grace: Duration) -> Harness {
    harness_with(MonitorConfig::default().with_takeover_grace_period(grace))
}

pub fn harness_with(config: MonitorConfig) -> Harness {
    let registry = AgentCallRegistry::new();
    let platform = LoopbackCallPlatform::new(registry.clone(), vec![AgentId::from("agent-a")], "support");
    let coordinator = MonitoringCoordinator::new(config, registry).expect("valid config");
    Harness {
        coordinator,
        platform,
        waiter: EventualConsistencyWaiter::new(Duration::from_millis(5), Duration::from_secs(2)),
    }
}

impl Harness {
    pub async fn talking_call(&self) -> CallId {
        let call_id = self.platform.create_call("+15550100").await.unwrap();
        self.platform.answer_call(&call_id).await.unwrap();
        call_id
    }

    pub async fn start(&self, supervisor: &str, call_id: &CallId, mode: MonitorMode) -> MonitoringSession {
        match self
            .coordinator
            .start_session(SupervisorId::from(supervisor), call_id, mode)
            .await
            .unwrap()
        {
            StartOutcome::Started(session) => session,
            other => panic!("{} could not start on {}: {:?}", supervisor, call_id, other),
        }
    }

    pub async fn request(&self, supervisor: &str, call_id: &CallId, mode: MonitorMode) -> TakeoverTicket {
        match self
            .coordinator
            .request_takeover(SupervisorId::from(supervisor), call_id, mode)
            .await
            .unwrap()
        {
            TakeoverStart::Requested(ticket) => ticket,
            TakeoverStart::Granted(session) => panic!("call was free, got {}", session.session_id),
        }
    }

    pub fn session(&self, session_id: &MonitoringSessionId) -> MonitoringSession {
        self.coordinator.get_session(session_id).expect("session recorded")
    }
}
