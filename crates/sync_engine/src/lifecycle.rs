use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use shared::{
    domain::InboxId,
    error::{Fault, FaultKind},
};
use thiserror::Error;

use crate::backend::MessagingClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    InitStarted,
    InitSucceeded,
    InitFailed,
    CleanedUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition from {from:?} on {event:?}")]
pub struct TransitionError {
    pub from: SessionState,
    pub event: LifecycleEvent,
}

pub fn transition(
    current: SessionState,
    event: LifecycleEvent,
) -> Result<SessionState, TransitionError> {
    match (current, event) {
        (SessionState::Uninitialized, LifecycleEvent::InitStarted) => Ok(SessionState::Initializing),
        (SessionState::Failed, LifecycleEvent::InitStarted) => Ok(SessionState::Initializing),
        (SessionState::Initializing, LifecycleEvent::InitSucceeded) => Ok(SessionState::Ready),
        (SessionState::Initializing, LifecycleEvent::InitFailed) => Ok(SessionState::Failed),
        // budget exhaustion is reported without a new attempt
        (SessionState::Uninitialized, LifecycleEvent::InitFailed) => Ok(SessionState::Failed),
        (SessionState::Failed, LifecycleEvent::InitFailed) => Ok(SessionState::Failed),
        (_, LifecycleEvent::CleanedUp) => Ok(SessionState::Uninitialized),
        (from, event) => Err(TransitionError { from, event }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientSession {
    pub state: SessionState,
    pub inbox_id: Option<InboxId>,
    pub attempt_count: u32,
}

/// Session record plus the single client instance. Only the engine's
/// initialize/cleanup paths mutate it.
#[derive(Default)]
pub(crate) struct Lifecycle {
    session: ClientSession,
    client: Option<Arc<dyn MessagingClient>>,
    last_error: Option<Fault>,
}

impl Lifecycle {
    pub(crate) fn session(&self) -> &ClientSession {
        &self.session
    }

    pub(crate) fn last_error(&self) -> Option<&Fault> {
        self.last_error.as_ref()
    }

    pub(crate) fn ready_client(&self) -> Option<Arc<dyn MessagingClient>> {
        match self.session.state {
            SessionState::Ready => self.client.clone(),
            _ => None,
        }
    }

    fn apply(&mut self, event: LifecycleEvent) -> Result<SessionState, TransitionError> {
        let next = transition(self.session.state, event)?;
        self.session.state = next;
        Ok(next)
    }

    /// Returns the budget fault, without consuming an attempt, once `budget`
    /// attempts have failed in a row.
    pub(crate) fn check_budget(&mut self, budget: u32) -> Result<(), Fault> {
        if self.session.attempt_count < budget {
            return Ok(());
        }
        let fault = Fault::new(
            FaultKind::AttemptBudgetExceeded,
            format!(
                "messaging client initialization failed {} times; giving up",
                self.session.attempt_count
            ),
        );
        self.apply(LifecycleEvent::InitFailed)
            .map_err(|err| Fault::generic(err.to_string()))?;
        self.last_error = Some(fault.clone());
        Err(fault)
    }

    pub(crate) fn begin_attempt(&mut self) -> Result<SessionState, TransitionError> {
        let state = self.apply(LifecycleEvent::InitStarted)?;
        self.session.attempt_count += 1;
        self.last_error = None;
        Ok(state)
    }

    pub(crate) fn complete(
        &mut self,
        client: Arc<dyn MessagingClient>,
    ) -> Result<SessionState, TransitionError> {
        let state = self.apply(LifecycleEvent::InitSucceeded)?;
        self.session.attempt_count = 0;
        self.session.inbox_id = Some(client.inbox_id());
        self.client = Some(client);
        Ok(state)
    }

    pub(crate) fn fail(&mut self, fault: Fault) -> Result<SessionState, TransitionError> {
        let state = self.apply(LifecycleEvent::InitFailed)?;
        self.client = None;
        self.session.inbox_id = None;
        self.last_error = Some(fault);
        Ok(state)
    }

    /// Records a session-level error without changing state.
    pub(crate) fn record_error(&mut self, fault: Fault) {
        self.last_error = Some(fault);
    }

    /// Drops the client and returns to `Uninitialized`. The attempt count
    /// survives so a failing backend cannot retry forever.
    pub(crate) fn teardown(&mut self) -> SessionState {
        self.client = None;
        self.session.inbox_id = None;
        self.session.state = SessionState::Uninitialized;
        self.session.state
    }

    pub(crate) fn reset_attempt_budget(&mut self) {
        self.session.attempt_count = 0;
        self.last_error = None;
        self.teardown();
    }
}

/// Single-flight guard: at most one initialize runs at a time. Released on
/// drop, including when the init future is cancelled.
pub(crate) struct InitFlight<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InitFlight<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InitFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
