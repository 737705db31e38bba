use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed taxonomy of faults surfaced by the synchronization layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Spurious low-level corruption (detached buffer, out-of-bounds access).
    TransientMemory,
    Network,
    /// Peer is absent from the messaging directory.
    NotRegistered,
    NotFound,
    Timeout,
    Validation,
    AttemptBudgetExceeded,
    Generic,
}

impl FaultKind {
    pub fn is_transient_memory(self) -> bool {
        matches!(self, Self::TransientMemory)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FaultKind::NotFound, message)
    }

    pub fn not_registered(message: impl Into<String>) -> Self {
        Self::new(FaultKind::NotRegistered, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Generic, message)
    }

    pub fn is_transient_memory(&self) -> bool {
        self.kind.is_transient_memory()
    }

    /// Text suitable for showing to the person using the chat.
    pub fn user_message(&self) -> String {
        match self.kind {
            FaultKind::TransientMemory => {
                "The messaging session hit an internal error. Please refresh the page.".into()
            }
            FaultKind::Network => {
                "Network error while talking to the messaging network. Check your connection and try again.".into()
            }
            FaultKind::NotRegistered => {
                "This address has not enabled messaging yet.".into()
            }
            FaultKind::NotFound => {
                "Conversation not found. It may have been deleted or not synced yet.".into()
            }
            FaultKind::Timeout => {
                "Connecting to the messaging network timed out. Please try again.".into()
            }
            FaultKind::AttemptBudgetExceeded => {
                "Too many failed connection attempts. Please refresh the page.".into()
            }
            FaultKind::Validation | FaultKind::Generic => self.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_memory_user_message_asks_for_refresh() {
        let fault = Fault::new(FaultKind::TransientMemory, "memory access out of bounds");
        assert!(fault.user_message().contains("refresh"));
    }

    #[test]
    fn validation_user_message_is_the_raw_message() {
        let fault = Fault::validation("message content must not be empty");
        assert_eq!(fault.user_message(), "message content must not be empty");
    }

    #[test]
    fn fault_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FaultKind::AttemptBudgetExceeded).expect("json");
        assert_eq!(json, "\"attempt_budget_exceeded\"");
    }
}
