use std::future::Future;

use shared::error::{Fault, FaultKind};
use tracing::warn;

const TRANSIENT_MEMORY_FINGERPRINTS: &[&str] = &[
    "memory access out of bounds",
    "out of bounds memory access",
    "detached arraybuffer",
    "detached buffer",
    "attempting to access detached",
    "null pointer passed to rust",
    "recursive use of an object detected",
    "unreachable executed",
    "already mutably borrowed",
];

const TIMEOUT_FINGERPRINTS: &[&str] = &["timed out", "timeout", "deadline exceeded"];

const NETWORK_FINGERPRINTS: &[&str] = &[
    "failed to fetch",
    "cross-origin",
    "cors",
    "network",
    "connection refused",
    "connection reset",
    "dns error",
    "transport error",
    "unavailable",
];

const NOT_REGISTERED_FINGERPRINTS: &[&str] = &[
    "not registered",
    "not found",
    "no inbox",
    "not on the network",
];

const VALIDATION_FINGERPRINTS: &[&str] = &["invalid", "must not be empty", "malformed"];

fn matches_any(haystack: &str, fingerprints: &[&str]) -> bool {
    fingerprints.iter().any(|needle| haystack.contains(needle))
}

/// Best-effort classification of a fault message by substring fingerprint.
pub fn classify_message(message: &str) -> FaultKind {
    let lowered = message.to_ascii_lowercase();
    if matches_any(&lowered, TRANSIENT_MEMORY_FINGERPRINTS) {
        FaultKind::TransientMemory
    } else if matches_any(&lowered, TIMEOUT_FINGERPRINTS) {
        FaultKind::Timeout
    } else if matches_any(&lowered, NOT_REGISTERED_FINGERPRINTS) {
        // before network: "not on the network" contains "network"
        FaultKind::NotRegistered
    } else if matches_any(&lowered, NETWORK_FINGERPRINTS) {
        FaultKind::Network
    } else if matches_any(&lowered, VALIDATION_FINGERPRINTS) {
        FaultKind::Validation
    } else {
        FaultKind::Generic
    }
}

/// Turns a collaborator error into a tagged [`Fault`]. Errors that already
/// carry a `Fault` keep their tag.
pub fn classify(err: &anyhow::Error) -> Fault {
    if let Some(fault) = err.downcast_ref::<Fault>() {
        return fault.clone();
    }
    let message = format!("{err:#}");
    Fault::new(classify_message(&message), message)
}

/// Runs `call`, absorbing transient-memory faults into `fallback`. Every other
/// fault is returned to the caller with its classification.
pub async fn safe_call<T, F>(operation: &'static str, call: F, fallback: T) -> Result<T, Fault>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match call.await {
        Ok(value) => Ok(value),
        Err(err) => {
            let fault = classify(&err);
            if fault.is_transient_memory() {
                warn!(
                    operation,
                    error = %fault.message,
                    "sync: absorbed transient memory fault, using fallback"
                );
                Ok(fallback)
            } else {
                Err(fault)
            }
        }
    }
}

/// [`safe_call`] for calls whose failure is logged and otherwise ignored.
pub async fn best_effort<F>(operation: &'static str, call: F)
where
    F: Future<Output = anyhow::Result<()>>,
{
    if let Err(fault) = safe_call(operation, call, ()).await {
        warn!(
            operation,
            kind = ?fault.kind,
            error = %fault.message,
            "sync: best-effort call failed"
        );
    }
}

#[cfg(test)]
#[path = "tests/fault_tests.rs"]
mod tests;
