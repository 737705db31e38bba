use std::collections::HashMap;

use shared::{
    domain::{IdentifierKind, InboxId},
    protocol::IdentityState,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{backend::MessagingClient, fault::safe_call};

/// Resolves inbox ids to wallet addresses. Positive results are cached for the
/// session; misses are retried on the next lookup.
#[derive(Default)]
pub struct PeerIdentityResolver {
    cache: Mutex<HashMap<InboxId, String>>,
}

impl PeerIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(&self, client: &dyn MessagingClient, peer: &InboxId) -> Option<String> {
        if let Some(hit) = self.cache.lock().await.get(peer) {
            return Some(hit.clone());
        }

        let states = match safe_call(
            "identity_states",
            client.identity_states(std::slice::from_ref(peer)),
            Vec::new(),
        )
        .await
        {
            Ok(states) => states,
            Err(fault) => {
                debug!(
                    peer = %peer,
                    kind = ?fault.kind,
                    error = %fault.message,
                    "sync: peer identity lookup failed"
                );
                return None;
            }
        };

        let address = first_chain_address(&states, peer)?;
        self.cache
            .lock()
            .await
            .insert(peer.clone(), address.clone());
        Some(address)
    }

    /// Resolved address, or the raw inbox id when resolution fails.
    pub async fn display_identity(&self, client: &dyn MessagingClient, peer: &InboxId) -> String {
        self.resolve(client, peer)
            .await
            .unwrap_or_else(|| peer.to_string())
    }

    pub async fn cached(&self, peer: &InboxId) -> Option<String> {
        self.cache.lock().await.get(peer).cloned()
    }

    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }
}

fn first_chain_address(states: &[IdentityState], peer: &InboxId) -> Option<String> {
    states
        .iter()
        .filter(|state| &state.inbox_id == peer)
        .flat_map(|state| state.identifiers.iter())
        .find(|identifier| identifier.kind == IdentifierKind::Ethereum)
        .map(|identifier| identifier.value.clone())
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;
