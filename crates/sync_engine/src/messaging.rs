use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{normalize_address, ConversationId, Identifier},
    error::Fault,
    protocol::{ConversationSummary, MessageQuery, MessageRecord},
};
use tracing::{debug, info, warn};

use crate::{
    fault::{best_effort, safe_call},
    reconcile::fetch_conversations,
    SyncEngine,
};

impl SyncEngine {
    /// Sends `content` to an existing conversation. Blank content and a
    /// session that is not ready are both rejected before the backend is
    /// contacted.
    pub async fn send_message(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<(), Fault> {
        if content.trim().is_empty() {
            return Err(Fault::validation("message content must not be empty"));
        }
        let (client, _) = self.require_ready().await?;

        best_effort("sync_all", client.sync_all()).await;
        let conversations = safe_call(
            "list_conversations",
            client.list_conversations(),
            Vec::new(),
        )
        .await?;
        if !conversations.iter().any(|c| &c.id == conversation_id) {
            return Err(Fault::not_found(format!(
                "conversation {conversation_id} not found; it may have been deleted or not synced yet"
            )));
        }

        safe_call("send", client.send(conversation_id, content), ()).await?;
        info!(conversation_id = %conversation_id, "sync: message sent");
        self.schedule_follow_up_sync();
        Ok(())
    }

    /// Returns the direct conversation with `peer_address`, creating it when
    /// none exists yet.
    pub async fn start_conversation(
        self: &Arc<Self>,
        peer_address: &str,
    ) -> Result<ConversationId, Fault> {
        let address = normalize_address(peer_address)
            .ok_or_else(|| Fault::validation(format!("invalid wallet address '{peer_address}'")))?;
        let (client, _) = self.require_ready().await?;

        let identifier = Identifier::ethereum(address.clone());
        let peer = safe_call("find_inbox_id", client.find_inbox_id(&identifier), None)
            .await?
            .ok_or_else(|| {
                Fault::not_registered(format!(
                    "{address} is not registered on the messaging network"
                ))
            })?;

        best_effort("sync_all", client.sync_all()).await;
        let existing = fetch_conversations(client.as_ref()).await;
        if let Some(found) = existing
            .iter()
            .find(|c| c.is_direct() && c.peer_inbox_id() == Some(&peer))
        {
            debug!(conversation_id = %found.id, peer = %peer, "sync: reusing direct conversation");
            return Ok(found.id.clone());
        }

        let created = safe_call(
            "find_or_create_dm",
            async { client.find_or_create_dm(&peer).await.map(Some) },
            None,
        )
        .await?
        .ok_or_else(|| Fault::generic(format!("could not create a conversation with {address}")))?;
        info!(conversation_id = %created.id, peer = %peer, "sync: direct conversation created");
        self.schedule_deferred_reconcile();
        Ok(created.id)
    }

    /// Reachability per normalized address. Any failure maps every address
    /// to `false`.
    pub async fn can_message(&self, addresses: &[&str]) -> HashMap<String, bool> {
        let mut reachability = HashMap::with_capacity(addresses.len());
        let mut identifiers = Vec::with_capacity(addresses.len());
        for raw in addresses {
            match normalize_address(raw) {
                Some(address) => {
                    reachability.insert(address.clone(), false);
                    identifiers.push(Identifier::ethereum(address));
                }
                None => {
                    reachability.insert(raw.trim().to_lowercase(), false);
                }
            }
        }
        if identifiers.is_empty() {
            return reachability;
        }
        let Some((client, _)) = self.ready_client().await else {
            debug!("sync: can_message without a ready client, reporting unreachable");
            return reachability;
        };

        match safe_call(
            "can_message",
            client.can_message(&identifiers),
            HashMap::new(),
        )
        .await
        {
            Ok(answers) => {
                for identifier in identifiers {
                    let reachable = answers.get(&identifier).copied().unwrap_or(false);
                    reachability.insert(identifier.value, reachable);
                }
            }
            Err(fault) => {
                warn!(
                    kind = ?fault.kind,
                    error = %fault.message,
                    "sync: reachability check failed, reporting unreachable"
                );
            }
        }
        reachability
    }

    /// Latest `limit` messages of one conversation, oldest first. Faults
    /// propagate since the caller asked for this data explicitly.
    pub async fn get_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, Fault> {
        let (client, _) = self.require_ready().await?;
        let mut page = safe_call(
            "list_messages",
            client.list_messages(conversation_id, MessageQuery::latest(limit)),
            Vec::new(),
        )
        .await?;
        page.sort_by_key(|message| message.sent_at_ns);

        let mut records = Vec::with_capacity(page.len());
        for message in page {
            let sender_display_identity = self
                .identities
                .display_identity(client.as_ref(), &message.sender_inbox_id)
                .await;
            records.push(MessageRecord {
                id: message.stable_id(),
                conversation_id: conversation_id.clone(),
                sent_at_ms: message.sent_at_ms(),
                content: message.content,
                sender_display_identity,
            });
        }
        Ok(records)
    }

    /// Forces a reconcile pass and returns the resulting list. Empty when
    /// the session is not ready.
    pub async fn list_conversations(&self) -> Vec<ConversationSummary> {
        match self.reconcile_now().await {
            Some(outcome) => outcome.conversations,
            None => self.conversations().await,
        }
    }

    /// Best-effort full sync; a no-op without a ready client.
    pub async fn sync_all(&self) {
        if let Some((client, _)) = self.ready_client().await {
            best_effort("sync_all", client.sync_all()).await;
        }
    }

    /// Clears the attempt budget and builds a fresh session.
    pub async fn refresh(&self) -> Result<(), Fault> {
        self.reset_attempt_budget().await;
        self.initialize().await
    }

    fn schedule_follow_up_sync(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        let delay = self.config.follow_up_sync_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(engine) = engine.upgrade() {
                engine.sync_all().await;
            }
        });
    }

    fn schedule_deferred_reconcile(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        let delay = self.config.deferred_reconcile_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(engine) = engine.upgrade() {
                engine.reconcile_now().await;
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/messaging_tests.rs"]
mod tests;
