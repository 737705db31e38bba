use shared::protocol::{
    nanos_to_millis, ConversationKind, ConversationSummary, LastMessage, MessageQuery,
    RemoteConversation,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    backend::MessagingClient,
    fault::{best_effort, safe_call},
    identity::PeerIdentityResolver,
};

pub const UNKNOWN_PEER: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub conversations: Vec<ConversationSummary>,
    pub changed: bool,
}

/// Lists conversations, retrying once through [`safe_call`] and degrading to an
/// empty list. Never fails.
pub(crate) async fn fetch_conversations(client: &dyn MessagingClient) -> Vec<RemoteConversation> {
    let first = match client.list_conversations().await {
        Ok(conversations) => return conversations,
        Err(err) => err,
    };
    warn!(error = %format!("{first:#}"), "sync: listing conversations failed, retrying once");
    match safe_call("list_conversations", client.list_conversations(), Vec::new()).await {
        Ok(conversations) => conversations,
        Err(fault) => {
            warn!(
                kind = ?fault.kind,
                error = %fault.message,
                "sync: listing conversations failed twice, using empty list"
            );
            Vec::new()
        }
    }
}

fn group_label(name: Option<&str>, member_count: usize) -> String {
    match name.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("Group ({member_count} members)"),
    }
}

/// Builds the ordered conversation list and keeps the last snapshot so
/// unchanged passes can be suppressed.
pub struct ConversationReconciler {
    preview_limit: usize,
    snapshot: Mutex<Vec<ConversationSummary>>,
}

impl ConversationReconciler {
    pub fn new(preview_limit: usize) -> Self {
        Self {
            preview_limit,
            snapshot: Mutex::new(Vec::new()),
        }
    }

    pub async fn snapshot(&self) -> Vec<ConversationSummary> {
        self.snapshot.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.snapshot.lock().await.clear();
    }

    pub async fn reconcile(
        &self,
        client: &dyn MessagingClient,
        identities: &PeerIdentityResolver,
    ) -> ReconcileOutcome {
        let conversations = self.build(client, identities).await;
        self.store(conversations).await
    }

    pub async fn build(
        &self,
        client: &dyn MessagingClient,
        identities: &PeerIdentityResolver,
    ) -> Vec<ConversationSummary> {
        best_effort("sync_all", client.sync_all()).await;
        let remote = fetch_conversations(client).await;

        let mut summaries = Vec::with_capacity(remote.len());
        for conversation in &remote {
            summaries.push(self.summarize(client, identities, conversation).await);
        }
        // stable: equal activity keeps fetch order
        summaries.sort_by(|a, b| b.activity_ms().cmp(&a.activity_ms()));
        summaries
    }

    /// Replaces the snapshot only when the new list differs structurally.
    pub async fn store(&self, conversations: Vec<ConversationSummary>) -> ReconcileOutcome {
        let mut snapshot = self.snapshot.lock().await;
        replace_if_changed(&mut snapshot, conversations)
    }

    /// [`store`](Self::store), unless `is_current` says the pass belongs to a
    /// session that has since been torn down.
    pub(crate) async fn store_if(
        &self,
        conversations: Vec<ConversationSummary>,
        is_current: impl FnOnce() -> bool,
    ) -> Option<ReconcileOutcome> {
        let mut snapshot = self.snapshot.lock().await;
        if !is_current() {
            return None;
        }
        Some(replace_if_changed(&mut snapshot, conversations))
    }

    async fn summarize(
        &self,
        client: &dyn MessagingClient,
        identities: &PeerIdentityResolver,
        conversation: &RemoteConversation,
    ) -> ConversationSummary {
        let peer_display_identity = match &conversation.kind {
            ConversationKind::Direct {
                peer_inbox_id: Some(peer),
            } => identities.display_identity(client, peer).await,
            ConversationKind::Direct {
                peer_inbox_id: None,
            } => UNKNOWN_PEER.to_string(),
            ConversationKind::Group { name, member_count } => {
                group_label(name.as_deref(), *member_count)
            }
        };

        let page = match safe_call(
            "list_messages",
            client.list_messages(
                &conversation.id,
                MessageQuery::latest(self.preview_limit),
            ),
            Vec::new(),
        )
        .await
        {
            Ok(page) => page,
            Err(fault) => {
                debug!(
                    conversation_id = %conversation.id,
                    kind = ?fault.kind,
                    error = %fault.message,
                    "sync: preview fetch failed, leaving last message empty"
                );
                Vec::new()
            }
        };

        let last_message = match page.iter().max_by_key(|message| message.sent_at_ns) {
            Some(latest) => Some(LastMessage {
                content: latest.content.clone(),
                sent_at_ms: latest.sent_at_ms(),
                sender_display_identity: identities
                    .display_identity(client, &latest.sender_inbox_id)
                    .await,
            }),
            None => None,
        };

        ConversationSummary {
            id: conversation.id.clone(),
            peer_display_identity,
            created_at_ms: nanos_to_millis(conversation.created_at_ns),
            last_message,
        }
    }
}

fn replace_if_changed(
    snapshot: &mut Vec<ConversationSummary>,
    conversations: Vec<ConversationSummary>,
) -> ReconcileOutcome {
    if *snapshot == conversations {
        return ReconcileOutcome {
            conversations,
            changed: false,
        };
    }
    *snapshot = conversations.clone();
    ReconcileOutcome {
        conversations,
        changed: true,
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
