use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, Identifier, InboxId, MessageId};

pub const NANOS_PER_MILLI: i64 = 1_000_000;

pub fn nanos_to_millis(nanos: i64) -> i64 {
    nanos / NANOS_PER_MILLI
}

fn millis_to_utc(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationKind {
    Direct {
        /// `None` when the collaborator could not report the peer.
        peer_inbox_id: Option<InboxId>,
    },
    Group {
        name: Option<String>,
        member_count: usize,
    },
}

/// A conversation as reported by the messaging collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConversation {
    pub id: ConversationId,
    pub created_at_ns: i64,
    pub kind: ConversationKind,
}

impl RemoteConversation {
    pub fn peer_inbox_id(&self) -> Option<&InboxId> {
        match &self.kind {
            ConversationKind::Direct { peer_inbox_id } => peer_inbox_id.as_ref(),
            ConversationKind::Group { .. } => None,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.kind, ConversationKind::Direct { .. })
    }
}

/// A decoded message as reported by the messaging collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: Option<MessageId>,
    pub conversation_id: ConversationId,
    pub sender_inbox_id: InboxId,
    pub content: String,
    pub sent_at_ns: i64,
}

impl RemoteMessage {
    pub fn sent_at_ms(&self) -> i64 {
        nanos_to_millis(self.sent_at_ns)
    }

    /// Backend id, or `<conversation>-<sent_at_ns>` when the backend gave none.
    pub fn stable_id(&self) -> String {
        match &self.id {
            Some(id) if !id.0.is_empty() => id.0.clone(),
            _ => format!("{}-{}", self.conversation_id, self.sent_at_ns),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    #[default]
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageQuery {
    pub limit: usize,
    pub direction: SortDirection,
}

impl MessageQuery {
    /// The most recent `limit` messages.
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            direction: SortDirection::Descending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityState {
    pub inbox_id: InboxId,
    pub identifiers: Vec<Identifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub content: String,
    pub sent_at_ms: i64,
    pub sender_display_identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub peer_display_identity: String,
    pub created_at_ms: i64,
    pub last_message: Option<LastMessage>,
}

impl ConversationSummary {
    /// Timestamp used for ordering: last activity, else creation time.
    pub fn activity_ms(&self) -> i64 {
        self.last_message
            .as_ref()
            .map(|last| last.sent_at_ms)
            .unwrap_or(self.created_at_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: ConversationId,
    pub content: String,
    pub sender_display_identity: String,
    pub sent_at_ms: i64,
}

impl MessageRecord {
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        millis_to_utc(self.sent_at_ms)
    }
}
