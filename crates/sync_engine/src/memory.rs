//! In-process messaging network. Every client created from one
//! [`MemoryNetwork`] shares its inbox directory and conversations, which is
//! enough to drive the engine end to end without a real backend.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{normalize_address, ConversationId, Identifier, IdentifierKind, InboxId, MessageId},
    protocol::{
        ConversationKind, IdentityState, MessageQuery, RemoteConversation, RemoteMessage,
        SortDirection, NANOS_PER_MILLI,
    },
};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{ClientOptions, MessagingBackend, MessagingClient, SigningAdapter, WalletSigner};

const LOGIN_CHALLENGE: &str = "memory network login";

enum Members {
    Direct([InboxId; 2]),
    Group { name: Option<String>, members: Vec<InboxId> },
}

struct StoredConversation {
    id: ConversationId,
    created_at_ns: i64,
    members: Members,
    messages: Vec<RemoteMessage>,
}

impl StoredConversation {
    fn has_member(&self, inbox_id: &InboxId) -> bool {
        match &self.members {
            Members::Direct(pair) => pair.contains(inbox_id),
            Members::Group { members, .. } => members.contains(inbox_id),
        }
    }

    fn view_for(&self, viewer: &InboxId) -> RemoteConversation {
        let kind = match &self.members {
            Members::Direct([a, b]) => ConversationKind::Direct {
                peer_inbox_id: Some(if a == viewer { b.clone() } else { a.clone() }),
            },
            Members::Group { name, members } => ConversationKind::Group {
                name: name.clone(),
                member_count: members.len(),
            },
        };
        RemoteConversation {
            id: self.id.clone(),
            created_at_ns: self.created_at_ns,
            kind,
        }
    }
}

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<String, InboxId>,
    addresses: HashMap<InboxId, String>,
    conversations: Vec<StoredConversation>,
    faults: HashMap<String, VecDeque<String>>,
    last_ns: i64,
}

impl NetworkState {
    /// Wall clock in nanoseconds. Consecutive stamps are at least a
    /// millisecond apart so millisecond watermarks never tie.
    fn now_ns(&mut self) -> i64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(self.last_ns);
        self.last_ns = wall.max(self.last_ns + NANOS_PER_MILLI);
        self.last_ns
    }

    fn register(&mut self, address: &str) -> InboxId {
        if let Some(existing) = self.inboxes.get(address) {
            return existing.clone();
        }
        let inbox_id = InboxId::new(format!("inbox-{}", Uuid::new_v4().simple()));
        self.inboxes.insert(address.to_string(), inbox_id.clone());
        self.addresses.insert(inbox_id.clone(), address.to_string());
        inbox_id
    }

    fn take_fault(&mut self, operation: &str) -> Result<()> {
        match self
            .faults
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    fn conversation_for(
        &mut self,
        viewer: &InboxId,
        id: &ConversationId,
    ) -> Result<&mut StoredConversation> {
        self.conversations
            .iter_mut()
            .find(|c| &c.id == id && c.has_member(viewer))
            .ok_or_else(|| anyhow!("conversation {id} not found"))
    }
}

/// Shared in-process directory and message store.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address` (idempotent) and returns its inbox id.
    pub async fn register(&self, address: &str) -> Result<InboxId> {
        let address = normalize_address(address)
            .ok_or_else(|| anyhow!("invalid wallet address '{address}'"))?;
        Ok(self.state.lock().await.register(&address))
    }

    /// Client for an already registered address, bypassing signing.
    pub async fn client_for(&self, address: &str) -> Result<Arc<MemoryClient>> {
        let inbox_id = self.register(address).await?;
        Ok(Arc::new(MemoryClient {
            network: self.clone(),
            inbox_id,
        }))
    }

    pub async fn create_group(
        &self,
        name: Option<&str>,
        members: &[InboxId],
    ) -> Result<ConversationId> {
        let mut state = self.state.lock().await;
        if let Some(unknown) = members.iter().find(|m| !state.addresses.contains_key(*m)) {
            bail!("inbox {unknown} is not registered");
        }
        let id = ConversationId::new(Uuid::new_v4().to_string());
        let created_at_ns = state.now_ns();
        state.conversations.push(StoredConversation {
            id: id.clone(),
            created_at_ns,
            members: Members::Group {
                name: name.map(str::to_string),
                members: members.to_vec(),
            },
            messages: Vec::new(),
        });
        Ok(id)
    }

    /// Makes the next call to `operation` on any client fail with `message`.
    pub async fn fail_next(&self, operation: &str, message: &str) {
        self.state
            .lock()
            .await
            .faults
            .entry(operation.to_string())
            .or_default()
            .push_back(message.to_string());
    }
}

#[async_trait]
impl MessagingBackend for MemoryNetwork {
    async fn create_client(
        &self,
        signer: SigningAdapter,
        options: ClientOptions,
    ) -> Result<Arc<dyn MessagingClient>> {
        self.state.lock().await.take_fault("create_client")?;
        let signature = signer.sign(LOGIN_CHALLENGE).await?;
        if signature.is_empty() {
            bail!("wallet returned an empty signature");
        }
        let client = self.client_for(&signer.identifier().value).await?;
        debug!(inbox_id = %client.inbox_id, env = ?options.env, "memory: client created");
        let client: Arc<dyn MessagingClient> = client;
        Ok(client)
    }
}

pub struct MemoryClient {
    network: MemoryNetwork,
    inbox_id: InboxId,
}

#[async_trait]
impl MessagingClient for MemoryClient {
    fn inbox_id(&self) -> InboxId {
        self.inbox_id.clone()
    }

    async fn sync_all(&self) -> Result<()> {
        self.network.state.lock().await.take_fault("sync_all")
    }

    async fn list_conversations(&self) -> Result<Vec<RemoteConversation>> {
        let mut state = self.network.state.lock().await;
        state.take_fault("list_conversations")?;
        Ok(state
            .conversations
            .iter()
            .filter(|c| c.has_member(&self.inbox_id))
            .map(|c| c.view_for(&self.inbox_id))
            .collect())
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        query: MessageQuery,
    ) -> Result<Vec<RemoteMessage>> {
        let mut state = self.network.state.lock().await;
        state.take_fault("list_messages")?;
        let conversation = state.conversation_for(&self.inbox_id, conversation_id)?;
        let mut messages = conversation.messages.clone();
        if query.direction == SortDirection::Descending {
            messages.reverse();
        }
        messages.truncate(query.limit);
        Ok(messages)
    }

    async fn send(&self, conversation_id: &ConversationId, content: &str) -> Result<()> {
        let mut state = self.network.state.lock().await;
        state.take_fault("send")?;
        let sent_at_ns = state.now_ns();
        let conversation = state.conversation_for(&self.inbox_id, conversation_id)?;
        conversation.messages.push(RemoteMessage {
            id: Some(MessageId::new(Uuid::new_v4().to_string())),
            conversation_id: conversation_id.clone(),
            sender_inbox_id: self.inbox_id.clone(),
            content: content.to_string(),
            sent_at_ns,
        });
        Ok(())
    }

    async fn find_or_create_dm(&self, peer: &InboxId) -> Result<RemoteConversation> {
        let mut state = self.network.state.lock().await;
        state.take_fault("find_or_create_dm")?;
        if !state.addresses.contains_key(peer) {
            bail!("inbox {peer} is not registered");
        }
        if let Some(existing) = state.conversations.iter().find(|c| {
            matches!(&c.members, Members::Direct(pair)
                if pair.contains(&self.inbox_id) && pair.contains(peer))
        }) {
            return Ok(existing.view_for(&self.inbox_id));
        }
        let created_at_ns = state.now_ns();
        let conversation = StoredConversation {
            id: ConversationId::new(Uuid::new_v4().to_string()),
            created_at_ns,
            members: Members::Direct([self.inbox_id.clone(), peer.clone()]),
            messages: Vec::new(),
        };
        let view = conversation.view_for(&self.inbox_id);
        state.conversations.push(conversation);
        Ok(view)
    }

    async fn find_inbox_id(&self, identifier: &Identifier) -> Result<Option<InboxId>> {
        let mut state = self.network.state.lock().await;
        state.take_fault("find_inbox_id")?;
        if identifier.kind != IdentifierKind::Ethereum {
            return Ok(None);
        }
        Ok(state.inboxes.get(&identifier.value.to_lowercase()).cloned())
    }

    async fn identity_states(&self, peers: &[InboxId]) -> Result<Vec<IdentityState>> {
        let mut state = self.network.state.lock().await;
        state.take_fault("identity_states")?;
        Ok(peers
            .iter()
            .filter_map(|peer| {
                state.addresses.get(peer).map(|address| IdentityState {
                    inbox_id: peer.clone(),
                    identifiers: vec![Identifier::ethereum(address.clone())],
                })
            })
            .collect())
    }

    async fn can_message(&self, identifiers: &[Identifier]) -> Result<HashMap<Identifier, bool>> {
        let mut state = self.network.state.lock().await;
        state.take_fault("can_message")?;
        Ok(identifiers
            .iter()
            .map(|identifier| {
                let registered = identifier.kind == IdentifierKind::Ethereum
                    && state
                        .inboxes
                        .contains_key(&identifier.value.to_lowercase());
                (identifier.clone(), registered)
            })
            .collect())
    }
}

/// Development signer: the "signature" is the address-bound challenge text.
pub struct DevWallet {
    address: String,
}

impl DevWallet {
    pub fn new(address: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
        })
    }

    /// Wallet with a fresh random address.
    pub fn random() -> Arc<Self> {
        let hex = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        Self::new(format!("0x{}", &hex[..40]))
    }
}

#[async_trait]
impl WalletSigner for DevWallet {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign_message(&self, message: &str) -> Result<Vec<u8>> {
        Ok(format!("{}:{message}", self.address).into_bytes())
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
