use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ConversationId, Identifier, IdentifierKind, InboxId, MessageId},
    protocol::{
        ConversationKind, IdentityState, MessageQuery, RemoteConversation, RemoteMessage,
        SortDirection,
    },
};

use crate::{
    backend::{ClientOptions, MessagingBackend, MessagingClient, SigningAdapter, WalletSigner},
    SyncConfig, SyncEngine,
};

pub(crate) const ALICE: &str = "0x1111111111111111111111111111111111111111";
pub(crate) const BOB: &str = "0x2222222222222222222222222222222222222222";
pub(crate) const CAROL: &str = "0x3333333333333333333333333333333333333333";

#[derive(Default)]
pub(crate) struct Script {
    pub conversations: Vec<RemoteConversation>,
    pub messages: HashMap<ConversationId, Vec<RemoteMessage>>,
    /// inbox id -> wallet address
    pub identities: HashMap<InboxId, String>,
    /// wallet address -> inbox id
    pub registered: HashMap<String, InboxId>,
    pub reachable: HashSet<String>,
    pub failures: HashMap<&'static str, VecDeque<String>>,
    pub persistent_failures: HashMap<&'static str, String>,
    pub calls: HashMap<&'static str, usize>,
    pub sent: Vec<(ConversationId, String)>,
    pub created_dms: Vec<InboxId>,
}

/// Scripted messaging client: canned responses, queued faults, call counters.
pub(crate) struct ScriptedClient {
    inbox_id: InboxId,
    script: Mutex<Script>,
}

impl ScriptedClient {
    pub(crate) fn new(inbox_id: &str) -> Arc<Self> {
        Arc::new(Self {
            inbox_id: InboxId::new(inbox_id),
            script: Mutex::new(Script::default()),
        })
    }

    pub(crate) fn with<R>(&self, edit: impl FnOnce(&mut Script) -> R) -> R {
        let mut script = self.script.lock().expect("script lock");
        edit(&mut script)
    }

    pub(crate) fn fail_next(&self, operation: &'static str, message: &str) {
        self.with(|s| {
            s.failures
                .entry(operation)
                .or_default()
                .push_back(message.to_string())
        });
    }

    pub(crate) fn fail_always(&self, operation: &'static str, message: &str) {
        self.with(|s| {
            s.persistent_failures
                .insert(operation, message.to_string())
        });
    }

    pub(crate) fn calls(&self, operation: &'static str) -> usize {
        self.with(|s| s.calls.get(operation).copied().unwrap_or(0))
    }

    pub(crate) fn add_conversation(&self, conversation: RemoteConversation) {
        self.with(|s| s.conversations.push(conversation));
    }

    pub(crate) fn add_message(&self, message: RemoteMessage) {
        self.with(|s| {
            s.messages
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message)
        });
    }

    pub(crate) fn add_identity(&self, inbox_id: &str, address: &str) {
        self.with(|s| {
            s.identities
                .insert(InboxId::new(inbox_id), address.to_string());
            s.registered
                .insert(address.to_string(), InboxId::new(inbox_id));
        });
    }

    fn enter(&self, operation: &'static str) -> Result<()> {
        self.with(|s| {
            *s.calls.entry(operation).or_default() += 1;
            if let Some(message) = s.persistent_failures.get(operation) {
                return Err(anyhow!(message.clone()));
            }
            match s.failures.get_mut(operation).and_then(VecDeque::pop_front) {
                Some(message) => Err(anyhow!(message)),
                None => Ok(()),
            }
        })
    }
}

#[async_trait]
impl MessagingClient for ScriptedClient {
    fn inbox_id(&self) -> InboxId {
        self.inbox_id.clone()
    }

    async fn sync_all(&self) -> Result<()> {
        self.enter("sync_all")
    }

    async fn list_conversations(&self) -> Result<Vec<RemoteConversation>> {
        self.enter("list_conversations")?;
        Ok(self.with(|s| s.conversations.clone()))
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        query: MessageQuery,
    ) -> Result<Vec<RemoteMessage>> {
        self.enter("list_messages")?;
        let mut messages = self.with(|s| {
            s.messages
                .get(conversation_id)
                .cloned()
                .unwrap_or_default()
        });
        messages.sort_by_key(|m| m.sent_at_ns);
        if query.direction == SortDirection::Descending {
            messages.reverse();
        }
        messages.truncate(query.limit);
        Ok(messages)
    }

    async fn send(&self, conversation_id: &ConversationId, content: &str) -> Result<()> {
        self.enter("send")?;
        self.with(|s| s.sent.push((conversation_id.clone(), content.to_string())));
        Ok(())
    }

    async fn find_or_create_dm(&self, peer: &InboxId) -> Result<RemoteConversation> {
        self.enter("find_or_create_dm")?;
        let conversation = direct(&format!("dm-{peer}"), peer.as_str(), 1);
        self.with(|s| {
            s.created_dms.push(peer.clone());
            s.conversations.push(conversation.clone());
        });
        Ok(conversation)
    }

    async fn find_inbox_id(&self, identifier: &Identifier) -> Result<Option<InboxId>> {
        self.enter("find_inbox_id")?;
        Ok(self.with(|s| s.registered.get(&identifier.value).cloned()))
    }

    async fn identity_states(&self, peers: &[InboxId]) -> Result<Vec<IdentityState>> {
        self.enter("identity_states")?;
        Ok(self.with(|s| {
            peers
                .iter()
                .filter_map(|peer| {
                    s.identities.get(peer).map(|address| IdentityState {
                        inbox_id: peer.clone(),
                        identifiers: vec![
                            Identifier {
                                kind: IdentifierKind::Passkey,
                                value: "passkey-1".into(),
                            },
                            Identifier::ethereum(address.clone()),
                        ],
                    })
                })
                .collect()
        }))
    }

    async fn can_message(&self, identifiers: &[Identifier]) -> Result<HashMap<Identifier, bool>> {
        self.enter("can_message")?;
        Ok(self.with(|s| {
            identifiers
                .iter()
                .map(|identifier| (identifier.clone(), s.reachable.contains(&identifier.value)))
                .collect()
        }))
    }
}

pub(crate) fn direct(id: &str, peer: &str, created_at_ns: i64) -> RemoteConversation {
    RemoteConversation {
        id: ConversationId::new(id),
        created_at_ns,
        kind: ConversationKind::Direct {
            peer_inbox_id: Some(InboxId::new(peer)),
        },
    }
}

pub(crate) fn group(id: &str, name: Option<&str>, created_at_ns: i64) -> RemoteConversation {
    RemoteConversation {
        id: ConversationId::new(id),
        created_at_ns,
        kind: ConversationKind::Group {
            name: name.map(str::to_string),
            member_count: 3,
        },
    }
}

pub(crate) fn message(
    conversation: &str,
    id: Option<&str>,
    sender: &str,
    content: &str,
    sent_at_ms: i64,
) -> RemoteMessage {
    RemoteMessage {
        id: id.map(MessageId::new),
        conversation_id: ConversationId::new(conversation),
        sender_inbox_id: InboxId::new(sender),
        content: content.to_string(),
        sent_at_ns: sent_at_ms * 1_000_000,
    }
}

pub(crate) struct TestWallet {
    address: String,
}

impl TestWallet {
    pub(crate) fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
        })
    }
}

#[async_trait]
impl WalletSigner for TestWallet {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign_message(&self, message: &str) -> Result<Vec<u8>> {
        Ok(message.as_bytes().to_vec())
    }
}

/// Backend whose `create_client` hands out a fixed client, fails with queued
/// errors, or stalls for `delay`.
pub(crate) struct ScriptedBackend {
    client: Arc<ScriptedClient>,
    failures: Mutex<VecDeque<String>>,
    always_fail: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub(crate) fn new(client: Arc<ScriptedClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn fail_next(&self, message: &str) {
        self.failures
            .lock()
            .expect("failures lock")
            .push_back(message.to_string());
    }

    pub(crate) fn fail_always(&self, message: &str) {
        *self.always_fail.lock().expect("fail lock") = Some(message.to_string());
    }

    pub(crate) fn stall_for(&self, delay: Duration) {
        *self.delay.lock().expect("delay lock") = Some(delay);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingBackend for ScriptedBackend {
    async fn create_client(
        &self,
        signer: SigningAdapter,
        _options: ClientOptions,
    ) -> Result<Arc<dyn MessagingClient>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        signer.sign("create inbox").await?;
        let delay = *self.delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.always_fail.lock().expect("fail lock").clone() {
            return Err(anyhow!(message));
        }
        if let Some(message) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(anyhow!(message));
        }
        let client: Arc<dyn MessagingClient> = self.client.clone();
        Ok(client)
    }
}

/// Engine with ALICE connected and a successfully initialized session.
pub(crate) async fn ready_engine(
    client: Arc<ScriptedClient>,
) -> (Arc<SyncEngine>, Arc<ScriptedBackend>) {
    let backend = ScriptedBackend::new(client);
    let engine = SyncEngine::new(backend.clone(), SyncConfig::default());
    engine.connect_wallet(TestWallet::new(ALICE)).await;
    engine.initialize().await.expect("initialize");
    (engine, backend)
}
