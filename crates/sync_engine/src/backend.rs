use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{BackendEnv, ConversationId, Identifier, InboxId},
    protocol::{IdentityState, MessageQuery, RemoteConversation, RemoteMessage},
};

/// The connected wallet that owns the messaging identity.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    fn address(&self) -> String;
    async fn sign_message(&self, message: &str) -> Result<Vec<u8>>;
}

/// Binds a wallet to the identifier the messaging network registers it under.
#[derive(Clone)]
pub struct SigningAdapter {
    identifier: Identifier,
    wallet: Arc<dyn WalletSigner>,
}

impl SigningAdapter {
    pub fn for_wallet(wallet: Arc<dyn WalletSigner>) -> Self {
        let identifier = Identifier::ethereum(wallet.address().trim().to_ascii_lowercase());
        Self { identifier, wallet }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub async fn sign(&self, signature_text: &str) -> Result<Vec<u8>> {
        self.wallet.sign_message(signature_text).await
    }
}

impl std::fmt::Debug for SigningAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningAdapter")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientOptions {
    pub env: BackendEnv,
    pub db_path: Option<PathBuf>,
    pub app_version: Option<String>,
}

/// Factory for messaging clients.
#[async_trait]
pub trait MessagingBackend: Send + Sync {
    async fn create_client(
        &self,
        signer: SigningAdapter,
        options: ClientOptions,
    ) -> Result<Arc<dyn MessagingClient>>;
}

/// Request/response API of a messaging client. There is no push channel;
/// everything live is derived from polling these calls.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    fn inbox_id(&self) -> InboxId;
    async fn sync_all(&self) -> Result<()>;
    async fn list_conversations(&self) -> Result<Vec<RemoteConversation>>;
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        query: MessageQuery,
    ) -> Result<Vec<RemoteMessage>>;
    async fn send(&self, conversation_id: &ConversationId, content: &str) -> Result<()>;
    async fn find_or_create_dm(&self, peer: &InboxId) -> Result<RemoteConversation>;
    async fn find_inbox_id(&self, identifier: &Identifier) -> Result<Option<InboxId>>;
    async fn identity_states(&self, peers: &[InboxId]) -> Result<Vec<IdentityState>>;
    async fn can_message(&self, identifiers: &[Identifier]) -> Result<HashMap<Identifier, bool>>;
}
