use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, PoisonError,
};

use shared::{
    domain::InboxId,
    error::{Fault, FaultKind},
    protocol::{ConversationSummary, MessageRecord},
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

pub mod backend;
pub mod config;
pub mod fault;
pub mod identity;
pub mod lifecycle;
pub mod memory;
mod messaging;
pub mod poller;
pub mod reconcile;
pub mod watermark;

#[cfg(test)]
mod test_support;

pub use backend::{ClientOptions, MessagingBackend, MessagingClient, SigningAdapter, WalletSigner};
pub use config::{load_config, SyncConfig};
pub use lifecycle::{ClientSession, SessionState};
pub use poller::{ConversationSubscription, MessageSubscription, Subscription};
pub use reconcile::ReconcileOutcome;

use fault::safe_call;
use identity::PeerIdentityResolver;
use lifecycle::{InitFlight, Lifecycle};
use poller::PollerSlot;
use reconcile::ConversationReconciler;
use watermark::DedupIndex;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(SessionState),
    PollingChanged(bool),
    Error(Fault),
}

struct StreamHub {
    messages: broadcast::Sender<MessageRecord>,
    conversations: broadcast::Sender<Vec<ConversationSummary>>,
}

impl StreamHub {
    fn new(capacity: usize) -> Self {
        let (messages, _) = broadcast::channel(capacity);
        let (conversations, _) = broadcast::channel(capacity);
        Self {
            messages,
            conversations,
        }
    }
}

/// Owns the messaging client and every piece of session state derived from
/// it: dedup index, conversation snapshot, identity cache, poll timers.
pub struct SyncEngine {
    backend: Arc<dyn MessagingBackend>,
    config: SyncConfig,
    wallet: RwLock<Option<Arc<dyn WalletSigner>>>,
    lifecycle: Mutex<Lifecycle>,
    initializing: AtomicBool,
    // bumped on every cleanup; work started under an older epoch is discarded
    epoch: AtomicU64,
    identities: PeerIdentityResolver,
    reconciler: ConversationReconciler,
    dedup: Mutex<DedupIndex>,
    message_poller: Arc<PollerSlot>,
    conversation_poller: Arc<PollerSlot>,
    polling: AtomicBool,
    streams: std::sync::Mutex<StreamHub>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(backend: Arc<dyn MessagingBackend>, config: SyncConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity);
        Arc::new(Self {
            backend,
            identities: PeerIdentityResolver::new(),
            reconciler: ConversationReconciler::new(config.conversation_preview_limit),
            dedup: Mutex::new(DedupIndex::new(config.dedup_retention)),
            streams: std::sync::Mutex::new(StreamHub::new(config.event_capacity)),
            config,
            wallet: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle::default()),
            initializing: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            message_poller: PollerSlot::new("messages"),
            conversation_poller: PollerSlot::new("conversations"),
            polling: AtomicBool::new(false),
            events,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn connect_wallet(&self, wallet: Arc<dyn WalletSigner>) {
        *self.wallet.write().await = Some(wallet);
    }

    /// Forgets the wallet and tears the session down.
    pub async fn disconnect_wallet(&self) {
        *self.wallet.write().await = None;
        self.cleanup().await;
    }

    async fn connected_wallet(&self) -> Option<Arc<dyn WalletSigner>> {
        let wallet = self.wallet.read().await.clone()?;
        if wallet.address().trim().is_empty() {
            return None;
        }
        Some(wallet)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn session(&self) -> ClientSession {
        self.lifecycle.lock().await.session().clone()
    }

    pub async fn state(&self) -> SessionState {
        self.lifecycle.lock().await.session().state
    }

    pub async fn is_ready(&self) -> bool {
        self.state().await == SessionState::Ready
    }

    pub async fn inbox_id(&self) -> Option<InboxId> {
        self.lifecycle.lock().await.session().inbox_id.clone()
    }

    pub async fn last_error(&self) -> Option<Fault> {
        self.lifecycle.lock().await.last_error().cloned()
    }

    pub async fn error_message(&self) -> Option<String> {
        self.last_error().await.map(|fault| fault.user_message())
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::Acquire)
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.reconciler.snapshot().await
    }

    pub async fn watermark_ms(&self) -> i64 {
        self.dedup.lock().await.watermark_ms()
    }

    /// Creates the messaging client. No-op without a connected wallet or while
    /// another initialize is in flight.
    pub async fn initialize(&self) -> Result<(), Fault> {
        let Some(wallet) = self.connected_wallet().await else {
            debug!("lifecycle: no connected wallet, skipping initialize");
            return Ok(());
        };
        let Some(_flight) = InitFlight::acquire(&self.initializing) else {
            debug!("lifecycle: initialize already in flight");
            return Ok(());
        };

        {
            let mut lifecycle = self.lifecycle.lock().await;
            if let Err(fault) = lifecycle.check_budget(self.config.attempt_budget) {
                let state = lifecycle.session().state;
                drop(lifecycle);
                warn!(
                    budget = self.config.attempt_budget,
                    "lifecycle: attempt budget exhausted, not contacting backend"
                );
                self.emit(SyncEvent::StateChanged(state));
                self.emit(SyncEvent::Error(fault.clone()));
                return Err(fault);
            }
        }

        self.cleanup().await;

        let (attempt, epoch) = {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle
                .begin_attempt()
                .map_err(|err| Fault::generic(err.to_string()))?;
            (
                lifecycle.session().attempt_count,
                self.epoch.load(Ordering::Acquire),
            )
        };
        self.emit(SyncEvent::StateChanged(SessionState::Initializing));
        info!(attempt, "lifecycle: initializing messaging client");

        let outcome =
            match tokio::time::timeout(self.config.init_timeout, self.connect_client(wallet)).await
            {
                Ok(result) => result,
                Err(_) => Err(Fault::new(
                    FaultKind::Timeout,
                    format!(
                        "messaging client initialization exceeded {}s",
                        self.config.init_timeout.as_secs_f64()
                    ),
                )),
            };

        let mut lifecycle = self.lifecycle.lock().await;
        if !self.is_current(epoch) {
            info!(attempt, "lifecycle: session cleaned up during initialize, discarding result");
            return Ok(());
        }
        match outcome {
            Ok(client) => {
                let inbox_id = client.inbox_id();
                lifecycle
                    .complete(client)
                    .map_err(|err| Fault::generic(err.to_string()))?;
                drop(lifecycle);
                info!(inbox_id = %inbox_id, attempt, "lifecycle: messaging client ready");
                self.emit(SyncEvent::StateChanged(SessionState::Ready));
                Ok(())
            }
            Err(fault) => {
                lifecycle
                    .fail(fault.clone())
                    .map_err(|err| Fault::generic(err.to_string()))?;
                drop(lifecycle);
                error!(
                    attempt,
                    kind = ?fault.kind,
                    error = %fault.message,
                    "lifecycle: messaging client initialization failed"
                );
                self.emit(SyncEvent::StateChanged(SessionState::Failed));
                self.emit(SyncEvent::Error(fault.clone()));
                Err(fault)
            }
        }
    }

    async fn connect_client(
        &self,
        wallet: Arc<dyn WalletSigner>,
    ) -> Result<Arc<dyn MessagingClient>, Fault> {
        let signer = SigningAdapter::for_wallet(wallet);
        debug!(identifier = %signer.identifier().value, "lifecycle: creating messaging client");
        let created = safe_call(
            "create_client",
            async {
                self.backend
                    .create_client(signer, self.config.client.clone())
                    .await
                    .map(Some)
            },
            None,
        )
        .await?;
        // only an absorbed transient fault yields no client
        let client = created.ok_or_else(|| {
            Fault::new(
                FaultKind::TransientMemory,
                "messaging backend did not return a client",
            )
        })?;

        // an empty or stale conversation list is an acceptable starting point
        if let Err(fault) = safe_call("initial_sync", client.sync_all(), ()).await {
            warn!(
                kind = ?fault.kind,
                error = %fault.message,
                "lifecycle: initial sync failed, continuing"
            );
        }
        Ok(client)
    }

    /// Stops both pollers, closes subscriptions and resets every session
    /// cache. Safe to call at any time, any number of times.
    pub async fn cleanup(&self) {
        self.message_poller.stop();
        self.conversation_poller.stop();
        self.set_polling(false);
        {
            let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
            *streams = StreamHub::new(self.config.event_capacity);
        }

        let (previous, state) = {
            let mut lifecycle = self.lifecycle.lock().await;
            self.epoch.fetch_add(1, Ordering::AcqRel);
            let previous = lifecycle.session().state;
            (previous, lifecycle.teardown())
        };
        self.dedup.lock().await.reset();
        self.reconciler.clear().await;
        self.identities.clear().await;

        if previous != state {
            debug!(from = ?previous, "lifecycle: session cleaned up");
            self.emit(SyncEvent::StateChanged(state));
        }
    }

    /// Explicit retry after the attempt budget ran out.
    pub async fn reset_attempt_budget(&self) {
        let state = {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.reset_attempt_budget();
            lifecycle.session().state
        };
        info!("lifecycle: attempt budget reset");
        self.emit(SyncEvent::StateChanged(state));
    }

    pub(crate) async fn ready_client(&self) -> Option<(Arc<dyn MessagingClient>, u64)> {
        let lifecycle = self.lifecycle.lock().await;
        let client = lifecycle.ready_client()?;
        Some((client, self.epoch.load(Ordering::Acquire)))
    }

    pub(crate) async fn require_ready(&self) -> Result<(Arc<dyn MessagingClient>, u64), Fault> {
        self.ready_client()
            .await
            .ok_or_else(|| Fault::validation("messaging client is not ready"))
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch
    }

    /// Records a fault that ends the session's usefulness until refresh.
    pub(crate) async fn record_session_error(&self, fault: Fault) {
        self.lifecycle.lock().await.record_error(fault.clone());
        self.emit(SyncEvent::Error(fault));
    }

    pub(crate) fn set_polling(&self, polling: bool) {
        if self.polling.swap(polling, Ordering::AcqRel) != polling {
            self.emit(SyncEvent::PollingChanged(polling));
        }
    }

    pub(crate) fn publish_message(&self, record: MessageRecord) {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = streams.messages.send(record);
    }

    pub(crate) fn publish_conversations(&self, conversations: Vec<ConversationSummary>) {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = streams.conversations.send(conversations);
    }

    pub(crate) fn subscribe_messages(&self) -> broadcast::Receiver<MessageRecord> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.messages.subscribe()
    }

    pub(crate) fn subscribe_conversations(
        &self,
    ) -> broadcast::Receiver<Vec<ConversationSummary>> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.conversations.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.message_poller.stop();
        self.conversation_poller.stop();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
