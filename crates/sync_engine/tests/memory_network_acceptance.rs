use std::{sync::Arc, time::Duration};

use shared::{
    domain::ConversationId,
    error::FaultKind,
    protocol::{MessageQuery, MessageRecord},
};
use sync_engine::{
    memory::{DevWallet, MemoryNetwork},
    MessagingClient, SessionState, Subscription, SyncConfig, SyncEngine, WalletSigner,
};

async fn next_within<T: Clone + Send + 'static>(
    subscription: &mut Subscription<T>,
    limit: Duration,
) -> T {
    tokio::time::timeout(limit, subscription.recv())
        .await
        .expect("item before timeout")
        .expect("subscription open")
}

async fn signed_in(network: &MemoryNetwork) -> (Arc<SyncEngine>, Arc<DevWallet>) {
    let wallet = DevWallet::random();
    let engine = SyncEngine::new(Arc::new(network.clone()), SyncConfig::default());
    engine.connect_wallet(wallet.clone()).await;
    engine.initialize().await.expect("initialize");
    (engine, wallet)
}

#[tokio::test(start_paused = true)]
async fn direct_chat_round_trip_acceptance() {
    let network = MemoryNetwork::new();
    let bob_wallet = DevWallet::random();
    let bob = network
        .client_for(&bob_wallet.address())
        .await
        .expect("bob client");
    let (engine, alice_wallet) = signed_in(&network).await;
    assert_eq!(engine.state().await, SessionState::Ready);

    let bob_address = bob_wallet.address();
    let stranger = DevWallet::random().address();
    let reachability = engine
        .can_message(&[bob_address.as_str(), stranger.as_str()])
        .await;
    assert_eq!(reachability.get(&bob_wallet.address()), Some(&true));
    assert_eq!(reachability.values().filter(|ok| **ok).count(), 1);

    let conversation = engine
        .start_conversation(&bob_wallet.address().to_uppercase().replacen("0X", "0x", 1))
        .await
        .expect("start conversation");
    let again = engine
        .start_conversation(&bob_wallet.address())
        .await
        .expect("same conversation");
    assert_eq!(conversation, again);

    let mut messages = engine.stream_messages();
    bob.send(&conversation, "hi alice").await.expect("bob sends");

    let received: MessageRecord = next_within(&mut messages, Duration::from_secs(5)).await;
    assert_eq!(received.content, "hi alice");
    assert_eq!(received.sender_display_identity, bob_wallet.address());
    assert_eq!(received.conversation_id, conversation);

    engine
        .send_message(&conversation, "hi bob")
        .await
        .expect("alice sends");
    let seen_by_bob = bob
        .list_messages(&conversation, MessageQuery::latest(10))
        .await
        .expect("bob reads");
    assert_eq!(seen_by_bob.len(), 2);
    assert_eq!(seen_by_bob[0].content, "hi bob");

    let echoed = next_within(&mut messages, Duration::from_secs(5)).await;
    assert_eq!(echoed.content, "hi bob");
    assert_eq!(echoed.sender_display_identity, alice_wallet.address());
    assert!(messages.try_recv().is_none());

    let mut conversations = engine.stream_conversations();
    let listed = next_within(&mut conversations, Duration::from_secs(15)).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].peer_display_identity, bob_wallet.address());
    assert_eq!(
        listed[0].last_message.as_ref().map(|m| m.content.as_str()),
        Some("hi bob")
    );

    engine.cleanup().await;
    assert!(messages.recv().await.is_none());
    assert!(conversations.recv().await.is_none());
}

#[tokio::test]
async fn group_conversations_use_their_name() {
    let network = MemoryNetwork::new();
    let bob = network
        .register(&DevWallet::random().address())
        .await
        .expect("bob");
    let (engine, _wallet) = signed_in(&network).await;
    let alice = engine.inbox_id().await.expect("inbox id");
    let named = network
        .create_group(Some("book club"), &[alice.clone(), bob.clone()])
        .await
        .expect("group");
    let unnamed = network
        .create_group(None, &[alice, bob])
        .await
        .expect("group");

    let conversations = engine.list_conversations().await;

    let label_of = |id: &ConversationId| {
        conversations
            .iter()
            .find(|c| &c.id == id)
            .map(|c| c.peer_display_identity.clone())
    };
    assert_eq!(label_of(&named).as_deref(), Some("book club"));
    assert_eq!(label_of(&unnamed).as_deref(), Some("Group (2 members)"));
}

#[tokio::test]
async fn transient_client_creation_failure_recovers_after_refresh() {
    let network = MemoryNetwork::new();
    network
        .fail_next("create_client", "RuntimeError: memory access out of bounds")
        .await;
    let engine = SyncEngine::new(Arc::new(network.clone()), SyncConfig::default());
    engine.connect_wallet(DevWallet::random()).await;

    let fault = engine.initialize().await.expect_err("first attempt");
    assert_eq!(fault.kind, FaultKind::TransientMemory);
    assert_eq!(engine.state().await, SessionState::Failed);

    engine.refresh().await.expect("refresh");
    assert!(engine.is_ready().await);
    assert!(engine.error_message().await.is_none());
}

#[tokio::test]
async fn unregistered_peers_cannot_be_messaged() {
    let network = MemoryNetwork::new();
    let (engine, _wallet) = signed_in(&network).await;
    let stranger = DevWallet::random().address();

    let fault = engine
        .start_conversation(&stranger)
        .await
        .expect_err("not registered");

    assert_eq!(fault.kind, FaultKind::NotRegistered);
    assert_eq!(
        engine.can_message(&[stranger.as_str()]).await.get(&stranger),
        Some(&false)
    );
}
