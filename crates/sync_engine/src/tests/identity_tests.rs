use super::*;
use crate::test_support::{ScriptedClient, BOB};

#[tokio::test]
async fn resolves_first_ethereum_identifier_and_caches_it() {
    let client = ScriptedClient::new("inbox-me");
    client.add_identity("inbox-bob", BOB);
    let resolver = PeerIdentityResolver::new();
    let bob = InboxId::new("inbox-bob");

    assert_eq!(resolver.resolve(client.as_ref(), &bob).await.as_deref(), Some(BOB));
    assert_eq!(resolver.resolve(client.as_ref(), &bob).await.as_deref(), Some(BOB));
    assert_eq!(client.calls("identity_states"), 1);
    assert_eq!(resolver.cached(&bob).await.as_deref(), Some(BOB));
}

#[tokio::test]
async fn unresolved_peers_are_not_cached() {
    let client = ScriptedClient::new("inbox-me");
    let resolver = PeerIdentityResolver::new();
    let ghost = InboxId::new("inbox-ghost");

    assert_eq!(resolver.resolve(client.as_ref(), &ghost).await, None);
    assert_eq!(resolver.resolve(client.as_ref(), &ghost).await, None);
    assert_eq!(client.calls("identity_states"), 2);
}

#[tokio::test]
async fn lookup_faults_are_soft() {
    let client = ScriptedClient::new("inbox-me");
    client.add_identity("inbox-bob", BOB);
    client.fail_next("identity_states", "Failed to fetch");
    client.fail_next("identity_states", "memory access out of bounds");
    let resolver = PeerIdentityResolver::new();
    let bob = InboxId::new("inbox-bob");

    assert_eq!(resolver.resolve(client.as_ref(), &bob).await, None);
    assert_eq!(resolver.resolve(client.as_ref(), &bob).await, None);
    assert_eq!(resolver.resolve(client.as_ref(), &bob).await.as_deref(), Some(BOB));
}

#[tokio::test]
async fn display_identity_falls_back_to_raw_handle() {
    let client = ScriptedClient::new("inbox-me");
    let resolver = PeerIdentityResolver::new();
    assert_eq!(
        resolver
            .display_identity(client.as_ref(), &InboxId::new("inbox-ghost"))
            .await,
        "inbox-ghost"
    );
}

#[tokio::test]
async fn clear_forgets_cached_identities() {
    let client = ScriptedClient::new("inbox-me");
    client.add_identity("inbox-bob", BOB);
    let resolver = PeerIdentityResolver::new();
    let bob = InboxId::new("inbox-bob");
    resolver.resolve(client.as_ref(), &bob).await;
    resolver.clear().await;
    assert_eq!(resolver.cached(&bob).await, None);
}
