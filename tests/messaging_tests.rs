//! Integration Tests: messaging session lifecycle
//!
//! These tests verify:
//! 1. Handshake outcomes (no signer, failure, timeout, cancellation)
//! 2. Conversation listing, discovery and local updates
//! 3. Send / history / reachability error mapping
//! 4. Subscriptions never fire after unsubscribe or session teardown

use async_trait::async_trait;
use broadcast_core::messaging::ConversationUpdate;
use broadcast_core::sim::SimulatedNetwork;
use broadcast_core::{
    Conversation, CoreConfig, Message, MessagingEnv, MessagingManager, MessagingState, SessionError, SessionResult,
    Signer, Subscription,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ALICE: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
const BOB: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";
const CAROL: &str = "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB";

struct TestSigner(String);

#[async_trait]
impl Signer for TestSigner {
    fn address(&self) -> String {
        self.0.clone()
    }

    async fn sign_message(&self, text: &str) -> SessionResult<String> {
        Ok(format!("sig:{text}"))
    }
}

fn signer(address: &str) -> Option<Arc<dyn Signer>> {
    Some(Arc::new(TestSigner(address.to_string())))
}

fn manager(network: &SimulatedNetwork) -> MessagingManager {
    MessagingManager::new(Arc::new(network.clone()), Duration::from_secs(2), MessagingEnv::Production)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Test: connect without a signer
#[tokio::test]
async fn connect_requires_signer() {
    let network = SimulatedNetwork::new();
    let messaging = manager(&network);

    assert_eq!(messaging.connect(None).await.unwrap_err(), SessionError::SignerUnavailable);
    let state = messaging.state();
    assert!(!state.is_connected && !state.is_connecting);
    assert_eq!(state.error, Some(SessionError::SignerUnavailable));
    assert_eq!(network.clients_created(), 0);
}

/// Test: successful handshake lists existing conversations
#[tokio::test]
async fn connect_lists_conversations() {
    let network = SimulatedNetwork::new().with_history(BOB, ALICE, "gm");
    let messaging = manager(&network);

    messaging.connect(signer(ALICE)).await.unwrap();

    let state = messaging.state();
    assert!(state.is_connected);
    assert_eq!(state.identity.as_deref(), Some(ALICE));
    assert_eq!(state.conversations.len(), 1);
    assert_eq!(state.conversations[0].last_message.as_deref(), Some("gm"));
    assert_eq!(state.conversations[0].unread_count, 1);
    assert!(!state.conversations_stale);
}

/// Test: transport failures surface as HandshakeFailed
#[tokio::test]
async fn handshake_failure_is_recorded() {
    let network = SimulatedNetwork::new();
    network.fail_next_handshake(SessionError::unavailable("relay down"));
    let messaging = manager(&network);

    let err = messaging.connect(signer(ALICE)).await.unwrap_err();
    assert!(matches!(err, SessionError::HandshakeFailed(_)));
    assert_eq!(messaging.state().error, Some(err));
    assert!(!messaging.is_connected());

    messaging.clear_error();
    assert_eq!(messaging.state().error, None);
}

/// Test: clients are created on the configured messaging network
#[tokio::test]
async fn handshake_uses_configured_env() {
    let network = SimulatedNetwork::new().with_env(MessagingEnv::Dev);
    let config = CoreConfig::new("test").with_messaging_env(MessagingEnv::Dev);
    let messaging = MessagingManager::from_config(&config, Arc::new(network.clone()));
    assert_eq!(messaging.env(), MessagingEnv::Dev);
    messaging.connect(signer(ALICE)).await.unwrap();
    assert!(messaging.is_connected());

    let production = MessagingManager::from_config(&CoreConfig::new("test"), Arc::new(network.clone()));
    let err = production.connect(signer(BOB)).await.unwrap_err();
    assert!(matches!(err, SessionError::HandshakeFailed(ref m) if m.contains("dev network")));
    assert!(!production.is_connected());
    assert_eq!(network.clients_created(), 2);
}

/// Test: a handshake slower than the timeout fails
#[tokio::test(start_paused = true)]
async fn handshake_times_out() {
    let network = SimulatedNetwork::new().with_handshake_delay(Duration::from_secs(10));
    let messaging = manager(&network);

    let err = messaging.connect(signer(ALICE)).await.unwrap_err();
    assert!(matches!(err, SessionError::HandshakeFailed(ref m) if m.contains("timed out")));
}

/// Test: a second connect while one is in flight is refused
#[tokio::test(start_paused = true)]
async fn second_connect_while_connecting_is_refused() {
    let network = SimulatedNetwork::new().with_handshake_delay(Duration::from_millis(100));
    let messaging = manager(&network);

    let first = messaging.spawn_connect(signer(ALICE)).unwrap();
    assert!(messaging.state().is_connecting);
    let second = messaging.spawn_connect(signer(ALICE)).unwrap_err();
    assert_eq!(second, SessionError::AlreadyConnecting { in_flight: "messaging".into() });

    first.await.unwrap().unwrap();
    assert_eq!(network.clients_created(), 1);
}

/// Test: disconnect during the handshake discards its result
#[tokio::test(start_paused = true)]
async fn disconnect_during_handshake_cancels() {
    let network = SimulatedNetwork::new().with_handshake_delay(Duration::from_millis(100));
    let messaging = manager(&network);

    let pending = messaging.spawn_connect(signer(ALICE)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    messaging.disconnect().await;

    assert_eq!(pending.await.unwrap().unwrap_err(), SessionError::ConnectCancelled);
    assert!(!messaging.is_connected());
    assert!(!messaging.state().is_connecting);
}

/// Test: listing failure leaves a connected session with a stale flag
#[tokio::test]
async fn listing_failure_is_recoverable() {
    let network = SimulatedNetwork::new().with_history(BOB, ALICE, "gm");
    network.set_listing_failure(true);
    let messaging = manager(&network);

    messaging.connect(signer(ALICE)).await.unwrap();
    let state = messaging.state();
    assert!(state.is_connected);
    assert!(state.conversations.is_empty());
    assert!(state.conversations_stale);
    assert_eq!(state.error.as_ref().map(|e| e.code()), Some("query_failed"));

    network.set_listing_failure(false);
    messaging.refresh_conversations().await.unwrap();
    let state = messaging.state();
    assert_eq!(state.conversations.len(), 1);
    assert!(!state.conversations_stale);
}

/// Test: send maps failures to DeliveryFailed and updates the preview
#[tokio::test]
async fn send_updates_preview_and_maps_errors() {
    let network = SimulatedNetwork::new().with_history(BOB, ALICE, "gm");
    let messaging = manager(&network);
    messaging.connect(signer(ALICE)).await.unwrap();

    let sent = messaging.send(BOB, "hello bob").await.unwrap();
    assert_eq!(sent.body, "hello bob");
    assert_eq!(messaging.conversations()[0].last_message.as_deref(), Some("hello bob"));

    network.set_send_failure(true);
    let err = messaging.send(BOB, "lost").await.unwrap_err();
    assert!(matches!(err, SessionError::DeliveryFailed(_)));

    let history = messaging.messages(BOB, Some(10)).await.unwrap();
    let bodies: Vec<&str> = history.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["gm", "hello bob"]);
    assert_eq!(messaging.messages(BOB, Some(1)).await.unwrap().len(), 1);
}

/// Test: operations without a session
#[tokio::test]
async fn operations_require_session() {
    let network = SimulatedNetwork::new().with_registered(BOB);
    let messaging = manager(&network);

    assert_eq!(messaging.send(BOB, "x").await.unwrap_err().code(), "not_connected");
    assert_eq!(messaging.messages(BOB, None).await.unwrap_err().code(), "not_connected");
    assert!(messaging.subscribe(BOB, |_| {}).await.is_err());
    assert!(!messaging.can_message(BOB).await);
}

/// Test: reachability probe treats transport errors as unreachable
#[tokio::test]
async fn can_message_is_advisory() {
    let network = SimulatedNetwork::new().with_registered(BOB).with_unreachable(CAROL).with_registered(CAROL);
    let messaging = manager(&network);
    messaging.connect(signer(ALICE)).await.unwrap();

    assert!(messaging.can_message(BOB).await);
    assert!(!messaging.can_message(CAROL).await);

    network.set_probe_failure(true);
    assert!(!messaging.can_message(BOB).await);
}

/// Test: local conversation edits
#[tokio::test]
async fn add_and_update_conversations() {
    let network = SimulatedNetwork::new().with_history(BOB, ALICE, "gm");
    let messaging = manager(&network);
    messaging.connect(signer(ALICE)).await.unwrap();

    messaging.add_conversation(Conversation::new("local-1", CAROL));
    messaging.add_conversation(Conversation::new("local-1", CAROL));
    let conversations = messaging.conversations();
    assert_eq!(conversations.len(), 2);
    assert_eq!(conversations[0].id, "local-1");

    let updated = messaging.update_conversation("local-1", ConversationUpdate { unread_count: Some(4), ..Default::default() });
    assert!(updated);
    assert_eq!(messaging.conversations()[0].unread_count, 4);
    assert!(!messaging.update_conversation("missing", ConversationUpdate::default()));
}

/// Test: a conversation opened by a peer shows up at the front
#[tokio::test]
async fn discovered_conversations_are_prepended() {
    let network = SimulatedNetwork::new().with_history(BOB, ALICE, "gm");
    let messaging = manager(&network);
    messaging.connect(signer(ALICE)).await.unwrap();

    network.inject(CAROL, ALICE, "hi from carol");
    settle().await;

    let conversations = messaging.conversations();
    assert_eq!(conversations.len(), 2);
    assert!(conversations[0].peer_identity.eq_ignore_ascii_case(CAROL));
}

/// Test: subscription delivers in order and stops at unsubscribe
#[tokio::test]
async fn subscription_stops_at_unsubscribe() {
    let network = SimulatedNetwork::new();
    let messaging = manager(&network);
    messaging.connect(signer(ALICE)).await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let subscription = messaging
        .subscribe(BOB, move |m: Message| sink.lock().unwrap().push(m.body))
        .await
        .unwrap();

    network.inject(BOB, ALICE, "one");
    network.inject(BOB, ALICE, "two");
    network.inject(CAROL, ALICE, "other thread");
    settle().await;
    assert_eq!(received.lock().unwrap().as_slice(), &["one".to_string(), "two".to_string()]);

    subscription.unsubscribe();
    network.inject(BOB, ALICE, "three");
    settle().await;
    assert_eq!(received.lock().unwrap().len(), 2);
    assert!(!subscription.is_active());
}

/// Test: unsubscribing from inside the callback
#[tokio::test]
async fn unsubscribe_from_callback() {
    let network = SimulatedNetwork::new();
    let messaging = manager(&network);
    messaging.connect(signer(ALICE)).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let handle: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let (counter, slot) = (calls.clone(), handle.clone());
    let subscription = messaging
        .subscribe(BOB, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = slot.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        })
        .await
        .unwrap();
    *handle.lock().unwrap() = Some(subscription);

    network.inject(BOB, ALICE, "one");
    network.inject(BOB, ALICE, "two");
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!handle.lock().unwrap().as_ref().unwrap().is_active());
}

/// Test: disconnect ends every subscription
#[tokio::test]
async fn disconnect_closes_subscriptions() {
    let network = SimulatedNetwork::new();
    let messaging = manager(&network);
    messaging.connect(signer(ALICE)).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let subscription = messaging
        .subscribe(BOB, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    messaging.disconnect().await;
    assert!(!subscription.is_active());
    network.inject(BOB, ALICE, "after teardown");
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(messaging.state().conversations.is_empty());
    assert_eq!(network.open_streams(), 0);

    // Idempotent.
    messaging.disconnect().await;
    assert_eq!(messaging.state(), MessagingState::default());
}
