//! Integration Tests: wallet session lifecycle
//!
//! These tests verify:
//! 1. Concurrent connects share one adapter call and one outcome
//! 2. Change events are applied in order; stale balance results are dropped
//! 3. An empty accounts list ends the session
//! 4. Disconnect is idempotent and cancels an in-flight connect
//! 5. Provider events racing connect or switch_network do not get lost or overwritten
//! 6. The EIP-1193 path end to end (hex chain ids, balance re-query)

use async_trait::async_trait;
use broadcast_core::chain::{same_address, POLYGON};
use broadcast_core::provider::{RawProviderEvent, RpcError};
use broadcast_core::sim::SimulatedWallet;
use broadcast_core::{
    Eip1193Adapter, Eip1193Transport, ProviderKind, SessionError, WalletManager, WalletProvider, WalletTransition,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const ALICE: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
const BOB: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";

fn manager_with(wallets: &[Arc<SimulatedWallet>]) -> WalletManager {
    let providers: Vec<Arc<dyn WalletProvider>> = wallets.iter().map(|w| w.clone() as Arc<dyn WalletProvider>).collect();
    WalletManager::new(providers, Duration::from_secs(30))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

/// Test: two concurrent connects for the same kind hit the adapter once
#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_attempt() {
    let injected = Arc::new(
        SimulatedWallet::new(ProviderKind::Injected)
            .with_account(ALICE)
            .with_connect_delay(Duration::from_millis(100)),
    );
    let relay = Arc::new(SimulatedWallet::new(ProviderKind::RelayPairing).with_account(BOB));
    let manager = manager_with(&[injected.clone(), relay.clone()]);

    let (first, second, other) = tokio::join!(
        manager.connect(ProviderKind::Injected),
        manager.connect(ProviderKind::Injected),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.connect(ProviderKind::RelayPairing).await
        },
    );

    assert_eq!(injected.connect_calls(), 1);
    assert_eq!(first.clone().unwrap(), second.unwrap());
    assert_eq!(first.unwrap().address, ALICE);
    assert_eq!(other.unwrap_err(), SessionError::AlreadyConnecting { in_flight: "injected".into() });
    assert_eq!(relay.connect_calls(), 0);
}

/// Test: a failed shared attempt fails every waiter with the same error
#[tokio::test(start_paused = true)]
async fn shared_attempt_failure_reaches_every_waiter() {
    let injected = Arc::new(
        SimulatedWallet::new(ProviderKind::Injected)
            .with_account(ALICE)
            .with_connect_delay(Duration::from_millis(50)),
    );
    injected.fail_next_connect(SessionError::rejected("user closed the modal"));
    let manager = manager_with(&[injected.clone()]);

    let (a, b) = tokio::join!(manager.connect(ProviderKind::Injected), manager.connect(ProviderKind::Injected));
    assert_eq!(a.unwrap_err(), SessionError::rejected("user closed the modal"));
    assert_eq!(b.unwrap_err(), SessionError::rejected("user closed the modal"));
    assert_eq!(injected.connect_calls(), 1);

    let state = manager.state();
    assert!(!state.is_connected && !state.is_connecting);
    assert!(state.error.unwrap().is_user_rejection());

    // Retry succeeds and clears the error.
    manager.connect(ProviderKind::Injected).await.unwrap();
    assert_eq!(manager.state().error, None);
}

/// Test: chainChanged(5) then chainChanged(7) back to back
#[tokio::test(start_paused = true)]
async fn back_to_back_chain_changes_query_only_the_latest() {
    let wallet = Arc::new(
        SimulatedWallet::new(ProviderKind::Injected)
            .with_account(ALICE)
            .with_balance(ALICE, 5, "5.0")
            .with_balance(ALICE, 7, "7.0")
            .with_balance_delay(5, Duration::from_millis(200))
            .with_balance_delay(7, Duration::from_millis(10)),
    );
    let manager = manager_with(&[wallet.clone()]);
    manager.connect(ProviderKind::Injected).await.unwrap();

    wallet.emit_chain_changed(5);
    wallet.emit_chain_changed(7);
    settle().await;

    let state = manager.state();
    assert_eq!(state.chain_id, Some(7));
    assert_eq!(state.balance.as_deref(), Some("7.0"));
    assert!(!state.is_loading);
    // The chain-5 refresh saw a newer generation before querying.
    assert_eq!(chains_queried(&wallet), vec![1, 7]);
}

/// Test: a slow query issued first cannot overwrite a fast one issued later
#[tokio::test(start_paused = true)]
async fn slow_first_query_loses_to_later_generation() {
    let wallet = Arc::new(
        SimulatedWallet::new(ProviderKind::Injected)
            .with_account(ALICE)
            .with_balance(ALICE, 5, "5.0")
            .with_balance(ALICE, 7, "7.0")
            .with_balance_delay(5, Duration::from_millis(300))
            .with_balance_delay(7, Duration::from_millis(10)),
    );
    let manager = manager_with(&[wallet.clone()]);
    manager.connect(ProviderKind::Injected).await.unwrap();

    wallet.emit_chain_changed(5);
    // Let the chain-5 query start before the second event arrives.
    tokio::time::sleep(Duration::from_millis(20)).await;
    wallet.emit_chain_changed(7);

    // Chain 7 has answered; chain 5 is still outstanding.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = manager.state();
    assert_eq!(state.balance.as_deref(), Some("7.0"));
    assert!(state.is_loading);

    // Chain 5 answers last and is dropped.
    settle().await;
    let state = manager.state();
    assert_eq!(state.chain_id, Some(7));
    assert_eq!(state.balance.as_deref(), Some("7.0"));
    assert!(!state.is_loading);
    assert_eq!(chains_queried(&wallet), vec![1, 5, 7]);
    assert!(wallet.balance_queries().iter().all(|(address, _)| same_address(address, ALICE)));
}

fn chains_queried(wallet: &SimulatedWallet) -> Vec<u64> {
    wallet.balance_queries().into_iter().map(|(_, chain)| chain).collect()
}

/// Test: accountsChanged([]) behaves like disconnect
#[tokio::test(start_paused = true)]
async fn empty_accounts_tears_down_session() {
    let wallet = Arc::new(SimulatedWallet::new(ProviderKind::Injected).with_account(ALICE));
    let manager = manager_with(&[wallet.clone()]);
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = transitions.clone();
    manager.on_transition(move |t| sink.lock().unwrap().push(t.clone()));

    manager.connect(ProviderKind::Injected).await.unwrap();
    assert_eq!(wallet.emit_accounts_cleared(), 1);
    settle().await;

    let state = manager.state();
    assert!(!state.is_connected);
    assert_eq!(state.address, None);
    assert_eq!(manager.session(), None);
    assert_eq!(transitions.lock().unwrap().as_slice(), &[WalletTransition::Disconnected]);
    assert_eq!(wallet.disconnect_calls(), 1);

    // Further events reach nobody.
    assert_eq!(wallet.emit_chain_changed(137), 0);
}

/// Test: accountsChanged with the current address is a no-op
#[tokio::test(start_paused = true)]
async fn same_account_event_keeps_generation() {
    let wallet = Arc::new(SimulatedWallet::new(ProviderKind::Injected).with_account(ALICE));
    let manager = manager_with(&[wallet.clone()]);
    manager.connect(ProviderKind::Injected).await.unwrap();
    let queries = wallet.balance_queries().len();

    wallet.emit_accounts_changed(&[ALICE.to_lowercase()]);
    settle().await;

    assert_eq!(wallet.balance_queries().len(), queries);
    assert_eq!(manager.state().address.as_deref(), Some(ALICE));
}

/// Test: disconnect twice, and disconnect without a session
#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent() {
    let wallet = Arc::new(SimulatedWallet::new(ProviderKind::Injected).with_account(ALICE));
    let manager = manager_with(&[wallet.clone()]);

    manager.disconnect().await;
    assert_eq!(wallet.disconnect_calls(), 0);

    manager.connect(ProviderKind::Injected).await.unwrap();
    manager.disconnect().await;
    let after_first = manager.state();
    manager.disconnect().await;

    assert_eq!(manager.state(), after_first);
    assert!(!after_first.is_connected);
    assert_eq!(wallet.disconnect_calls(), 1);
}

/// Test: disconnect during connect discards and releases the late session
#[tokio::test(start_paused = true)]
async fn disconnect_cancels_in_flight_connect() {
    let wallet = Arc::new(
        SimulatedWallet::new(ProviderKind::Injected)
            .with_account(ALICE)
            .with_connect_delay(Duration::from_millis(100)),
    );
    let manager = manager_with(&[wallet.clone()]);

    let pending = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(ProviderKind::Injected).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(manager.state().is_connecting);

    manager.disconnect().await;
    assert!(!manager.state().is_connecting);

    assert_eq!(pending.await.unwrap().unwrap_err(), SessionError::ConnectCancelled);
    assert!(!manager.state().is_connected);
    assert_eq!(wallet.disconnect_calls(), 1);
}

/// Test: chainChanged(5) lands while switch_network(137) is still pending
#[tokio::test(start_paused = true)]
async fn chain_event_during_switch_wins() {
    let wallet = Arc::new(
        SimulatedWallet::new(ProviderKind::Injected)
            .with_account(ALICE)
            .with_balance(ALICE, 5, "5.0")
            .with_balance(ALICE, POLYGON, "137.0")
            .with_switch_delay(Duration::from_millis(50)),
    );
    let manager = manager_with(&[wallet.clone()]);
    manager.connect(ProviderKind::Injected).await.unwrap();

    let switching = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.switch_network(POLYGON).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    wallet.emit_chain_changed(5);

    switching.await.unwrap().unwrap();
    settle().await;

    let state = manager.state();
    assert_eq!(state.chain_id, Some(5));
    assert_eq!(state.balance.as_deref(), Some("5.0"));
    assert!(!state.is_loading);
}

/// Test: switch_network refreshes the balance on the new chain; failures leave state as is
#[tokio::test(start_paused = true)]
async fn switch_network_refreshes_or_leaves_state() {
    let wallet = Arc::new(
        SimulatedWallet::new(ProviderKind::Injected)
            .with_account(ALICE)
            .with_balance(ALICE, 1, "1.0")
            .with_balance(ALICE, POLYGON, "42.0")
            .with_name(ALICE, "alice.eth"),
    );
    let manager = manager_with(&[wallet.clone()]);
    let session = manager.connect(ProviderKind::Injected).await.unwrap();
    assert_eq!(session.display_name.as_deref(), Some("alice.eth"));

    manager.switch_network(POLYGON).await.unwrap();
    settle().await;
    let state = manager.state();
    assert_eq!(state.chain_id, Some(POLYGON));
    assert_eq!(state.balance.as_deref(), Some("42.0"));
    assert_eq!(state.display_name, None);

    let err = manager.switch_network(424242).await.unwrap_err();
    assert_eq!(err, SessionError::UnsupportedNetwork(424242));
    assert_eq!(manager.state().chain_id, Some(POLYGON));
}

// -----------------------------------------------------------------------------
// EIP-1193 end to end
// -----------------------------------------------------------------------------

/// Minimal injected provider: one account on mainnet, records every request.
struct InjectedProvider {
    requests: Mutex<Vec<(String, Value)>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RawProviderEvent>>>,
    /// How long the user takes to approve `eth_requestAccounts`.
    approval_delay: Duration,
    closes: AtomicUsize,
}

impl InjectedProvider {
    fn new() -> (Arc<Self>, mpsc::UnboundedSender<RawProviderEvent>) {
        Self::with_approval_delay(Duration::ZERO)
    }

    fn with_approval_delay(approval_delay: Duration) -> (Arc<Self>, mpsc::UnboundedSender<RawProviderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            events: Mutex::new(Some(rx)),
            approval_delay,
            closes: AtomicUsize::new(0),
        });
        (provider, tx)
    }

    fn balance_requests(&self) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(method, _)| method == "eth_getBalance")
            .map(|(_, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl Eip1193Transport for InjectedProvider {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.requests.lock().unwrap().push((method.to_string(), params));
        if method == "eth_requestAccounts" && !self.approval_delay.is_zero() {
            tokio::time::sleep(self.approval_delay).await;
        }
        match method {
            "eth_requestAccounts" => Ok(json!(["0xabcdef0000000000000000000000000000001234"])),
            "eth_chainId" => Ok(json!("0x1")),
            "eth_getBalance" => Ok(json!("0xde0b6b3a7640000")),
            _ => Err(RpcError::new(-32601, format!("{method} not supported"))),
        }
    }

    fn events(&self) -> mpsc::UnboundedReceiver<RawProviderEvent> {
        self.events.lock().unwrap().take().unwrap_or_else(|| mpsc::unbounded_channel().1)
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn injected_manager(transport: &Arc<InjectedProvider>) -> WalletManager {
    let adapter = Eip1193Adapter::new(ProviderKind::Injected, transport.clone(), Vec::new());
    WalletManager::new([Arc::new(adapter) as Arc<dyn WalletProvider>], Duration::from_secs(5))
}

async fn wait_for_chain(manager: &WalletManager, chain_id: u64) {
    let mut changes = manager.watch();
    tokio::time::timeout(Duration::from_secs(2), changes.wait_for(|s| s.chain_id == Some(chain_id) && !s.is_loading))
        .await
        .expect("chain change applied")
        .unwrap();
}

/// Test: connect 0xABCD…1234 on chain 1, push chainChanged("0x89")
#[tokio::test]
async fn hex_chain_change_requeries_balance_on_new_chain() {
    let (transport, events) = InjectedProvider::new();
    let manager = injected_manager(&transport);

    let session = manager.connect(ProviderKind::Injected).await.unwrap();
    assert!(same_address(&session.address, "0xabcdef0000000000000000000000000000001234"));
    assert_eq!(session.chain_id, 1);
    assert_eq!(session.balance, "1.0");
    assert_eq!(transport.balance_requests().len(), 1);

    events.send(RawProviderEvent::new("chainChanged", json!("0x89"))).unwrap();
    wait_for_chain(&manager, 137).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(manager.state().chain_id, Some(137));
    let balance_requests = transport.balance_requests();
    assert_eq!(balance_requests.len(), 2);
    assert!(same_address(balance_requests[1][0].as_str().unwrap(), &session.address));
}

/// Test: connect, disconnect, reconnect while the first approval is pending
#[tokio::test(start_paused = true)]
async fn late_cancelled_connect_leaves_reconnect_intact() {
    let (transport, events) = InjectedProvider::with_approval_delay(Duration::from_millis(100));
    let manager = injected_manager(&transport);

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(ProviderKind::Injected).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.disconnect().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(ProviderKind::Injected).await })
    };

    assert_eq!(first.await.unwrap().unwrap_err(), SessionError::ConnectCancelled);
    let session = second.await.unwrap().unwrap();
    assert_eq!(session.chain_id, 1);
    assert_eq!(transport.closes.load(Ordering::SeqCst), 0);

    // The reconnected session still hears the provider.
    events.send(RawProviderEvent::new("chainChanged", json!("0x89"))).unwrap();
    wait_for_chain(&manager, 137).await;
    assert!(manager.state().is_connected);
}

/// Test: an accountsChanged with an unparseable address changes nothing
#[tokio::test(start_paused = true)]
async fn malformed_accounts_event_keeps_session() {
    let (transport, events) = InjectedProvider::new();
    let manager = injected_manager(&transport);
    let session = manager.connect(ProviderKind::Injected).await.unwrap();

    events.send(RawProviderEvent::new("accountsChanged", json!(["not-an-address"]))).unwrap();
    events.send(RawProviderEvent::new("chainChanged", json!("0x89"))).unwrap();
    wait_for_chain(&manager, 137).await;

    let state = manager.state();
    assert!(state.is_connected);
    assert_eq!(state.address.as_deref(), Some(session.address.as_str()));
    assert_eq!(transport.closes.load(Ordering::SeqCst), 0);
}

/// Test: a chainChanged emitted while connecting is applied once connected
#[tokio::test(start_paused = true)]
async fn chain_change_during_connect_is_applied() {
    let (transport, events) = InjectedProvider::with_approval_delay(Duration::from_millis(50));
    let manager = injected_manager(&transport);

    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(ProviderKind::Injected).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    events.send(RawProviderEvent::new("chainChanged", json!("0x89"))).unwrap();

    let session = connecting.await.unwrap().unwrap();
    assert_eq!(session.chain_id, 1);
    wait_for_chain(&manager, 137).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.balance_requests().len(), 2);
}
