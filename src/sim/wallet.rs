//! In-memory wallet provider

use alloy_primitives::keccak256;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::chain::{checksum_address, default_networks, ChainId, ETHEREUM};
use crate::error::{SessionError, SessionResult};
use crate::provider::{EventHub, ProviderEvent, ProviderKind, TransactionRequest, WalletProvider};
use crate::wallet::WalletSession;

struct State {
    accounts: Vec<String>,
    chain_id: ChainId,
    known_chains: HashSet<ChainId>,
    balances: HashMap<(String, ChainId), String>,
    default_balance: String,
    names: HashMap<String, String>,
    connect_delay: Duration,
    switch_delay: Duration,
    balance_delays: HashMap<ChainId, Duration>,
    next_connect_error: Option<SessionError>,
    balance_failure: bool,
    reject_signing: bool,
    transactions: Vec<TransactionRequest>,
    balance_queries: Vec<(String, ChainId)>,
}

/// Scriptable [`WalletProvider`]. Names resolve on chain 1 only, like ENS.
pub struct SimulatedWallet {
    kind: ProviderKind,
    state: Mutex<State>,
    hub: EventHub,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl SimulatedWallet {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            state: Mutex::new(State {
                accounts: Vec::new(),
                chain_id: ETHEREUM,
                known_chains: default_networks().iter().map(|n| n.chain_id).collect(),
                balances: HashMap::new(),
                default_balance: "0.0".into(),
                names: HashMap::new(),
                connect_delay: Duration::ZERO,
                switch_delay: Duration::ZERO,
                balance_delays: HashMap::new(),
                next_connect_error: None,
                balance_failure: false,
                reject_signing: false,
                transactions: Vec::new(),
                balance_queries: Vec::new(),
            }),
            hub: EventHub::new(),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn with_account(self, address: &str) -> Self { self.lock().accounts.push(address.to_string()); self }
    pub fn with_chain(self, chain_id: ChainId) -> Self { self.lock().chain_id = chain_id; self }
    pub fn with_known_chain(self, chain_id: ChainId) -> Self { self.lock().known_chains.insert(chain_id); self }
    pub fn with_connect_delay(self, delay: Duration) -> Self { self.lock().connect_delay = delay; self }
    /// `switch_network` emits `chainChanged` right away but returns after `delay`.
    pub fn with_switch_delay(self, delay: Duration) -> Self { self.lock().switch_delay = delay; self }
    pub fn with_balance_delay(self, chain_id: ChainId, delay: Duration) -> Self { self.lock().balance_delays.insert(chain_id, delay); self }
    pub fn with_name(self, address: &str, name: &str) -> Self { self.lock().names.insert(address.to_lowercase(), name.to_string()); self }

    pub fn with_balance(self, address: &str, chain_id: ChainId, balance: &str) -> Self {
        self.lock().balances.insert((address.to_lowercase(), chain_id), balance.to_string());
        self
    }

    /// The next `connect` fails with `error`.
    pub fn fail_next_connect(&self, error: SessionError) {
        self.lock().next_connect_error = Some(error);
    }

    pub fn set_balance_failure(&self, failing: bool) {
        self.lock().balance_failure = failing;
    }

    pub fn set_reject_signing(&self, rejecting: bool) {
        self.lock().reject_signing = rejecting;
    }

    /// Push `accountsChanged` to subscribers. Returns the delivery count.
    pub fn emit_accounts_changed<S: AsRef<str>>(&self, accounts: &[S]) -> usize {
        let accounts: Vec<String> = accounts.iter().map(|a| a.as_ref().to_string()).collect();
        self.lock().accounts = accounts.clone();
        self.hub.emit(ProviderEvent::AccountsChanged(accounts))
    }

    /// The user disconnected every account in the wallet UI.
    pub fn emit_accounts_cleared(&self) -> usize {
        self.emit_accounts_changed::<&str>(&[])
    }

    pub fn emit_chain_changed(&self, chain_id: ChainId) -> usize {
        self.lock().chain_id = chain_id;
        self.hub.emit(ProviderEvent::ChainChanged(chain_id))
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Every `(address, chain)` a balance was requested for, in order.
    pub fn balance_queries(&self) -> Vec<(String, ChainId)> {
        self.lock().balance_queries.clone()
    }

    pub fn transactions(&self) -> Vec<TransactionRequest> {
        self.lock().transactions.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl WalletProvider for SimulatedWallet {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn connect(&self) -> SessionResult<WalletSession> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (address, chain_id) = {
            let mut state = self.lock();
            if let Some(error) = state.next_connect_error.take() {
                return Err(error);
            }
            let Some(first) = state.accounts.first() else {
                return Err(SessionError::rejected("no accounts authorized"));
            };
            (checksum_address(first)?, state.chain_id)
        };
        let balance = self.get_balance(&address, chain_id).await?;
        let display_name = self.resolve_name(&address, chain_id).await?;
        Ok(WalletSession { address, chain_id, balance, display_name, provider_kind: self.kind })
    }

    async fn disconnect(&self) -> SessionResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_balance(&self, address: &str, chain_id: ChainId) -> SessionResult<String> {
        let delay = {
            let mut state = self.lock();
            state.balance_queries.push((address.to_string(), chain_id));
            state.balance_delays.get(&chain_id).copied().unwrap_or_default()
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = self.lock();
        if state.balance_failure {
            return Err(SessionError::query("balance endpoint unavailable"));
        }
        Ok(state
            .balances
            .get(&(address.to_lowercase(), chain_id))
            .cloned()
            .unwrap_or_else(|| state.default_balance.clone()))
    }

    async fn switch_network(&self, chain_id: ChainId) -> SessionResult<()> {
        let delay = {
            let mut state = self.lock();
            if !state.known_chains.contains(&chain_id) {
                return Err(SessionError::UnsupportedNetwork(chain_id));
            }
            if state.chain_id == chain_id {
                return Ok(());
            }
            state.chain_id = chain_id;
            state.switch_delay
        };
        self.hub.emit(ProviderEvent::ChainChanged(chain_id));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn sign_message(&self, address: &str, text: &str) -> SessionResult<String> {
        if self.lock().reject_signing {
            return Err(SessionError::SigningRejected("user denied message signature".into()));
        }
        let digest = keccak256(format!("{}:{text}", address.to_lowercase()));
        Ok(format!("0x{}", hex::encode(digest)))
    }

    async fn send_transaction(&self, tx: &TransactionRequest) -> SessionResult<String> {
        checksum_address(&tx.to).map_err(|e| SessionError::TransactionFailed(e.to_string()))?;
        let mut state = self.lock();
        state.transactions.push(tx.clone());
        let nonce = state.transactions.len();
        Ok(format!("0x{}", hex::encode(keccak256(format!("tx:{nonce}:{}", tx.to)))))
    }

    async fn resolve_name(&self, address: &str, chain_id: ChainId) -> SessionResult<Option<String>> {
        if chain_id != ETHEREUM {
            return Ok(None);
        }
        Ok(self.lock().names.get(&address.to_lowercase()).cloned())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProviderEvent> {
        self.hub.subscribe()
    }
}
