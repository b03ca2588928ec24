//! Provider - Network provider adapters
//!
//! One adapter wraps one external wallet provider (an injected browser/mobile
//! SDK or a relay-paired wallet) behind the [`WalletProvider`] contract.
//!
//! # Contract
//!
//! | Operation | Failure |
//! |-----------|---------|
//! | `connect` | `ConnectionRejected`, `ProviderUnavailable` |
//! | `disconnect` | idempotent |
//! | `get_balance` | `QueryFailed` (zero is not an error) |
//! | `switch_network` | `UnsupportedNetwork` |
//! | `sign_message` | `SigningRejected` |
//! | `send_transaction` | `TransactionFailed` |
//!
//! Change notifications (`accountsChanged`, `chainChanged`) arrive on the
//! receiver returned by [`WalletProvider::subscribe`], one item per provider
//! event, in emission order.

pub mod eip1193;
mod ens;

pub use eip1193::{Eip1193Adapter, Eip1193Transport, RawProviderEvent, RpcError};
pub use ens::{decode_abi_string, namehash, reverse_node_name};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::chain::ChainId;
use crate::error::SessionResult;
use crate::wallet::WalletSession;

/// Which adapter produced a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Injected provider (browser extension, MetaMask mobile SDK).
    Injected,
    /// Wallet paired over a relay (WalletConnect style).
    RelayPairing,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Injected => "injected",
            ProviderKind::RelayPairing => "relay-pairing",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "injected" | "metamask" => Some(ProviderKind::Injected),
            "relay-pairing" | "relay" | "walletconnect" => Some(ProviderKind::RelayPairing),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-pushed change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    AccountsChanged(Vec<String>),
    ChainChanged(ChainId),
}

/// `eth_sendTransaction` request. Quantities are 0x-prefixed hex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<String>,
}

impl TransactionRequest {
    pub fn to(to: impl Into<String>) -> Self {
        Self { to: to.into(), ..Default::default() }
    }
    pub fn with_value(mut self, wei_hex: impl Into<String>) -> Self { self.value = Some(wei_hex.into()); self }
    pub fn with_data(mut self, data: impl Into<String>) -> Self { self.data = Some(data.into()); self }
}

#[async_trait]
pub trait WalletProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn connect(&self) -> SessionResult<WalletSession>;

    async fn disconnect(&self) -> SessionResult<()>;

    /// Native balance of `address` as a decimal string. `chain_id` is the
    /// chain the caller believes is active.
    async fn get_balance(&self, address: &str, chain_id: ChainId) -> SessionResult<String>;

    async fn switch_network(&self, chain_id: ChainId) -> SessionResult<()>;

    async fn sign_message(&self, address: &str, text: &str) -> SessionResult<String>;

    /// Returns the transaction hash.
    async fn send_transaction(&self, tx: &TransactionRequest) -> SessionResult<String>;

    /// Best-effort reverse name lookup. `Ok(None)` when unsupported on the chain.
    async fn resolve_name(&self, _address: &str, _chain_id: ChainId) -> SessionResult<Option<String>> {
        Ok(None)
    }

    /// New receiver for change notifications. Dropping it unsubscribes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProviderEvent>;
}

/// Fan-out of provider events to live subscribers, for adapter implementations.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ProviderEvent>>>,
}

impl EventHub {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ProviderEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber; closed ones are pruned. Returns the
    /// number of deliveries.
    pub fn emit(&self, event: ProviderEvent) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// Drop every subscriber; their receivers observe a closed channel.
    pub fn close(&self) {
        self.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<ProviderEvent>>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }
}
