//! EIP-1193 adapter
//!
//! Maps the JSON-RPC surface every injected or relay-paired Ethereum wallet
//! exposes (`request(method, params)` + `accountsChanged`/`chainChanged`
//! events) onto the [`WalletProvider`] contract.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ens::{self, ENS_REGISTRY};
use super::{EventHub, ProviderEvent, ProviderKind, TransactionRequest, WalletProvider};
use crate::chain::{chain_id_to_hex, checksum_address, parse_chain_id, wei_hex_to_ether, ChainId, NetworkConfig, ETHEREUM};
use crate::error::{SessionError, SessionResult};
use crate::wallet::WalletSession;

/// EIP-1193 provider error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub const USER_REJECTED: i64 = 4001;
    pub const UNAUTHORIZED: i64 = 4100;
    pub const DISCONNECTED: i64 = 4900;
    pub const UNRECOGNIZED_CHAIN: i64 = 4902;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn user_rejected() -> Self { Self::new(Self::USER_REJECTED, "User rejected the request.") }

    pub fn is_user_rejection(&self) -> bool { self.code == Self::USER_REJECTED }
}

/// Event as the provider emits it, before parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProviderEvent {
    pub name: String,
    pub payload: Value,
}

impl RawProviderEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self { name: name.into(), payload }
    }
}

/// The SDK-facing side: one JSON-RPC request channel plus its event stream.
#[async_trait]
pub trait Eip1193Transport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    /// Raw provider events. Called whenever the adapter's pump (re)starts.
    fn events(&self) -> mpsc::UnboundedReceiver<RawProviderEvent>;

    /// Release the socket / pairing.
    async fn close(&self) -> Result<(), RpcError> {
        Ok(())
    }
}

pub struct Eip1193Adapter {
    kind: ProviderKind,
    transport: Arc<dyn Eip1193Transport>,
    networks: Vec<NetworkConfig>,
    hub: Arc<EventHub>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Eip1193Adapter {
    pub fn new(kind: ProviderKind, transport: Arc<dyn Eip1193Transport>, networks: Vec<NetworkConfig>) -> Self {
        Self { kind, transport, networks, hub: Arc::new(EventHub::new()), pump: Mutex::new(None) }
    }

    fn known_network(&self, chain_id: ChainId) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.chain_id == chain_id)
    }

    fn start_pump(&self) {
        let mut pump = self.pump.lock().unwrap_or_else(|p| p.into_inner());
        if pump.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let mut events = self.transport.events();
        let hub = self.hub.clone();
        let kind = self.kind;
        *pump = Some(tokio::spawn(async move {
            while let Some(raw) = events.recv().await {
                match translate_event(&raw) {
                    Some(event) => {
                        tracing::debug!(provider = %kind, ?event, "provider event");
                        hub.emit(event);
                    }
                    None => tracing::debug!(provider = %kind, name = %raw.name, "ignored provider event"),
                }
            }
        }));
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }

    async fn request_accounts(&self) -> SessionResult<Vec<String>> {
        let value = self.transport.request("eth_requestAccounts", json!([])).await.map_err(|e| {
            if e.is_user_rejection() {
                SessionError::rejected(e.message)
            } else {
                SessionError::unavailable(e.to_string())
            }
        })?;
        let accounts: Vec<String> = serde_json::from_value(value)
            .map_err(|e| SessionError::unavailable(format!("malformed accounts: {e}")))?;
        Ok(accounts)
    }

    async fn chain_id(&self) -> SessionResult<ChainId> {
        let value = self
            .transport
            .request("eth_chainId", json!([]))
            .await
            .map_err(|e| SessionError::unavailable(e.to_string()))?;
        parse_chain_value(&value)
    }

    async fn eth_call(&self, to: &str, data: &str) -> SessionResult<String> {
        let value = self
            .transport
            .request("eth_call", json!([{"to": to, "data": data}, "latest"]))
            .await
            .map_err(|e| SessionError::query(e.to_string()))?;
        value.as_str().map(String::from).ok_or_else(|| SessionError::query("eth_call returned non-string"))
    }

    async fn switch_chain(&self, chain_id: ChainId) -> Result<(), RpcError> {
        self.transport
            .request("wallet_switchEthereumChain", json!([{"chainId": chain_id_to_hex(chain_id)}]))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl WalletProvider for Eip1193Adapter {
    fn kind(&self) -> ProviderKind { self.kind }

    /// The event pump starts before `eth_requestAccounts`, so a
    /// `chainChanged` racing the handshake reaches subscribers after the
    /// session is returned. It outlives a failed connect; `disconnect` stops it.
    async fn connect(&self) -> SessionResult<WalletSession> {
        self.start_pump();
        let accounts = self.request_accounts().await?;
        let first = accounts.first().ok_or_else(|| SessionError::rejected("no accounts found"))?;
        let address = checksum_address(first)?;
        let chain_id = self.chain_id().await?;
        let balance = self
            .get_balance(&address, chain_id)
            .await
            .map_err(|e| SessionError::unavailable(format!("initial balance: {e}")))?;
        let display_name = match self.resolve_name(&address, chain_id).await {
            Ok(name) => name,
            Err(e) => {
                tracing::debug!(provider = %self.kind, error = %e, "name lookup failed");
                None
            }
        };
        tracing::info!(provider = %self.kind, %address, chain_id, "provider connected");
        Ok(WalletSession { address, chain_id, balance, display_name, provider_kind: self.kind })
    }

    async fn disconnect(&self) -> SessionResult<()> {
        self.stop_pump();
        self.hub.close();
        self.transport
            .close()
            .await
            .map_err(|e| SessionError::unavailable(format!("close: {e}")))
    }

    async fn get_balance(&self, address: &str, _chain_id: ChainId) -> SessionResult<String> {
        let value = self
            .transport
            .request("eth_getBalance", json!([address, "latest"]))
            .await
            .map_err(|e| SessionError::query(e.to_string()))?;
        let raw = value.as_str().ok_or_else(|| SessionError::query("balance is not a hex quantity"))?;
        wei_hex_to_ether(raw)
    }

    async fn switch_network(&self, chain_id: ChainId) -> SessionResult<()> {
        let err = match self.switch_chain(chain_id).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if err.is_user_rejection() {
            return Err(SessionError::rejected(format!("network switch: {}", err.message)));
        }
        if err.code != RpcError::UNRECOGNIZED_CHAIN {
            return Err(SessionError::unavailable(err.to_string()));
        }
        let network = self.known_network(chain_id).ok_or(SessionError::UnsupportedNetwork(chain_id))?;
        tracing::info!(provider = %self.kind, chain_id, name = %network.name, "registering network with provider");
        self.transport
            .request("wallet_addEthereumChain", json!([network.add_chain_params()]))
            .await
            .map_err(|e| {
                tracing::warn!(chain_id, error = %e, "wallet_addEthereumChain failed");
                SessionError::UnsupportedNetwork(chain_id)
            })?;
        self.switch_chain(chain_id).await.map_err(|e| {
            tracing::warn!(chain_id, error = %e, "switch after registration failed");
            SessionError::UnsupportedNetwork(chain_id)
        })
    }

    async fn sign_message(&self, address: &str, text: &str) -> SessionResult<String> {
        let payload = format!("0x{}", hex::encode(text.as_bytes()));
        let value = self
            .transport
            .request("personal_sign", json!([payload, address]))
            .await
            .map_err(|e| SessionError::SigningRejected(e.message))?;
        value.as_str().map(String::from).ok_or_else(|| SessionError::SigningRejected("malformed signature".into()))
    }

    async fn send_transaction(&self, tx: &TransactionRequest) -> SessionResult<String> {
        let params = serde_json::to_value(tx).map_err(|e| SessionError::TransactionFailed(e.to_string()))?;
        let value = self
            .transport
            .request("eth_sendTransaction", json!([params]))
            .await
            .map_err(|e| SessionError::TransactionFailed(e.message))?;
        value.as_str().map(String::from).ok_or_else(|| SessionError::TransactionFailed("malformed hash".into()))
    }

    async fn resolve_name(&self, address: &str, chain_id: ChainId) -> SessionResult<Option<String>> {
        if chain_id != ETHEREUM {
            return Ok(None);
        }
        let parsed = alloy_primitives::Address::from_str(address)
            .map_err(|_| SessionError::InvalidAddress(address.to_string()))?;
        let node = ens::namehash(&ens::reverse_node_name(&parsed));
        let resolver_word = self.eth_call(ENS_REGISTRY, &ens::resolver_calldata(&node)).await?;
        let Some(resolver) = ens::decode_abi_address(&resolver_word) else {
            return Ok(None);
        };
        let name_word = self.eth_call(&resolver.to_checksum(None), &ens::name_calldata(&node)).await?;
        Ok(ens::decode_abi_string(&name_word))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProviderEvent> {
        self.hub.subscribe()
    }
}

fn parse_chain_value(value: &Value) -> SessionResult<ChainId> {
    match value {
        Value::String(s) => parse_chain_id(s),
        Value::Number(n) => n.as_u64().filter(|id| *id > 0).ok_or_else(|| SessionError::query(format!("invalid chain id {n}"))),
        other => Err(SessionError::query(format!("invalid chain id {other}"))),
    }
}

fn translate_event(raw: &RawProviderEvent) -> Option<ProviderEvent> {
    match raw.name.as_str() {
        // Only a literally empty list means "no accounts". A malformed
        // primary account drops the whole event; later ones are skipped.
        "accountsChanged" => {
            let accounts = raw.payload.as_array()?;
            let mut addresses = Vec::with_capacity(accounts.len());
            for (index, account) in accounts.iter().enumerate() {
                match account.as_str().map(checksum_address) {
                    Some(Ok(address)) => addresses.push(address),
                    _ if index == 0 => {
                        tracing::warn!(%account, "ignoring accountsChanged with malformed primary account");
                        return None;
                    }
                    _ => tracing::warn!(%account, "dropping malformed account from accountsChanged"),
                }
            }
            Some(ProviderEvent::AccountsChanged(addresses))
        }
        "chainChanged" => parse_chain_value(&raw.payload).ok().map(ProviderEvent::ChainChanged),
        _ => None,
    }
}
