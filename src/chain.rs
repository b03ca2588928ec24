//! Chain ids, addresses and the registry of networks the app knows how to
//! register with a provider.

use alloy_primitives::{utils::format_ether, Address, U256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{SessionError, SessionResult};

pub type ChainId = u64;

pub const ETHEREUM: ChainId = 1;
pub const POLYGON: ChainId = 137;
pub const MUMBAI: ChainId = 80_001;
pub const SEPOLIA: ChainId = 11_155_111;

/// Parse a chain id as providers report it: `"0x89"`, `"137"` or
/// `"eip155:137"`.
pub fn parse_chain_id(raw: &str) -> SessionResult<ChainId> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("eip155:").unwrap_or(trimmed);
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    match parsed {
        Ok(0) | Err(_) => Err(SessionError::query(format!("invalid chain id '{raw}'"))),
        Ok(id) => Ok(id),
    }
}

pub fn chain_id_to_hex(chain_id: ChainId) -> String {
    format!("0x{chain_id:x}")
}

/// EIP-55 checksum an account address. Input case is not validated.
pub fn checksum_address(raw: &str) -> SessionResult<String> {
    let address = Address::from_str(raw.trim())
        .map_err(|_| SessionError::InvalidAddress(raw.to_string()))?;
    Ok(address.to_checksum(None))
}

/// Case-insensitive address equality; unparseable input never matches.
pub fn same_address(a: &str, b: &str) -> bool {
    match (Address::from_str(a.trim()), Address::from_str(b.trim())) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Wei quantity (hex, as returned by `eth_getBalance`) to a decimal ether string.
pub fn wei_hex_to_ether(raw: &str) -> SessionResult<String> {
    let digits = raw.trim().trim_start_matches("0x");
    let digits = if digits.is_empty() { "0" } else { digits };
    let wei = U256::from_str_radix(digits, 16)
        .map_err(|e| SessionError::query(format!("invalid balance '{raw}': {e}")))?;
    let formatted = format_ether(wei);
    Ok(trim_decimal(&formatted))
}

fn trim_decimal(value: &str) -> String {
    if !value.contains('.') {
        return format!("{value}.0");
    }
    let trimmed = value.trim_end_matches('0');
    if trimmed.ends_with('.') { format!("{trimmed}0") } else { trimmed.to_string() }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// A network the app can ask a provider to switch to (and register first
/// when the provider does not know it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: ChainId,
    pub name: String,
    pub currency: NativeCurrency,
    pub rpc_urls: Vec<String>,
    pub explorer_urls: Vec<String>,
}

impl NetworkConfig {
    pub fn new(chain_id: ChainId, name: impl Into<String>, symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        Self {
            chain_id,
            name: name.into(),
            currency: NativeCurrency { name: symbol.clone(), symbol, decimals: 18 },
            rpc_urls: Vec::new(),
            explorer_urls: Vec::new(),
        }
    }

    pub fn with_currency_name(mut self, name: impl Into<String>) -> Self { self.currency.name = name.into(); self }
    pub fn with_rpc(mut self, url: impl Into<String>) -> Self { self.rpc_urls.push(url.into()); self }
    pub fn with_explorer(mut self, url: impl Into<String>) -> Self { self.explorer_urls.push(url.into()); self }

    /// `wallet_addEthereumChain` parameter object.
    pub fn add_chain_params(&self) -> serde_json::Value {
        serde_json::json!({
            "chainId": chain_id_to_hex(self.chain_id),
            "chainName": self.name,
            "nativeCurrency": {
                "name": self.currency.name,
                "symbol": self.currency.symbol,
                "decimals": self.currency.decimals,
            },
            "rpcUrls": self.rpc_urls,
            "blockExplorerUrls": self.explorer_urls,
        })
    }
}

/// Ethereum, Polygon and their test networks.
pub fn default_networks() -> Vec<NetworkConfig> {
    vec![
        NetworkConfig::new(ETHEREUM, "Ethereum Mainnet", "ETH")
            .with_currency_name("Ether")
            .with_rpc("https://eth-mainnet.g.alchemy.com/v2/demo")
            .with_explorer("https://etherscan.io"),
        NetworkConfig::new(POLYGON, "Polygon", "MATIC")
            .with_rpc("https://polygon-rpc.com/")
            .with_explorer("https://polygonscan.com"),
        NetworkConfig::new(MUMBAI, "Mumbai Testnet", "MATIC")
            .with_rpc("https://rpc-mumbai.maticvigil.com/")
            .with_explorer("https://mumbai.polygonscan.com"),
        NetworkConfig::new(SEPOLIA, "Sepolia Testnet", "ETH")
            .with_currency_name("Ether")
            .with_rpc("https://rpc.sepolia.org/")
            .with_explorer("https://sepolia.etherscan.io"),
    ]
}
