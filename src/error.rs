//! Error taxonomy shared by the provider adapters, both session managers and
//! the orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified failure of a wallet or messaging operation.
///
/// Clone + Serialize because a single connect outcome is handed to every
/// caller waiting on it, and because the read-model carries the last error.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum SessionError {
    /// The user or the provider declined the connection request.
    #[error("connection rejected: {0}")]
    ConnectionRejected(String),

    /// The provider could not be reached (not installed, socket down, timeout).
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A read query (balance, chain id, name) failed.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The target chain is not registered with the provider and no known
    /// configuration exists to register it.
    #[error("unsupported network: chain {0}")]
    UnsupportedNetwork(u64),

    #[error("signing rejected: {0}")]
    SigningRejected(String),

    /// No signer bound to the current wallet address.
    #[error("no signer available for the messaging handshake")]
    SignerUnavailable,

    #[error("messaging handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("message delivery failed: {0}")]
    DeliveryFailed(String),

    /// A connect is already in flight (for another provider kind, or a
    /// messaging handshake).
    #[error("a connect via {in_flight} is already in progress")]
    AlreadyConnecting { in_flight: String },

    /// The operation needs an active session.
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    /// The attempt was superseded by an explicit disconnect.
    #[error("connect attempt cancelled by disconnect")]
    ConnectCancelled,

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl SessionError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::ConnectionRejected(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ProviderUnavailable(message.into())
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::QueryFailed(message.into())
    }

    pub fn not_connected(what: impl Into<String>) -> Self {
        Self::NotConnected(what.into())
    }

    /// Stable identifier for UI mapping tables.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionRejected(_) => "connection_rejected",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::QueryFailed(_) => "query_failed",
            Self::UnsupportedNetwork(_) => "unsupported_network",
            Self::SigningRejected(_) => "signing_rejected",
            Self::SignerUnavailable => "signer_unavailable",
            Self::HandshakeFailed(_) => "handshake_failed",
            Self::DeliveryFailed(_) => "delivery_failed",
            Self::AlreadyConnecting { .. } => "already_connecting",
            Self::NotConnected(_) => "not_connected",
            Self::TransactionFailed(_) => "transaction_failed",
            Self::ConnectCancelled => "connect_cancelled",
            Self::InvalidAddress(_) => "invalid_address",
        }
    }

    /// True for failures caused by a user decision rather than the network.
    pub fn is_user_rejection(&self) -> bool {
        matches!(self, Self::ConnectionRejected(_) | Self::SigningRejected(_))
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
