//! Messaging - wallet-derived messaging sessions
//!
//! A messaging client is created from a wallet [`Signer`] and lives only as
//! long as the wallet session for the same address.
//!
//! # Architecture
//!
//! ```text
//! MessagingManager
//!     │
//!     ├── connect(signer) ──▶ MessagingTransport::create_client ──▶ MessagingClient
//!     │                                                              │
//!     ├── conversations ◀── list_conversations / stream_conversations ┤
//!     │                                                              │
//!     └── subscribe(peer) ──▶ Subscription ◀── stream_messages ───────┘
//! ```
//!
//! # Collaborator contract
//!
//! | Call | Failure mapping |
//! |------|-----------------|
//! | `create_client` | `HandshakeFailed` |
//! | `list_conversations` | recoverable flag, empty list |
//! | `send` | `DeliveryFailed` |
//! | `messages` | `QueryFailed` |
//! | `can_message` | `false` |

mod manager;
mod subscription;

pub use manager::{MessagingManager, MessagingState};
pub use subscription::Subscription;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::MessagingEnv;
use crate::error::SessionResult;

/// Signs on behalf of one wallet address.
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> String;

    async fn sign_message(&self, text: &str) -> SessionResult<String>;
}

/// A conversation with one peer, as reported by the messaging layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub peer_identity: String,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    /// Provider supplied; only changed through [`ConversationUpdate`].
    pub unread_count: u32,
}

impl Conversation {
    pub fn new(id: impl Into<String>, peer_identity: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            peer_identity: peer_identity.into(),
            last_message: None,
            last_message_time: None,
            unread_count: 0,
        }
    }
    pub fn with_preview(mut self, text: impl Into<String>, at: DateTime<Utc>) -> Self { self.last_message = Some(text.into()); self.last_message_time = Some(at); self }
    pub fn with_unread(mut self, count: u32) -> Self { self.unread_count = count; self }
}

/// Partial update applied by `update_conversation`. `None` fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdate {
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: Option<u32>,
}

impl ConversationUpdate {
    pub(crate) fn apply(&self, conversation: &mut Conversation) {
        if let Some(text) = &self.last_message {
            conversation.last_message = Some(text.clone());
        }
        if let Some(at) = self.last_message_time {
            conversation.last_message_time = Some(at);
        }
        if let Some(count) = self.unread_count {
            conversation.unread_count = count;
        }
    }
}

/// A delivered message. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_identity: String,
    pub recipient_identity: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// A live client bound to one identity.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Address the client was created for.
    fn identity(&self) -> String;

    async fn list_conversations(&self) -> SessionResult<Vec<Conversation>>;

    async fn send(&self, peer: &str, body: &str) -> SessionResult<Message>;

    /// Most recent messages with `peer`, oldest first.
    async fn messages(&self, peer: &str, limit: Option<usize>) -> SessionResult<Vec<Message>>;

    /// Messages exchanged with `peer` from now on, in delivery order.
    async fn stream_messages(&self, peer: &str) -> SessionResult<mpsc::UnboundedReceiver<Message>>;

    /// Newly discovered conversations. Transports without discovery return a
    /// closed stream.
    async fn stream_conversations(&self) -> SessionResult<mpsc::UnboundedReceiver<Conversation>> {
        let (_tx, rx) = mpsc::unbounded_channel();
        Ok(rx)
    }

    async fn can_message(&self, identity: &str) -> SessionResult<bool>;

    /// Release network resources. Ends every stream handed out.
    async fn close(&self) -> SessionResult<()>;
}

/// Factory for clients (the handshake).
#[async_trait]
pub trait MessagingTransport: Send + Sync {
    /// Create a client for `signer` on the `env` network.
    async fn create_client(&self, signer: Arc<dyn Signer>, env: MessagingEnv) -> SessionResult<Arc<dyn MessagingClient>>;
}
