//! Broadcast core: wallet and messaging session lifecycle.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator (entry point for UI code)
//!   │
//!   ├── WalletManager
//!   │     └── WalletProvider (Eip1193Adapter over an injected / relay transport)
//!   │           └── accountsChanged / chainChanged ──▶ generation-checked refresh
//!   │
//!   ├── MessagingManager
//!   │     └── MessagingTransport ──▶ MessagingClient (conversations, streams)
//!   │
//!   └── wallet watcher ──▶ should_auto_connect_messaging() ──▶ messaging connect
//! ```
//!
//! # Actions
//!
//! | Action | Method | Error slot |
//! |--------|--------|------------|
//! | connect wallet | `connect_wallet(kind)` | orchestrator |
//! | disconnect | `disconnect_wallet()` | never fails |
//! | switch network | `switch_network(chain_id)` | orchestrator |
//! | sign | `sign_message(text)` | orchestrator |
//! | send message | `send_message(peer, body)` | orchestrator |
//! | subscribe | `subscribe_to_messages(peer, f)` | orchestrator |
//! | balance | `fetch_balance()` | wallet |
//!
//! # Features
//!
//! - `native` - HTTP server, CLI, log subscriber
//!
//! # Usage
//!
//! ```ignore
//! use broadcast_core::{CoreConfig, Orchestrator, ProviderKind};
//!
//! let core = Orchestrator::from_parts(CoreConfig::from_env(), [provider], transport);
//! core.start();
//!
//! let session = core.connect_wallet(Some(ProviderKind::Injected)).await?;
//! let snapshot = core.snapshot();
//! ```

// =============================================================================
// Shared modules
// =============================================================================
pub mod chain;
pub mod config;
pub mod error;
pub mod messaging;
pub mod orchestrator;
pub mod provider;
pub mod sim;
pub mod wallet;

// =============================================================================
// Native-only modules (server, CLI, log subscriber)
// =============================================================================
#[cfg(feature = "native")]
pub mod logging;
#[cfg(feature = "native")]
pub mod runtime;
#[cfg(feature = "native")]
pub mod server;

// =============================================================================
// Re-exports
// =============================================================================
pub use chain::{ChainId, NetworkConfig};
pub use config::{CoreConfig, MessagingEnv};
pub use error::{SessionError, SessionResult};
pub use messaging::{
    Conversation, ConversationUpdate, Message, MessagingClient, MessagingManager, MessagingState, MessagingTransport,
    Signer, Subscription,
};
pub use orchestrator::{should_auto_connect_messaging, Orchestrator, Snapshot};
pub use provider::{Eip1193Adapter, Eip1193Transport, ProviderEvent, ProviderKind, TransactionRequest, WalletProvider};
pub use wallet::{WalletManager, WalletSession, WalletState, WalletTransition};

#[cfg(feature = "native")]
pub use runtime::{install_signal_handlers, Shutdown};
#[cfg(feature = "native")]
pub use server::{create_router, create_router_with_name};
