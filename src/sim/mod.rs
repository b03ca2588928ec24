//! Sim - in-memory collaborators
//!
//! Deterministic stand-ins for a wallet provider and a messaging network,
//! used by the tests, the `demo` command and the HTTP server when no real
//! provider is attached. Nothing in the core depends on this module.
//!
//! | Type | Implements | Knobs |
//! |------|------------|-------|
//! | [`SimulatedWallet`] | `WalletProvider` | accounts, balances per chain, delays, failures, events |
//! | [`SimulatedNetwork`] | `MessagingTransport` | handshake delay/failure, reachability, history |

mod network;
mod wallet;

pub use network::SimulatedNetwork;
pub use wallet::SimulatedWallet;
