//! Signer bound to one wallet address

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::SessionResult;
use crate::messaging::Signer;
use crate::provider::WalletProvider;

/// Signs through the provider that owns the session. The address is fixed at
/// creation; after an account change a new signer must be taken.
pub struct WalletSigner {
    provider: Arc<dyn WalletProvider>,
    address: String,
}

impl WalletSigner {
    pub fn new(provider: Arc<dyn WalletProvider>, address: impl Into<String>) -> Self {
        Self { provider, address: address.into() }
    }
}

#[async_trait]
impl Signer for WalletSigner {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign_message(&self, text: &str) -> SessionResult<String> {
        self.provider.sign_message(&self.address, text).await
    }
}

impl std::fmt::Debug for WalletSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletSigner")
            .field("address", &self.address)
            .field("provider", &self.provider.kind())
            .finish()
    }
}
