//! Orchestrator - one read-model and one action surface over both sessions
//!
//! Sequencing rules:
//!
//! - When the wallet becomes connected, or its address changes, messaging is
//!   connected automatically if [`should_auto_connect_messaging`] allows it.
//! - `disconnect_wallet` stops messaging before the wallet.
//! - A wallet teardown or address change invalidates messaging in the same
//!   transition (installed as a wallet transition hook).
//!
//! Errors from explicit actions are kept in the orchestrator's own slot until
//! cleared; errors from background work stay in the session that produced
//! them.

use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

use crate::chain::{ChainId, NetworkConfig};
use crate::config::CoreConfig;
use crate::error::{SessionError, SessionResult};
use crate::messaging::{Message, MessagingManager, MessagingState, MessagingTransport, Subscription};
use crate::provider::{ProviderKind, TransactionRequest, WalletProvider};
use crate::wallet::{WalletManager, WalletSession, WalletState, WalletTransition};

/// Auto-connect decision. Pure so it can be tested on its own.
pub fn should_auto_connect_messaging(wallet_connected: bool, messaging_connected: bool, messaging_connecting: bool) -> bool {
    wallet_connected && !messaging_connected && !messaging_connecting
}

/// Combined read-model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub wallet: WalletState,
    pub messaging: MessagingState,
    /// Wallet and messaging both connected.
    pub is_connected: bool,
    pub is_connecting: bool,
    /// Action error first, then wallet, then messaging.
    pub error: Option<SessionError>,
}

struct Inner {
    config: CoreConfig,
    wallet: WalletManager,
    messaging: MessagingManager,
    error: Mutex<Option<SessionError>>,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(reactor) = self.reactor.get_mut().unwrap_or_else(|p| p.into_inner()).take() {
            reactor.abort();
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Wire the two managers together. Call [`Orchestrator::start`] to enable
    /// event-driven auto-connect.
    pub fn new(config: CoreConfig, wallet: WalletManager, messaging: MessagingManager) -> Self {
        let hooked = messaging.clone();
        wallet.on_transition(move |transition| match transition {
            WalletTransition::Disconnected => hooked.invalidate(),
            WalletTransition::AccountChanged { previous, current } => {
                tracing::debug!(%previous, %current, "wallet identity changed, dropping messaging session");
                hooked.invalidate();
            }
        });
        Self {
            inner: Arc::new(Inner {
                config,
                wallet,
                messaging,
                error: Mutex::new(None),
                reactor: Mutex::new(None),
            }),
        }
    }

    /// Build both managers from `config` and the given collaborators.
    pub fn from_parts(
        config: CoreConfig,
        providers: impl IntoIterator<Item = Arc<dyn WalletProvider>>,
        transport: Arc<dyn MessagingTransport>,
    ) -> Self {
        let wallet = WalletManager::from_config(&config, providers);
        let messaging = MessagingManager::from_config(&config, transport);
        Self::new(config, wallet, messaging)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn wallet(&self) -> &WalletManager {
        &self.inner.wallet
    }

    pub fn messaging(&self) -> &MessagingManager {
        &self.inner.messaging
    }

    pub fn networks(&self) -> &[NetworkConfig] {
        &self.inner.config.networks
    }

    pub fn snapshot(&self) -> Snapshot {
        let wallet = self.inner.wallet.state();
        let messaging = self.inner.messaging.state();
        let error = self.action_error().or_else(|| wallet.error.clone()).or_else(|| messaging.error.clone());
        Snapshot {
            is_connected: wallet.is_connected && messaging.is_connected,
            is_connecting: wallet.is_connecting || messaging.is_connecting,
            error,
            wallet,
            messaging,
        }
    }

    /// Spawn the watcher that reconciles messaging on wallet transitions.
    /// Idempotent; a no-op when auto-connect is disabled.
    pub fn start(&self) {
        if !self.inner.config.auto_connect_messaging {
            return;
        }
        let mut reactor = self.inner.reactor.lock().unwrap_or_else(|p| p.into_inner());
        if reactor.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let changes = self.inner.wallet.watch();
        *reactor = Some(tokio::spawn(watch_wallet(weak, changes)));
    }

    /// Evaluate the auto-connect rule once. Returns whether a messaging
    /// connect was started.
    pub fn reconcile(&self) -> bool {
        let wallet = self.inner.wallet.state();
        let messaging = self.inner.messaging.state();
        if !should_auto_connect_messaging(wallet.is_connected, messaging.is_connected, messaging.is_connecting) {
            return false;
        }
        match self.inner.messaging.spawn_connect(self.inner.wallet.signer()) {
            Ok(handshake) => {
                tokio::spawn(async move {
                    if let Ok(Err(e)) = handshake.await {
                        tracing::warn!(error = %e, "messaging auto-connect failed");
                    }
                });
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "messaging auto-connect skipped");
                false
            }
        }
    }

    /// Connect a wallet (the configured default kind when `None`), then
    /// start messaging if auto-connect is on. Once [`Orchestrator::start`]
    /// has run, the watcher owns that step.
    pub async fn connect_wallet(&self, kind: Option<ProviderKind>) -> SessionResult<WalletSession> {
        let kind = kind.unwrap_or(self.inner.config.default_provider);
        self.clear_action_error();
        let session = self.record(self.inner.wallet.connect(kind).await)?;
        if self.inner.config.auto_connect_messaging && !self.is_watching() {
            self.reconcile();
        }
        Ok(session)
    }

    /// Messaging first, then the wallet. Never fails.
    pub async fn disconnect_wallet(&self) {
        self.inner.messaging.disconnect().await;
        self.inner.wallet.disconnect().await;
        self.clear_action_error();
    }

    /// Explicit messaging connect for the current wallet.
    pub async fn connect_messaging(&self) -> SessionResult<()> {
        if !self.inner.wallet.is_connected() {
            return self.record(Err(SessionError::not_connected("wallet")));
        }
        let signer = self.inner.wallet.signer();
        self.record(self.inner.messaging.connect(signer).await)
    }

    pub async fn disconnect_messaging(&self) {
        self.inner.messaging.disconnect().await;
    }

    pub async fn send_message(&self, peer: &str, body: &str) -> SessionResult<Message> {
        self.record(self.inner.messaging.send(peer, body).await)
    }

    pub async fn get_messages(&self, peer: &str, limit: Option<usize>) -> SessionResult<Vec<Message>> {
        self.inner.messaging.messages(peer, limit).await
    }

    pub async fn subscribe_to_messages<F>(&self, peer: &str, on_message: F) -> SessionResult<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.record(self.inner.messaging.subscribe(peer, on_message).await)
    }

    pub async fn can_message(&self, identity: &str) -> bool {
        self.inner.messaging.can_message(identity).await
    }

    pub async fn switch_network(&self, chain_id: ChainId) -> SessionResult<()> {
        self.record(self.inner.wallet.switch_network(chain_id).await)
    }

    pub async fn sign_message(&self, text: &str) -> SessionResult<String> {
        self.record(self.inner.wallet.sign_message(text).await)
    }

    pub async fn send_transaction(&self, tx: TransactionRequest) -> SessionResult<String> {
        self.record(self.inner.wallet.send_transaction(tx).await)
    }

    /// Refresh the wallet balance. Failures land in the wallet state only.
    pub async fn fetch_balance(&self) -> SessionResult<()> {
        self.inner.wallet.refresh_balance().await
    }

    pub fn wallet_kind(&self) -> Option<ProviderKind> {
        self.inner.wallet.provider_kind()
    }

    /// Clear every recorded error without retrying anything.
    pub fn clear_error(&self) {
        self.clear_action_error();
        self.inner.wallet.clear_error();
        self.inner.messaging.clear_error();
    }

    fn is_watching(&self) -> bool {
        self.inner.reactor.lock().unwrap_or_else(|p| p.into_inner()).as_ref().is_some_and(|r| !r.is_finished())
    }

    fn action_error(&self) -> Option<SessionError> {
        self.inner.error.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn clear_action_error(&self) {
        *self.inner.error.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    fn record<T>(&self, result: SessionResult<T>) -> SessionResult<T> {
        if let Err(e) = &result {
            *self.inner.error.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.clone());
        }
        result
    }
}

/// Reconcile on the wallet's rising edge and on address changes. Steady
/// states never trigger, so a failed handshake is not retried in a loop.
async fn watch_wallet(inner: Weak<Inner>, mut changes: tokio::sync::watch::Receiver<WalletState>) {
    let mut last: Option<String> = None;
    loop {
        let current = {
            let state = changes.borrow_and_update();
            if state.is_connected { state.address.clone() } else { None }
        };
        if current.is_some() && current != last {
            let Some(inner) = inner.upgrade() else { break };
            Orchestrator { inner }.reconcile();
        }
        last = current;
        if changes.changed().await.is_err() {
            break;
        }
    }
    tracing::debug!("wallet watcher stopped");
}
