//! Wallet - session lifecycle over a set of provider adapters
//!
//! Owns at most one wallet session. Connect attempts are serialized, provider
//! change notifications are applied in order, and balance reads are tagged
//! with a generation so that a slow query never overwrites a newer one.
//!
//! # State machine
//!
//! ```text
//!                connect(kind)
//!  Disconnected ─────────────▶ Connecting{kind, attempt} ──ok──▶ Connected{session, generation}
//!       ▲                            │                                 │
//!       │          err / disconnect  │         disconnect / accounts=[]│
//!       └────────────────────────────┴─────────────────────────────────┘
//! ```
//!
//! # Generations
//!
//! | Trigger | Generation | Follow-up |
//! |---------|------------|-----------|
//! | connect | 1 | none (session carries the initial balance) |
//! | `accountsChanged` (new address) | +1 | balance + name refresh |
//! | `chainChanged` | +1 | balance + name refresh |
//! | `switch_network` | +1, unless an event moved the session first | balance + name refresh |
//!
//! A balance result is applied only if the generation it was issued under is
//! still current.

mod signer;

pub use signer::WalletSigner;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::chain::{checksum_address, same_address, ChainId};
use crate::config::CoreConfig;
use crate::error::{SessionError, SessionResult};
use crate::messaging::Signer;
use crate::provider::{ProviderEvent, ProviderKind, TransactionRequest, WalletProvider};

/// An active wallet session as reported by a provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSession {
    /// EIP-55 checksummed.
    pub address: String,
    pub chain_id: ChainId,
    /// Native balance, decimal. Stale between an account or chain change and
    /// the refresh it triggers.
    pub balance: String,
    pub display_name: Option<String>,
    pub provider_kind: ProviderKind,
}

/// Read-model published to observers after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletState {
    pub is_connected: bool,
    pub is_connecting: bool,
    /// A balance refresh is in flight.
    pub is_loading: bool,
    pub address: Option<String>,
    pub chain_id: Option<ChainId>,
    pub balance: Option<String>,
    pub display_name: Option<String>,
    pub provider_kind: Option<ProviderKind>,
    pub error: Option<SessionError>,
}

/// Identity transitions that invalidate anything bound to the old address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletTransition {
    /// The session ended (explicit disconnect or the provider dropped all
    /// accounts).
    Disconnected,
    AccountChanged { previous: String, current: String },
}

type TransitionHook = Arc<dyn Fn(&WalletTransition) + Send + Sync>;
type ConnectOutcome = Shared<BoxFuture<'static, SessionResult<WalletSession>>>;

enum Phase {
    Disconnected,
    Connecting { kind: ProviderKind, attempt: u64, outcome: ConnectOutcome },
    Connected(Active),
}

struct Active {
    /// Attempt id the session came from. Event pumps and refreshes carry it
    /// so they cannot touch a later session.
    attempt: u64,
    generation: u64,
    session: WalletSession,
    provider: Arc<dyn WalletProvider>,
    events: Option<JoinHandle<()>>,
}

struct Core {
    phase: Phase,
    next_attempt: u64,
    pending_refreshes: usize,
    error: Option<SessionError>,
}

impl Core {
    fn active(&self, attempt: u64) -> Option<&Active> {
        match &self.phase {
            Phase::Connected(active) if active.attempt == attempt => Some(active),
            _ => None,
        }
    }

    fn active_mut(&mut self, attempt: u64) -> Option<&mut Active> {
        match &mut self.phase {
            Phase::Connected(active) if active.attempt == attempt => Some(active),
            _ => None,
        }
    }

    fn view(&self) -> WalletState {
        let mut view = WalletState {
            is_loading: self.pending_refreshes > 0,
            error: self.error.clone(),
            ..Default::default()
        };
        match &self.phase {
            Phase::Disconnected => {}
            Phase::Connecting { .. } => view.is_connecting = true,
            Phase::Connected(active) => {
                let session = &active.session;
                view.is_connected = true;
                view.address = Some(session.address.clone());
                view.chain_id = Some(session.chain_id);
                view.balance = Some(session.balance.clone());
                view.display_name = session.display_name.clone();
                view.provider_kind = Some(session.provider_kind);
            }
        }
        view
    }
}

struct Inner {
    providers: HashMap<ProviderKind, Arc<dyn WalletProvider>>,
    connect_timeout: Duration,
    core: Mutex<Core>,
    view: watch::Sender<WalletState>,
    hooks: Mutex<Vec<TransitionHook>>,
    /// In-flight `WalletProvider::disconnect` calls per kind. A connect on
    /// that kind waits for zero before subscribing.
    releases: HashMap<ProviderKind, watch::Sender<usize>>,
}

/// Wallet session manager. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct WalletManager {
    inner: Arc<Inner>,
}

impl WalletManager {
    pub fn new(providers: impl IntoIterator<Item = Arc<dyn WalletProvider>>, connect_timeout: Duration) -> Self {
        let providers: HashMap<ProviderKind, Arc<dyn WalletProvider>> =
            providers.into_iter().map(|p| (p.kind(), p)).collect();
        let releases = providers.keys().map(|kind| (*kind, watch::channel(0).0)).collect();
        let (view, _) = watch::channel(WalletState::default());
        Self {
            inner: Arc::new(Inner {
                providers,
                connect_timeout,
                core: Mutex::new(Core { phase: Phase::Disconnected, next_attempt: 0, pending_refreshes: 0, error: None }),
                view,
                hooks: Mutex::new(Vec::new()),
                releases,
            }),
        }
    }

    pub fn from_config(config: &CoreConfig, providers: impl IntoIterator<Item = Arc<dyn WalletProvider>>) -> Self {
        Self::new(providers, config.connect_timeout)
    }

    /// Register a callback run on every [`WalletTransition`], before the new
    /// state is published. Hooks run under the session lock: they must not
    /// block or call back into this manager.
    pub fn on_transition(&self, hook: impl Fn(&WalletTransition) + Send + Sync + 'static) {
        self.inner.hooks.lock().unwrap_or_else(|p| p.into_inner()).push(Arc::new(hook));
    }

    pub fn state(&self) -> WalletState {
        self.inner.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<WalletState> {
        self.inner.view.subscribe()
    }

    pub fn session(&self) -> Option<WalletSession> {
        match &self.lock().phase {
            Phase::Connected(active) => Some(active.session.clone()),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.lock().phase, Phase::Connected(_))
    }

    /// Kind of the provider behind the active session, if any.
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        match &self.lock().phase {
            Phase::Connected(active) => Some(active.session.provider_kind),
            _ => None,
        }
    }

    pub fn clear_error(&self) {
        let mut core = self.lock();
        if core.error.take().is_some() {
            self.publish(&core);
        }
    }

    /// Connect through the adapter for `kind`.
    ///
    /// Concurrent calls for the same kind share one attempt and observe the
    /// same outcome. A call for another kind while one is in flight fails
    /// with `AlreadyConnecting`. Connecting while a session for another kind
    /// is active ends that session first.
    pub async fn connect(&self, kind: ProviderKind) -> SessionResult<WalletSession> {
        if let Some(current) = self.session() {
            if current.provider_kind == kind {
                return Ok(current);
            }
            tracing::info!(from = %current.provider_kind, to = %kind, "switching wallet provider");
            self.disconnect().await;
        }

        let outcome = {
            let mut core = self.lock();
            let joined = match &core.phase {
                Phase::Connecting { kind: in_flight, outcome, .. } => {
                    if *in_flight != kind {
                        return Err(SessionError::AlreadyConnecting { in_flight: in_flight.to_string() });
                    }
                    Some(outcome.clone())
                }
                Phase::Connected(active) if active.session.provider_kind == kind => {
                    return Ok(active.session.clone());
                }
                Phase::Connected(active) => {
                    return Err(SessionError::AlreadyConnecting { in_flight: active.session.provider_kind.to_string() });
                }
                Phase::Disconnected => None,
            };
            match joined {
                Some(outcome) => outcome,
                None => self.start_attempt(&mut core, kind)?,
            }
        };

        outcome.await
    }

    fn start_attempt(&self, core: &mut Core, kind: ProviderKind) -> SessionResult<ConnectOutcome> {
        let provider = self
            .inner
            .providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| SessionError::unavailable(format!("no {kind} provider configured")))?;

        core.next_attempt += 1;
        let attempt = core.next_attempt;
        let manager = self.clone();
        let task = tokio::spawn(async move { manager.run_connect(provider, attempt).await });
        let outcome = async move {
            task.await.unwrap_or_else(|e| Err(SessionError::unavailable(format!("connect task failed: {e}"))))
        }
        .boxed()
        .shared();

        core.phase = Phase::Connecting { kind, attempt, outcome: outcome.clone() };
        core.error = None;
        self.publish(core);
        tracing::info!(%kind, attempt, "wallet connect started");
        Ok(outcome)
    }

    async fn run_connect(&self, provider: Arc<dyn WalletProvider>, attempt: u64) -> SessionResult<WalletSession> {
        let kind = provider.kind();
        let connecting = async {
            // A release still running would close the subscription below.
            self.wait_for_releases(kind).await;
            // Subscribe first so nothing emitted while the user approves is lost.
            let events = provider.subscribe();
            provider.connect().await.map(|session| (session, events))
        };
        let result = match tokio::time::timeout(self.inner.connect_timeout, connecting).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::unavailable(format!(
                "connect timed out after {}s",
                self.inner.connect_timeout.as_secs()
            ))),
        };
        let result = result.and_then(|(mut session, events)| {
            session.address = checksum_address(&session.address)?;
            session.provider_kind = kind;
            Ok((session, events))
        });

        // Ok(outcome) when applied. Err(release) when a disconnect superseded
        // this attempt; release is false if a newer attempt owns the provider.
        let applied = {
            let mut core = self.lock();
            let current = matches!(core.phase, Phase::Connecting { attempt: a, .. } if a == attempt);
            if current {
                Ok(self.apply_connect(&mut core, result, provider.clone(), attempt))
            } else if result.is_ok() && !provider_in_use(&core, kind) {
                self.begin_release(kind);
                Err(true)
            } else {
                Err(false)
            }
        };

        match applied {
            Ok(outcome) => outcome,
            Err(release) => {
                tracing::debug!(attempt, release, "discarding superseded connect outcome");
                if release {
                    self.release(provider).await;
                }
                Err(SessionError::ConnectCancelled)
            }
        }
    }

    fn apply_connect(
        &self,
        core: &mut Core,
        result: SessionResult<(WalletSession, mpsc::UnboundedReceiver<ProviderEvent>)>,
        provider: Arc<dyn WalletProvider>,
        attempt: u64,
    ) -> SessionResult<WalletSession> {
        match result {
            Ok((session, events)) => {
                let pump = tokio::spawn(self.clone().pump_events(events, attempt));
                core.phase = Phase::Connected(Active {
                    attempt,
                    generation: 1,
                    session: session.clone(),
                    provider,
                    events: Some(pump),
                });
                core.error = None;
                self.publish(core);
                tracing::info!(address = %session.address, chain_id = session.chain_id, "wallet connected");
                Ok(session)
            }
            Err(e) => {
                core.phase = Phase::Disconnected;
                core.error = Some(e.clone());
                self.publish(core);
                tracing::warn!(error = %e, "wallet connect failed");
                Err(e)
            }
        }
    }

    /// End the session. Never fails; provider errors are logged. An in-flight
    /// connect is cancelled and its waiters get `ConnectCancelled`.
    pub async fn disconnect(&self) {
        let released = {
            let mut core = self.lock();
            match std::mem::replace(&mut core.phase, Phase::Disconnected) {
                Phase::Disconnected => return,
                Phase::Connecting { attempt, .. } => {
                    tracing::info!(attempt, "wallet connect cancelled");
                    core.error = None;
                    self.publish(&core);
                    None
                }
                Phase::Connected(active) => {
                    if let Some(pump) = &active.events {
                        pump.abort();
                    }
                    core.error = None;
                    self.run_hooks(&WalletTransition::Disconnected);
                    self.publish(&core);
                    self.begin_release(active.session.provider_kind);
                    Some(active.provider)
                }
            }
        };

        if let Some(provider) = released {
            self.release(provider).await;
            tracing::info!("wallet disconnected");
        }
    }

    /// Count a provider release. Called under the core lock, so any attempt
    /// started afterwards waits in [`WalletManager::wait_for_releases`].
    fn begin_release(&self, kind: ProviderKind) {
        if let Some(releases) = self.inner.releases.get(&kind) {
            releases.send_modify(|n| *n += 1);
        }
    }

    /// Disconnect the provider and settle the count taken by `begin_release`.
    async fn release(&self, provider: Arc<dyn WalletProvider>) {
        if let Err(e) = provider.disconnect().await {
            tracing::warn!(error = %e, "provider disconnect failed");
        }
        if let Some(releases) = self.inner.releases.get(&provider.kind()) {
            releases.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    async fn wait_for_releases(&self, kind: ProviderKind) {
        if let Some(releases) = self.inner.releases.get(&kind) {
            let mut pending = releases.subscribe();
            if pending.wait_for(|n| *n == 0).await.is_err() {
                tracing::debug!(%kind, "release counter closed");
            }
        }
    }

    /// Re-query the balance for the current address and chain. No-op without a
    /// session. Failures are recorded and returned; the last known balance
    /// stays in place.
    pub async fn refresh_balance(&self) -> SessionResult<()> {
        let current = {
            let core = self.lock();
            match &core.phase {
                Phase::Connected(active) => Some((active.attempt, active.generation)),
                _ => None,
            }
        };
        match current {
            Some((attempt, generation)) => self.refresh(attempt, generation, false).await,
            None => Ok(()),
        }
    }

    /// Ask the provider to switch chains. On success the chain id advances and
    /// the balance is refreshed for the current chain; a refresh failure is
    /// recorded without failing the switch. On failure nothing changes.
    ///
    /// If a provider event moved the session while the request was pending,
    /// that event wins and `chain_id` is not written back.
    pub async fn switch_network(&self, chain_id: ChainId) -> SessionResult<()> {
        let (provider, attempt, before) = self.current_provider()?;
        provider.switch_network(chain_id).await?;

        let generation = {
            let mut core = self.lock();
            let Some(active) = core.active_mut(attempt) else {
                return Ok(());
            };
            if active.generation != before {
                tracing::debug!(chain_id, current = active.session.chain_id, "session moved during switch, keeping event state");
            } else if active.session.chain_id != chain_id {
                active.session.chain_id = chain_id;
                active.generation += 1;
            }
            let generation = active.generation;
            self.publish(&core);
            generation
        };
        tracing::info!(chain_id, "network switched");

        if let Err(e) = self.refresh(attempt, generation, true).await {
            tracing::warn!(chain_id, error = %e, "balance refresh after switch failed");
        }
        Ok(())
    }

    pub async fn sign_message(&self, text: &str) -> SessionResult<String> {
        let (provider, address) = self.current_signer_parts()?;
        provider.sign_message(&address, text).await
    }

    /// Submit a transaction from the session address. Returns the hash.
    pub async fn send_transaction(&self, tx: TransactionRequest) -> SessionResult<String> {
        let (provider, address) = self.current_signer_parts()?;
        let tx = TransactionRequest { from: Some(tx.from.unwrap_or(address)), ..tx };
        let hash = provider.send_transaction(&tx).await?;
        tracing::info!(%hash, to = %tx.to, "transaction submitted");
        Ok(hash)
    }

    /// Signer bound to the current address, for the messaging handshake.
    pub fn signer(&self) -> Option<Arc<dyn Signer>> {
        let (provider, address) = self.current_signer_parts().ok()?;
        Some(Arc::new(WalletSigner::new(provider, address)))
    }

    fn current_provider(&self) -> SessionResult<(Arc<dyn WalletProvider>, u64, u64)> {
        match &self.lock().phase {
            Phase::Connected(active) => Ok((active.provider.clone(), active.attempt, active.generation)),
            _ => Err(SessionError::not_connected("wallet")),
        }
    }

    fn current_signer_parts(&self) -> SessionResult<(Arc<dyn WalletProvider>, String)> {
        match &self.lock().phase {
            Phase::Connected(active) => Ok((active.provider.clone(), active.session.address.clone())),
            _ => Err(SessionError::not_connected("wallet")),
        }
    }

    async fn pump_events(self, mut events: mpsc::UnboundedReceiver<ProviderEvent>, attempt: u64) {
        while let Some(event) = events.recv().await {
            if !self.apply_event(event, attempt).await {
                break;
            }
        }
        tracing::debug!(attempt, "wallet event pump stopped");
    }

    /// Apply one provider event. Returns false once the session is gone.
    async fn apply_event(&self, event: ProviderEvent, attempt: u64) -> bool {
        match event {
            ProviderEvent::AccountsChanged(accounts) if accounts.is_empty() => {
                tracing::info!("provider reported no accounts");
                self.teardown(attempt).await;
                false
            }
            ProviderEvent::AccountsChanged(accounts) => {
                let next = match checksum_address(&accounts[0]) {
                    Ok(address) => address,
                    Err(e) => {
                        tracing::warn!(error = %e, "ignoring malformed accountsChanged");
                        return true;
                    }
                };
                let generation = {
                    let mut core = self.lock();
                    let Some(active) = core.active_mut(attempt) else {
                        return false;
                    };
                    if same_address(&active.session.address, &next) {
                        return true;
                    }
                    let previous = std::mem::replace(&mut active.session.address, next.clone());
                    active.session.display_name = None;
                    active.generation += 1;
                    let generation = active.generation;
                    self.run_hooks(&WalletTransition::AccountChanged { previous, current: next.clone() });
                    self.publish(&core);
                    generation
                };
                tracing::info!(address = %next, "active account changed");
                self.spawn_refresh(attempt, generation);
                true
            }
            ProviderEvent::ChainChanged(chain_id) => {
                let generation = {
                    let mut core = self.lock();
                    let Some(active) = core.active_mut(attempt) else {
                        return false;
                    };
                    if active.session.chain_id == chain_id {
                        return true;
                    }
                    active.session.chain_id = chain_id;
                    active.generation += 1;
                    let generation = active.generation;
                    self.publish(&core);
                    generation
                };
                tracing::info!(chain_id, "chain changed");
                self.spawn_refresh(attempt, generation);
                true
            }
        }
    }

    /// Provider-initiated end of session. The pump calling this is not
    /// aborted; it exits on its own.
    async fn teardown(&self, attempt: u64) {
        let provider = {
            let mut core = self.lock();
            if core.active(attempt).is_none() {
                return;
            }
            let Phase::Connected(active) = std::mem::replace(&mut core.phase, Phase::Disconnected) else {
                return;
            };
            self.run_hooks(&WalletTransition::Disconnected);
            self.publish(&core);
            self.begin_release(active.session.provider_kind);
            active.provider
        };
        self.release(provider).await;
    }

    fn spawn_refresh(&self, attempt: u64, generation: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.refresh(attempt, generation, true).await {
                tracing::warn!(error = %e, "background balance refresh failed");
            }
        });
    }

    /// Query balance (and optionally the display name) under `generation`.
    /// The result is dropped if the session moved on in the meantime.
    async fn refresh(&self, attempt: u64, generation: u64, resolve_name: bool) -> SessionResult<()> {
        let (provider, address, chain_id) = {
            let mut core = self.lock();
            let Some(active) = core.active(attempt).filter(|a| a.generation == generation) else {
                return Ok(());
            };
            let parts = (active.provider.clone(), active.session.address.clone(), active.session.chain_id);
            core.pending_refreshes += 1;
            self.publish(&core);
            parts
        };

        let balance = provider.get_balance(&address, chain_id).await;
        let name = if resolve_name && balance.is_ok() {
            match provider.resolve_name(&address, chain_id).await {
                Ok(name) => name,
                Err(e) => {
                    tracing::debug!(error = %e, "name lookup failed");
                    None
                }
            }
        } else {
            None
        };

        let mut core = self.lock();
        core.pending_refreshes = core.pending_refreshes.saturating_sub(1);
        let result = match core.active_mut(attempt).filter(|a| a.generation == generation) {
            None => {
                tracing::debug!(chain_id, generation, "discarding stale balance result");
                Ok(())
            }
            Some(active) => match balance {
                Ok(balance) => {
                    active.session.balance = balance;
                    if resolve_name {
                        active.session.display_name = name;
                    }
                    Ok(())
                }
                Err(e) => {
                    core.error = Some(e.clone());
                    Err(e)
                }
            },
        };
        self.publish(&core);
        result
    }

    fn run_hooks(&self, transition: &WalletTransition) {
        let hooks = self.inner.hooks.lock().unwrap_or_else(|p| p.into_inner()).clone();
        for hook in hooks {
            hook(transition);
        }
    }

    /// Called with the core lock held so published views are totally ordered.
    fn publish(&self, core: &Core) {
        self.inner.view.send_replace(core.view());
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A newer attempt is connecting through, or connected on, `kind`.
fn provider_in_use(core: &Core, kind: ProviderKind) -> bool {
    match &core.phase {
        Phase::Disconnected => false,
        Phase::Connecting { kind: in_flight, .. } => *in_flight == kind,
        Phase::Connected(active) => active.session.provider_kind == kind,
    }
}
