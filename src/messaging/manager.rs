//! Messaging session manager

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::subscription::Gate;
use super::{Conversation, ConversationUpdate, Message, MessagingClient, MessagingTransport, Signer, Subscription};
use crate::chain::same_address;
use crate::config::{CoreConfig, MessagingEnv};
use crate::error::{SessionError, SessionResult};

/// Read-model published after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingState {
    pub is_connected: bool,
    pub is_connecting: bool,
    /// Conversation listing in flight.
    pub is_loading: bool,
    pub identity: Option<String>,
    pub conversations: Vec<Conversation>,
    /// The last listing failed; `conversations` may be incomplete.
    pub conversations_stale: bool,
    pub error: Option<SessionError>,
}

enum Phase {
    Disconnected,
    Connecting { attempt: u64, identity: String },
    Connected(Active),
}

struct Active {
    attempt: u64,
    identity: String,
    client: Arc<dyn MessagingClient>,
    discovery: Option<JoinHandle<()>>,
}

struct Core {
    phase: Phase,
    next_attempt: u64,
    conversations: Vec<Conversation>,
    conversations_stale: bool,
    loading: usize,
    error: Option<SessionError>,
    gates: Vec<Weak<Gate>>,
}

impl Core {
    fn active(&self, attempt: u64) -> Option<&Active> {
        match &self.phase {
            Phase::Connected(active) if active.attempt == attempt => Some(active),
            _ => None,
        }
    }

    fn client(&self) -> SessionResult<(Arc<dyn MessagingClient>, u64)> {
        match &self.phase {
            Phase::Connected(active) => Ok((active.client.clone(), active.attempt)),
            _ => Err(SessionError::not_connected("messaging")),
        }
    }

    fn view(&self) -> MessagingState {
        let (is_connected, is_connecting, identity) = match &self.phase {
            Phase::Disconnected => (false, false, None),
            Phase::Connecting { identity, .. } => (false, true, Some(identity.clone())),
            Phase::Connected(active) => (true, false, Some(active.identity.clone())),
        };
        MessagingState {
            is_connected,
            is_connecting,
            is_loading: self.loading > 0,
            identity,
            conversations: self.conversations.clone(),
            conversations_stale: self.conversations_stale,
            error: self.error.clone(),
        }
    }

    /// Take the session out, closing every subscription gate. Returns the
    /// client to release, if one was live.
    fn detach(&mut self) -> Option<Arc<dyn MessagingClient>> {
        let previous = std::mem::replace(&mut self.phase, Phase::Disconnected);
        for gate in self.gates.drain(..).filter_map(|g| g.upgrade()) {
            gate.close();
        }
        self.conversations.clear();
        self.conversations_stale = false;
        self.error = None;
        match previous {
            Phase::Connected(active) => {
                if let Some(discovery) = active.discovery {
                    discovery.abort();
                }
                Some(active.client)
            }
            Phase::Connecting { attempt, .. } => {
                tracing::info!(attempt, "messaging handshake cancelled");
                None
            }
            Phase::Disconnected => None,
        }
    }
}

struct Inner {
    transport: Arc<dyn MessagingTransport>,
    handshake_timeout: Duration,
    env: MessagingEnv,
    core: Mutex<Core>,
    view: watch::Sender<MessagingState>,
}

/// Messaging session manager. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct MessagingManager {
    inner: Arc<Inner>,
}

impl MessagingManager {
    pub fn new(transport: Arc<dyn MessagingTransport>, handshake_timeout: Duration, env: MessagingEnv) -> Self {
        let (view, _) = watch::channel(MessagingState::default());
        Self {
            inner: Arc::new(Inner {
                transport,
                handshake_timeout,
                env,
                core: Mutex::new(Core {
                    phase: Phase::Disconnected,
                    next_attempt: 0,
                    conversations: Vec::new(),
                    conversations_stale: false,
                    loading: 0,
                    error: None,
                    gates: Vec::new(),
                }),
                view,
            }),
        }
    }

    pub fn from_config(config: &CoreConfig, transport: Arc<dyn MessagingTransport>) -> Self {
        Self::new(transport, config.handshake_timeout, config.messaging_env)
    }

    /// Network every client of this manager is created against.
    pub fn env(&self) -> MessagingEnv {
        self.inner.env
    }

    pub fn state(&self) -> MessagingState {
        self.inner.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<MessagingState> {
        self.inner.view.subscribe()
    }

    pub fn identity(&self) -> Option<String> {
        match &self.lock().phase {
            Phase::Connected(active) => Some(active.identity.clone()),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.lock().phase, Phase::Connected(_))
    }

    pub fn clear_error(&self) {
        let mut core = self.lock();
        if core.error.take().is_some() {
            self.publish(&core);
        }
    }

    /// Create a client for `signer` and wait for it (including the initial
    /// conversation listing).
    pub async fn connect(&self, signer: Option<Arc<dyn Signer>>) -> SessionResult<()> {
        match self.spawn_connect(signer)?.await {
            Ok(result) => result,
            Err(e) => Err(SessionError::HandshakeFailed(format!("handshake task failed: {e}"))),
        }
    }

    /// Start a handshake in the background. The manager is marked connecting
    /// before this returns, so a second call fails with `AlreadyConnecting`.
    pub fn spawn_connect(&self, signer: Option<Arc<dyn Signer>>) -> SessionResult<JoinHandle<SessionResult<()>>> {
        let mut core = self.lock();
        let Some(signer) = signer else {
            core.error = Some(SessionError::SignerUnavailable);
            self.publish(&core);
            return Err(SessionError::SignerUnavailable);
        };
        let identity = signer.address();

        let stale = match &core.phase {
            Phase::Connecting { .. } => {
                return Err(SessionError::AlreadyConnecting { in_flight: "messaging".into() });
            }
            Phase::Connected(active) if same_address(&active.identity, &identity) => {
                return Ok(tokio::spawn(async { Ok(()) }));
            }
            Phase::Connected(_) => true,
            Phase::Disconnected => false,
        };
        if stale {
            if let Some(client) = core.detach() {
                release(client);
            }
        }

        core.next_attempt += 1;
        let attempt = core.next_attempt;
        core.phase = Phase::Connecting { attempt, identity: identity.clone() };
        core.error = None;
        self.publish(&core);
        tracing::info!(%identity, attempt, "messaging handshake started");

        let manager = self.clone();
        Ok(tokio::spawn(async move { manager.handshake(signer, attempt).await }))
    }

    async fn handshake(&self, signer: Arc<dyn Signer>, attempt: u64) -> SessionResult<()> {
        let identity = signer.address();
        let env = self.inner.env;
        let created =
            tokio::time::timeout(self.inner.handshake_timeout, self.inner.transport.create_client(signer, env)).await;
        let created = match created {
            Ok(Ok(client)) if !same_address(&client.identity(), &identity) => {
                let reported = client.identity();
                release(client);
                Err(SessionError::HandshakeFailed(format!("client identity {reported} does not match {identity}")))
            }
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e @ SessionError::HandshakeFailed(_))) => Err(e),
            Ok(Err(e)) => Err(SessionError::HandshakeFailed(e.to_string())),
            Err(_) => Err(SessionError::HandshakeFailed(format!(
                "timed out after {}s",
                self.inner.handshake_timeout.as_secs()
            ))),
        };

        // Ok(outcome) when applied, Err(outcome) when superseded.
        let applied = {
            let mut core = self.lock();
            let current = matches!(core.phase, Phase::Connecting { attempt: a, .. } if a == attempt);
            if current {
                Ok(self.apply_handshake(&mut core, created, attempt, &identity))
            } else {
                Err(created)
            }
        };

        let client = match applied {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "messaging handshake failed");
                return Err(e);
            }
            Err(superseded) => {
                tracing::debug!(attempt, "discarding superseded handshake");
                if let Ok(client) = superseded {
                    release(client);
                }
                return Err(SessionError::ConnectCancelled);
            }
        };
        tracing::info!(%identity, "messaging connected");

        if let Err(e) = self.load_conversations(&client, attempt).await {
            tracing::warn!(error = %e, "initial conversation listing failed");
        }
        self.start_discovery(client, attempt).await;
        Ok(())
    }

    fn apply_handshake(
        &self,
        core: &mut Core,
        created: SessionResult<Arc<dyn MessagingClient>>,
        attempt: u64,
        identity: &str,
    ) -> SessionResult<Arc<dyn MessagingClient>> {
        match created {
            Ok(client) => {
                core.phase = Phase::Connected(Active {
                    attempt,
                    identity: identity.to_string(),
                    client: client.clone(),
                    discovery: None,
                });
                core.conversations.clear();
                self.publish(core);
                Ok(client)
            }
            Err(e) => {
                core.phase = Phase::Disconnected;
                core.error = Some(e.clone());
                self.publish(core);
                Err(e)
            }
        }
    }

    /// Stop the session, closing every subscription. Idempotent.
    pub async fn disconnect(&self) {
        let released = {
            let mut core = self.lock();
            if matches!(core.phase, Phase::Disconnected) && core.conversations.is_empty() && core.gates.is_empty() {
                return;
            }
            let client = core.detach();
            self.publish(&core);
            client
        };
        if let Some(client) = released {
            if let Err(e) = client.close().await {
                tracing::warn!(error = %e, "messaging client close failed");
            }
            tracing::info!("messaging disconnected");
        }
    }

    /// Synchronous teardown for wallet identity changes. The client is closed
    /// in the background.
    pub fn invalidate(&self) {
        let mut core = self.lock();
        if matches!(core.phase, Phase::Disconnected) && core.conversations.is_empty() {
            return;
        }
        if let Some(client) = core.detach() {
            release(client);
        }
        self.publish(&core);
        tracing::info!("messaging session invalidated");
    }

    pub async fn send(&self, peer: &str, body: &str) -> SessionResult<Message> {
        let (client, attempt) = self.lock().client()?;
        let message = client.send(peer, body).await.map_err(|e| match e {
            SessionError::DeliveryFailed(_) => e,
            other => SessionError::DeliveryFailed(other.to_string()),
        })?;

        let mut core = self.lock();
        if core.active(attempt).is_some() {
            if let Some(conversation) = core.conversations.iter_mut().find(|c| same_address(&c.peer_identity, peer)) {
                conversation.last_message = Some(message.body.clone());
                conversation.last_message_time = Some(message.sent_at);
                self.publish(&core);
            }
        }
        Ok(message)
    }

    pub async fn messages(&self, peer: &str, limit: Option<usize>) -> SessionResult<Vec<Message>> {
        let (client, _) = self.lock().client()?;
        client.messages(peer, limit).await.map_err(|e| match e {
            SessionError::QueryFailed(_) => e,
            other => SessionError::query(other.to_string()),
        })
    }

    /// Deliver messages exchanged with `peer` to `on_message` until the
    /// returned handle is unsubscribed or the session ends.
    pub async fn subscribe<F>(&self, peer: &str, on_message: F) -> SessionResult<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let (client, attempt) = self.lock().client()?;
        let stream = client.stream_messages(peer).await?;

        let gate = Arc::new(Gate::new());
        {
            let mut core = self.lock();
            if core.active(attempt).is_none() {
                return Err(SessionError::not_connected("messaging"));
            }
            core.gates.retain(|g| g.strong_count() > 0);
            core.gates.push(Arc::downgrade(&gate));
        }
        tracing::debug!(%peer, "subscribed to messages");
        Ok(Subscription::start(peer.to_string(), gate, stream, on_message))
    }

    /// Advisory reachability probe. Errors read as unreachable.
    pub async fn can_message(&self, identity: &str) -> bool {
        let Ok((client, _)) = self.lock().client() else {
            return false;
        };
        match client.can_message(identity).await {
            Ok(reachable) => reachable,
            Err(e) => {
                tracing::debug!(%identity, error = %e, "reachability probe failed");
                false
            }
        }
    }

    /// Re-list conversations. On failure the last known list is kept.
    pub async fn refresh_conversations(&self) -> SessionResult<()> {
        let (client, attempt) = self.lock().client()?;
        self.load_conversations(&client, attempt).await
    }

    /// Insert at the front unless a conversation with the same id exists.
    pub fn add_conversation(&self, conversation: Conversation) {
        let mut core = self.lock();
        if insert_front(&mut core.conversations, conversation) {
            self.publish(&core);
        }
    }

    /// Apply a partial update. Returns false if no conversation has `id`.
    pub fn update_conversation(&self, id: &str, update: ConversationUpdate) -> bool {
        let mut core = self.lock();
        let Some(conversation) = core.conversations.iter_mut().find(|c| c.id == id) else {
            return false;
        };
        update.apply(conversation);
        self.publish(&core);
        true
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.lock().conversations.clone()
    }

    async fn load_conversations(&self, client: &Arc<dyn MessagingClient>, attempt: u64) -> SessionResult<()> {
        {
            let mut core = self.lock();
            core.loading += 1;
            self.publish(&core);
        }
        let listed = client.list_conversations().await.map_err(|e| match e {
            SessionError::QueryFailed(_) => e,
            other => SessionError::query(other.to_string()),
        });

        let mut core = self.lock();
        core.loading = core.loading.saturating_sub(1);
        let result = if core.active(attempt).is_none() {
            Ok(())
        } else {
            match listed {
                Ok(conversations) => {
                    tracing::debug!(count = conversations.len(), "conversations listed");
                    core.conversations = conversations;
                    core.conversations_stale = false;
                    Ok(())
                }
                Err(e) => {
                    core.conversations_stale = true;
                    core.error = Some(e.clone());
                    Err(e)
                }
            }
        };
        self.publish(&core);
        result
    }

    async fn start_discovery(&self, client: Arc<dyn MessagingClient>, attempt: u64) {
        let mut discovered = match client.stream_conversations().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "conversation stream unavailable");
                return;
            }
        };
        let manager = self.clone();
        let task = tokio::spawn(async move {
            while let Some(conversation) = discovered.recv().await {
                let mut core = manager.lock();
                if core.active(attempt).is_none() {
                    break;
                }
                if insert_front(&mut core.conversations, conversation) {
                    manager.publish(&core);
                }
            }
        });

        let mut core = self.lock();
        match &mut core.phase {
            Phase::Connected(active) if active.attempt == attempt => active.discovery = Some(task),
            _ => task.abort(),
        }
    }

    fn publish(&self, core: &Core) {
        self.inner.view.send_replace(core.view());
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn insert_front(conversations: &mut Vec<Conversation>, conversation: Conversation) -> bool {
    if conversations.iter().any(|c| c.id == conversation.id) {
        return false;
    }
    conversations.insert(0, conversation);
    true
}

/// Close a detached client without waiting. Outside a runtime the client is
/// simply dropped.
fn release(client: Arc<dyn MessagingClient>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = client.close().await {
                    tracing::warn!(error = %e, "messaging client close failed");
                }
            });
        }
        Err(_) => drop(client),
    }
}
