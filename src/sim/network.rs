//! In-memory messaging network

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::MessagingEnv;
use crate::error::{SessionError, SessionResult};
use crate::messaging::{Conversation, Message, MessagingClient, MessagingTransport, Signer};

struct Thread {
    id: String,
    members: [String; 2],
    messages: Vec<Message>,
}

struct MessageStream {
    client: u64,
    owner: String,
    peer: String,
    tx: mpsc::UnboundedSender<Message>,
}

struct ConversationStream {
    client: u64,
    owner: String,
    tx: mpsc::UnboundedSender<Conversation>,
}

#[derive(Default)]
struct State {
    registered: HashSet<String>,
    unreachable: HashSet<String>,
    threads: Vec<Thread>,
    message_streams: Vec<MessageStream>,
    conversation_streams: Vec<ConversationStream>,
    handshake_delay: Duration,
    env: MessagingEnv,
    next_handshake_error: Option<SessionError>,
    listing_failure: bool,
    send_failure: bool,
    probe_failure: bool,
}

impl State {
    fn position(&self, a: &str, b: &str) -> Option<usize> {
        self.threads.iter().position(|t| t.members.iter().any(|m| m == a) && t.members.iter().any(|m| m == b))
    }

    fn thread_mut(&mut self, a: &str, b: &str) -> Option<&mut Thread> {
        let index = self.position(a, b)?;
        self.threads.get_mut(index)
    }

    /// Find or open the thread between `a` and `b`. New threads are announced
    /// to both sides' conversation streams.
    fn open_thread(&mut self, a: &str, b: &str) -> &mut Thread {
        let index = match self.position(a, b) {
            Some(index) => index,
            None => {
                let mut pair = [a.to_string(), b.to_string()];
                pair.sort();
                let id = format!("dm:{}:{}", pair[0], pair[1]);
                for (owner, peer) in [(a, b), (b, a)] {
                    let conversation = Conversation::new(id.clone(), peer);
                    self.conversation_streams.retain(|s| s.owner != owner || s.tx.send(conversation.clone()).is_ok());
                }
                self.threads.push(Thread { id, members: pair, messages: Vec::new() });
                self.threads.len() - 1
            }
        };
        &mut self.threads[index]
    }

    fn deliver(&mut self, message: &Message) {
        let sender = message.sender_identity.as_str();
        let recipient = message.recipient_identity.as_str();
        self.message_streams.retain(|s| {
            let on_thread = (s.owner == sender && s.peer == recipient) || (s.owner == recipient && s.peer == sender);
            !on_thread || s.tx.send(message.clone()).is_ok()
        });
    }
}

struct Shared {
    state: Mutex<State>,
    clients_created: AtomicUsize,
    next_client: AtomicU64,
    next_message: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn post(&self, sender: &str, recipient: &str, body: &str) -> Message {
        let message = Message {
            id: format!("msg-{}", self.next_message.fetch_add(1, Ordering::SeqCst) + 1),
            sender_identity: sender.to_string(),
            recipient_identity: recipient.to_string(),
            body: body.to_string(),
            sent_at: Utc::now(),
        };
        let mut state = self.lock();
        state.open_thread(sender, recipient).messages.push(message.clone());
        state.deliver(&message);
        message
    }
}

/// Scriptable [`MessagingTransport`]: every client created from it shares one
/// in-memory network. Identities are compared lowercase.
#[derive(Clone)]
pub struct SimulatedNetwork {
    shared: Arc<Shared>,
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                clients_created: AtomicUsize::new(0),
                next_client: AtomicU64::new(0),
                next_message: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_handshake_delay(self, delay: Duration) -> Self { self.shared.lock().handshake_delay = delay; self }

    /// The network clients must ask for. Defaults to production.
    pub fn with_env(self, env: MessagingEnv) -> Self { self.shared.lock().env = env; self }

    /// Mark `identity` as reachable without it ever creating a client.
    pub fn with_registered(self, identity: &str) -> Self { self.shared.lock().registered.insert(identity.to_lowercase()); self }

    pub fn with_unreachable(self, identity: &str) -> Self { self.shared.lock().unreachable.insert(identity.to_lowercase()); self }

    /// Seed a message thread as if it had been exchanged earlier.
    pub fn with_history(self, from: &str, to: &str, body: &str) -> Self {
        self.shared.post(&from.to_lowercase(), &to.to_lowercase(), body);
        self
    }

    pub fn fail_next_handshake(&self, error: SessionError) {
        self.shared.lock().next_handshake_error = Some(error);
    }

    pub fn set_listing_failure(&self, failing: bool) {
        self.shared.lock().listing_failure = failing;
    }

    pub fn set_send_failure(&self, failing: bool) {
        self.shared.lock().send_failure = failing;
    }

    pub fn set_probe_failure(&self, failing: bool) {
        self.shared.lock().probe_failure = failing;
    }

    /// Deliver a message from `from` (which need not have a client).
    pub fn inject(&self, from: &str, to: &str, body: &str) -> Message {
        self.shared.post(&from.to_lowercase(), &to.to_lowercase(), body)
    }

    pub fn clients_created(&self) -> usize {
        self.shared.clients_created.load(Ordering::SeqCst)
    }

    /// Live per-peer message streams across all clients.
    pub fn open_streams(&self) -> usize {
        let mut state = self.shared.lock();
        state.message_streams.retain(|s| !s.tx.is_closed());
        state.message_streams.len()
    }
}

#[async_trait]
impl MessagingTransport for SimulatedNetwork {
    async fn create_client(&self, signer: Arc<dyn Signer>, env: MessagingEnv) -> SessionResult<Arc<dyn MessagingClient>> {
        self.shared.clients_created.fetch_add(1, Ordering::SeqCst);
        let (delay, network_env) = {
            let state = self.shared.lock();
            (state.handshake_delay, state.env)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if env != network_env {
            return Err(SessionError::HandshakeFailed(format!("{env} client cannot reach the {network_env} network")));
        }
        if let Some(error) = self.shared.lock().next_handshake_error.take() {
            return Err(error);
        }

        let identity = signer.address();
        signer
            .sign_message(&format!("Broadcast identity key for {identity}"))
            .await
            .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;

        self.shared.lock().registered.insert(identity.to_lowercase());
        Ok(Arc::new(SimulatedClient {
            id: self.shared.next_client.fetch_add(1, Ordering::SeqCst) + 1,
            identity,
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct SimulatedClient {
    id: u64,
    identity: String,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl SimulatedClient {
    fn me(&self) -> String {
        self.identity.to_lowercase()
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::not_connected("messaging client closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl MessagingClient for SimulatedClient {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    async fn list_conversations(&self) -> SessionResult<Vec<Conversation>> {
        self.ensure_open()?;
        let me = self.me();
        let state = self.shared.lock();
        if state.listing_failure {
            return Err(SessionError::query("conversation listing unavailable"));
        }
        Ok(state
            .threads
            .iter()
            .filter(|t| t.members.contains(&me))
            .map(|t| {
                let peer = t.members.iter().find(|m| **m != me).cloned().unwrap_or_else(|| me.clone());
                let mut conversation = Conversation::new(t.id.clone(), peer);
                if let Some(last) = t.messages.last() {
                    conversation = conversation.with_preview(last.body.clone(), last.sent_at);
                }
                let unread = t.messages.iter().filter(|m| m.recipient_identity == me).count();
                conversation.with_unread(u32::try_from(unread).unwrap_or(u32::MAX))
            })
            .collect())
    }

    async fn send(&self, peer: &str, body: &str) -> SessionResult<Message> {
        self.ensure_open().map_err(|e| SessionError::DeliveryFailed(e.to_string()))?;
        if self.shared.lock().send_failure {
            return Err(SessionError::DeliveryFailed("relay rejected the envelope".into()));
        }
        Ok(self.shared.post(&self.me(), &peer.to_lowercase(), body))
    }

    async fn messages(&self, peer: &str, limit: Option<usize>) -> SessionResult<Vec<Message>> {
        self.ensure_open()?;
        let me = self.me();
        let mut state = self.shared.lock();
        let Some(thread) = state.thread_mut(&me, &peer.to_lowercase()) else {
            return Ok(Vec::new());
        };
        let skip = limit.map_or(0, |n| thread.messages.len().saturating_sub(n));
        Ok(thread.messages[skip..].to_vec())
    }

    async fn stream_messages(&self, peer: &str) -> SessionResult<mpsc::UnboundedReceiver<Message>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().message_streams.push(MessageStream {
            client: self.id,
            owner: self.me(),
            peer: peer.to_lowercase(),
            tx,
        });
        Ok(rx)
    }

    async fn stream_conversations(&self) -> SessionResult<mpsc::UnboundedReceiver<Conversation>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().conversation_streams.push(ConversationStream { client: self.id, owner: self.me(), tx });
        Ok(rx)
    }

    async fn can_message(&self, identity: &str) -> SessionResult<bool> {
        let state = self.shared.lock();
        if state.probe_failure {
            return Err(SessionError::query("reachability endpoint unavailable"));
        }
        let identity = identity.to_lowercase();
        Ok(state.registered.contains(&identity) && !state.unreachable.contains(&identity))
    }

    async fn close(&self) -> SessionResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.shared.lock();
        state.message_streams.retain(|s| s.client != self.id);
        state.conversation_streams.retain(|s| s.client != self.id);
        Ok(())
    }
}
