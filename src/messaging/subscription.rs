//! Per-peer message subscriptions with synchronous teardown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Message;

/// Delivery gate shared between a subscription handle and its pump task.
///
/// A callback runs only while holding `delivering`, and only if the gate is
/// still open. Closing flips the flag, then waits for an in-flight callback
/// to return, unless the close comes from inside that callback.
pub(crate) struct Gate {
    active: AtomicBool,
    delivering: Mutex<()>,
    delivering_on: Mutex<Option<ThreadId>>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self { active: AtomicBool::new(true), delivering: Mutex::new(()), delivering_on: Mutex::new(None) }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run `deliver` if the gate is open. Returns whether it is still open.
    fn deliver(&self, deliver: impl FnOnce()) -> bool {
        let _turn = self.delivering.lock().unwrap_or_else(|p| p.into_inner());
        if !self.is_open() {
            return false;
        }
        *self.slot() = Some(thread::current().id());
        deliver();
        *self.slot() = None;
        self.is_open()
    }

    pub(crate) fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        let reentrant = *self.slot() == Some(thread::current().id());
        if !reentrant {
            drop(self.delivering.lock().unwrap_or_else(|p| p.into_inner()));
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<ThreadId>> {
        self.delivering_on.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Handle returned by `subscribe`. Unsubscribes on drop.
///
/// Once [`Subscription::unsubscribe`] returns, the callback is never invoked
/// again. Calling it from inside the callback is allowed.
pub struct Subscription {
    peer: String,
    gate: Arc<Gate>,
    pump: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn start<F>(peer: String, gate: Arc<Gate>, mut messages: mpsc::UnboundedReceiver<Message>, on_message: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let pump_gate = gate.clone();
        let pump_peer = peer.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                if !pump_gate.deliver(|| on_message(message)) {
                    break;
                }
            }
            tracing::debug!(peer = %pump_peer, "message subscription ended");
        });
        Self { peer, gate, pump }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// False after `unsubscribe`, or once the messaging session ended.
    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    pub fn unsubscribe(&self) {
        self.gate.close();
        self.pump.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("peer", &self.peer).field("active", &self.is_active()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn message(body: &str) -> Message {
        Message {
            id: body.into(),
            sender_identity: "0xa".into(),
            recipient_identity: "0xb".into(),
            body: body.into(),
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn closed_gate_drops_pending_messages() {
        let (tx, rx) = mpsc::unbounded_channel();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sub = Subscription::start("0xb".into(), Arc::new(Gate::new()), rx, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(message("one")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        sub.unsubscribe();
        tx.send(message("two")).ok();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
    }

    #[test]
    fn close_from_inside_delivery_does_not_deadlock() {
        let gate = Arc::new(Gate::new());
        let inner = gate.clone();
        let still_open = gate.deliver(|| inner.close());
        assert!(!still_open);
        assert!(!gate.deliver(|| panic!("delivered after close")));
    }
}
