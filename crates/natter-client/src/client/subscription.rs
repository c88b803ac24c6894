// Subscription registry and per-subscription dispatch tasks.
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;

use crate::client::connection::Connection;
use crate::error::Result;

/// A message delivered to a subscription handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub subject: String,
    /// Where the publisher expects a response, if anywhere.
    pub reply: Option<String>,
    /// Subscription id the server routed this message to.
    pub sid: u64,
    pub payload: Bytes,
}

struct SubscriptionEntry {
    tx: mpsc::UnboundedSender<Msg>,
    queued: Arc<AtomicUsize>,
}

/// Maps subscription ids to their dispatch queues. The lock is never held
/// across an await.
pub(crate) struct SubscriptionRegistry {
    next_sid: AtomicU64,
    entries: Mutex<HashMap<u64, SubscriptionEntry>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_sid: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn allocate_sid(&self) -> u64 {
        self.next_sid.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `sid` and spawns its dispatch task. Returns the queue depth
    /// counter shared with the task.
    pub(crate) fn register<F, Fut>(&self, sid: u64, handler: F) -> Arc<AtomicUsize>
    where
        F: Fn(Msg) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run_dispatch(sid, rx, Arc::clone(&queued), handler));
        self.entries.lock().insert(
            sid,
            SubscriptionEntry {
                tx,
                queued: Arc::clone(&queued),
            },
        );
        queued
    }

    /// Queues `msg` for its subscription. Returns false when the sid is not
    /// (or no longer) registered.
    pub(crate) fn dispatch(&self, msg: Msg) -> bool {
        let sid = msg.sid;
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(&sid) else {
            return false;
        };
        entry.queued.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("natter_client_sub_queue_len").increment(1.0);
        if entry.tx.send(msg).is_ok() {
            return true;
        }
        // The dispatch task is gone (its handler panicked).
        entry.queued.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("natter_client_sub_queue_len").decrement(1.0);
        entries.remove(&sid);
        tracing::debug!(sid, "dropping subscription with dead dispatch task");
        false
    }

    /// Removing an entry closes its queue; the task drains and exits.
    pub(crate) fn remove(&self, sid: u64) -> bool {
        self.entries.lock().remove(&sid).is_some()
    }

    pub(crate) fn clear(&self) {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "cleared subscriptions");
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, sid: u64) -> bool {
        self.entries.lock().contains_key(&sid)
    }
}

async fn run_dispatch<F, Fut>(
    sid: u64,
    mut rx: mpsc::UnboundedReceiver<Msg>,
    queued: Arc<AtomicUsize>,
    handler: F,
) where
    F: Fn(Msg) -> Fut,
    Fut: Future<Output = ()>,
{
    while let Some(msg) = rx.recv().await {
        queued.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("natter_client_sub_queue_len").decrement(1.0);
        handler(msg).await;
    }
    tracing::debug!(sid, "subscription dispatch stopped");
}

/// Handle to a live subscription. Dropping it leaves the subscription active;
/// call [`Subscription::unsubscribe`] to end it.
pub struct Subscription {
    sid: u64,
    subject: Arc<str>,
    queued: Arc<AtomicUsize>,
    registry: Arc<SubscriptionRegistry>,
    connection: Arc<Connection>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        sid: u64,
        subject: &str,
        queued: Arc<AtomicUsize>,
        registry: Arc<SubscriptionRegistry>,
        connection: Arc<Connection>,
    ) -> Self {
        Self {
            sid,
            subject: Arc::from(subject),
            queued,
            registry,
            connection,
        }
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Messages received but not yet handed to the handler.
    pub fn pending_messages(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Stops routing to this subscription and tells the server. Messages
    /// already queued are still delivered.
    pub async fn unsubscribe(self) -> Result<()> {
        if !self.registry.remove(self.sid) {
            return Ok(());
        }
        let mut frame = BytesMut::with_capacity(24);
        natter_wire::encode_unsub(&mut frame, self.sid);
        self.connection.write_and_flush(&frame).await
    }
}
