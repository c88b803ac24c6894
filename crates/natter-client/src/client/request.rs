// Request/reply multiplexing over one wildcard inbox subscription.
use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::client::Msg;

const PREFIX_TOKEN_BYTES: usize = 11;
const REQUEST_TOKEN_BYTES: usize = 11;

/// Routes responses arriving on `<prefix>.<token>` to the waiting caller.
pub(crate) struct RequestMux {
    prefix: String,
    pending: Mutex<HashMap<String, oneshot::Sender<Bytes>>>,
}

impl RequestMux {
    pub(crate) fn new(inbox_prefix: &str) -> Self {
        Self {
            prefix: format!("{inbox_prefix}.{}", random_hex(PREFIX_TOKEN_BYTES)),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Subject the mux subscribes to once per client.
    pub(crate) fn wildcard(&self) -> String {
        format!("{}.*", self.prefix)
    }

    pub(crate) fn register(self: &Arc<Self>) -> (PendingRequest, oneshot::Receiver<Bytes>) {
        let (tx, rx) = oneshot::channel();
        let token = random_hex(REQUEST_TOKEN_BYTES);
        let reply = format!("{}.{token}", self.prefix);
        self.pending.lock().insert(token.clone(), tx);
        let guard = PendingRequest {
            mux: Arc::clone(self),
            token,
            reply,
        };
        (guard, rx)
    }

    /// Delivers a response to its waiter; each token resolves at most once.
    pub(crate) fn resolve(&self, msg: Msg) {
        let Some(token) = msg
            .subject
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            tracing::debug!(subject = %msg.subject, "response outside inbox prefix");
            return;
        };
        let slot = self.pending.lock().remove(token);
        let delivered = match slot {
            Some(tx) => tx.send(msg.payload).is_ok(),
            None => false,
        };
        if !delivered {
            metrics::counter!("natter_client_late_responses_total").increment(1);
            tracing::debug!(token, "discarding response with no waiting request");
        }
    }

    /// Drops every waiter; their receivers observe a closed channel.
    pub(crate) fn fail_all(&self) {
        self.pending.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Keeps a response slot registered; removes it when dropped, whether the
/// request completed, timed out, or was cancelled.
pub(crate) struct PendingRequest {
    mux: Arc<RequestMux>,
    token: String,
    reply: String,
}

impl PendingRequest {
    pub(crate) fn reply_subject(&self) -> &str {
        &self.reply
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.mux.pending.lock().remove(&self.token);
    }
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
