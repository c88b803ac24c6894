// Client handle: connection setup, publish/subscribe/request, and the
// protocol hooks driven by the parser loop.
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use natter_wire::{ConnectOptions, ServerInfo};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{OnceCell, watch};
use tokio_util::sync::CancellationToken;

use crate::client::connection::{Connection, run_flusher};
use crate::client::request::RequestMux;
use crate::client::subscription::{Msg, Subscription, SubscriptionRegistry};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::wire::{ParserLimits, ProtocolHandler, run_parser_loop};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// `reason` is the read-path error that ended the connection, or `None`
    /// after an explicit [`Client::close`].
    Closed { reason: Option<String> },
}

/// A connection to one server. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    connection: Arc<Connection>,
    registry: Arc<SubscriptionRegistry>,
    requests: Arc<RequestMux>,
    mux_subscription: OnceCell<Subscription>,
    server_info: Mutex<Option<ServerInfo>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs, config: ClientConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::ConnectTimeout(timeout))??;
        stream.set_nodelay(true)?;
        tracing::debug!(peer = ?stream.peer_addr().ok(), "connected");
        Self::from_stream(stream, config).await
    }

    /// Runs the protocol over an already established byte stream.
    pub async fn from_stream<S>(stream: S, config: ClientConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_parts(read_half, write_half, config).await
    }

    pub(crate) async fn from_parts<R, W>(reader: R, writer: W, config: ClientConfig) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (connection, flush_rx) = Connection::new(
            Box::new(writer),
            config.write_buffer_bytes,
            config.flush_queue_depth,
        );
        let connection = Arc::new(connection);

        let mut handshake = BytesMut::with_capacity(64);
        ConnectOptions {
            name: config.name.clone(),
            ..ConnectOptions::default()
        }
        .encode(&mut handshake)?;
        connection.write_and_flush(&handshake).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let inner = Arc::new(ClientInner {
            connection: Arc::clone(&connection),
            registry: Arc::new(SubscriptionRegistry::new()),
            requests: Arc::new(RequestMux::new(&config.inbox_prefix)),
            mux_subscription: OnceCell::new(),
            server_info: Mutex::new(None),
            state_tx,
            shutdown_tx,
        });

        tokio::spawn(run_flusher(connection, flush_rx, shutdown_rx.clone()));

        let limits = ParserLimits::from(&config);
        let reader = BufReader::with_capacity(config.read_buffer_bytes.max(1), reader);
        let handler = Arc::clone(&inner);
        tokio::spawn(async move {
            run_parser_loop(reader, &*handler, limits, shutdown_rx).await;
        });

        Ok(Self { inner })
    }

    pub async fn publish(&self, subject: &str, payload: impl AsRef<[u8]>) -> Result<()> {
        self.inner
            .connection
            .write_pub(subject, None, payload.as_ref())
            .await?;
        metrics::counter!("natter_client_publish_total").increment(1);
        Ok(())
    }

    /// Publishes with a reply-to subject, for responders answering a
    /// request or callers managing their own inboxes.
    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl AsRef<[u8]>,
    ) -> Result<()> {
        self.inner
            .connection
            .write_pub(subject, Some(reply), payload.as_ref())
            .await?;
        metrics::counter!("natter_client_publish_total").increment(1);
        Ok(())
    }

    /// Subscribes `handler` to `subject`. Messages for one subscription are
    /// handled one at a time, in arrival order.
    pub async fn subscribe<F, Fut>(&self, subject: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(Msg) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let registry = &self.inner.registry;
        let sid = registry.allocate_sid();
        let mut frame = BytesMut::with_capacity(subject.len() + 32);
        natter_wire::encode_sub(&mut frame, subject, sid)?;

        // Registered before SUB is written so no early MSG finds an unknown sid.
        let queued = registry.register(sid, handler);
        if self.is_closed() {
            registry.remove(sid);
            return Err(ClientError::ConnectionClosed);
        }
        if let Err(err) = self.inner.connection.write_and_flush(&frame).await {
            registry.remove(sid);
            return Err(err);
        }
        tracing::debug!(sid, subject, "subscribed");
        Ok(Subscription::new(
            sid,
            subject,
            queued,
            Arc::clone(registry),
            Arc::clone(&self.inner.connection),
        ))
    }

    /// Publishes `payload` with a private reply subject and waits up to
    /// `timeout` for the first response.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> Result<Bytes> {
        let deadline = tokio::time::Instant::now() + timeout;
        let result = self
            .request_until(subject, payload.as_ref(), async move {
                tokio::time::sleep_until(deadline).await;
                ClientError::RequestTimeout
            })
            .await;
        if matches!(result, Err(ClientError::RequestTimeout)) {
            metrics::counter!("natter_client_request_timeouts_total").increment(1);
        }
        result
    }

    /// Like [`Client::request`], but abandoned when `cancel` fires instead of
    /// after a fixed timeout.
    pub async fn request_with_cancel(
        &self,
        subject: &str,
        payload: impl AsRef<[u8]>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        self.request_until(subject, payload.as_ref(), async {
            cancel.cancelled().await;
            ClientError::RequestCancelled
        })
        .await
    }

    async fn request_until(
        &self,
        subject: &str,
        payload: &[u8],
        give_up: impl Future<Output = ClientError>,
    ) -> Result<Bytes> {
        natter_wire::validate_subject(subject)?;
        self.ensure_request_mux().await?;
        metrics::counter!("natter_client_requests_total").increment(1);

        let (pending, response_rx) = self.inner.requests.register();
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        self.inner
            .connection
            .write_pub(subject, Some(pending.reply_subject()), payload)
            .await?;
        metrics::counter!("natter_client_publish_total").increment(1);

        let result = tokio::select! {
            response = response_rx => response.map_err(|_| ClientError::ConnectionClosed),
            err = give_up => Err(err),
        };
        drop(pending);
        result
    }

    async fn ensure_request_mux(&self) -> Result<()> {
        self.inner
            .mux_subscription
            .get_or_try_init(|| async {
                let mux = Arc::clone(&self.inner.requests);
                self.subscribe(&mux.wildcard(), move |msg| {
                    mux.resolve(msg);
                    std::future::ready(())
                })
                .await
            })
            .await?;
        Ok(())
    }

    /// The most recent `INFO` sent by the server, if any.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.server_info.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), ConnectionState::Closed { .. })
    }

    /// Resolves once the connection is closed, with the error that closed it
    /// (`None` after [`Client::close`]).
    pub async fn closed(&self) -> Option<String> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let state = state_rx
            .wait_for(|state| matches!(state, ConnectionState::Closed { .. }))
            .await
            .ok()?;
        match &*state {
            ConnectionState::Closed { reason } => reason.clone(),
            ConnectionState::Connected => None,
        }
    }

    /// Flushes buffered frames, closes the connection and fails everything
    /// still waiting on it.
    pub async fn close(&self) {
        self.inner.teardown(None);
        self.inner.connection.shutdown().await;
    }

    #[cfg(test)]
    pub(crate) fn pending_requests(&self) -> usize {
        self.inner.requests.pending_len()
    }

    #[cfg(test)]
    pub(crate) fn has_subscription(&self, sid: u64) -> bool {
        self.inner.registry.contains(sid)
    }

    // Closed state without giving up the writer, as seen by callers that
    // run while `close` or the read loop is still shutting the connection.
    #[cfg(test)]
    pub(crate) fn mark_closed(&self, reason: &str) {
        self.inner.teardown(Some(reason.to_string()));
    }
}

impl ClientInner {
    // The state flips to closed before anything is cleared; `subscribe` and
    // `request_until` re-check it after registering.
    fn teardown(&self, reason: Option<String>) {
        let first = self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Closed { reason };
                true
            } else {
                false
            }
        });
        self.shutdown_tx.send_replace(true);
        self.registry.clear();
        self.requests.fail_all();
        if first {
            tracing::debug!("client connection closed");
        }
    }
}

#[async_trait]
impl ProtocolHandler for ClientInner {
    fn process_info(&self, info: &str) {
        match ServerInfo::parse(info) {
            Ok(info) => {
                tracing::debug!(
                    server_id = %info.server_id,
                    version = %info.version,
                    max_payload = info.max_payload,
                    "server info"
                );
                *self.server_info.lock() = Some(info);
            }
            Err(err) => tracing::warn!(error = %err, "ignoring malformed server info"),
        }
    }

    fn process_msg(&self, msg: Msg) {
        metrics::counter!("natter_client_msgs_received_total").increment(1);
        let sid = msg.sid;
        if !self.registry.dispatch(msg) {
            metrics::counter!("natter_client_msgs_dropped_total").increment(1);
            tracing::debug!(sid, "dropping message for unknown subscription");
        }
    }

    async fn process_ping(&self) {
        if let Err(err) = self.connection.write_and_flush(natter_wire::PONG).await {
            tracing::debug!(error = %err, "failed to answer server ping");
        }
    }

    fn process_pong(&self) {
        tracing::trace!("pong");
    }

    fn process_err(&self, message: &str) {
        tracing::warn!(message, "server reported error");
    }

    async fn process_op_err(&self, err: ClientError) {
        tracing::warn!(error = %err, "connection read loop stopped");
        self.teardown(Some(err.to_string()));
        self.connection.shutdown().await;
    }
}
