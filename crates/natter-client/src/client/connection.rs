// Write half of a client connection.
//
// Every outbound frame is appended whole to one pending buffer behind an async
// mutex, so PUB, SUB, UNSUB and the PING auto-reply can never interleave on the
// wire. A writer cancelled mid-drain leaves the unsent suffix in the buffer and
// the next writer sends it first. Publishes only buffer; a single flusher task
// coalesces any number of them into one flush. SUB, UNSUB, CONNECT and PONG
// flush inline.
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, watch};

use crate::error::{ClientError, Result};

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Outbound {
    io: BoxedWriter,
    // Encoded frames not yet accepted by `io`.
    pending: BytesMut,
    high_water: usize,
}

impl Outbound {
    async fn drain(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            // `write_buf` advances `pending` only by what `io` accepted.
            if self.io.write_buf(&mut self.pending).await? == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
        }
        Ok(())
    }

    async fn drain_and_flush(&mut self) -> io::Result<()> {
        self.drain().await?;
        self.io.flush().await
    }
}

pub(crate) struct Connection {
    // `None` once the connection is closed.
    writer: Mutex<Option<Outbound>>,
    flush_tx: mpsc::Sender<()>,
}

impl Connection {
    pub(crate) fn new(
        writer: BoxedWriter,
        write_buffer_bytes: usize,
        flush_queue_depth: usize,
    ) -> (Self, mpsc::Receiver<()>) {
        let (flush_tx, flush_rx) = mpsc::channel(flush_queue_depth.max(1));
        let high_water = write_buffer_bytes.max(1);
        let connection = Self {
            writer: Mutex::new(Some(Outbound {
                io: writer,
                pending: BytesMut::with_capacity(high_water),
                high_water,
            })),
            flush_tx,
        };
        (connection, flush_rx)
    }

    /// Buffers one PUB frame and nudges the flusher. Sends buffered bytes
    /// inline once they pass the write buffer size.
    pub(crate) async fn write_pub(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
    ) -> Result<()> {
        let mut header = BytesMut::with_capacity(subject.len() + 32);
        natter_wire::encode_pub_header(&mut header, subject, reply, payload.len())?;
        {
            let mut guard = self.writer.lock().await;
            let out = guard.as_mut().ok_or(ClientError::ConnectionClosed)?;
            out.pending.reserve(header.len() + payload.len() + 2);
            out.pending.extend_from_slice(&header);
            out.pending.extend_from_slice(payload);
            out.pending.extend_from_slice(natter_wire::CRLF);
            if out.pending.len() >= out.high_water {
                out.drain().await?;
            }
        }
        self.signal_flush();
        Ok(())
    }

    /// Writes a complete frame and flushes it before releasing the lock.
    pub(crate) async fn write_and_flush(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let out = guard.as_mut().ok_or(ClientError::ConnectionClosed)?;
        out.pending.extend_from_slice(frame);
        out.drain_and_flush().await?;
        Ok(())
    }

    // Only the first publish after a flush enqueues a signal; later ones see
    // a pending signal and skip. A full queue is never waited on.
    fn signal_flush(&self) {
        if self.flush_tx.capacity() == self.flush_tx.max_capacity() {
            let _ = self.flush_tx.try_send(());
        }
    }

    /// Flushes buffered bytes; returns whether there was anything to flush.
    async fn flush_buffered(&self) -> Result<bool> {
        let mut guard = self.writer.lock().await;
        let out = guard.as_mut().ok_or(ClientError::ConnectionClosed)?;
        if out.pending.is_empty() {
            return Ok(false);
        }
        out.drain_and_flush().await?;
        Ok(true)
    }

    /// Flushes what is buffered (best effort), shuts the write half down and
    /// refuses all further writes.
    pub(crate) async fn shutdown(&self) {
        let Some(mut out) = self.writer.lock().await.take() else {
            return;
        };
        if let Err(err) = out.drain_and_flush().await {
            tracing::debug!(error = %err, "final flush failed");
        }
        if let Err(err) = out.io.shutdown().await {
            tracing::debug!(error = %err, "write half shutdown failed");
        }
    }
}

pub(crate) async fn run_flusher(
    connection: Arc<Connection>,
    mut flush_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => break,
            signal = flush_rx.recv() => {
                if signal.is_none() {
                    break;
                }
                match connection.flush_buffered().await {
                    Ok(true) => metrics::counter!("natter_client_flush_total").increment(1),
                    Ok(false) => {}
                    Err(ClientError::ConnectionClosed) => break,
                    Err(err) => {
                        metrics::counter!("natter_client_flush_errors_total").increment(1);
                        tracing::debug!(error = %err, "coalesced flush failed");
                    }
                }
            }
        }
    }
    tracing::debug!("flusher stopped");
}
