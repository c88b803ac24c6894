// Minimal in-test server: accepts connections, tracks subscriptions and
// routes every PUB to matching subscribers (including the publisher).
#![allow(dead_code)]
use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use natter_wire::ClientOp;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Route {
    conn_id: u64,
    sid: u64,
    subject: String,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct Hub {
    routes: Mutex<Vec<Route>>,
}

impl Hub {
    fn route(&self, subject: &str, reply: Option<&str>, payload: &[u8]) {
        let routes = self.routes.lock();
        for route in routes.iter().filter(|route| subject_matches(&route.subject, subject)) {
            let mut frame = BytesMut::new();
            if natter_wire::encode_msg_header(&mut frame, subject, route.sid, reply, payload.len())
                .is_err()
            {
                continue;
            }
            frame.extend_from_slice(payload);
            frame.extend_from_slice(natter_wire::CRLF);
            let _ = route.tx.send(frame.freeze());
        }
    }

    fn drop_connection(&self, conn_id: u64) {
        self.routes.lock().retain(|route| route.conn_id != conn_id);
    }
}

/// `*` matches one token, a trailing `>` matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match (token, subject_tokens.next()) {
            (">", Some(_)) => return true,
            ("*", Some(_)) => {}
            (literal, Some(actual)) if literal == actual => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

pub struct LoopbackServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

// Honors RUST_LOG when debugging a failing test; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl LoopbackServer {
    pub async fn start() -> Result<Self> {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind loopback")?;
        let addr = listener.local_addr()?;
        let hub = Arc::new(Hub::default());
        let next_conn = Arc::new(AtomicU64::new(1));
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_id = next_conn.fetch_add(1, Ordering::Relaxed);
                let hub = Arc::clone(&hub);
                tokio::spawn(async move {
                    if let Err(err) = serve(stream, conn_id, Arc::clone(&hub)).await {
                        tracing::debug!(error = %err, conn_id, "loopback connection ended");
                    }
                    hub.drop_connection(conn_id);
                });
            }
        });
        Ok(Self { addr, task })
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, conn_id: u64, hub: Arc<Hub>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let info = natter_wire::ServerInfo {
        server_id: "loopback".to_string(),
        version: "0.0.0".to_string(),
        max_payload: 1024 * 1024,
        ..Default::default()
    };
    let _ = tx.send(Bytes::from(format!(
        "INFO {}\r\n",
        serde_json::to_string(&info)?
    )));

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        match ClientOp::parse(&line)? {
            ClientOp::Connect(_) => {}
            ClientOp::Pub(args) => {
                let mut payload = vec![0u8; args.size + 2];
                reader.read_exact(&mut payload).await?;
                if &payload[args.size..] != natter_wire::CRLF {
                    bail!("missing payload terminator");
                }
                hub.route(args.subject, args.reply, &payload[..args.size]);
            }
            ClientOp::Sub { subject, sid, .. } => {
                hub.routes.lock().push(Route {
                    conn_id,
                    sid,
                    subject: subject.to_string(),
                    tx: tx.clone(),
                });
            }
            ClientOp::Unsub { sid, .. } => {
                hub.routes
                    .lock()
                    .retain(|route| !(route.conn_id == conn_id && route.sid == sid));
            }
            ClientOp::Ping => {
                let _ = tx.send(Bytes::from_static(natter_wire::PONG));
            }
            ClientOp::Pong => {}
            ClientOp::Unknown(op) => bail!("unknown op {op}"),
        }
    }
    drop(tx);
    writer.abort();
    Ok(())
}
