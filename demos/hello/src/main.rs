//! Hello-world demo against a running natter-compatible server.
//!
//! # Purpose
//! Exercises publish, a wildcard subscriber, and request/reply on one
//! connection: ten `hello` publishes, a responder on `hi`, then ten requests.
//!
//! # Notes
//! The server address comes from the first argument, then `NATTER_ADDR`,
//! then `127.0.0.1:4222`. Log verbosity follows `RUST_LOG` (default `info`).
use anyhow::{Context, Result};
use natter_client::{Client, ClientConfig, Msg};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_ADDR: &str = "127.0.0.1:4222";
const EXPECTED_MESSAGES: usize = 20;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// Counts deliveries across both counting subscriptions and wakes main once
// the expected total has arrived.
#[derive(Clone)]
struct Tally {
    received: Arc<AtomicUsize>,
    done: Arc<Notify>,
}

impl Tally {
    fn record(&self) {
        if self.received.fetch_add(1, Ordering::SeqCst) + 1 == EXPECTED_MESSAGES {
            self.done.notify_one();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("NATTER_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let config = ClientConfig::from_env_or_yaml(None).context("load client config")?;
    let client = Client::connect(addr.as_str(), config)
        .await
        .with_context(|| format!("connect to {addr}"))?;

    let tally = Tally {
        received: Arc::new(AtomicUsize::new(0)),
        done: Arc::new(Notify::new()),
    };

    client
        .subscribe("hello", {
            let tally = tally.clone();
            move |msg: Msg| {
                tracing::info!(payload = %String::from_utf8_lossy(&msg.payload), "[Received]");
                tally.record();
                std::future::ready(())
            }
        })
        .await?;

    client
        .subscribe(">", {
            let tally = tally.clone();
            move |msg: Msg| {
                let tally = tally.clone();
                async move {
                    tracing::info!(payload = %String::from_utf8_lossy(&msg.payload), "[Wildcard]");
                    tally.record();
                    // A slow handler only delays its own subscription.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        })
        .await?;

    let responder = client.clone();
    client
        .subscribe("hi", move |msg: Msg| {
            let responder = responder.clone();
            async move {
                let Some(reply) = msg.reply else {
                    return;
                };
                tracing::info!(
                    reply = %reply,
                    payload = %String::from_utf8_lossy(&msg.payload),
                    "[Request]"
                );
                if let Err(err) = responder.publish(&reply, b"hi!").await {
                    tracing::warn!(error = %err, "failed to answer request");
                }
            }
        })
        .await?;

    for _ in 0..10 {
        client.publish("hello", b"world").await?;
    }

    for _ in 0..10 {
        let response = client
            .request("hi", b"hello!", Duration::from_secs(1))
            .await
            .context("request hi")?;
        tracing::info!(response = %String::from_utf8_lossy(&response), "[Response]");
    }

    tally.done.notified().await;
    client.close().await;
    Ok(())
}
