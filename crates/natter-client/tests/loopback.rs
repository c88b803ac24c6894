// End-to-end tests over TCP against the in-test loopback server.
mod common;

use anyhow::{Context, Result};
use bytes::Bytes;
use common::{LoopbackServer, subject_matches};
use natter_client::{Client, ClientConfig, ClientError, Msg};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn connect(server: &LoopbackServer) -> Result<Client> {
    Client::connect(server.addr, ClientConfig::default())
        .await
        .context("connect")
}

// The server routes a PUB only after it has processed the SUB; a round trip
// through the same connection proves that happened.
async fn sync_with_server(client: &Client) -> Result<()> {
    let probe = format!("sync.{}", next_probe_id());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = client
        .subscribe(&probe, move |msg: Msg| {
            let _ = tx.send(msg);
            std::future::ready(())
        })
        .await?;
    client.publish(&probe, b"").await?;
    timeout(WAIT, rx.recv()).await.context("sync round trip")?;
    sub.unsubscribe().await?;
    Ok(())
}

fn next_probe_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[test]
fn wildcard_matching() {
    assert!(subject_matches("a.b", "a.b"));
    assert!(subject_matches("a.*", "a.b"));
    assert!(!subject_matches("a.*", "a.b.c"));
    assert!(subject_matches("a.>", "a.b.c"));
    assert!(subject_matches(">", "hello"));
    assert!(!subject_matches("a.>", "a"));
    assert!(!subject_matches("a.b", "a"));
}

#[tokio::test]
async fn publish_subscribe_over_tcp() -> Result<()> {
    let server = LoopbackServer::start().await?;
    let client = connect(&server).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe("hello", move |msg: Msg| {
            let _ = tx.send(msg);
            std::future::ready(())
        })
        .await?;
    sync_with_server(&client).await?;

    for i in 0..10 {
        client.publish("hello", format!("world {i}")).await?;
    }
    for i in 0..10 {
        let msg = timeout(WAIT, rx.recv())
            .await
            .context("message in time")?
            .context("subscription open")?;
        assert_eq!(msg.subject, "hello");
        assert_eq!(msg.payload, Bytes::from(format!("world {i}")));
    }

    let info = client.server_info().context("server info")?;
    assert_eq!(info.server_id, "loopback");
    client.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_reply_between_clients() -> Result<()> {
    let server = LoopbackServer::start().await?;
    let responder = connect(&server).await?;
    let requester = connect(&server).await?;

    let replier = responder.clone();
    responder
        .subscribe("hi", move |msg: Msg| {
            let replier = replier.clone();
            async move {
                if let Some(reply) = msg.reply {
                    let mut answer = msg.payload.to_vec();
                    answer.push(b'!');
                    let _ = replier.publish(&reply, answer).await;
                }
            }
        })
        .await?;
    sync_with_server(&responder).await?;

    for _ in 0..10 {
        let response = requester
            .request("hi", b"hi", Duration::from_secs(1))
            .await?;
        assert_eq!(response, Bytes::from_static(b"hi!"));
    }
    Ok(())
}

#[tokio::test]
async fn request_without_responder_times_out() -> Result<()> {
    let server = LoopbackServer::start().await?;
    let client = connect(&server).await?;
    let err = client
        .request("nobody.home", b"?", Duration::from_millis(100))
        .await
        .expect_err("no responder");
    assert!(matches!(err, ClientError::RequestTimeout));
    Ok(())
}

#[tokio::test]
async fn wildcard_subscription_sees_everything() -> Result<()> {
    let server = LoopbackServer::start().await?;
    let client = connect(&server).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe("metrics.>", move |msg: Msg| {
            let _ = tx.send(msg.subject);
            std::future::ready(())
        })
        .await?;
    sync_with_server(&client).await?;

    client.publish("metrics.cpu", b"1").await?;
    client.publish("other", b"2").await?;
    client.publish("metrics.mem.rss", b"3").await?;
    let first = timeout(WAIT, rx.recv()).await?.context("first")?;
    let second = timeout(WAIT, rx.recv()).await?.context("second")?;
    assert_eq!((first.as_str(), second.as_str()), ("metrics.cpu", "metrics.mem.rss"));
    Ok(())
}

#[tokio::test]
async fn connecting_to_a_closed_port_fails() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    let err = Client::connect(addr, ClientConfig::default())
        .await
        .err()
        .context("connect should fail")?;
    assert!(matches!(
        err,
        ClientError::Io(_) | ClientError::ConnectTimeout(_)
    ));
    Ok(())
}

#[tokio::test]
async fn close_is_observed_by_clones() -> Result<()> {
    let server = LoopbackServer::start().await?;
    let client = connect(&server).await?;
    sync_with_server(&client).await?;
    let watcher = client.clone();
    let closed = tokio::spawn(async move { watcher.closed().await });
    client.close().await;
    assert_eq!(timeout(WAIT, closed).await??, None);
    assert!(client.is_closed());
    Ok(())
}
