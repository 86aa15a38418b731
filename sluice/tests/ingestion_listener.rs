//! Ingestion listener lifecycle over real TCP connections

use serde_json::json;
use sluice::ingestion::{IngestionChannel, IngestionError, IngestionListener};
use sluice::ListenerConfig;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn wait_for_len(channel: &IngestionChannel, len: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while channel.len() < len {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("channel never reached {} records", len));
}

#[tokio::test]
async fn test_start_returns_once_accepting() {
    init_tracing();
    let channel = IngestionChannel::new(16);
    let listener = IngestionListener::new(channel.clone(), ListenerConfig::default());

    let addr = listener.start(Duration::from_secs(5)).await.unwrap();
    assert!(listener.is_running());

    // No retry loop: the first connect must succeed.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"{\"id\":1}\n").await.unwrap();
    wait_for_len(&channel, 1).await;

    listener.stop().await;
    assert!(!listener.is_running());
}

#[tokio::test]
async fn test_records_from_several_connections_land_in_channel() {
    init_tracing();
    let channel = IngestionChannel::new(64);
    let listener = IngestionListener::new(channel.clone(), ListenerConfig::default());
    let addr = listener.serve().await.unwrap();

    let mut senders = Vec::new();
    for conn in 0..3 {
        senders.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            for i in 0..5 {
                let line = format!("{}\n", json!({"conn": conn, "seq": i}));
                stream.write_all(line.as_bytes()).await.unwrap();
            }
            // Garbage in the middle of a stream is skipped.
            stream.write_all(b"{broken\n").await.unwrap();
            stream.shutdown().await.unwrap();
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }

    wait_for_len(&channel, 15).await;
    let records = channel.drain();
    assert_eq!(records.len(), 15);
    for conn in 0..3 {
        let seqs: Vec<_> = records
            .iter()
            .filter(|r| r["conn"] == json!(conn))
            .map(|r| r["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    listener.stop().await;
}

#[tokio::test]
async fn test_full_queue_keeps_accepted_records() {
    init_tracing();
    let channel = IngestionChannel::new(2);
    let listener = IngestionListener::new(channel.clone(), ListenerConfig::default());
    let addr = listener.serve().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n")
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    wait_for_len(&channel, 2).await;
    // Give the connection time to read (and reject) the third line.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(channel.drain(), vec![json!({"n": 1}), json!({"n": 2})]);

    listener.stop().await;
}

#[tokio::test]
async fn test_stop_marks_channel_stopped() {
    init_tracing();
    let channel = IngestionChannel::new(4);
    let listener = IngestionListener::new(
        channel.clone(),
        ListenerConfig::default().with_stop_grace(Duration::from_millis(500)),
    );
    listener.serve().await.unwrap();
    assert_eq!(channel.health().status, "ok");

    listener.stop().await;
    assert!(!listener.is_running());
    let health = channel.health();
    assert_eq!(health.status, "stopped");
    assert_eq!(health.queue_size, 0);
    assert!(matches!(channel.push(json!(1)), Err(IngestionError::Stopped)));
}

#[tokio::test]
async fn test_restart_after_stop_accepts_records_again() {
    init_tracing();
    let channel = IngestionChannel::new(8);
    let listener = IngestionListener::new(channel.clone(), ListenerConfig::default());

    listener.serve().await.unwrap();
    listener.stop().await;
    assert_eq!(channel.health().status, "stopped");

    let addr = listener.serve().await.unwrap();
    assert!(listener.is_running());
    assert_eq!(channel.health().status, "ok");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"{\"after\":\"restart\"}\n").await.unwrap();
    stream.shutdown().await.unwrap();
    wait_for_len(&channel, 1).await;
    assert_eq!(channel.drain(), vec![json!({"after": "restart"})]);

    listener.stop().await;
}
