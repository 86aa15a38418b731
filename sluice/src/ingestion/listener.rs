//! Newline-delimited JSON over TCP, feeding an [`IngestionChannel`].

use super::channel::IngestionChannel;
use super::error::{IngestionError, Result};
use crate::config::ListenerConfig;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of the accept loop, published through a watch cell.
#[derive(Debug, Clone)]
enum ListenerState {
    Starting,
    Ready(SocketAddr),
    BindFailed(std::io::ErrorKind, String),
    Stopped,
}

struct Running {
    addr: Option<SocketAddr>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: watch::Receiver<ListenerState>,
}

/// TCP source that parses one JSON record per line into a channel.
///
/// Malformed lines are logged and skipped. Records arriving while the
/// channel is full are logged and dropped by the listener; the channel
/// itself never drops a record it accepted.
pub struct IngestionListener {
    channel: IngestionChannel,
    config: ListenerConfig,
    running: Mutex<Option<Running>>,
}

impl IngestionListener {
    pub fn new(channel: IngestionChannel, config: ListenerConfig) -> Self {
        Self {
            channel,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &IngestionChannel {
        &self.channel
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts with the configured `start_timeout`.
    pub async fn serve(&self) -> Result<SocketAddr> {
        self.start(self.config.start_timeout).await
    }

    /// Binds and spawns the accept loop.
    ///
    /// Returns the bound address once the loop is accepting connections, or
    /// the bind error the loop reported. Gives up after `timeout`.
    pub async fn start(&self, timeout: Duration) -> Result<SocketAddr> {
        let mut state = {
            let mut running = self.running();
            if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
                return Err(IngestionError::AlreadyRunning);
            }

            let (state_tx, state_rx) = watch::channel(ListenerState::Starting);
            let cancel = CancellationToken::new();
            let task = tokio::spawn(accept_loop(
                self.config.bind_addr,
                self.channel.clone(),
                cancel.clone(),
                state_tx,
            ));
            *running = Some(Running {
                addr: None,
                cancel,
                task,
                state: state_rx.clone(),
            });
            state_rx
        };

        let outcome = tokio::time::timeout(
            timeout,
            state.wait_for(|s| !matches!(s, ListenerState::Starting)),
        )
        .await
        .map(|waited| waited.map(|s| s.clone()));

        match outcome {
            Ok(Ok(ListenerState::Ready(addr))) => {
                if let Some(running) = self.running().as_mut() {
                    running.addr = Some(addr);
                }
                info!("Ingestion listener started on {}", addr);
                Ok(addr)
            }
            Ok(Ok(ListenerState::BindFailed(kind, message))) => {
                self.discard();
                Err(IngestionError::Bind(std::io::Error::new(kind, message)))
            }
            // The loop exited (or was dropped) before it became ready.
            Ok(Ok(ListenerState::Starting | ListenerState::Stopped)) | Ok(Err(_)) => {
                self.discard();
                Err(IngestionError::Stopped)
            }
            Err(_) => {
                self.discard();
                Err(IngestionError::StartTimeout(timeout))
            }
        }
    }

    fn discard(&self) {
        if let Some(running) = self.running().take() {
            running.cancel.cancel();
            running.task.abort();
        }
    }

    /// Stops accepting connections and closes the channel.
    ///
    /// Waits up to `stop_grace` for open connections to wind down, then
    /// aborts the loop.
    pub async fn stop(&self) {
        let Some(mut running) = self.running().take() else {
            return;
        };
        running.cancel.cancel();
        if tokio::time::timeout(self.config.stop_grace, &mut running.task)
            .await
            .is_err()
        {
            warn!(
                "Ingestion listener did not stop within {:?}, aborting",
                self.config.stop_grace
            );
            running.task.abort();
        }
        self.channel.close();
        info!("Ingestion listener stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running().as_ref().is_some_and(|r| {
            !r.task.is_finished() && matches!(*r.state.borrow(), ListenerState::Ready(_))
        })
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().as_ref().and_then(|r| r.addr)
    }
}

impl Drop for IngestionListener {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(running) = running.take() {
            running.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for IngestionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionListener")
            .field("bind_addr", &self.config.bind_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn accept_loop(
    bind_addr: SocketAddr,
    channel: IngestionChannel,
    cancel: CancellationToken,
    state: watch::Sender<ListenerState>,
) {
    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind ingestion listener on {}: {}", bind_addr, e);
            state.send_replace(ListenerState::BindFailed(e.kind(), e.to_string()));
            return;
        }
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            state.send_replace(ListenerState::BindFailed(e.kind(), e.to_string()));
            return;
        }
    };
    // A previous stop closed the channel.
    channel.reopen();
    state.send_replace(ListenerState::Ready(addr));

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted ingestion connection from {}", peer);
                    connections.spawn(read_records(stream, peer, channel.clone(), cancel.clone()));
                }
                Err(e) => {
                    error!("Ingestion listener accept error: {}", e);
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    state.send_replace(ListenerState::Stopped);
}

async fn read_records(
    stream: TcpStream,
    peer: SocketAddr,
    channel: IngestionChannel,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Ingestion connection from {} failed: {}", peer, e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record = match parse_record(line) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping record from {}: {}", peer, e);
                continue;
            }
        };
        match channel.push(record) {
            Ok(()) => {}
            Err(IngestionError::Stopped) => break,
            Err(e) => warn!("Dropping record from {}: {}", peer, e),
        }
    }
    debug!("Ingestion connection from {} closed", peer);
}

fn parse_record(line: &str) -> Result<serde_json::Value> {
    Ok(serde_json::from_str(line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    fn listener(capacity: usize) -> IngestionListener {
        IngestionListener::new(IngestionChannel::new(capacity), ListenerConfig::default())
    }

    async fn next(channel: &IngestionChannel) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(5), channel.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_accepts_and_stop_closes() {
        let listener = listener(16);
        assert!(!listener.is_running());

        let addr = listener.start(Duration::from_secs(5)).await.unwrap();
        assert!(listener.is_running());
        assert_eq!(listener.local_addr(), Some(addr));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"{\"id\":1}\nnot json\n\n{\"id\":2}\n")
            .await
            .unwrap();
        stream.flush().await.unwrap();

        let channel = listener.channel().clone();
        assert_eq!(next(&channel).await, json!({"id": 1}));
        assert_eq!(next(&channel).await, json!({"id": 2}));

        listener.stop().await;
        assert!(!listener.is_running());
        assert_eq!(listener.local_addr(), None);
        assert_eq!(channel.health().status, "stopped");
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let listener = listener(4);
        listener.serve().await.unwrap();
        assert!(matches!(
            listener.start(Duration::from_secs(1)).await,
            Err(IngestionError::AlreadyRunning)
        ));
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let first = listener(4);
        let addr = first.serve().await.unwrap();

        let second = IngestionListener::new(
            IngestionChannel::new(4),
            ListenerConfig::default().with_bind_addr(addr),
        );
        let err = second.serve().await.unwrap_err();
        assert!(matches!(err, IngestionError::Bind(_)));
        assert!(!second.is_running());

        first.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let listener = listener(4);
        listener.stop().await;
        assert!(!listener.is_running());
        assert_eq!(listener.channel().health().status, "ok");
    }
}
