use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::traits::{PublishError, Publisher};

/// Relay-to-broker path.
///
/// Sessions hand payloads over with `publish`, which never waits on the
/// broker: the payload goes into a bounded queue drained by a single task
/// that owns the backend. Failures stay on this side: they are logged and
/// the payload is dropped.
pub struct BrokerPublisher {
    tx: mpsc::Sender<Bytes>,
    available: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Worker {
    backend: Arc<dyn Publisher>,
    available: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
    /// Also bounds every single backend call
    reconnect_interval: Duration,
}

impl BrokerPublisher {
    /// Spawns the publishing task and waits at most `reconnect_interval` for
    /// its first connection attempt. While the broker is down the task keeps
    /// retrying every `reconnect_interval`.
    pub async fn start(
        backend: Arc<dyn Publisher>,
        capacity: usize,
        reconnect_interval: Duration,
    ) -> Self {
        let available = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shutdown_token = CancellationToken::new();
        let (first_attempt_tx, first_attempt_rx) = oneshot::channel();

        let worker = Worker {
            backend,
            available: Arc::clone(&available),
            shutdown_token: shutdown_token.clone(),
            reconnect_interval,
        };
        let handle = tokio::spawn(worker.run(rx, first_attempt_tx));

        if timeout(reconnect_interval, first_attempt_rx).await.is_err() {
            warn!(
                "Broker publisher still connecting after {:?}, continuing in background",
                reconnect_interval
            );
        }

        Self {
            tx,
            available,
            shutdown_token,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        if self.shutdown_token.is_cancelled() {
            return Err(PublishError::Closed);
        }
        if !self.is_available() {
            return Err(PublishError::Unavailable(
                "broker connection is down".to_string(),
            ));
        }

        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => PublishError::Backlogged,
            TrySendError::Closed(_) => PublishError::Closed,
        })
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Idempotent. Payloads still queued are flushed before the backend
    /// closes, each backend call bounded by the reconnect interval.
    pub async fn stop(&self) {
        self.shutdown_token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.await.unwrap_or_else(|e| {
                error!("Error in waiting for publisher task {e}");
            });
        }
    }
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Bytes>, first_attempt: oneshot::Sender<()>) {
        self.try_connect().await;
        let _ = first_attempt.send(());

        let mut reconnect = interval(self.reconnect_interval);
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reconnect.reset();

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,

                _ = reconnect.tick(), if !self.is_available() => {
                    self.try_connect().await;
                }

                payload = rx.recv() => {
                    let Some(payload) = payload else { break };
                    self.forward(payload).await;
                }
            }
        }

        // Drain what sessions already handed over
        rx.close();
        while let Some(payload) = rx.recv().await {
            self.forward(payload).await;
        }

        if timeout(self.reconnect_interval, self.backend.close())
            .await
            .is_err()
        {
            warn!("Broker publisher close timed out");
        }
        info!("Broker publisher stopped");
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    async fn try_connect(&self) {
        let connected = tokio::select! {
            _ = self.shutdown_token.cancelled() => return,
            connected = timeout(self.reconnect_interval, self.backend.connect()) => connected,
        };

        match connected {
            Ok(Ok(())) => {
                info!("Broker publisher connected");
                self.available.store(true, Ordering::Release);
            }
            Ok(Err(e)) => {
                error!("Broker publisher failed to connect: {e}");
                self.available.store(false, Ordering::Release);
            }
            Err(_) => {
                error!(
                    "Broker publisher connect timed out after {:?}",
                    self.reconnect_interval
                );
                self.available.store(false, Ordering::Release);
            }
        }
    }

    async fn forward(&self, payload: Bytes) {
        if !self.is_available() {
            warn!(
                "Broker unavailable, dropping {} byte payload",
                payload.len()
            );
            return;
        }

        let len = payload.len();
        match timeout(self.reconnect_interval, self.backend.publish(payload)).await {
            Ok(Ok(())) => debug!("Published payload to broker"),
            Ok(Err(e)) => {
                error!("Broker publish failed: {e}");
                self.available.store(false, Ordering::Release);
            }
            Err(_) => {
                error!("Broker publish of {len} bytes timed out");
                self.available.store(false, Ordering::Release);
            }
        }
    }
}
