use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::traits::{Delivery, DeliverySource, DeliveryStream, SubscribeError};
use crate::protocol::Frame;
use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    Connecting,
    Consuming,
    /// Gave up after repeated declaration failures
    Failed,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    pub reconnect_interval: Duration,
    /// 0 retries declarations forever
    pub max_declare_failures: u32,
    /// Largest frame a delivery may be relayed as, header included
    pub max_frame_length: usize,
}

/// Broker-to-relay path.
///
/// One dedicated task connects, consumes deliveries one at a time and fans
/// each out through the registry. A delivery is acknowledged only after its
/// broadcast has been submitted to every connection in the snapshot; a
/// delivery whose broadcast or ack cannot complete is dropped unacknowledged
/// and left for the broker to redeliver.
pub struct BrokerSubscriber {
    state_rx: watch::Receiver<SubscriberState>,
    shutdown_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

enum ConsumeEnd {
    Shutdown,
    Lost,
}

struct Worker {
    source: Arc<dyn DeliverySource>,
    registry: Arc<ConnectionRegistry>,
    options: SubscriberOptions,
    state_tx: watch::Sender<SubscriberState>,
    shutdown_token: CancellationToken,
}

impl BrokerSubscriber {
    pub fn spawn(
        source: Arc<dyn DeliverySource>,
        registry: Arc<ConnectionRegistry>,
        options: SubscriberOptions,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(SubscriberState::Disconnected);
        let shutdown_token = CancellationToken::new();

        let worker = Worker {
            source,
            registry,
            options,
            state_tx,
            shutdown_token: shutdown_token.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Self {
            state_rx,
            shutdown_token,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn state(&self) -> SubscriberState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state_rx.clone()
    }

    /// Waits until the subscriber reaches `state`; false if it stopped first.
    pub async fn wait_for(&self, state: SubscriberState) -> bool {
        let mut rx = self.state_rx.clone();
        let reached = match rx
            .wait_for(|current| *current == state || *current == SubscriberState::Stopped)
            .await
        {
            Ok(current) => *current == state,
            Err(_) => false,
        };
        reached
    }

    /// Closes the consuming channel and ends the task. Idempotent.
    pub async fn stop(&self) {
        self.shutdown_token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle.await.unwrap_or_else(|e| {
                error!("Error in waiting for subscriber task {e}");
            });
        }
    }
}

impl Worker {
    fn set_state(&self, state: SubscriberState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            info!("Broker subscriber {:?} -> {:?}", *current, state);
            *current = state;
            true
        });
    }

    async fn run(self) {
        let mut declare_failures = 0u32;

        loop {
            self.set_state(SubscriberState::Connecting);

            let connected = tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                connected = self.source.connect() => connected,
            };

            match connected {
                Ok(mut stream) => {
                    declare_failures = 0;
                    info!("Broker subscriber consuming");
                    self.set_state(SubscriberState::Consuming);

                    let end = self.consume(stream.as_mut()).await;
                    stream.close().await;
                    if let ConsumeEnd::Shutdown = end {
                        break;
                    }
                    warn!("Broker subscriber lost its connection");
                }
                Err(SubscribeError::Declare(e)) => {
                    declare_failures += 1;
                    error!(
                        "Broker subscriber declaration failed ({} in a row): {e}",
                        declare_failures
                    );
                    let limit = self.options.max_declare_failures;
                    if limit > 0 && declare_failures >= limit {
                        error!("Broker subscriber giving up after {limit} declaration failures");
                        self.set_state(SubscriberState::Failed);
                        // Stay failed until stopped
                        self.shutdown_token.cancelled().await;
                        break;
                    }
                }
                Err(e) => {
                    error!("Broker subscriber failed to connect: {e}");
                }
            }

            self.set_state(SubscriberState::Disconnected);
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                _ = tokio::time::sleep(self.options.reconnect_interval) => {}
            }
        }

        self.set_state(SubscriberState::Stopped);
        info!("Broker subscriber stopped");
    }

    async fn consume(&self, stream: &mut dyn DeliveryStream) -> ConsumeEnd {
        loop {
            let next = tokio::select! {
                _ = self.shutdown_token.cancelled() => return ConsumeEnd::Shutdown,
                next = stream.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    if let Err(e) = self.relay(delivery).await {
                        error!("Broker subscriber failed to relay delivery: {e}");
                        return ConsumeEnd::Lost;
                    }
                }
                Some(Err(e)) => {
                    error!("Broker subscriber consume error: {e}");
                    return ConsumeEnd::Lost;
                }
                None => return ConsumeEnd::Lost,
            }
        }
    }

    async fn relay(&self, delivery: Delivery) -> Result<(), SubscribeError> {
        // Left unacknowledged, so the broker gets it back when the channel resets
        let frame = Frame::message(delivery.payload().clone());
        if frame.encoded_len() > self.options.max_frame_length {
            return Err(SubscribeError::Relay(format!(
                "{} byte frame exceeds limit of {} bytes",
                frame.encoded_len(),
                self.options.max_frame_length
            )));
        }
        let frame = frame
            .to_bytes()
            .map_err(|e| SubscribeError::Relay(e.to_string()))?;

        let report = self.registry.broadcast(frame);
        info!(
            "Broadcast delivery to {}/{} connections",
            report.submitted, report.attempted
        );

        delivery.ack().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::registry::ConnectionHandle;
    use crate::protocol::DEFAULT_MAX_FRAME_LENGTH;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn options() -> SubscriberOptions {
        SubscriberOptions {
            reconnect_interval: Duration::from_millis(50),
            max_declare_failures: 3,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    fn register(registry: &ConnectionRegistry, id: &str) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(8);
        registry.add(ConnectionHandle::new(
            id.to_string(),
            None,
            tx,
            CancellationToken::new(),
        ));
        rx
    }

    #[tokio::test]
    async fn test_broadcast_then_ack() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let mut rx_a = register(&registry, "a");
        let mut rx_b = register(&registry, "b");

        let subscriber =
            BrokerSubscriber::spawn(Arc::new(broker.clone()), Arc::clone(&registry), options());
        assert!(subscriber.wait_for(SubscriberState::Consuming).await);

        let receipt = broker.deliver("world");
        assert!(receipt.acked().await);

        let expected = Frame::message("world").to_bytes().unwrap();
        assert_eq!(rx_a.recv().await.unwrap(), expected);
        assert_eq!(rx_b.recv().await.unwrap(), expected);

        subscriber.stop().await;
        assert_eq!(subscriber.state(), SubscriberState::Stopped);
    }

    #[tokio::test]
    async fn test_ack_despite_failed_connection() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let mut alive = register(&registry, "alive");
        drop(register(&registry, "dead"));

        let subscriber =
            BrokerSubscriber::spawn(Arc::new(broker.clone()), Arc::clone(&registry), options());

        assert!(broker.deliver("m").acked().await);
        assert!(alive.recv().await.is_some());
        assert!(!registry.contains("dead"));
        subscriber.stop().await;
    }

    #[tokio::test]
    async fn test_acks_with_no_connections() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let subscriber =
            BrokerSubscriber::spawn(Arc::new(broker.clone()), Arc::clone(&registry), options());

        assert!(broker.deliver("nobody").acked().await);
        subscriber.stop().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_outage() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let mut rx = register(&registry, "a");
        let subscriber =
            BrokerSubscriber::spawn(Arc::new(broker.clone()), Arc::clone(&registry), options());
        assert!(subscriber.wait_for(SubscriberState::Consuming).await);

        broker.set_available(false);
        assert!(subscriber.wait_for(SubscriberState::Disconnected).await);

        broker.set_available(true);
        assert!(subscriber.wait_for(SubscriberState::Consuming).await);
        assert!(broker.deliver("again").acked().await);
        assert!(rx.recv().await.is_some());
        assert!(broker.connect_attempts() >= 2);

        subscriber.stop().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_declaration_failures() {
        let broker = MemoryBroker::new();
        broker.reject_declarations(true);
        let registry = Arc::new(ConnectionRegistry::new());
        let subscriber =
            BrokerSubscriber::spawn(Arc::new(broker.clone()), Arc::clone(&registry), options());

        assert!(subscriber.wait_for(SubscriberState::Failed).await);
        assert_eq!(broker.connect_attempts(), 3);

        subscriber.stop().await;
        assert_eq!(subscriber.state(), SubscriberState::Stopped);
        subscriber.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_delivery_resets_channel() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let mut rx = register(&registry, "a");
        let mut options = options();
        options.max_frame_length = 16;
        let subscriber =
            BrokerSubscriber::spawn(Arc::new(broker.clone()), Arc::clone(&registry), options);
        assert!(subscriber.wait_for(SubscriberState::Consuming).await);

        assert!(!broker.deliver(vec![0u8; 64]).acked().await);
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.connect_attempts() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(broker.deliver("ok").acked().await);
        assert_eq!(
            rx.recv().await.unwrap(),
            Frame::message("ok").to_bytes().unwrap()
        );
        subscriber.stop().await;
    }
}
