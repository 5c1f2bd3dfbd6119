use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::broker::traits::{
    Acknowledger, Delivery, DeliverySource, DeliveryStream, PublishError, Publisher,
    SubscribeError,
};

/// Published payloads kept for inspection; older ones are discarded first.
pub const PUBLISHED_CAPACITY: usize = 1024;

struct PendingDelivery {
    payload: Bytes,
    ack_tx: oneshot::Sender<()>,
}

struct Inner {
    available: AtomicBool,
    reject_declare: AtomicBool,
    connect_attempts: AtomicUsize,
    acked: AtomicUsize,
    // Bumped whenever the broker "drops" its connections
    generation: watch::Sender<u64>,
    published_tx: broadcast::Sender<Bytes>,
    published_rx: Mutex<broadcast::Receiver<Bytes>>,
    deliveries_tx: mpsc::UnboundedSender<PendingDelivery>,
    deliveries_rx: Arc<Mutex<mpsc::UnboundedReceiver<PendingDelivery>>>,
}

/// In-process broker backend.
///
/// Records every published payload, lets callers inject deliveries and watch
/// for their acknowledgment, and can simulate outages or rejected
/// declarations. Unacknowledged deliveries are not redelivered.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

/// Resolves once the matching delivery is acknowledged.
pub struct DeliveryReceipt {
    ack_rx: oneshot::Receiver<()>,
}

impl DeliveryReceipt {
    /// `false` if the delivery was dropped without an ack.
    pub async fn acked(self) -> bool {
        self.ack_rx.await.is_ok()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (published_tx, published_rx) = broadcast::channel(PUBLISHED_CAPACITY);
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                available: AtomicBool::new(true),
                reject_declare: AtomicBool::new(false),
                connect_attempts: AtomicUsize::new(0),
                acked: AtomicUsize::new(0),
                generation,
                published_tx,
                published_rx: Mutex::new(published_rx),
                deliveries_tx,
                deliveries_rx: Arc::new(Mutex::new(deliveries_rx)),
            }),
        }
    }

    /// Both halves as trait objects, ready to hand to the server.
    pub fn backends(&self) -> (Arc<dyn Publisher>, Arc<dyn DeliverySource>) {
        (Arc::new(self.clone()), Arc::new(self.clone()))
    }

    /// Taking the broker down also severs every open consumer.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
        if !available {
            self.inner.generation.send_modify(|generation| *generation += 1);
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    pub fn reject_declarations(&self, reject: bool) {
        self.inner.reject_declare.store(reject, Ordering::Release);
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::Acquire)
    }

    pub fn acked_count(&self) -> usize {
        self.inner.acked.load(Ordering::Acquire)
    }

    /// Queue a message for the relay's subscriber.
    pub fn deliver(&self, payload: impl Into<Bytes>) -> DeliveryReceipt {
        let (ack_tx, ack_rx) = oneshot::channel();
        let pending = PendingDelivery {
            payload: payload.into(),
            ack_tx,
        };
        // The receiver lives in `inner`, so this only fails during teardown
        let _ = self.inner.deliveries_tx.send(pending);
        DeliveryReceipt { ack_rx }
    }

    /// Next payload the relay published, in publish order. Only the latest
    /// `PUBLISHED_CAPACITY` unread payloads are kept.
    pub async fn recv_published(&self) -> Option<Bytes> {
        let mut rx = self.inner.published_rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Memory broker discarded {skipped} unread payloads");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub async fn try_recv_published(&self) -> Option<Bytes> {
        let mut rx = self.inner.published_rx.lock().await;
        loop {
            match rx.try_recv() {
                Ok(payload) => return Some(payload),
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!("Memory broker discarded {skipped} unread payloads");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn connect(&self) -> Result<(), PublishError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(PublishError::Unavailable("memory broker is down".to_string()))
        }
    }

    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        if !self.is_available() {
            return Err(PublishError::Unavailable("memory broker is down".to_string()));
        }
        self.inner
            .published_tx
            .send(payload)
            .map(|_| ())
            .map_err(|_| PublishError::Closed)
    }

    async fn close(&self) {}
}

#[async_trait]
impl DeliverySource for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn DeliveryStream>, SubscribeError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::AcqRel);

        if !self.is_available() {
            return Err(SubscribeError::Connection(
                "memory broker is down".to_string(),
            ));
        }
        if self.inner.reject_declare.load(Ordering::Acquire) {
            return Err(SubscribeError::Declare(
                "queue declaration rejected".to_string(),
            ));
        }

        let deliveries = Arc::clone(&self.inner.deliveries_rx)
            .try_lock_owned()
            .map_err(|_| {
                SubscribeError::Connection("queue already has an exclusive consumer".to_string())
            })?;

        debug!("Memory broker consumer attached");
        Ok(Box::new(MemoryDeliveryStream {
            broker: self.clone(),
            deliveries,
            generation: self.inner.generation.subscribe(),
        }))
    }
}

struct MemoryDeliveryStream {
    broker: MemoryBroker,
    deliveries: OwnedMutexGuard<mpsc::UnboundedReceiver<PendingDelivery>>,
    generation: watch::Receiver<u64>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, SubscribeError>> {
        tokio::select! {
            _ = self.generation.changed() => None,
            pending = self.deliveries.recv() => pending.map(|pending| {
                let acker = MemoryAcker {
                    broker: self.broker.clone(),
                    ack_tx: pending.ack_tx,
                };
                Ok(Delivery::new(pending.payload, Box::new(acker)))
            }),
        }
    }

    async fn close(&mut self) {
        debug!("Memory broker consumer detached");
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    ack_tx: oneshot::Sender<()>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), SubscribeError> {
        if !self.broker.is_available() {
            return Err(SubscribeError::Ack("memory broker is down".to_string()));
        }
        self.broker.inner.acked.fetch_add(1, Ordering::AcqRel);
        let _ = self.ack_tx.send(());
        Ok(())
    }
}
