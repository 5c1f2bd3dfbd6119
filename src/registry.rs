use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use std::net::SocketAddr;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type ConnectionId = String;

/// Registry-side view of one live client: its outbound queue and the token
/// that tears the connection down.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Bytes>,
    closer: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        outbound: mpsc::Sender<Bytes>,
        closer: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            outbound,
            closer,
        }
    }

    pub fn close(&self) {
        self.closer.cancel();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections in the snapshot taken when the broadcast started
    pub attempted: usize,
    /// Frames queued on a connection's writer
    pub submitted: usize,
    /// Connections that were closed or overflowed and got removed
    pub dropped: usize,
}

/// The set of live client connections eligible for fan-out.
///
/// Shared between every session task (add/remove) and the broker subscriber
/// (broadcast). Callers never lock: the map is sharded internally and
/// `broadcast` works on a cloned snapshot, so removals triggered during a
/// broadcast cannot deadlock against it.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a connection with the same id is already present.
    pub fn add(&self, handle: ConnectionHandle) -> bool {
        match self.connections.entry(handle.id.clone()) {
            Entry::Occupied(_) => {
                warn!("Connection {} already registered", handle.id);
                false
            }
            Entry::Vacant(entry) => {
                debug!("Registered connection {}", handle.id);
                entry.insert(handle);
                true
            }
        }
    }

    /// Idempotent: removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) -> Option<ConnectionHandle> {
        let removed = self.connections.remove(id).map(|(_, handle)| handle);
        if removed.is_some() {
            debug!("Unregistered connection {}", id);
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Queues an encoded frame on every connection in the current snapshot.
    ///
    /// Never waits on a slow consumer: a connection whose queue is full is
    /// disconnected, and one that already closed is removed. Either way the
    /// remaining connections still get the frame. When this returns every
    /// frame that could be submitted has been.
    pub fn broadcast(&self, frame: Bytes) -> BroadcastReport {
        let snapshot = self.snapshot();
        let mut report = BroadcastReport {
            attempted: snapshot.len(),
            ..Default::default()
        };

        for handle in snapshot {
            match handle.outbound.try_send(frame.clone()) {
                Ok(()) => report.submitted += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Connection {} from {:?} write queue is full, disconnecting",
                        handle.id, handle.peer
                    );
                    handle.close();
                    self.remove(&handle.id);
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Connection {} closed during broadcast", handle.id);
                    self.remove(&handle.id);
                    report.dropped += 1;
                }
            }
        }

        report
    }

    /// Empties the registry and signals every connection to close.
    pub fn close_all(&self) -> usize {
        let handles = self.snapshot();
        for handle in &handles {
            self.remove(&handle.id);
            handle.close();
        }
        info!("Closed {} connections", handles.len());
        handles.len()
    }
}
