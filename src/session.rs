use bytes::Bytes;
use futures::StreamExt;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerPublisher;
use crate::config::{Config, IdlePolicy};
use crate::idle::IdleMonitor;
use crate::protocol::{Frame, FrameCodec, FrameError};
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::transport::{AsyncStream, StreamReader, StreamWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client closed the socket
    PeerClosed,
    /// Malformed frame
    ProtocolViolation(String),
    /// Read or write failure on the socket
    Transport(String),
    /// Idle window elapsed under the disconnect policy
    Idle,
    /// Dropped by the registry, e.g. write queue overflow
    Evicted,
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "peer closed"),
            DisconnectReason::ProtocolViolation(e) => write!(f, "protocol violation: {e}"),
            DisconnectReason::Transport(e) => write!(f, "transport error: {e}"),
            DisconnectReason::Idle => write!(f, "idle timeout"),
            DisconnectReason::Evicted => write!(f, "evicted"),
            DisconnectReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Connection lifecycle notifications, published on a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connected {
        id: ConnectionId,
        peer: Option<SocketAddr>,
    },
    Idle {
        id: ConnectionId,
        idle_for: Duration,
    },
    Disconnected {
        id: ConnectionId,
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Option<Duration>,
    pub idle_policy: IdlePolicy,
    pub echo: bool,
    pub max_frame_length: usize,
    pub write_queue_capacity: usize,
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            idle_policy: config.idle_policy,
            echo: config.echo,
            max_frame_length: config.max_frame_length,
            write_queue_capacity: config.write_queue_capacity(),
        }
    }
}

/// Everything a session shares with the rest of the server.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub publisher: Arc<BrokerPublisher>,
    pub events: broadcast::Sender<RelayEvent>,
    pub config: Arc<SessionConfig>,
    pub shutdown_token: CancellationToken,
    pub tracker: TaskTracker,
}

impl SessionContext {
    fn emit(&self, event: RelayEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

/// One client connection.
///
/// Reads frames in order, hands each payload to the broker publisher and
/// optionally echoes it back to this client only. Outbound traffic (echoes
/// and broadcasts) goes through a bounded queue drained by a separate
/// writer task, so a slow client only ever stalls itself.
pub struct Session {
    id: ConnectionId,
    ctx: SessionContext,
    idle: IdleMonitor,
    outbound: mpsc::Sender<Bytes>,
    closer: CancellationToken,
}

impl Session {
    pub fn spawn(stream: Box<dyn AsyncStream>, ctx: SessionContext) {
        let tracker = ctx.tracker.clone();
        tracker.spawn(Self::run(stream, ctx));
    }

    async fn run(stream: Box<dyn AsyncStream>, ctx: SessionContext) {
        let id = format!("conn_{}", Uuid::new_v4().simple());
        let peer = stream.peer_addr();
        let (reader, writer) = stream.into_split();

        let (outbound, outbound_rx) = mpsc::channel(ctx.config.write_queue_capacity);
        let closer = ctx.shutdown_token.child_token();

        ctx.registry.add(ConnectionHandle::new(
            id.clone(),
            peer,
            outbound.clone(),
            closer.clone(),
        ));
        info!("Connection {} established from {:?}", id, peer);
        ctx.emit(RelayEvent::Connected {
            id: id.clone(),
            peer,
        });

        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, closer.clone()));

        let mut frames = FramedRead::new(reader, FrameCodec::new(ctx.config.max_frame_length));
        let mut session = Session {
            id,
            idle: IdleMonitor::new(ctx.config.idle_timeout),
            ctx,
            outbound,
            closer,
        };
        let read_end = session.read_loop(&mut frames).await;

        // Leave the registry before the socket goes away
        session.ctx.registry.remove(&session.id);
        session.closer.cancel();
        drop(frames);

        let write_end = match writer_task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Error in join writer task: {}", e);
                Ok(())
            }
        };

        let reason = match (read_end, write_end) {
            (Some(reason), _) => reason,
            (None, Err(e)) => DisconnectReason::Transport(e.to_string()),
            (None, Ok(())) if session.ctx.shutdown_token.is_cancelled() => {
                DisconnectReason::Shutdown
            }
            (None, Ok(())) => DisconnectReason::Evicted,
        };

        info!("Connection {} closed: {}", session.id, reason);
        session.ctx.emit(RelayEvent::Disconnected {
            id: session.id.clone(),
            reason,
        });
    }

    /// `None` when the connection was closed from elsewhere.
    async fn read_loop(
        &mut self,
        frames: &mut FramedRead<StreamReader, FrameCodec>,
    ) -> Option<DisconnectReason> {
        loop {
            tokio::select! {
                _ = self.closer.cancelled() => return None,

                _ = self.idle.expired() => {
                    if let Some(event) = self.idle.on_expired() {
                        info!("Connection {} read idle for {:?}", self.id, event.idle_for);
                        self.ctx.emit(RelayEvent::Idle {
                            id: self.id.clone(),
                            idle_for: event.idle_for,
                        });
                        if self.ctx.config.idle_policy == IdlePolicy::Disconnect {
                            return Some(DisconnectReason::Idle);
                        }
                    }
                }

                next = frames.next() => match next {
                    Some(Ok(frame)) => {
                        self.idle.touch();
                        if let Err(reason) = self.handle_frame(frame).await {
                            return Some(reason);
                        }
                    }
                    Some(Err(FrameError::Io(e))) => {
                        return Some(DisconnectReason::Transport(e.to_string()));
                    }
                    Some(Err(e)) => {
                        warn!("Connection {} sent a malformed frame: {}", self.id, e);
                        return Some(DisconnectReason::ProtocolViolation(e.to_string()));
                    }
                    None => return Some(DisconnectReason::PeerClosed),
                },
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), DisconnectReason> {
        debug!(
            "Connection {} received frame type {} with {} byte payload",
            self.id,
            frame.frame_type,
            frame.payload.len()
        );

        // Broker trouble never costs the client its connection
        if let Err(e) = self.ctx.publisher.publish(frame.payload.clone()) {
            warn!("Connection {} payload not published: {}", self.id, e);
        }

        if !self.ctx.config.echo {
            return Ok(());
        }

        let echo = frame
            .to_bytes()
            .map_err(|e| DisconnectReason::ProtocolViolation(e.to_string()))?;
        tokio::select! {
            _ = self.closer.cancelled() => Ok(()),
            sent = self.outbound.send(echo) => sent.map_err(|_| {
                DisconnectReason::Transport("writer closed".to_string())
            }),
        }
    }
}

async fn write_loop(
    mut writer: StreamWriter,
    mut outbound: mpsc::Receiver<Bytes>,
    closer: CancellationToken,
) -> io::Result<()> {
    loop {
        let frame = tokio::select! {
            biased;
            _ = closer.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = closer.cancelled() => break,
            written = writer.write_all(&frame) => written,
        };
        if let Err(e) = written {
            closer.cancel();
            return Err(e);
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Socket shutdown: {}", e);
    }
    Ok(())
}
