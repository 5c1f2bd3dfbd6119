use crate::broker::{
    self, BrokerPublisher, BrokerSubscriber, DeliverySource, Publisher, SubscriberOptions,
    SubscriberState,
};
use crate::config::Config;
use crate::registry::ConnectionRegistry;
use crate::session::{RelayEvent, Session, SessionConfig, SessionContext};
use crate::transport::{AsyncListener, TcpAsyncListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Server failed to start: {0}")]
    StartupFailed(String),
    #[error("Server is already running")]
    AlreadyRunning,
}

const EVENT_CAPACITY: usize = 1024;

struct Running {
    accept_token: CancellationToken,
    accept_handle: JoinHandle<()>,
    sessions_token: CancellationToken,
    tracker: TaskTracker,
    publisher: Arc<BrokerPublisher>,
    subscriber: BrokerSubscriber,
}

pub struct Server {
    config: Config,
    registry: Arc<ConnectionRegistry>,
    publisher_backend: Arc<dyn Publisher>,
    source: Arc<dyn DeliverySource>,
    events: broadcast::Sender<RelayEvent>,
    running: AtomicBool,
    state: Mutex<Option<Running>>,
    address: RwLock<Option<String>>,
}

impl Server {
    /// Server with the broker backends selected by `config.broker.backend`
    pub fn new(config: Config) -> Self {
        let (publisher, source) = broker::new(&config.broker);
        Self::with_backends(config, publisher, source)
    }

    pub fn with_backends(
        config: Config,
        publisher_backend: Arc<dyn Publisher>,
        source: Arc<dyn DeliverySource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            publisher_backend,
            source,
            events,
            running: AtomicBool::new(false),
            state: Mutex::new(None),
            address: RwLock::new(None),
        }
    }

    /// Binds the listener, then brings up the broker paths.
    ///
    /// The subscriber only starts once the listener is bound, so broker
    /// traffic is never consumed while clients cannot be served.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        info!("Starting relay server");

        let listener = TcpAsyncListener::bind(&self.config.listen)
            .await
            .map_err(|e| {
                ServerError::StartupFailed(format!(
                    "Failed to bind to {}: {e}",
                    self.config.listen
                ))
            })?;

        // Get the actual bound address (useful for port 0)
        let bound_addr = listener
            .local_addr()
            .map_err(|e| ServerError::StartupFailed(format!("Failed to get local address: {e}")))?;
        *self.address.write().await = Some(bound_addr.to_string());
        info!("Server listening on {}", bound_addr);

        let broker_config = &self.config.broker;
        let publisher = Arc::new(
            BrokerPublisher::start(
                Arc::clone(&self.publisher_backend),
                broker_config.publish_queue_capacity(),
                broker_config.reconnect_interval(),
            )
            .await,
        );

        let accept_token = CancellationToken::new();
        let sessions_token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let ctx = SessionContext {
            registry: Arc::clone(&self.registry),
            publisher: Arc::clone(&publisher),
            events: self.events.clone(),
            config: Arc::new(SessionConfig::from(&self.config)),
            shutdown_token: sessions_token.clone(),
            tracker: tracker.clone(),
        };
        let accept_handle = tokio::spawn(Self::accept_loop(
            Box::new(listener),
            ctx,
            accept_token.clone(),
        ));

        let subscriber = BrokerSubscriber::spawn(
            Arc::clone(&self.source),
            Arc::clone(&self.registry),
            SubscriberOptions {
                reconnect_interval: broker_config.reconnect_interval(),
                max_declare_failures: broker_config.max_declare_failures,
                max_frame_length: self.config.max_frame_length,
            },
        );

        *state = Some(Running {
            accept_token,
            accept_handle,
            sessions_token,
            tracker,
            publisher,
            subscriber,
        });
        self.running.store(true, Ordering::Release);
        info!("Server started successfully");
        Ok(())
    }

    /// Tears down in reverse order: stop accepting, close the subscriber's
    /// channel, close every client connection, then stop the publisher.
    /// Calling it again, or before `start`, is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.state.lock().await.take() else {
            return Ok(());
        };

        info!("Stopping server");

        running.accept_token.cancel();
        running.accept_handle.await.unwrap_or_else(|e| {
            error!("Error in waiting for accept task {e}");
        });

        running.subscriber.stop().await;

        running.sessions_token.cancel();
        self.registry.close_all();
        running.tracker.close();
        running.tracker.wait().await;

        running.publisher.stop().await;

        *self.address.write().await = None;
        self.running.store(false, Ordering::Release);
        info!("Server stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn address(&self) -> Option<String> {
        self.address.read().await.clone()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Connection lifecycle events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub async fn subscriber_state(&self) -> Option<watch::Receiver<SubscriberState>> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|running| running.subscriber.watch_state())
    }

    async fn accept_loop(
        listener: Box<dyn AsyncListener>,
        ctx: SessionContext,
        accept_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(stream) => Session::spawn(stream, ctx.clone()),
                        Err(e) => error!("Failed to accept connection: {e}"),
                    }
                }

                _ = accept_token.cancelled() => {
                    info!("Server received shutdown signal");
                    break;
                }
            }
        }

        // Dropping the listener closes the socket
        drop(listener);
        info!("Accept loop completed");
    }
}
