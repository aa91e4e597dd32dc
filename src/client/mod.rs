//! Broker client.
//!
//! One `Client` owns one connection and the shutdown coordinator shared by
//! every loop it spawns:
//! - the connection supervisor, started on open
//! - one send loop per [`Publisher`]
//! - one delivery loop per [`Subscriber`]
//!
//! [`Client::close`] stops them all and returns once they have exited.

mod publisher;
mod shutdown;
mod subscriber;
mod supervisor;

pub use publisher::Publisher;
pub use shutdown::{LoopGuard, Shutdown};
pub use subscriber::Subscriber;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::bus::{BusError, Connection, Handler, Result};
use crate::config::ClientConfig;

/// Handle to a broker connection. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connection: Arc<dyn Connection>,
    shutdown: Arc<Shutdown>,
    publishers: Mutex<HashMap<String, Arc<OnceCell<Publisher>>>>,
    grace: Option<Duration>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.is_closed())
            .field("grace", &self.inner.grace)
            .finish()
    }
}

impl Client {
    /// Connect to the AMQP broker at `url` with default settings.
    #[cfg(feature = "amqp")]
    pub async fn open(url: &str) -> Result<Self> {
        let mut config = ClientConfig::default();
        config.amqp.url = url.to_string();
        Self::open_with(&config).await
    }

    /// Connect to the AMQP broker described by `config`.
    #[cfg(feature = "amqp")]
    pub async fn open_with(config: &ClientConfig) -> Result<Self> {
        let connection = crate::bus::AmqpConnection::connect(&config.amqp).await?;
        Ok(Self::with_connection(Arc::new(connection), config))
    }

    /// Build a client over an already established connection.
    ///
    /// Starts the connection supervisor, so it must run inside a tokio runtime.
    pub fn with_connection(connection: Arc<dyn Connection>, config: &ClientConfig) -> Self {
        let shutdown = Arc::new(Shutdown::new());

        tokio::spawn(supervisor::supervise(
            connection.clone(),
            shutdown.clone(),
            shutdown.register(),
        ));

        Self {
            inner: Arc::new(ClientInner {
                connection,
                shutdown,
                publishers: Mutex::new(HashMap::new()),
                grace: config.shutdown.grace(),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_stopped()
    }

    /// Create a publisher with its own send loop on `exchange`.
    pub async fn publisher(&self, exchange: &str) -> Result<Publisher> {
        if self.is_closed() {
            return Err(BusError::ClientClosed);
        }

        let channel = self.inner.connection.publish_channel(exchange).await?;
        let publisher = Publisher::spawn(exchange, channel, self.inner.shutdown.clone());

        // Close may have started while the channel was opening.
        if self.is_closed() {
            return Err(BusError::ClientClosed);
        }

        debug!(exchange = %exchange, "Publisher created");
        Ok(publisher)
    }

    /// Register a consumer on `queue`. Deliveries start flowing once
    /// [`Subscriber::subscribe`] is called.
    pub async fn subscriber(&self, queue: &str) -> Result<Subscriber> {
        if self.is_closed() {
            return Err(BusError::ClientClosed);
        }

        let stream = self.inner.connection.consume(queue).await?;
        debug!(queue = %queue, "Subscriber created");
        Ok(Subscriber::new(queue, stream, self.inner.shutdown.clone()))
    }

    /// Publish through the cached publisher for `exchange`, creating it on first use.
    ///
    /// Fails with [`BusError::PublisherDead`] once close has begun.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::PublisherDead);
        }

        let publisher = self.cached_publisher(exchange).await.map_err(|e| match e {
            BusError::ClientClosed => BusError::PublisherDead,
            other => other,
        })?;
        publisher.publish(routing_key, body).await
    }

    /// Consume `queue` with `handler` until the client closes.
    pub async fn subscribe(&self, queue: &str, handler: impl Handler) -> Result<()> {
        self.subscriber(queue).await?.subscribe(handler)
    }

    /// The map lock is held only to find the slot; creation runs outside it.
    async fn cached_publisher(&self, exchange: &str) -> Result<Publisher> {
        let slot = self
            .inner
            .publishers
            .lock()
            .await
            .entry(exchange.to_string())
            .or_default()
            .clone();

        slot.get_or_try_init(|| self.publisher(exchange))
            .await
            .cloned()
    }

    /// Stop every loop, wait for them to exit, then close the connection.
    ///
    /// Waits without limit unless a grace period is configured. Calling it
    /// again, or concurrently, waits for the same shutdown, including the
    /// connection close.
    pub async fn close(&self) {
        if let Err(e) = self.shutdown(self.inner.grace).await {
            warn!(error = %e, "Client closed before all loops stopped");
        }
    }

    /// Like [`Client::close`], but gives up waiting after `grace`.
    pub async fn close_within(&self, grace: Duration) -> Result<()> {
        self.shutdown(Some(grace)).await
    }

    async fn shutdown(&self, grace: Option<Duration>) -> Result<()> {
        let shutdown = &self.inner.shutdown;
        if !shutdown.stop() {
            debug!("Close already in progress");
            return bounded(grace, async {
                shutdown.wait_all().await;
                shutdown.finished().await;
            })
            .await;
        }

        info!(active_loops = shutdown.active(), "Closing client");
        shutdown.broadcast();
        let drained = bounded(grace, shutdown.wait_all()).await;

        self.inner.publishers.lock().await.clear();
        self.inner.connection.close().await;
        shutdown.finish();
        info!("Client closed");

        drained
    }
}

/// Await `wait`, giving up after `grace` when one is set.
async fn bounded(
    grace: Option<Duration>,
    wait: impl std::future::Future<Output = ()>,
) -> Result<()> {
    match grace {
        Some(grace) => tokio::time::timeout(grace, wait)
            .await
            .map_err(|_| BusError::ShutdownTimeout(grace)),
        None => {
            wait.await;
            Ok(())
        }
    }
}
