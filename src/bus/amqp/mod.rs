//! AMQP (RabbitMQ) transport.
//!
//! The broker connection lives in a deadpool pool capped at one connection,
//! so every channel is multiplexed over it and a broken connection is
//! replaced on the next checkout. Publish channels are re-opened with exponential backoff when
//! they drop, and each consumer runs a forwarding task that re-registers on
//! the queue with backoff until its stream is dropped.

use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use bytes::Bytes;
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::{
    Acknowledge, BusError, Connection, Delivery, DeliveryStream, PublishChannel, Result,
};
use crate::config::{AmqpSettings, ReconnectConfig};

/// Deliveries buffered between a consumer task and its subscriber.
const CONSUMER_BUFFER: usize = 64;

/// Attempts made to re-open a publish channel before the message is given up.
const CHANNEL_RETRIES: usize = 5;

/// Physical broker connections; publishers and consumers share channels on it.
const POOL_SIZE: usize = 1;

/// Upper bound on checking out a connection while closing.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Broker connection backed by a deadpool-lapin pool.
pub struct AmqpConnection {
    pool: Pool,
    settings: AmqpSettings,
    errors_tx: mpsc::UnboundedSender<BusError>,
    errors_rx: Mutex<mpsc::UnboundedReceiver<BusError>>,
    closed: CancellationToken,
}

impl AmqpConnection {
    /// Build the pool and verify the broker is reachable.
    pub async fn connect(settings: &AmqpSettings) -> Result<Self> {
        let pool = build_pool(&settings.url)?;

        // Verify connection
        pool.get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        info!(url = %settings.url, "Connected to AMQP");

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Ok(Self {
            pool,
            settings: settings.clone(),
            errors_tx,
            errors_rx: Mutex::new(errors_rx),
            closed: CancellationToken::new(),
        })
    }

    /// Declare a durable topic exchange and a durable queue bound to it.
    ///
    /// The client itself never declares topology; this is for setup and tests.
    pub async fn declare_binding(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<()> {
        let channel = open_channel(&self.pool).await?;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        info!(
            exchange = %exchange,
            queue = %queue,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );
        Ok(())
    }

    /// Check out a connection; deadpool recycles it if the socket died.
    async fn probe(&self) -> Result<()> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;
        if !conn.status().connected() {
            return Err(BusError::Connection("Connection is not open".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn next_error(&self) -> Option<BusError> {
        let mut errors = self.errors_rx.lock().await;
        let mut probe = tokio::time::interval(self.settings.probe_interval());
        probe.tick().await;

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return None,
                reported = errors.recv() => return reported,
                _ = probe.tick() => {
                    if let Err(e) = self.probe().await {
                        return Some(e);
                    }
                }
            }
        }
    }

    async fn publish_channel(&self, exchange: &str) -> Result<Box<dyn PublishChannel>> {
        let channel = open_channel(&self.pool).await?;
        debug!(exchange = %exchange, "Opened publish channel");

        Ok(Box::new(AmqpPublishChannel {
            pool: self.pool.clone(),
            exchange: exchange.to_string(),
            channel: Mutex::new(Some(channel)),
            reconnect: self.settings.reconnect.clone(),
        }))
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>> {
        let tag = format!("relaymq-{}", uuid::Uuid::new_v4());
        let consumer = setup_consumer(&self.pool, queue, &tag).await?;
        info!(queue = %queue, consumer_tag = %tag, "Consumer registered");

        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        let stop = CancellationToken::new();

        let task = ConsumerTask {
            pool: self.pool.clone(),
            queue: queue.to_string(),
            tag,
            reconnect: self.settings.reconnect.clone(),
            errors: self.errors_tx.clone(),
            tx,
            stop: stop.clone(),
        };
        tokio::spawn(forward_deliveries(task, consumer));

        Ok(Box::new(AmqpDeliveryStream {
            rx,
            _stop: stop.drop_guard(),
        }))
    }

    async fn close(&self) {
        self.closed.cancel();

        // Closing cleanly hands unacknowledged deliveries back to the broker.
        match tokio::time::timeout(CLOSE_TIMEOUT, self.pool.get()).await {
            Ok(Ok(conn)) if conn.status().connected() => {
                if let Err(e) = conn.close(200, "relaymq client closed").await {
                    warn!(error = %e, "Failed to close AMQP connection");
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to check out AMQP connection for close"),
            Err(_) => warn!("Timed out checking out AMQP connection for close"),
        }

        self.pool.close();
        info!(url = %self.settings.url, "AMQP connection closed");
    }
}

fn build_pool(url: &str) -> Result<Pool> {
    Pool::builder(Manager::new(url.to_string(), Default::default()))
        .max_size(POOL_SIZE)
        .build()
        .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))
}

fn backoff(reconnect: &ReconnectConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(reconnect.min_delay())
        .with_max_delay(reconnect.max_delay())
        .with_jitter()
}

/// Get a channel from the pool.
async fn open_channel(pool: &Pool) -> Result<Channel> {
    let conn = pool.get().await.map_err(|e: PoolError| {
        BusError::Connection(format!("Failed to get connection from pool: {}", e))
    })?;

    conn.create_channel()
        .await
        .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
}

async fn setup_consumer(pool: &Pool, queue: &str, tag: &str) -> Result<lapin::Consumer> {
    let channel = open_channel(pool).await?;

    channel
        .basic_consume(
            queue,
            tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))
}

// ============================================================================
// Publishing
// ============================================================================

struct AmqpPublishChannel {
    pool: Pool,
    exchange: String,
    channel: Mutex<Option<Channel>>,
    reconnect: ReconnectConfig,
}

impl AmqpPublishChannel {
    /// Current channel, re-opened with backoff if it is no longer connected.
    async fn channel(&self) -> Result<Channel> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let pool = self.pool.clone();
        let channel = (|| open_channel(&pool))
            .retry(backoff(&self.reconnect).with_max_times(CHANNEL_RETRIES))
            .notify(|e: &BusError, delay: Duration| {
                warn!(
                    exchange = %self.exchange,
                    error = %e,
                    backoff_ms = %delay.as_millis(),
                    "Failed to re-open publish channel, retrying after backoff"
                );
            })
            .await?;

        info!(exchange = %self.exchange, "Publish channel re-opened");
        *slot = Some(channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl PublishChannel for AmqpPublishChannel {
    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        let channel = self.channel().await?;
        let properties = BasicProperties::default().with_delivery_mode(2); // persistent

        let confirm = channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(exchange = %self.exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }
}

// ============================================================================
// Consuming
// ============================================================================

struct ConsumerTask {
    pool: Pool,
    queue: String,
    tag: String,
    reconnect: ReconnectConfig,
    errors: mpsc::UnboundedSender<BusError>,
    tx: mpsc::Sender<Result<Delivery>>,
    stop: CancellationToken,
}

impl ConsumerTask {
    /// Sleep for `delay`. Returns `false` if the stream was dropped meanwhile.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Forward deliveries to the subscriber, re-registering on the queue with
/// exponential backoff and jitter whenever the consumer drops.
async fn forward_deliveries(task: ConsumerTask, first: lapin::Consumer) {
    use futures::StreamExt;

    let backoff_builder = backoff(&task.reconnect);
    let mut backoff_iter = backoff_builder.build();
    let mut current = Some(first);

    loop {
        let mut consumer = match current.take() {
            Some(consumer) => consumer,
            None => match setup_consumer(&task.pool, &task.queue, &task.tag).await {
                Ok(consumer) => {
                    info!(queue = %task.queue, "Consumer reconnected");
                    backoff_iter = backoff_builder.build();
                    consumer
                }
                Err(e) => {
                    // The supervisor logs it.
                    let delay = backoff_iter.next().unwrap_or(task.reconnect.max_delay());
                    let _ = task.errors.send(reregister_failed(&task.queue, delay, &e));
                    if !task.pause(delay).await {
                        break;
                    }
                    continue;
                }
            },
        };

        loop {
            let next = tokio::select! {
                _ = task.stop.cancelled() => return,
                next = consumer.next() => next,
            };

            match next {
                Some(Ok(mut delivery)) => {
                    let body = Bytes::from(std::mem::take(&mut delivery.data));
                    let routing_key = delivery.routing_key.as_str().to_string();
                    let delivery = Delivery::new(routing_key, body, Box::new(AmqpAcker(delivery)));
                    if task.tx.send(Ok(delivery)).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    let e = BusError::Subscribe(format!("Consumer delivery error: {}", e));
                    if task.tx.send(Err(e)).await.is_err() {
                        return;
                    }
                    break;
                }
                None => {
                    info!(queue = %task.queue, "Consumer stream ended, reconnecting...");
                    break;
                }
            }
        }

        // Brief pause before reconnecting
        let delay = backoff_iter.next().unwrap_or(task.reconnect.max_delay());
        if !task.pause(delay).await {
            break;
        }
    }

    debug!(queue = %task.queue, "Consumer task stopped");
}

fn reregister_failed(queue: &str, delay: Duration, cause: &BusError) -> BusError {
    BusError::Subscribe(format!(
        "Consumer on '{}' not re-registered, retrying in {}ms: {}",
        queue,
        delay.as_millis(),
        cause
    ))
}

struct AmqpDeliveryStream {
    rx: mpsc::Receiver<Result<Delivery>>,
    _stop: DropGuard,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        self.rx.recv().await
    }
}

struct AmqpAcker(lapin::message::Delivery);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(Default::default())
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}
