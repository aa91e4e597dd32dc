//! Mock transport for testing.
//!
//! Records every transmission in order, feeds deliveries from in-memory
//! queues, and counts acknowledgments per delivery tag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::{
    Acknowledge, BusError, Connection, Delivery, DeliveryStream, PublishChannel, Result,
};

/// A message the mock broker received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
}

type DeliveryTx = mpsc::UnboundedSender<Result<Delivery>>;
type DeliveryRx = mpsc::UnboundedReceiver<Result<Delivery>>;

struct QueueSlot {
    tx: Option<DeliveryTx>,
    rx: Option<DeliveryRx>,
}

impl QueueSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

struct MockState {
    transmissions: RwLock<Vec<Transmission>>,
    fail_on_publish: RwLock<bool>,
    fail_on_ack: RwLock<bool>,
    fail_on_channel: RwLock<bool>,
    publish_delay: RwLock<Option<Duration>>,
    channel_delay: RwLock<Option<Duration>>,
    close_delay: RwLock<Option<Duration>>,
    queues: Mutex<HashMap<String, QueueSlot>>,
    acks: RwLock<HashMap<u64, usize>>,
    next_tag: AtomicU64,
    errors_tx: mpsc::UnboundedSender<BusError>,
    errors_rx: Mutex<mpsc::UnboundedReceiver<BusError>>,
    closed: AtomicBool,
}

/// Mock broker connection for testing.
pub struct MockConnection {
    state: Arc<MockState>,
}

impl Default for MockConnection {
    fn default() -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(MockState {
                transmissions: RwLock::new(Vec::new()),
                fail_on_publish: RwLock::new(false),
                fail_on_ack: RwLock::new(false),
                fail_on_channel: RwLock::new(false),
                publish_delay: RwLock::new(None),
                channel_delay: RwLock::new(None),
                close_delay: RwLock::new(None),
                queues: Mutex::new(HashMap::new()),
                acks: RwLock::new(HashMap::new()),
                next_tag: AtomicU64::new(1),
                errors_tx,
                errors_rx: Mutex::new(errors_rx),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.state.fail_on_publish.write().await = fail;
    }

    pub async fn set_fail_on_ack(&self, fail: bool) {
        *self.state.fail_on_ack.write().await = fail;
    }

    /// Make channel and consumer creation fail.
    pub async fn set_fail_on_channel(&self, fail: bool) {
        *self.state.fail_on_channel.write().await = fail;
    }

    /// Delay every transmission by `delay`.
    pub async fn set_publish_delay(&self, delay: Option<Duration>) {
        *self.state.publish_delay.write().await = delay;
    }

    /// Stall publish channel creation by `delay`.
    pub async fn set_channel_delay(&self, delay: Option<Duration>) {
        *self.state.channel_delay.write().await = delay;
    }

    /// Delay `close` by `delay` before marking the connection closed.
    pub async fn set_close_delay(&self, delay: Option<Duration>) {
        *self.state.close_delay.write().await = delay;
    }

    pub async fn transmissions(&self) -> Vec<Transmission> {
        self.state.transmissions.read().await.clone()
    }

    pub async fn published_count(&self) -> usize {
        self.state.transmissions.read().await.len()
    }

    /// Enqueue a delivery on `queue`. Returns its delivery tag.
    pub async fn deliver(&self, queue: &str, body: impl Into<Bytes>) -> u64 {
        let tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery::new(
            queue,
            body,
            Box::new(MockAcker {
                tag,
                state: self.state.clone(),
            }),
        );
        self.push(queue, Ok(delivery)).await;
        tag
    }

    /// Enqueue a consumer-level error on `queue`.
    pub async fn inject_consumer_error(&self, queue: &str, error: BusError) {
        self.push(queue, Err(error)).await;
    }

    /// End the consumer stream on `queue`.
    pub async fn end_stream(&self, queue: &str) {
        let mut queues = self.state.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_insert_with(QueueSlot::new)
            .tx
            .take();
    }

    /// Report a transport-level error to whoever waits on `next_error`.
    pub fn inject_error(&self, error: BusError) {
        let _ = self.state.errors_tx.send(error);
    }

    pub async fn ack_count(&self, tag: u64) -> usize {
        self.state.acks.read().await.get(&tag).copied().unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    async fn push(&self, queue: &str, item: Result<Delivery>) {
        let mut queues = self.state.queues.lock().await;
        let slot = queues
            .entry(queue.to_string())
            .or_insert_with(QueueSlot::new);
        if let Some(tx) = &slot.tx {
            let _ = tx.send(item);
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn next_error(&self) -> Option<BusError> {
        self.state.errors_rx.lock().await.recv().await
    }

    async fn publish_channel(&self, exchange: &str) -> Result<Box<dyn PublishChannel>> {
        let delay = *self.state.channel_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.state.fail_on_channel.read().await {
            return Err(BusError::Connection("Mock channel failure".to_string()));
        }
        Ok(Box::new(MockChannel {
            exchange: exchange.to_string(),
            state: self.state.clone(),
        }))
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>> {
        if *self.state.fail_on_channel.read().await {
            return Err(BusError::Subscribe("Mock consumer failure".to_string()));
        }
        let mut queues = self.state.queues.lock().await;
        let slot = queues
            .entry(queue.to_string())
            .or_insert_with(QueueSlot::new);
        let rx = slot.rx.take().ok_or_else(|| {
            BusError::Subscribe(format!("Queue '{}' already has a consumer", queue))
        })?;
        Ok(Box::new(MockStream { rx }))
    }

    async fn close(&self) {
        let delay = *self.state.close_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

struct MockChannel {
    exchange: String,
    state: Arc<MockState>,
}

#[async_trait]
impl PublishChannel for MockChannel {
    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        let delay = *self.state.publish_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.state.fail_on_publish.read().await {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }
        self.state.transmissions.write().await.push(Transmission {
            exchange: self.exchange.clone(),
            routing_key: routing_key.to_string(),
            body: Bytes::copy_from_slice(body),
        });
        Ok(())
    }
}

struct MockStream {
    rx: DeliveryRx,
}

#[async_trait]
impl DeliveryStream for MockStream {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        self.rx.recv().await
    }
}

struct MockAcker {
    tag: u64,
    state: Arc<MockState>,
}

#[async_trait]
impl Acknowledge for MockAcker {
    async fn ack(&self) -> Result<()> {
        if *self.state.fail_on_ack.read().await {
            return Err(BusError::Ack("Mock ack failure".to_string()));
        }
        *self.state.acks.write().await.entry(self.tag).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_publish_records_in_order() {
        let conn = MockConnection::new();
        let channel = conn.publish_channel("orders").await.unwrap();

        channel.publish("created", b"order-1").await.unwrap();
        channel.publish("created", b"order-2").await.unwrap();

        let sent = conn.transmissions().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].exchange, "orders");
        assert_eq!(sent[0].body, Bytes::from_static(b"order-1"));
        assert_eq!(sent[1].body, Bytes::from_static(b"order-2"));
    }

    #[tokio::test]
    async fn test_mock_fail_on_publish() {
        let conn = MockConnection::new();
        conn.set_fail_on_publish(true).await;
        let channel = conn.publish_channel("orders").await.unwrap();

        let result = channel.publish("created", b"order-1").await;

        assert!(matches!(result, Err(BusError::Publish(_))));
        assert_eq!(conn.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_fail_on_channel() {
        let conn = MockConnection::new();
        conn.set_fail_on_channel(true).await;

        assert!(matches!(
            conn.publish_channel("orders").await,
            Err(BusError::Connection(_))
        ));
        assert!(matches!(
            conn.consume("orders.created").await,
            Err(BusError::Subscribe(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_deliveries_queued_before_consumer() {
        let conn = MockConnection::new();
        let tag = conn.deliver("orders.created", "early").await;

        let mut stream = conn.consume("orders.created").await.unwrap();
        let mut delivery = stream.next().await.unwrap().unwrap();

        assert_eq!(delivery.body(), &Bytes::from_static(b"early"));
        delivery.ack().await.unwrap();
        assert_eq!(conn.ack_count(tag).await, 1);
    }

    #[tokio::test]
    async fn test_mock_second_consumer_rejected() {
        let conn = MockConnection::new();
        let _first = conn.consume("orders.created").await.unwrap();

        let second = conn.consume("orders.created").await;

        assert!(matches!(second, Err(BusError::Subscribe(_))));
    }

    #[tokio::test]
    async fn test_mock_end_stream() {
        let conn = MockConnection::new();
        let mut stream = conn.consume("orders.created").await.unwrap();
        conn.end_stream("orders.created").await;

        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_injected_error_reported() {
        let conn = MockConnection::new();
        conn.inject_error(BusError::Connection("heartbeat missed".to_string()));

        let err = conn.next_error().await;

        assert!(matches!(err, Some(BusError::Connection(_))));
    }

    #[tokio::test]
    async fn test_mock_close() {
        let conn = MockConnection::new();
        assert!(!conn.is_closed());
        conn.close().await;
        assert!(conn.is_closed());
    }
}
