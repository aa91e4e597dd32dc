//! Exchange-bound publisher.
//!
//! `publish` hands each message to a single send loop and returns once the
//! loop has taken it. The loop transmits in arrival order and, on shutdown,
//! drains what it already accepted before exiting.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::shutdown::{LoopGuard, Shutdown};
use crate::bus::{BusError, Message, PublishChannel, Result};

struct Handoff {
    message: Message,
    accepted: oneshot::Sender<()>,
}

/// Publisher bound to one exchange. Clones share the same send loop.
#[derive(Clone)]
pub struct Publisher {
    exchange: Arc<str>,
    handoff: mpsc::Sender<Handoff>,
    shutdown: Arc<Shutdown>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("exchange", &self.exchange)
            .finish()
    }
}

impl Publisher {
    /// Spawn the send loop over `channel` and return its handle.
    pub(crate) fn spawn(
        exchange: &str,
        channel: Box<dyn PublishChannel>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let exchange: Arc<str> = Arc::from(exchange);
        let (handoff, rx) = mpsc::channel(1);
        let guard = shutdown.register();

        tokio::spawn(send_loop(
            exchange.clone(),
            channel,
            rx,
            shutdown.clone(),
            guard,
        ));

        Self {
            exchange,
            handoff,
            shutdown,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Hand a message to the send loop.
    ///
    /// Returns once the loop has accepted the message, not once the broker
    /// has it. Fails with [`BusError::PublisherDead`] once shutdown began.
    pub async fn publish(&self, routing_key: &str, body: impl Into<Bytes>) -> Result<()> {
        if self.shutdown.is_stopped() {
            return Err(BusError::PublisherDead);
        }

        let (accepted, taken) = oneshot::channel();
        let handoff = Handoff {
            message: Message::new(routing_key, body),
            accepted,
        };

        self.handoff
            .send(handoff)
            .await
            .map_err(|_| BusError::PublisherDead)?;
        taken.await.map_err(|_| BusError::PublisherDead)
    }
}

async fn send_loop(
    exchange: Arc<str>,
    channel: Box<dyn PublishChannel>,
    mut rx: mpsc::Receiver<Handoff>,
    shutdown: Arc<Shutdown>,
    _guard: LoopGuard,
) {
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(handoff) => send(&exchange, channel.as_ref(), handoff).await,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    // Refuse new handoffs, then flush what was already queued.
    rx.close();
    let mut drained = 0usize;
    while let Some(handoff) = rx.recv().await {
        send(&exchange, channel.as_ref(), handoff).await;
        drained += 1;
    }
    if drained > 0 {
        debug!(exchange = %exchange, drained, "Drained accepted messages");
    }

    info!(exchange = %exchange, "Publisher stopped");
}

/// Accept one handoff and transmit it. Failures are logged and the message dropped.
async fn send(exchange: &str, channel: &dyn PublishChannel, handoff: Handoff) {
    let Handoff { message, accepted } = handoff;
    let _ = accepted.send(());

    if let Err(e) = channel.publish(message.routing_key(), message.body()).await {
        error!(
            exchange = %exchange,
            routing_key = %message.routing_key(),
            body = %String::from_utf8_lossy(message.body()),
            error = %e,
            "Failed to publish message"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::bus::{Connection, MockConnection};

    async fn spawn_publisher(conn: &MockConnection, shutdown: &Arc<Shutdown>) -> Publisher {
        let channel = conn.publish_channel("orders").await.unwrap();
        Publisher::spawn("orders", channel, shutdown.clone())
    }

    async fn stop(shutdown: &Shutdown) {
        shutdown.stop();
        shutdown.broadcast();
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait_all())
            .await
            .expect("publisher loop should stop");
    }

    #[tokio::test]
    async fn test_publish_transmits_in_submission_order() {
        let conn = MockConnection::new();
        let shutdown = Arc::new(Shutdown::new());
        let publisher = spawn_publisher(&conn, &shutdown).await;

        for i in 0..20 {
            publisher
                .publish("created", format!("order-{}", i))
                .await
                .unwrap();
        }
        stop(&shutdown).await;

        let bodies: Vec<_> = conn
            .transmissions()
            .await
            .into_iter()
            .map(|t| t.body)
            .collect();
        let expected: Vec<_> = (0..20)
            .map(|i| Bytes::from(format!("order-{}", i)))
            .collect();
        assert_eq!(bodies, expected);
    }

    #[tokio::test]
    async fn test_publish_after_stop_is_dead() {
        let conn = MockConnection::new();
        let shutdown = Arc::new(Shutdown::new());
        let publisher = spawn_publisher(&conn, &shutdown).await;
        stop(&shutdown).await;

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            publisher.publish("created", "late"),
        )
        .await
        .expect("publish after stop must not block");

        assert!(matches!(result, Err(BusError::PublisherDead)));
        assert_eq!(conn.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_transmission_failure_is_dropped_not_returned() {
        let conn = MockConnection::new();
        conn.set_fail_on_publish(true).await;
        let shutdown = Arc::new(Shutdown::new());
        let publisher = spawn_publisher(&conn, &shutdown).await;

        publisher.publish("created", "lost").await.unwrap();
        conn.set_fail_on_publish(false).await;
        publisher.publish("created", "kept").await.unwrap();
        stop(&shutdown).await;

        let sent = conn.transmissions().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, Bytes::from_static(b"kept"));
    }

    #[tokio::test]
    async fn test_accepted_messages_drain_on_shutdown() {
        let conn = Arc::new(MockConnection::new());
        conn.set_publish_delay(Some(Duration::from_millis(30))).await;
        let shutdown = Arc::new(Shutdown::new());
        let publisher = spawn_publisher(&conn, &shutdown).await;

        publisher.publish("created", "first").await.unwrap();
        // The loop is busy transmitting "first"; "second" sits in the handoff slot.
        let pending = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish("created", "second").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        shutdown.stop();
        shutdown.broadcast();
        shutdown.wait_all().await;

        let result = pending.await.unwrap();
        let sent = conn.transmissions().await;
        match result {
            Ok(()) => assert_eq!(sent.len(), 2),
            Err(e) => {
                assert!(matches!(e, BusError::PublisherDead));
                assert_eq!(sent.len(), 1);
            }
        }
        assert_eq!(sent[0].body, Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn test_publish_blocks_until_loop_takes_message() {
        let conn = MockConnection::new();
        conn.set_publish_delay(Some(Duration::from_millis(50))).await;
        let shutdown = Arc::new(Shutdown::new());
        let publisher = spawn_publisher(&conn, &shutdown).await;

        // "a" is being transmitted and "b" occupies the handoff slot.
        publisher.publish("created", "a").await.unwrap();
        let second = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish("created", "b").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut third = tokio_test::task::spawn(publisher.publish("created", "c"));
        tokio_test::assert_pending!(third.poll());
        assert_eq!(conn.published_count().await, 0);

        // "a" is sent and "b" is in flight; "c" now waits in the slot.
        tokio::time::sleep(Duration::from_millis(70)).await;
        tokio_test::assert_pending!(third.poll());
        assert_eq!(conn.published_count().await, 1);

        // "b" is sent, so the loop has taken "c".
        tokio::time::sleep(Duration::from_millis(70)).await;
        tokio_test::assert_ready_ok!(third.poll());
        second.await.unwrap().unwrap();

        stop(&shutdown).await;
        let bodies: Vec<_> = conn
            .transmissions()
            .await
            .into_iter()
            .map(|t| t.body)
            .collect();
        assert_eq!(
            bodies,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c"),
            ]
        );
    }

    #[tokio::test]
    async fn test_clones_share_one_loop() {
        let conn = MockConnection::new();
        let shutdown = Arc::new(Shutdown::new());
        let publisher = spawn_publisher(&conn, &shutdown).await;
        let clone = publisher.clone();

        publisher.publish("created", "a").await.unwrap();
        clone.publish("created", "b").await.unwrap();

        assert_eq!(shutdown.active(), 1);
        assert_eq!(clone.exchange(), "orders");
        stop(&shutdown).await;
        assert_eq!(conn.published_count().await, 2);
    }
}
