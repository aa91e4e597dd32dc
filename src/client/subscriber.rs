//! Queue-bound subscriber.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::shutdown::{LoopGuard, Shutdown};
use crate::bus::{BusError, Delivery, DeliveryStream, Handler, Result};

/// A consumer registered on one queue, waiting for its handler.
///
/// The loop started by [`Subscriber::subscribe`] runs until the client shuts
/// down; there is no per-subscriber cancellation.
pub struct Subscriber {
    queue: String,
    stream: Box<dyn DeliveryStream>,
    shutdown: Arc<Shutdown>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("queue", &self.queue)
            .finish()
    }
}

impl Subscriber {
    pub(crate) fn new(
        queue: &str,
        stream: Box<dyn DeliveryStream>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            queue: queue.to_string(),
            stream,
            shutdown,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Start the delivery loop with `handler`.
    ///
    /// A delivery is acknowledged only when the handler returns `Ok`. A
    /// failing handler leaves it unacknowledged for the broker to redeliver.
    /// Fails with [`BusError::ClientClosed`] once the client has begun closing.
    pub fn subscribe(self, handler: impl Handler) -> Result<()> {
        if self.shutdown.is_stopped() {
            return Err(BusError::ClientClosed);
        }
        let guard = self.shutdown.register();
        tokio::spawn(delivery_loop(self, Arc::new(handler), guard));
        Ok(())
    }
}

async fn delivery_loop(mut sub: Subscriber, handler: Arc<dyn Handler>, _guard: LoopGuard) {
    info!(queue = %sub.queue, "Subscriber started");

    while !sub.shutdown.is_stopped() {
        tokio::select! {
            biased;
            _ = sub.shutdown.cancelled() => break,
            next = sub.stream.next() => match next {
                Some(Ok(delivery)) => handle(&sub.queue, handler.as_ref(), delivery).await,
                Some(Err(e)) => error!(queue = %sub.queue, error = %e, "Consumer error"),
                None => {
                    warn!(queue = %sub.queue, "Consumer stream ended, idling until shutdown");
                    sub.shutdown.cancelled().await;
                    break;
                }
            },
        }
    }

    info!(queue = %sub.queue, "Subscriber stopped");
}

async fn handle(queue: &str, handler: &dyn Handler, mut delivery: Delivery) {
    if let Err(e) = handler.handle(delivery.body().clone()).await {
        error!(
            queue = %queue,
            routing_key = %delivery.routing_key(),
            body = %String::from_utf8_lossy(delivery.body()),
            error = %e,
            "Handler failed, leaving message unacknowledged"
        );
        return;
    }

    match delivery.ack().await {
        Ok(()) => debug!(queue = %queue, "Acknowledged delivery"),
        Err(e) => error!(
            queue = %queue,
            body = %String::from_utf8_lossy(delivery.body()),
            error = %e,
            "Failed to ack message"
        ),
    }
}
