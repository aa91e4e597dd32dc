//! relaymq-bridge: queue-to-exchange relay
//!
//! Consumes a source queue and republishes every payload to a target
//! exchange under a fixed routing key.
//!
//! ## Architecture
//! ```text
//! [source_queue] --> relaymq-bridge --> [target_exchange / routing_key]
//! ```
//!
//! ## Configuration
//! - RELAYMQ_CONFIG: Path to a YAML config file (optional)
//! - RELAYMQ__CLIENT__AMQP__URL: Broker URL (default: amqp://localhost:5672)
//! - RELAYMQ__BRIDGE__SOURCE_QUEUE / TARGET_EXCHANGE / ROUTING_KEY
//! - RELAYMQ_LOG: Log filter (default: info)
//!
//! A payload is acknowledged once it has been handed to the publisher. If the
//! client is already shutting down it stays unacknowledged for redelivery.

use bytes::Bytes;
use tracing::info;

use relaymq::config::Config;
use relaymq::utils::bootstrap::{init_tracing, wait_for_shutdown_signal};
use relaymq::{Client, HandlerError};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let bridge = config.bridge.clone();

    let client = Client::open_with(&config.client).await?;
    let publisher = client.publisher(&bridge.target_exchange).await?;

    let routing_key = bridge.routing_key.clone();
    client
        .subscribe(&bridge.source_queue, move |body: Bytes| {
            let publisher = publisher.clone();
            let routing_key = routing_key.clone();
            async move {
                publisher
                    .publish(&routing_key, body)
                    .await
                    .map_err(HandlerError::from)
            }
        })
        .await?;

    info!(
        source_queue = %bridge.source_queue,
        target_exchange = %bridge.target_exchange,
        routing_key = %bridge.routing_key,
        "relaymq-bridge started"
    );

    wait_for_shutdown_signal().await?;
    client.close().await;

    info!("relaymq-bridge stopped");
    Ok(())
}
