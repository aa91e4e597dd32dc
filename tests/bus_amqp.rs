//! AMQP/RabbitMQ client integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use relaymq::bus::{AmqpConnection, BusError, HandlerError};
use relaymq::{Client, ClientConfig};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

/// Connect a client and bind a fresh queue to a fresh exchange.
async fn bound_client(url: &str) -> (Client, String, String) {
    let mut config = ClientConfig::default();
    config.amqp.url = url.to_string();
    config.amqp.probe_interval_ms = 200;

    let exchange = format!("test-exchange-{}", uuid::Uuid::new_v4());
    let queue = format!("test-queue-{}", uuid::Uuid::new_v4());

    let conn = AmqpConnection::connect(&config.amqp)
        .await
        .expect("Failed to connect");
    conn.declare_binding(&exchange, &queue, "#")
        .await
        .expect("Failed to declare binding");

    let client = Client::with_connection(Arc::new(conn), &config);
    (client, exchange, queue)
}

/// Handler forwarding every payload to a channel, failing on "bad".
fn forwarding_handler(
    tx: mpsc::Sender<Bytes>,
) -> impl Fn(Bytes) -> futures::future::BoxFuture<'static, Result<(), HandlerError>> + Send + Sync
{
    move |body: Bytes| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(body.clone()).await;
            if body.as_ref() == b"bad" {
                return Err(HandlerError::from("bad payload"));
            }
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_publish_and_consume_in_order() {
    println!("=== AMQP Publish and Consume Test ===");
    println!("Starting RabbitMQ container...");

    let (_container, url) = start_rabbitmq().await;
    let (client, exchange, queue) = bound_client(&url).await;

    let (tx, mut rx) = mpsc::channel(10);
    client
        .subscribe(&queue, forwarding_handler(tx))
        .await
        .expect("Failed to subscribe");

    let publisher = client
        .publisher(&exchange)
        .await
        .expect("Failed to create publisher");
    publisher.publish("created", "order-1").await.unwrap();
    publisher.publish("created", "order-2").await.unwrap();

    let mut received = Vec::new();
    for _ in 0..2 {
        let body = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for message")
            .expect("Channel closed");
        received.push(body);
    }

    assert_eq!(
        received,
        vec![Bytes::from_static(b"order-1"), Bytes::from_static(b"order-2")]
    );

    client.close().await;
    println!("=== AMQP Publish and Consume Test PASSED ===");
}

#[tokio::test]
async fn test_failed_handler_leaves_message_for_redelivery() {
    println!("=== AMQP Redelivery Test ===");

    let (_container, url) = start_rabbitmq().await;
    let (client, exchange, queue) = bound_client(&url).await;

    let (tx, mut rx) = mpsc::channel(10);
    client
        .subscribe(&queue, forwarding_handler(tx))
        .await
        .expect("Failed to subscribe");

    client.publish(&exchange, "created", "bad").await.unwrap();
    client.publish(&exchange, "created", "good").await.unwrap();

    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for message")
            .expect("Channel closed");
    }
    client.close().await;

    // A fresh consumer gets the unacknowledged "bad" message back, and only it.
    let (second, _exchange, _queue) = bound_client(&url).await;
    let (tx, mut rx) = mpsc::channel(10);
    second
        .subscribe(&queue, forwarding_handler(tx))
        .await
        .expect("Failed to resubscribe");

    let redelivered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for redelivery")
        .expect("Channel closed");
    assert_eq!(redelivered, Bytes::from_static(b"bad"));

    second.close().await;
    println!("=== AMQP Redelivery Test PASSED ===");
}

#[tokio::test]
async fn test_publish_after_close_is_dead() {
    let (_container, url) = start_rabbitmq().await;
    let (client, exchange, _queue) = bound_client(&url).await;

    client.publish(&exchange, "created", "order-1").await.unwrap();
    client.close().await;

    let result = client.publish(&exchange, "created", "order-2").await;
    assert!(matches!(result, Err(BusError::PublisherDead)));
}

#[tokio::test]
async fn test_consume_missing_queue_fails() {
    let (_container, url) = start_rabbitmq().await;
    let (client, _exchange, _queue) = bound_client(&url).await;

    let result = client.subscriber("no-such-queue").await;

    assert!(matches!(result, Err(BusError::Subscribe(_))));
    client.close().await;
}
