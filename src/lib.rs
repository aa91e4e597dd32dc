//! relaymq - resilient AMQP publish/subscribe client
//!
//! One long-lived broker connection shared by any number of publishers and
//! subscribers, with a close that returns only after every loop has stopped.
//!
//! ```no_run
//! use bytes::Bytes;
//! use relaymq::bus::HandlerError;
//! use relaymq::Client;
//!
//! # async fn run() -> relaymq::bus::Result<()> {
//! let client = Client::open("amqp://localhost:5672").await?;
//!
//! client
//!     .subscribe("orders.created", |body: Bytes| async move {
//!         println!("{}", String::from_utf8_lossy(&body));
//!         Ok::<(), HandlerError>(())
//!     })
//!     .await?;
//!
//! client.publish("orders", "created", "order-1").await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod client;
pub mod config;
pub mod utils;

pub use bus::{BusError, Handler, HandlerError};
pub use client::{Client, Publisher, Subscriber};
pub use config::{ClientConfig, Config};
