//! `ami`: a client library for a reliable, at-least-once message queue built on Redis Cluster
//! Streams (`XADD`/`XREADGROUP`/`XACK`/`XDEL`/`XGROUP CREATE`/`XINFO STREAM`).
//!
//! Two long-lived endpoints are exposed: [`Producer`] ingests strings and publishes them across
//! shard-streams in pipelined batches; [`Consumer`] pulls messages back out under a consumer-
//! group discipline and requires explicit [`Consumer::ack`].
//!
//! ```no_run
//! # async fn run() -> ami::error::AmiResult<()> {
//! use ami::{Consumer, Producer};
//! use ami::config::{ConsumerOptions, ProducerOptions};
//! use ami::redis::Store;
//!
//! let store = Store::connect("redis://127.0.0.1:6379").await?;
//!
//! let producer = Producer::new(ProducerOptions::new("orders"), store.clone()).await?;
//! producer.send("hello".to_string()).await?;
//! producer.close().await?;
//!
//! let mut consumer = Consumer::new(ConsumerOptions::new("orders", "worker-1"), store).await?;
//! let mut rx = consumer.start()?;
//! if let Some(msg) = rx.recv().await {
//!     consumer.ack(msg).await?;
//! }
//! consumer.stop().await?;
//! consumer.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! At-least-once delivery only: duplicates are possible on producer retry after a commit whose
//! acknowledgement was lost, and on consumer recovery via the backlog phase after an unacked
//! crash. See each module's docs for the exact guarantees.

pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod metrics;
pub mod metrics_server;
pub mod naming;
pub mod notifier;
pub mod producer;
pub mod redis;
pub mod retry;

pub use consumer::Consumer;
pub use error::{AmiError, AmiResult};
pub use message::Message;
pub use notifier::{ClosureNotifier, ErrorNotifier, TracingNotifier};
pub use producer::Producer;
