//! Reliable publishing and resumable consumption over append-only streams.
//!
//! This crate provides the two halves of at-least-once stream messaging:
//!
//! - **Producer**: non-blocking sends with per-record confirmations and
//!   broker-side deduplication keyed by producer name and publishing id
//! - **Confirmation tracker**: a countdown to wait for a batch of confirmations
//! - **Consumer**: single-threaded delivery in offset order that resumes after
//!   the offset last stored under its name
//! - **Tracking policy**: manual or periodic offset checkpoints
//! - **Broker**: the log service abstraction, with an in-memory implementation
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rill_stream::{
//!     ConfirmationTracker, ConsumerConfig, Environment, MessageContext, ProducerConfig, Record,
//!     StreamOptions, TrackingPolicy,
//! };
//!
//! #[tokio::main]
//! async fn main() -> rill_stream::Result<()> {
//!     let env = Environment::in_memory();
//!     env.create_stream("orders", StreamOptions::default()).await?;
//!
//!     let producer = env.producer(ProducerConfig::new("orders").with_name("app-1")).await?;
//!     let start = producer.resume_point().await?;
//!     let tracker = Arc::new(ConfirmationTracker::expecting(10));
//!     for id in start..start + 10 {
//!         let record = Record::new(format!("message {id}")).with_publishing_id(id);
//!         producer.send(record, tracker.callback())?;
//!     }
//!     tracker.await_all(Duration::from_secs(10)).await;
//!     producer.close().await?;
//!
//!     let consumer = env.consumer(
//!         ConsumerConfig::new("orders")
//!             .with_name("c1")
//!             .with_tracking(TrackingPolicy::periodic(3)),
//!         |ctx: &mut MessageContext, record: &Record| -> anyhow::Result<()> {
//!             println!("{}: {:?}", ctx.offset(), record.body_str());
//!             Ok(())
//!         },
//!     )?;
//!     consumer.close().await?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod broker;
pub mod confirm;
pub mod consumer;
pub mod environment;
pub mod error;
pub mod producer;
pub mod record;
pub mod snapshot;
pub mod state;
pub mod tracking;
pub mod types;
pub mod wait;

// Re-export main types
pub use broker::{AppendOutcome, BrokerSnapshot, InMemoryBroker, StreamBroker, TracingBroker};
pub use confirm::{ConfirmationCode, ConfirmationStatus, ConfirmationTracker};
pub use consumer::{
    Consumer, ConsumerConfig, ConsumerHandle, DeliveryReport, MessageContext, MessageHandler,
    RetryConfig,
};
pub use environment::Environment;
pub use error::{Error, Result};
pub use producer::{Producer, ProducerConfig};
pub use record::{MessageId, Properties, Record};
pub use state::ConsumerState;
pub use tracking::{DEFAULT_STORE_EVERY, TrackingPolicy, TrackingState};
pub use types::{Delivery, Offset, OffsetSpec, PublishingId, StreamBounds, StreamOptions};
pub use wait::{wait_at_most, wait_until};
