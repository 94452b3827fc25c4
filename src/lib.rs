#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Streamline Client
//!
//! Client-side group coordination for Kafka-compatible brokers. A process
//! uses it to join, stay in and cleanly leave a **consumer**, **share** or
//! **streams** group while a dedicated network thread talks to the group
//! coordinator and the partition leaders.
//!
//! ## Features
//!
//! - **Two-thread model**: user calls become events on a queue; one
//!   background thread owns every request manager and the transport
//! - **Coordinator discovery**: FindCoordinator with exponential backoff and
//!   disconnect tracking
//! - **Heartbeats**: consumer, streams and share group heartbeats with
//!   interval, backoff and poll-timer handling
//! - **Reconciliation**: one membership state machine for all group types,
//!   revoking before assigning and never re-applying an aborted step
//! - **Share acknowledgements**: per-node batching, sync/async ordering,
//!   retries and leadership-change recovery
//!
//! ## Quick Start
//!
//! ```no_run
//! use streamline_client::config::ConsumerConfig;
//! use streamline_client::consumer::ShareConsumer;
//! use streamline_client::consumer::metadata::ClusterMetadata;
//! use streamline_client::consumer::protocol::Node;
//! use streamline_client::testing::MockClient;
//! use streamline_client::util::SystemClock;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> streamline_client::Result<()> {
//!     let config = ConsumerConfig::builder().group_id("billing").build_validated()?;
//!     let transport = MockClient::new(vec![Node::new(1, "localhost", 9092)]);
//!     let mut consumer = ShareConsumer::new(
//!         config,
//!         Box::new(transport),
//!         Box::new(ClusterMetadata::new()),
//!         Arc::new(SystemClock::new()),
//!     )?;
//!
//!     consumer.subscribe(["invoices".to_string()].into())?;
//!     for record in consumer.poll(Duration::from_millis(500))? {
//!         println!("{}@{}", record.partition, record.offset);
//!     }
//!     consumer.commit_sync(Duration::from_secs(5))?;
//!     consumer.close(Duration::from_secs(5))
//! }
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`consumer`] | Request managers, membership, events and the facades |
//! | [`config`] | [`ConsumerConfig`] and its builder |
//! | [`error`] | [`ConsumerError`] and Kafka error codes |
//! | [`metrics`] | Metric recording (feature `metrics`) |
//! | [`testing`] | In-memory transport and metadata for tests |
//! | [`util`] | Clocks, timers and backoff |

// Deny .unwrap() in production code; the background thread must never panic.
// Test code is exempt via #[cfg(test)] and --cfg test.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod testing;
pub mod util;

pub use config::{AcknowledgementMode, ConsumerConfig};
pub use consumer::{AsyncConsumer, ShareConsumer, StreamsGroupMember, WakeupTrigger};
pub use error::{ConsumerError, KafkaErrorCode, Result};
