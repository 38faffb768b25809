//! corr-lite - Partitioned Message Correlation Engine
//!
//! Message correlation for a partitioned process engine: messages are
//! published to the partition their correlation key hashes to, waiting
//! elements subscribe from whichever partition owns their process instance,
//! and the two sides converge through an at-least-once command protocol
//! that survives lost commands and racing subscribers.
//!
//! Per publish, at most one subscription is correlated. Unmatched messages
//! are buffered until their time to live elapses; unmatched subscriptions
//! wait until a message arrives or the element is left.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use corr_lite_core::config::CorrelationConfig;
//! use corr_lite_core::engine::Cluster;
//! use corr_lite_core::types::PublishMessage;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut cluster = Cluster::new(CorrelationConfig::default());
//! cluster
//!     .publish(PublishMessage {
//!         name: "order-placed".into(),
//!         correlation_key: "order-17".into(),
//!         message_id: String::new(),
//!         variables: r#"{"total":42}"#.into(),
//!         ttl_ms: 60_000,
//!     })
//!     .await?;
//! cluster.run_until_idle().await?;
//! # Ok(())
//! # }
//! ```

// Scalar types, records, and command outcomes
pub mod types;

// Append-only event log
pub mod events;

// Correlation-key partition routing
pub mod router;

// Partition-prefixed key generation
pub mod keys;

// Engine clock (system and manual)
pub mod clock;

// Engine configuration
pub mod config;

// Inter-partition command transport
pub mod gateway;

// Correlation-partition state
pub mod message_state;
pub mod subscription_state;

// Instance-partition state
pub mod process_subscription_state;

// The two processor sides
pub mod correlation;
pub mod instance;

// Expiry and retry sweeps
pub mod scheduler;

// Multi-partition in-memory harness
pub mod engine;

pub use config::CorrelationConfig;
pub use correlation::CorrelationProcessor;
pub use engine::Cluster;
pub use instance::InstanceProcessor;
pub use types::{CommandOutcome, PublishMessage, Rejection};
