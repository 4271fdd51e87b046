#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use rbus::broker::PubSub;
//! use rbus::pubapi::{PublishParams, SubscribeParams};
//! use rbus::registry::{EndpointConfig, TopicConfig};
//! use rbus::storage::MemGdStorage;
//! use rbus::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!
//!     let ps = PubSub::builder().storage(MemGdStorage::new()).build().await?;
//!
//!     ps.registry.create_topic("orders.new".into(), TopicConfig::default())?;
//!     let ep = ps.registry.create_endpoint(EndpointConfig {
//!         name: "shop".into(),
//!         topic_patterns: "pub=orders.**\nsub=orders.**".into(),
//!         ..Default::default()
//!     })?;
//!
//!     let sub = ps
//!         .subscribe(SubscribeParams {
//!             topic: "orders.new".into(),
//!             endpoint_id: Some(ep.id),
//!             ..Default::default()
//!         })
//!         .await?;
//!
//!     ps.publish(PublishParams {
//!         topic: Some("orders.new".into()),
//!         data: Some("a new order".into()),
//!         endpoint_id: Some(ep.id),
//!         ..Default::default()
//!     })
//!     .await?;
//!
//!     let msgs = ps.get_messages(&sub.sub_key, None, None).await?;
//!     println!("{} message(s)", msgs.len());
//!     Ok(())
//! }
//!
//! ```

/// Core Broker Components
pub mod backlog; // In-RAM message backlog
pub mod broker; // Shared broker context
pub mod pubapi; // Publish/subscribe operations
pub mod registry; // Topics, endpoints and subscriptions

/// Delivery Pipeline
pub mod task; // Per-subscriber delivery tasks
pub mod tool; // Delivery coordination across subscribers

/// Supporting Services
pub mod matcher; // Topic permission patterns
pub mod message; // Message model and wire form
pub mod stats; // Runtime counters
pub mod storage; // Guaranteed-delivery storage interface

/// Common Definitions
pub mod error; // Error types
pub mod types; // Common data types

/// External Crate Re-exports
pub use error::{BrokerError, Result}; // Broker error types
pub use rbus_conf as conf; // Configuration layer
pub use rbus_utils as utils; // Shared helpers
