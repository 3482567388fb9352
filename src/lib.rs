//! Webhook delivery for the test-result database.
//!
//! A mutation saved through the [`catalog::Catalog`] is handed to the
//! [`trigger::EventTrigger`], which resolves the interested subscriptions,
//! serializes one envelope and submits one delivery per subscription to the
//! [`pool::DispatchPool`]. Each delivery is a single POST whose outcome is
//! recorded in the bounded [`log_store::DeliveryLog`].

pub mod catalog;
pub mod config;
pub mod entities;
pub mod error;
pub mod executor;
pub mod log_store;
pub mod payload;
pub mod pool;
pub mod resolver;
pub mod signature;
pub mod transport;
pub mod trigger;
pub mod types;

pub use catalog::Catalog;
pub use config::{DispatchMode, WebhookConfig, RETENTION_LIMIT, WORKER_COUNT};
pub use entities::{Project, ReferenceSet, Submission, TestReference, TestResult, WatchedEntity};
pub use trigger::{EventTrigger, ProcessingSwitch};
pub use types::{DeliveryLogEntry, EntityKind, InterestFlags, Subscription};
