//! Kafka channel dispatcher.
//!
//! Turns the desired set of subscribers of a channel into one Kafka consumer group per
//! subscriber, each pumping records from the channel topic to its subscriber, and keeps
//! that set of groups in sync as subscribers and consumer settings change.

pub mod config;
pub mod consumer_group;
pub mod consumption;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod kafka;
pub mod metrics;
pub mod metrics_consts;
pub mod settings;
pub mod subscriber;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

pub use dispatcher::{Dispatcher, DispatcherConfig, KafkaDispatcher};
pub use subscriber::{SubscriberSpec, SubscriberUid};
