pub mod context;
pub mod group;

pub use group::{KafkaConsumerGroup, KafkaConsumerGroupFactory};
