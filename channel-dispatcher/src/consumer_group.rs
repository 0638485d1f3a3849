use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::message::{Headers, Message};
use tokio::sync::mpsc;

use crate::error::{ConsumerGroupError, ForwardError};
use crate::settings::ClientSettings;

/// An owned copy of one record pulled from the channel topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp: Option<i64>,
}

impl ConsumedRecord {
    pub fn from_message<M: Message>(message: &M) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|header| {
                        header
                            .value
                            .map(|value| (header.key.to_owned(), value.to_vec()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            headers,
            timestamp: message.timestamp().to_millis(),
        }
    }

    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_slice())
    }
}

/// Callback invoked for every record yielded during a consume epoch.
///
/// An `Err` means the record was not delivered: its offset must not be committed.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &ConsumedRecord) -> Result<(), ForwardError>;
}

/// A handle onto one Kafka consumer group bound to a cluster.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    fn group_id(&self) -> &str;

    /// Consume `topic` for one rebalance epoch.
    ///
    /// Returns `Ok(())` when a rebalance ends the epoch and the caller should
    /// consume again, or `Err(ConsumerGroupError::Closed)` once `close` was called.
    async fn consume(
        &self,
        topic: &str,
        handler: &dyn RecordHandler,
    ) -> Result<(), ConsumerGroupError>;

    /// The group's error stream. Can only be taken once, and ends when the group closes.
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<ConsumerGroupError>>;

    /// Leave the group and release its connection, unblocking any running `consume`.
    fn close(&self) -> Result<(), ConsumerGroupError>;
}

/// Builds consumer group handles. Must be safe to call concurrently for distinct groups.
pub trait ConsumerGroupFactory: Send + Sync {
    fn create_group(
        &self,
        brokers: &[String],
        settings: &ClientSettings,
        group_id: &str,
    ) -> Result<Arc<dyn ConsumerGroup>, ConsumerGroupError>;
}
