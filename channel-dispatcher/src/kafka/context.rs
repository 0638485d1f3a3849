use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientContext, Statistics, TopicPartitionList};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::error::ConsumerGroupError;
use crate::metrics_consts::CONSUMER_LAG;

/// Consumer context of a single consumer group.
///
/// Every completed rebalance wakes up the running consume call so that it can end
/// its epoch, and client errors are pushed onto the group's error stream until the
/// group is closed.
pub struct DispatcherConsumerContext {
    group_id: String,
    rebalanced: Notify,
    errors_tx: Mutex<Option<mpsc::UnboundedSender<ConsumerGroupError>>>,
}

impl DispatcherConsumerContext {
    pub fn new(
        group_id: &str,
    ) -> (Self, mpsc::UnboundedReceiver<ConsumerGroupError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = Self {
            group_id: group_id.to_owned(),
            rebalanced: Notify::new(),
            errors_tx: Mutex::new(Some(tx)),
        };
        (context, rx)
    }

    /// Resolves once the next rebalance has completed.
    pub async fn rebalanced(&self) {
        self.rebalanced.notified().await
    }

    /// Drop the sender side of the error stream, ending it for any reader.
    pub fn close_errors(&self) {
        self.errors_tx.lock().take();
    }

    fn push_error(&self, error: ConsumerGroupError) {
        if let Some(tx) = self.errors_tx.lock().as_ref() {
            if tx.send(error).is_err() {
                debug!(group_id = self.group_id, "error stream has no reader");
            }
        }
    }
}

impl ClientContext for DispatcherConsumerContext {
    fn stats(&self, stats: Statistics) {
        for (topic, topic_stats) in stats.topics {
            for (partition, partition_stats) in topic_stats.partitions {
                // librdkafka reports the internal UA partition as -1.
                if partition < 0 {
                    continue;
                }
                metrics::gauge!(
                    CONSUMER_LAG,
                    "group_id" => self.group_id.clone(),
                    "topic" => topic.clone(),
                    "partition" => partition.to_string()
                )
                .set(partition_stats.consumer_lag as f64);
            }
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(group_id = self.group_id, "consumer group error: {}: {}", error, reason);
        self.push_error(ConsumerGroupError::Kafka(error));
    }
}

impl ConsumerContext for DispatcherConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!(group_id = self.group_id, "pre-rebalance event: {:?}", rebalance);
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(
                    group_id = self.group_id,
                    "assigned {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Revoke(partitions) => {
                info!(
                    group_id = self.group_id,
                    "revoked {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!(group_id = self.group_id, "rebalance error: {}", e);
            }
        }

        self.rebalanced.notify_one();
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!(
                group_id = self.group_id,
                "committed offsets for {} partitions",
                offsets.count()
            ),
            Err(e) => warn!(group_id = self.group_id, "failed to commit offsets: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::error::RDKafkaErrorCode;

    #[tokio::test]
    async fn test_errors_are_streamed_until_closed() {
        let (context, mut errors) = DispatcherConsumerContext::new("kafka.sub-1");

        context.error(
            KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure),
            "broker down",
        );
        assert!(matches!(
            errors.recv().await,
            Some(ConsumerGroupError::Kafka(_))
        ));

        context.close_errors();
        context.error(
            KafkaError::Global(RDKafkaErrorCode::AllBrokersDown),
            "all brokers down",
        );
        assert!(errors.recv().await.is_none());
    }
}
