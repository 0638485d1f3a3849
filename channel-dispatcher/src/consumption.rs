use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::consumer_group::{ConsumedRecord, ConsumerGroup, RecordHandler};
use crate::error::{ConsumerGroupError, ForwardError};
use crate::forwarder::{MessageForwarder, RetryPolicy};
use crate::metrics_consts::{CONSUMER_GROUP_ERRORS, FORWARD_DURATION, RECORDS_FORWARDED};
use crate::subscriber::SubscriberSpec;

/// Hands every record of a consume epoch to the forwarder, bound to one subscriber.
///
/// A record the forwarder could not deliver is held back for the redelivery backoff
/// before the failure is reported, so the group does not redeliver it in a hot loop.
pub struct SubscriberHandler {
    spec: SubscriberSpec,
    forwarder: Arc<dyn MessageForwarder>,
    redelivery_policy: RetryPolicy,
    consecutive_failures: AtomicU32,
    token: CancellationToken,
}

impl SubscriberHandler {
    pub fn new(
        spec: SubscriberSpec,
        forwarder: Arc<dyn MessageForwarder>,
        redelivery_policy: RetryPolicy,
        token: CancellationToken,
    ) -> Self {
        Self {
            spec,
            forwarder,
            redelivery_policy,
            consecutive_failures: AtomicU32::new(0),
            token,
        }
    }

    async fn back_off(&self, error: &ForwardError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        let wait = self
            .redelivery_policy
            .time_until_next_retry(failures, error.retry_after());

        debug!(
            uid = %self.spec.uid,
            failures = failures + 1,
            "holding back redelivery for {:?}",
            wait
        );
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[async_trait]
impl RecordHandler for SubscriberHandler {
    async fn handle(&self, record: &ConsumedRecord) -> Result<(), ForwardError> {
        let start = Instant::now();
        let result = self.forwarder.forward(record, &self.spec).await;

        let status = match &result {
            Ok(()) => "delivered",
            Err(_) => "failed",
        };
        metrics::counter!(RECORDS_FORWARDED, "status" => status).increment(1);
        metrics::histogram!(FORWARD_DURATION).record(start.elapsed().as_secs_f64());

        match &result {
            Ok(()) => self.consecutive_failures.store(0, Ordering::SeqCst),
            Err(e) => self.back_off(e).await,
        }
        result
    }
}

/// The two tasks running for a registered subscriber.
pub struct ConsumptionTasks {
    pub errors: Option<JoinHandle<()>>,
    pub pump: JoinHandle<()>,
}

/// Start consuming `topic` with `group` on behalf of one subscriber.
///
/// The pump only stops once `token` is cancelled and the group is closed; closing
/// the group is what unblocks a running consume call.
pub fn spawn_consumption(
    group: Arc<dyn ConsumerGroup>,
    topic: String,
    spec: SubscriberSpec,
    forwarder: Arc<dyn MessageForwarder>,
    redelivery_policy: RetryPolicy,
    token: CancellationToken,
) -> ConsumptionTasks {
    let errors = group.take_errors().map(|mut errors| {
        let group_id = group.group_id().to_owned();
        tokio::spawn(async move {
            info!(group_id, "consumer group error processing started");
            while let Some(e) = errors.recv().await {
                error!(group_id, "consumer group error: {}", e);
                metrics::counter!(CONSUMER_GROUP_ERRORS, "source" => "stream").increment(1);
            }
            info!(group_id, "consumer group error processing stopped");
        })
    });

    let handler = SubscriberHandler::new(spec, forwarder, redelivery_policy, token.clone());
    let pump = tokio::spawn(async move {
        let group_id = group.group_id().to_owned();

        loop {
            if token.is_cancelled() {
                info!(group_id, "consumer group stopped, ceasing consumption");
                return;
            }

            debug!(group_id, topic, "consume epoch started");
            match group.consume(&topic, &handler).await {
                Ok(()) => {}
                Err(ConsumerGroupError::Closed) => {
                    info!(group_id, "consumer group closed, ceasing consumption");
                    return;
                }
                Err(e) => {
                    error!(group_id, "consumer group failed to consume records: {}", e);
                    metrics::counter!(CONSUMER_GROUP_ERRORS, "source" => "consume")
                        .increment(1);
                }
            }

            tokio::task::yield_now().await;
        }
    });

    ConsumptionTasks { errors, pump }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{record, FakeConsumerGroup, RecordingForwarder};
    use rdkafka::error::{KafkaError, RDKafkaErrorCode};
    use std::time::Duration;

    fn spec() -> SubscriberSpec {
        SubscriberSpec::new("sub-1", None)
    }

    fn fast_redelivery() -> RetryPolicy {
        RetryPolicy::new(1, Duration::from_millis(1), Some(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_pump_forwards_records_until_closed() {
        let group = Arc::new(FakeConsumerGroup::new("kafka.sub-1"));
        group.push_records(vec![record(0), record(1), record(2)]);
        let forwarder = Arc::new(RecordingForwarder::default());
        let token = CancellationToken::new();

        let tasks = spawn_consumption(
            group.clone(),
            "default.channel".to_owned(),
            spec(),
            forwarder.clone(),
            fast_redelivery(),
            token.clone(),
        );

        forwarder.wait_for(3).await;
        token.cancel();
        group.close().unwrap();

        tokio::time::timeout(Duration::from_secs(5), tasks.pump)
            .await
            .expect("pump did not stop")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), tasks.errors.unwrap())
            .await
            .expect("error drain did not stop")
            .unwrap();

        assert_eq!(forwarder.delivered_offsets("sub-1"), vec![0, 1, 2]);
        assert_eq!(group.stored_offsets(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_records_are_not_stored() {
        let group = Arc::new(FakeConsumerGroup::new("kafka.sub-1"));
        group.push_records(vec![record(0), record(1)]);
        let forwarder = Arc::new(RecordingForwarder::failing_offsets([1]));
        let token = CancellationToken::new();

        let tasks = spawn_consumption(
            group.clone(),
            "default.channel".to_owned(),
            spec(),
            forwarder.clone(),
            fast_redelivery(),
            token.clone(),
        );

        forwarder.wait_for(2).await;
        token.cancel();
        group.close().unwrap();
        tokio::time::timeout(Duration::from_secs(5), tasks.pump)
            .await
            .expect("pump did not stop")
            .unwrap();

        assert_eq!(group.stored_offsets(), vec![1]);
    }

    #[tokio::test]
    async fn test_failed_record_redelivery_is_spaced_out() {
        let group = Arc::new(FakeConsumerGroup::new("kafka.sub-1"));
        let forwarder = Arc::new(RecordingForwarder::failing_offsets([0]));
        let token = CancellationToken::new();
        let interval = Duration::from_millis(100);

        let tasks = spawn_consumption(
            group.clone(),
            "default.channel".to_owned(),
            spec(),
            forwarder.clone(),
            RetryPolicy::new(1, interval, Some(interval)),
            token.clone(),
        );

        let start = Instant::now();
        group.push_records(vec![record(0)]);
        forwarder.wait_for(3).await;
        let elapsed = start.elapsed();

        token.cancel();
        group.close().unwrap();
        tokio::time::timeout(Duration::from_secs(5), tasks.pump)
            .await
            .expect("pump did not stop")
            .unwrap();

        assert!(elapsed >= interval * 2, "redelivered after {elapsed:?}");
        assert!(group.stored_offsets().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_redelivery_backoff() {
        let group = Arc::new(FakeConsumerGroup::new("kafka.sub-1"));
        let forwarder = Arc::new(RecordingForwarder::failing_offsets([0]));
        let token = CancellationToken::new();
        let interval = Duration::from_secs(60);

        let tasks = spawn_consumption(
            group.clone(),
            "default.channel".to_owned(),
            spec(),
            forwarder.clone(),
            RetryPolicy::new(1, interval, Some(interval)),
            token.clone(),
        );

        group.push_records(vec![record(0)]);
        forwarder.wait_for(1).await;

        group.close().unwrap();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), tasks.pump)
            .await
            .expect("pump did not stop")
            .unwrap();

        assert_eq!(forwarder.attempts(), 1);
    }

    #[tokio::test]
    async fn test_pump_restarts_after_rebalance_and_errors() {
        let group = Arc::new(FakeConsumerGroup::new("kafka.sub-1"));
        group.fail_next_consumes(2);
        let forwarder = Arc::new(RecordingForwarder::default());
        let token = CancellationToken::new();

        let tasks = spawn_consumption(
            group.clone(),
            "default.channel".to_owned(),
            spec(),
            forwarder.clone(),
            fast_redelivery(),
            token.clone(),
        );

        group.wait_for_consume_calls(3).await;
        group.rebalance();
        group.wait_for_consume_calls(4).await;

        group.push_records(vec![record(5)]);
        forwarder.wait_for(1).await;

        token.cancel();
        group.close().unwrap();
        tokio::time::timeout(Duration::from_secs(5), tasks.pump)
            .await
            .expect("pump did not stop")
            .unwrap();

        assert_eq!(forwarder.delivered_offsets("sub-1"), vec![5]);
    }

    #[tokio::test]
    async fn test_error_stream_is_drained() {
        let group = Arc::new(FakeConsumerGroup::new("kafka.sub-1"));
        let token = CancellationToken::new();

        let tasks = spawn_consumption(
            group.clone(),
            "default.channel".to_owned(),
            spec(),
            Arc::new(RecordingForwarder::default()),
            fast_redelivery(),
            token.clone(),
        );

        group.push_error(ConsumerGroupError::Kafka(KafkaError::Global(
            RDKafkaErrorCode::BrokerTransportFailure,
        )));
        group.push_error(ConsumerGroupError::Kafka(KafkaError::Global(
            RDKafkaErrorCode::AllBrokersDown,
        )));

        token.cancel();
        group.close().unwrap();

        tokio::time::timeout(Duration::from_secs(5), tasks.errors.unwrap())
            .await
            .expect("error drain did not stop")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), tasks.pump)
            .await
            .expect("pump did not stop")
            .unwrap();
    }
}
