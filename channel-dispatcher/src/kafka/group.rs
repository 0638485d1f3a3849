use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Offset};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::DispatcherConsumerContext;
use crate::consumer_group::{
    ConsumedRecord, ConsumerGroup, ConsumerGroupFactory, RecordHandler,
};
use crate::error::{ConsumerGroupError, ForwardError};
use crate::settings::ClientSettings;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// What woke up a consume epoch.
enum Step {
    Closed,
    Rebalanced,
    Record(ConsumedRecord),
    Failed(KafkaError),
}

/// A consumer group backed by an rdkafka `StreamConsumer`.
///
/// Offsets are stored manually once a record was handled and committed by the
/// auto commit timer, so the committed offset never moves past an undelivered record.
pub struct KafkaConsumerGroup {
    group_id: String,
    consumer: StreamConsumer<DispatcherConsumerContext>,
    subscribed_topic: Mutex<Option<String>>,
    closing: CancellationToken,
    closed: AtomicBool,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<ConsumerGroupError>>>,
}

impl KafkaConsumerGroup {
    pub fn new(
        brokers: &[String],
        settings: &ClientSettings,
        group_id: &str,
    ) -> Result<Self, ConsumerGroupError> {
        if brokers.is_empty() {
            return Err(ConsumerGroupError::InvalidConfig {
                group_id: group_id.to_owned(),
                reason: "no bootstrap servers configured".to_owned(),
            });
        }

        let mut config = ClientConfig::new();
        settings.apply_to(&mut config);
        config
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false");

        let (context, errors_rx) = DispatcherConsumerContext::new(group_id);
        let consumer: StreamConsumer<DispatcherConsumerContext> = config
            .create_with_context(context)
            .map_err(|e| match e {
                KafkaError::ClientCreation(reason) => ConsumerGroupError::InvalidConfig {
                    group_id: group_id.to_owned(),
                    reason,
                },
                KafkaError::ClientConfig(_, description, key, _) => {
                    ConsumerGroupError::InvalidConfig {
                        group_id: group_id.to_owned(),
                        reason: format!("{key}: {description}"),
                    }
                }
                e => ConsumerGroupError::Kafka(e),
            })?;

        Ok(Self {
            group_id: group_id.to_owned(),
            consumer,
            subscribed_topic: Mutex::new(None),
            closing: CancellationToken::new(),
            closed: AtomicBool::new(false),
            errors_rx: Mutex::new(Some(errors_rx)),
        })
    }

    fn ensure_subscribed(&self, topic: &str) -> Result<(), ConsumerGroupError> {
        let mut subscribed = self.subscribed_topic.lock();
        if subscribed.as_deref() == Some(topic) {
            return Ok(());
        }

        self.consumer.subscribe(&[topic])?;
        info!(group_id = self.group_id, topic, "subscribed to topic");
        *subscribed = Some(topic.to_owned());
        Ok(())
    }

    fn record_delivered(&self, record: &ConsumedRecord) -> Result<(), ConsumerGroupError> {
        self.consumer
            .store_offset(&record.topic, record.partition, record.offset + 1)?;
        Ok(())
    }

    /// Rewind the partition so the undelivered record is consumed again.
    fn record_failed(&self, record: &ConsumedRecord, error: &ForwardError) {
        warn!(
            group_id = self.group_id,
            topic = record.topic,
            partition = record.partition,
            offset = record.offset,
            "record was not delivered, rewinding partition: {}",
            error
        );

        if let Err(e) = self.consumer.seek(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset),
            SEEK_TIMEOUT,
        ) {
            warn!(
                group_id = self.group_id,
                partition = record.partition,
                "failed to rewind partition: {}",
                e
            );
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn consume(
        &self,
        topic: &str,
        handler: &dyn RecordHandler,
    ) -> Result<(), ConsumerGroupError> {
        if self.closing.is_cancelled() {
            return Err(ConsumerGroupError::Closed);
        }
        self.ensure_subscribed(topic)?;

        loop {
            let step = tokio::select! {
                biased;

                _ = self.closing.cancelled() => Step::Closed,
                _ = self.consumer.context().rebalanced() => Step::Rebalanced,
                message = self.consumer.recv() => match message {
                    Ok(message) => Step::Record(ConsumedRecord::from_message(&message)),
                    Err(e) => Step::Failed(e),
                },
            };

            match step {
                Step::Closed => return Err(ConsumerGroupError::Closed),
                Step::Rebalanced => {
                    debug!(group_id = self.group_id, "rebalance ended consume epoch");
                    return Ok(());
                }
                Step::Failed(e) => return Err(ConsumerGroupError::Kafka(e)),
                Step::Record(record) => match handler.handle(&record).await {
                    Ok(()) => self.record_delivered(&record)?,
                    Err(e) => self.record_failed(&record, &e),
                },
            }
        }
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<ConsumerGroupError>> {
        self.errors_rx.lock().take()
    }

    fn close(&self) -> Result<(), ConsumerGroupError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsumerGroupError::Closed);
        }

        self.closing.cancel();

        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => {}
            // Nothing was consumed since the last commit.
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => return Err(ConsumerGroupError::Kafka(e)),
        }

        if self.subscribed_topic.lock().take().is_some() {
            self.consumer.unsubscribe();
        }
        self.consumer.context().close_errors();
        self.closed.store(true, Ordering::SeqCst);

        Ok(())
    }
}

/// Creates rdkafka backed consumer groups.
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaConsumerGroupFactory;

impl ConsumerGroupFactory for KafkaConsumerGroupFactory {
    fn create_group(
        &self,
        brokers: &[String],
        settings: &ClientSettings,
        group_id: &str,
    ) -> Result<Arc<dyn ConsumerGroup>, ConsumerGroupError> {
        let group = KafkaConsumerGroup::new(brokers, settings, group_id)?;
        Ok(Arc::new(group))
    }
}
