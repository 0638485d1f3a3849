use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::consumer_group::{
    ConsumedRecord, ConsumerGroup, ConsumerGroupFactory, RecordHandler,
};
use crate::error::{ConsumerGroupError, ForwardError};
use crate::forwarder::MessageForwarder;
use crate::settings::ClientSettings;
use crate::subscriber::SubscriberSpec;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds, panicking after a few seconds.
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// A record on the test channel topic at `offset`.
pub fn record(offset: i64) -> ConsumedRecord {
    ConsumedRecord {
        topic: "default.channel".to_owned(),
        partition: 0,
        offset,
        key: None,
        payload: Some(format!("{{\"offset\":{offset}}}").into_bytes()),
        headers: vec![("ce_id".to_owned(), offset.to_string().into_bytes())],
        timestamp: None,
    }
}

/// In-memory consumer group. Records pushed onto it are handed to the running
/// consume call. Offsets of handled records are stored and failed records are
/// consumed again, like the real group does.
pub struct FakeConsumerGroup {
    group_id: String,
    records: Mutex<VecDeque<ConsumedRecord>>,
    records_available: Notify,
    rebalanced: Notify,
    stored_offsets: Mutex<Vec<i64>>,
    consume_calls: AtomicUsize,
    consume_failures: AtomicUsize,
    closing: CancellationToken,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    fail_close: AtomicBool,
    errors_tx: Mutex<Option<mpsc::UnboundedSender<ConsumerGroupError>>>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<ConsumerGroupError>>>,
}

impl FakeConsumerGroup {
    pub fn new(group_id: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            group_id: group_id.to_owned(),
            records: Mutex::new(VecDeque::new()),
            records_available: Notify::new(),
            rebalanced: Notify::new(),
            stored_offsets: Mutex::new(Vec::new()),
            consume_calls: AtomicUsize::new(0),
            consume_failures: AtomicUsize::new(0),
            closing: CancellationToken::new(),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
            errors_tx: Mutex::new(Some(tx)),
            errors_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn push_records(&self, records: Vec<ConsumedRecord>) {
        self.records.lock().extend(records);
        self.records_available.notify_one();
    }

    pub fn push_error(&self, error: ConsumerGroupError) {
        if let Some(tx) = self.errors_tx.lock().as_ref() {
            tx.send(error).expect("error stream receiver dropped");
        }
    }

    /// End the current consume epoch.
    pub fn rebalance(&self) {
        self.rebalanced.notify_one();
    }

    /// Make the next `count` consume calls fail immediately.
    pub fn fail_next_consumes(&self, count: usize) {
        self.consume_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn stored_offsets(&self) -> Vec<i64> {
        self.stored_offsets.lock().clone()
    }

    pub fn consume_calls(&self) -> usize {
        self.consume_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn wait_for_consume_calls(&self, count: usize) {
        wait_until("consume calls", || self.consume_calls() >= count).await
    }
}

#[async_trait]
impl ConsumerGroup for FakeConsumerGroup {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn consume(
        &self,
        _topic: &str,
        handler: &dyn RecordHandler,
    ) -> Result<(), ConsumerGroupError> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);

        if self.closing.is_cancelled() {
            return Err(ConsumerGroupError::Closed);
        }

        let failures = self.consume_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.consume_failures.store(failures - 1, Ordering::SeqCst);
            return Err(ConsumerGroupError::Kafka(KafkaError::Global(
                RDKafkaErrorCode::Fail,
            )));
        }

        loop {
            if self.closing.is_cancelled() {
                return Err(ConsumerGroupError::Closed);
            }

            let next = self.records.lock().pop_front();
            if let Some(record) = next {
                match handler.handle(&record).await {
                    Ok(()) => self.stored_offsets.lock().push(record.offset + 1),
                    // Rewind, the record is consumed again.
                    Err(_) => self.records.lock().push_front(record),
                }
                continue;
            }

            tokio::select! {
                biased;

                _ = self.closing.cancelled() => return Err(ConsumerGroupError::Closed),
                _ = self.rebalanced.notified() => return Ok(()),
                _ = self.records_available.notified() => {}
            }
        }
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<ConsumerGroupError>> {
        self.errors_rx.lock().take()
    }

    fn close(&self) -> Result<(), ConsumerGroupError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_close.load(Ordering::SeqCst) {
            return Err(ConsumerGroupError::Kafka(KafkaError::Global(
                RDKafkaErrorCode::BrokerTransportFailure,
            )));
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ConsumerGroupError::Closed);
        }

        self.closing.cancel();
        self.errors_tx.lock().take();
        Ok(())
    }
}

/// Hands out `FakeConsumerGroup`s and remembers every one of them.
#[derive(Default)]
pub struct FakeConsumerGroupFactory {
    groups: Mutex<Vec<Arc<FakeConsumerGroup>>>,
    settings: Mutex<Vec<ClientSettings>>,
    failing_group_ids: Mutex<HashSet<String>>,
}

impl FakeConsumerGroupFactory {
    /// Refuse to create the group with `group_id` from now on.
    pub fn fail_group(&self, group_id: &str) {
        self.failing_group_ids.lock().insert(group_id.to_owned());
    }

    pub fn allow_group(&self, group_id: &str) {
        self.failing_group_ids.lock().remove(group_id);
    }

    pub fn created_count(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn groups(&self) -> Vec<Arc<FakeConsumerGroup>> {
        self.groups.lock().clone()
    }

    /// The most recently created group with `group_id`.
    pub fn group(&self, group_id: &str) -> Option<Arc<FakeConsumerGroup>> {
        self.groups
            .lock()
            .iter()
            .rev()
            .find(|g| g.group_id() == group_id)
            .cloned()
    }

    /// Settings passed to the most recent create call.
    pub fn last_settings(&self) -> Option<ClientSettings> {
        self.settings.lock().last().cloned()
    }
}

impl ConsumerGroupFactory for FakeConsumerGroupFactory {
    fn create_group(
        &self,
        _brokers: &[String],
        settings: &ClientSettings,
        group_id: &str,
    ) -> Result<Arc<dyn ConsumerGroup>, ConsumerGroupError> {
        self.settings.lock().push(settings.clone());

        if self.failing_group_ids.lock().contains(group_id) {
            return Err(ConsumerGroupError::InvalidConfig {
                group_id: group_id.to_owned(),
                reason: "refused by test factory".to_owned(),
            });
        }

        let group = Arc::new(FakeConsumerGroup::new(group_id));
        self.groups.lock().push(group.clone());
        Ok(group)
    }
}

/// Records every forward call, failing for a configurable set of offsets.
#[derive(Default)]
pub struct RecordingForwarder {
    attempts: AtomicUsize,
    delivered: Mutex<Vec<(String, i64)>>,
    failing_offsets: HashSet<i64>,
}

impl RecordingForwarder {
    pub fn failing_offsets(offsets: impl IntoIterator<Item = i64>) -> Self {
        Self {
            failing_offsets: offsets.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Offsets delivered to the subscriber with `uid`, in delivery order.
    pub fn delivered_offsets(&self, uid: &str) -> Vec<i64> {
        self.delivered
            .lock()
            .iter()
            .filter(|(u, _)| u == uid)
            .map(|(_, offset)| *offset)
            .collect()
    }

    /// Wait until at least `count` forward calls were made.
    pub async fn wait_for(&self, count: usize) {
        wait_until("forward calls", || self.attempts() >= count).await
    }
}

#[async_trait]
impl MessageForwarder for RecordingForwarder {
    async fn forward(
        &self,
        record: &ConsumedRecord,
        subscriber: &SubscriberSpec,
    ) -> Result<(), ForwardError> {
        let result = if self.failing_offsets.contains(&record.offset) {
            Err(ForwardError::Rejected(format!(
                "offset {} rejected",
                record.offset
            )))
        } else {
            self.delivered
                .lock()
                .push((subscriber.uid.to_string(), record.offset));
            Ok(())
        };

        self.attempts.fetch_add(1, Ordering::SeqCst);
        result
    }
}
