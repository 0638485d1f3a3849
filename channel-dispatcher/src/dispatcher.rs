use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::consumer_group::{ConsumerGroup, ConsumerGroupFactory};
use crate::consumption::spawn_consumption;
use crate::error::ConsumerGroupError;
use crate::forwarder::{MessageForwarder, RetryPolicy};
use crate::metrics_consts::{
    ACTIVE_SUBSCRIBERS, CONSUMER_GROUPS_CLOSED, CONSUMER_GROUPS_CLOSE_FAILED,
    CONSUMER_GROUPS_CREATED, CONSUMER_GROUPS_CREATE_FAILED, DISPATCHER_REBUILDS,
};
use crate::settings::{ClientSettings, SettingsOverlay};
use crate::subscriber::{SubscriberSpec, SubscriberUid};

/// Keeps a channel's set of running consumer groups in line with its subscribers.
pub trait Dispatcher: Send + Sync {
    /// Reconcile the registered subscribers with `specs`, creating consumer groups for
    /// new subscribers and closing those of subscribers that are gone. Returns the
    /// subscribers that could not be registered, an empty map meaning full success.
    fn update_subscriptions(
        &self,
        specs: &[SubscriberSpec],
    ) -> HashMap<SubscriberSpec, ConsumerGroupError>;

    /// Apply a settings overlay. Returns the dispatcher that replaces this one when the
    /// overlay changes consumer settings, `None` when nothing needed to change.
    fn config_changed(&self, overlay: &SettingsOverlay) -> Option<Self>
    where
        Self: Sized;

    /// Close the consumer groups of all registered subscribers.
    fn shutdown(&self);
}

/// Everything a dispatcher needs to create consumer groups and deliver their records.
#[derive(Clone)]
pub struct DispatcherConfig {
    pub client_id: String,
    pub brokers: Vec<String>,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub channel_key: String,
    pub settings: ClientSettings,
    pub forwarder: Arc<dyn MessageForwarder>,
    /// Spaces out redeliveries of a record its subscriber did not accept.
    pub redelivery_policy: RetryPolicy,
    pub group_factory: Arc<dyn ConsumerGroupFactory>,
}

struct SubscriberRegistration {
    spec: SubscriberSpec,
    group_id: String,
    group: Arc<dyn ConsumerGroup>,
    token: CancellationToken,
}

impl SubscriberRegistration {
    /// Stop consumption and close the consumer group. Returns whether the
    /// registration can be dropped, which is not the case if the close failed.
    fn close(&self) -> bool {
        self.token.cancel();

        match self.group.close() {
            Ok(()) | Err(ConsumerGroupError::Closed) => {
                info!(
                    group_id = self.group_id,
                    uri = self.spec.uri_str(),
                    "closed consumer group"
                );
                metrics::counter!(CONSUMER_GROUPS_CLOSED).increment(1);
                true
            }
            Err(e) => {
                error!(
                    group_id = self.group_id,
                    uri = self.spec.uri_str(),
                    "failed to close consumer group: {}",
                    e
                );
                metrics::counter!(CONSUMER_GROUPS_CLOSE_FAILED).increment(1);
                false
            }
        }
    }
}

#[derive(Default)]
struct DispatcherState {
    subscribers: HashMap<SubscriberUid, SubscriberRegistration>,
    /// Specs of the subscribers that were desired and registered after the last reconciliation.
    active_specs: Vec<SubscriberSpec>,
}

pub struct KafkaDispatcher {
    config: DispatcherConfig,
    state: Mutex<DispatcherState>,
}

impl KafkaDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        info!(
            channel_key = config.channel_key,
            topic = config.topic,
            "created kafka channel dispatcher"
        );

        Self {
            config,
            state: Mutex::new(DispatcherState::default()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn has_subscriber(&self, uid: &SubscriberUid) -> bool {
        self.state.lock().subscribers.contains_key(uid)
    }

    pub fn subscriber_group_ids(&self) -> Vec<String> {
        let mut group_ids: Vec<String> = self
            .state
            .lock()
            .subscribers
            .values()
            .map(|r| r.group_id.clone())
            .collect();
        group_ids.sort();
        group_ids
    }

    pub fn subscriber_group(&self, uid: &SubscriberUid) -> Option<Arc<dyn ConsumerGroup>> {
        self.state
            .lock()
            .subscribers
            .get(uid)
            .map(|r| r.group.clone())
    }

    /// The specs retained from the last reconciliation.
    pub fn subscriber_specs(&self) -> Vec<SubscriberSpec> {
        self.state.lock().active_specs.clone()
    }

    fn subscribe(&self, spec: &SubscriberSpec) -> Result<SubscriberRegistration, ConsumerGroupError> {
        let group_id = spec.group_id();

        let group = self
            .config
            .group_factory
            .create_group(&self.config.brokers, &self.config.settings, &group_id)
            .map_err(|e| {
                error!(group_id, "failed to create consumer group: {}", e);
                metrics::counter!(CONSUMER_GROUPS_CREATE_FAILED, "reason" => e.reason())
                    .increment(1);
                e
            })?;

        info!(group_id, uri = spec.uri_str(), "created consumer group");
        metrics::counter!(CONSUMER_GROUPS_CREATED).increment(1);

        let token = CancellationToken::new();
        spawn_consumption(
            group.clone(),
            self.config.topic.clone(),
            spec.clone(),
            self.config.forwarder.clone(),
            self.config
                .redelivery_policy
                .for_delivery(spec.delivery.as_ref()),
            token.clone(),
        );

        Ok(SubscriberRegistration {
            spec: spec.clone(),
            group_id,
            group,
            token,
        })
    }

    /// Close every registration, keeping those whose close failed.
    fn close_all(&self, state: &mut DispatcherState) {
        state.subscribers.retain(|_, registration| !registration.close());
        self.report_active(state);
    }

    fn report_active(&self, state: &DispatcherState) {
        metrics::gauge!(ACTIVE_SUBSCRIBERS, "channel" => self.config.channel_key.clone())
            .set(state.subscribers.len() as f64);
    }
}

impl Dispatcher for KafkaDispatcher {
    fn update_subscriptions(
        &self,
        specs: &[SubscriberSpec],
    ) -> HashMap<SubscriberSpec, ConsumerGroupError> {
        let mut failed = HashMap::new();
        let mut desired = HashSet::new();

        let mut state = self.state.lock();

        for spec in specs {
            desired.insert(spec.uid.clone());
            if state.subscribers.contains_key(&spec.uid) {
                continue;
            }

            match self.subscribe(spec) {
                Ok(registration) => {
                    state.subscribers.insert(spec.uid.clone(), registration);
                }
                Err(e) => {
                    failed.insert(spec.clone(), e);
                }
            }
        }

        state
            .subscribers
            .retain(|uid, registration| desired.contains(uid) || !registration.close());

        let mut active_specs = Vec::new();
        let mut seen = HashSet::new();
        for spec in specs {
            if !seen.insert(&spec.uid) {
                continue;
            }
            if let Some(registration) = state.subscribers.get(&spec.uid) {
                active_specs.push(registration.spec.clone());
            }
        }
        state.active_specs = active_specs;

        self.report_active(&state);
        debug!(
            active = state.active_specs.len(),
            failed = failed.len(),
            "reconciled subscribers"
        );

        failed
    }

    fn config_changed(&self, overlay: &SettingsOverlay) -> Option<Self> {
        debug!(channel_key = self.config.channel_key, "new settings overlay received");

        let settings = match ClientSettings::merge(None, overlay) {
            Ok(settings) => settings,
            Err(e) => {
                error!("unable to merge consumer settings: {}", e);
                return None;
            }
        };
        let settings = settings.with_identity(
            &self.config.client_id,
            self.config.username.as_deref(),
            self.config.password.as_deref(),
        );

        if settings.consumer_equal(&self.config.settings) {
            info!("no consumer changes detected in new settings, ignoring");
            return None;
        }

        info!("consumer changes detected in new settings, recreating dispatcher");
        let retained = {
            let mut state = self.state.lock();
            let retained = state.active_specs.clone();
            self.close_all(&mut state);
            retained
        };

        let mut config = self.config.clone();
        config.settings = settings;
        let dispatcher = KafkaDispatcher::new(config);

        let failed = dispatcher.update_subscriptions(&retained);
        if !failed.is_empty() {
            for (spec, e) in &failed {
                error!(uid = %spec.uid, "failed to resubscribe subscriber: {}", e);
            }
            error!(
                count = failed.len(),
                "failed to subscribe kafka subscriptions for new dispatcher"
            );
            panic!(
                "failed to subscribe {} kafka subscriptions for new dispatcher",
                failed.len()
            );
        }

        metrics::counter!(DISPATCHER_REBUILDS).increment(1);
        Some(dispatcher)
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        self.close_all(&mut state);
    }
}
