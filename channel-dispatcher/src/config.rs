use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::forwarder::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "localhost:9092")]
    pub kafka_brokers: BrokerList,

    pub kafka_topic: NonEmptyString,

    #[envconfig(default = "kafka-channel-dispatcher")]
    pub kafka_client_id: String,

    pub kafka_username: Option<String>,

    pub kafka_password: Option<String>,

    /// The `namespace/name` of the channel served by this dispatcher.
    pub channel_key: NonEmptyString,

    /// JSON object of librdkafka properties, watched for changes.
    pub settings_overlay_path: Option<String>,

    /// JSON array of subscriber specs, watched for changes.
    pub subscribers_path: String,

    #[envconfig(default = "5000")]
    pub watch_interval: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL", default = "100000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAX_RETRIES", default = "3")]
    pub max_retries: u32,
}

impl RetryPolicyConfig {
    /// The policy applied to subscribers that do not set their own delivery options.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.backoff_coefficient,
            self.initial_interval.0,
            Some(self.maximum_interval.0),
        )
        .max_retries(self.max_retries)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Comma separated list of `host:port` bootstrap servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerList(pub Vec<String>);

#[derive(Debug, PartialEq, Eq)]
pub struct EmptyBrokerListError;

impl FromStr for BrokerList {
    type Err = EmptyBrokerListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let brokers: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_owned)
            .collect();

        if brokers.is_empty() {
            Err(EmptyBrokerListError)
        } else {
            Ok(BrokerList(brokers))
        }
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_broker_list_parsing() {
        assert_eq!(
            "kafka-0:9092, kafka-1:9092,".parse::<BrokerList>(),
            Ok(BrokerList(vec![
                "kafka-0:9092".to_owned(),
                "kafka-1:9092".to_owned()
            ]))
        );
        assert_eq!(" , ".parse::<BrokerList>(), Err(EmptyBrokerListError));
    }

    #[test]
    fn test_config_from_env() {
        let config = Config::init_from_hashmap(&env(&[
            ("KAFKA_BROKERS", "kafka-0:9092,kafka-1:9092"),
            ("KAFKA_TOPIC", "knative-messaging-kafka.default.channel"),
            ("KAFKA_USERNAME", "user"),
            ("CHANNEL_KEY", "default/channel"),
            ("SUBSCRIBERS_PATH", "/etc/dispatcher/subscribers.json"),
            ("RETRY_INITIAL_INTERVAL", "250"),
        ]))
        .unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.kafka_brokers.0.len(), 2);
        assert_eq!(config.kafka_client_id, "kafka-channel-dispatcher");
        assert_eq!(config.kafka_username.as_deref(), Some("user"));
        assert_eq!(config.kafka_password, None);
        assert_eq!(config.settings_overlay_path, None);
        assert_eq!(config.watch_interval.0, time::Duration::from_secs(5));
        assert_eq!(
            config.retry_policy.provide().time_until_next_retry(0, None),
            time::Duration::from_millis(250)
        );
        assert_eq!(config.retry_policy.provide().attempts(), 4);
    }

    #[test]
    fn test_config_requires_channel() {
        let result = Config::init_from_hashmap(&env(&[
            ("KAFKA_TOPIC", "topic"),
            ("CHANNEL_KEY", ""),
            ("SUBSCRIBERS_PATH", "/etc/dispatcher/subscribers.json"),
        ]));

        assert!(result.is_err());
    }
}
