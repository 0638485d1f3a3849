use std::time;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Enumeration of errors raised by a consumer group handle or while creating one.
#[derive(Error, Debug)]
pub enum ConsumerGroupError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer group is closed")]
    Closed,
    #[error("consumer group {group_id} rejected its configuration: {reason}")]
    InvalidConfig { group_id: String, reason: String },
}

impl ConsumerGroupError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ConsumerGroupError::Kafka(_) => "kafka",
            ConsumerGroupError::Closed => "closed",
            ConsumerGroupError::InvalidConfig { .. } => "invalid_config",
        }
    }
}

/// Enumeration of errors raised while forwarding a record to a subscriber.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("error building http client for delivery")]
    ClientBuildError(reqwest::Error),
    #[error("a record could not be delivered but it could be retried later: {error}")]
    RetryableRequestError {
        error: reqwest::Error,
        retry_after: Option<time::Duration>,
    },
    #[error("a record could not be delivered and it cannot be retried further: {0}")]
    NonRetryableRequestError(reqwest::Error),
    #[error("delivery failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<ForwardError>,
    },
    #[error("failed to forward reply from {subscriber}: {source}")]
    Reply {
        subscriber: String,
        #[source]
        source: Box<ForwardError>,
    },
    #[error("failed to deliver record to dead letter sink: {0}")]
    DeadLetter(Box<ForwardError>),
    #[error("{0}")]
    Rejected(String),
}

impl ForwardError {
    /// Whether a later attempt at the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ForwardError::RetryableRequestError { .. })
    }

    pub fn retry_after(&self) -> Option<time::Duration> {
        match self {
            ForwardError::RetryableRequestError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Enumeration of errors raised when merging a settings overlay.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("settings overlay is not valid json: {0}")]
    ParseError(String),
    #[error("settings overlay must be a json object")]
    NotAnObject,
    #[error("settings overlay contains an empty property name")]
    EmptyKey,
    #[error("settings overlay property {0} must be a string, number or boolean")]
    UnsupportedValue(String),
}
