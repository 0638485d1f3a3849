use std::time;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use super::retry::RetryPolicy;
use super::MessageForwarder;
use crate::consumer_group::ConsumedRecord;
use crate::error::ForwardError;
use crate::subscriber::SubscriberSpec;

/// Kafka headers carrying CloudEvents attributes use `ce_`, HTTP uses `ce-`.
const KAFKA_CE_PREFIX: &str = "ce_";
const HTTP_CE_PREFIX: &str = "ce-";

/// Forwards records to subscribers over HTTP, in CloudEvents binary mode.
pub struct HttpForwarder {
    /// The client used for HTTP requests.
    client: reqwest::Client,
    /// Applied to subscribers that do not configure their own delivery options.
    retry_policy: RetryPolicy,
}

impl HttpForwarder {
    pub fn new(
        request_timeout: time::Duration,
        retry_policy: RetryPolicy,
    ) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .user_agent("Kafka Channel Dispatcher")
            .timeout(request_timeout)
            .build()
            .map_err(ForwardError::ClientBuildError)?;

        Ok(Self {
            client,
            retry_policy,
        })
    }

    /// Send `body` to `url`, retrying retryable failures as allowed by `policy`.
    async fn send_with_retries(
        &self,
        url: &Url,
        headers: &HeaderMap,
        body: &[u8],
        policy: &RetryPolicy,
    ) -> Result<reqwest::Response, ForwardError> {
        let attempts = policy.attempts();
        let mut attempt = 0;

        loop {
            let error = match send_request(&self.client, url, headers.clone(), body.to_vec()).await
            {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            attempt += 1;
            if !error.is_retryable() {
                return Err(error);
            }
            if attempt >= attempts {
                return Err(ForwardError::Exhausted {
                    attempts,
                    source: Box::new(error),
                });
            }

            let wait = policy.time_until_next_retry(attempt - 1, error.retry_after());
            debug!(url = %url, attempt, "retrying delivery in {:?}: {}", wait, error);
            tokio::time::sleep(wait).await;
        }
    }

    /// Send a subscriber's response on to its reply destination. Empty responses are dropped.
    async fn forward_reply(
        &self,
        response: reqwest::Response,
        reply: &Url,
        policy: &RetryPolicy,
        subscriber: &SubscriberSpec,
    ) -> Result<(), ForwardError> {
        let reply_headers = reply_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(ForwardError::NonRetryableRequestError)?;

        if body.is_empty() {
            debug!(uri = subscriber.uri_str(), "subscriber returned no reply");
            return Ok(());
        }

        self.send_with_retries(reply, &reply_headers, &body, policy)
            .await
            .map(|_| ())
            .map_err(|error| ForwardError::Reply {
                subscriber: subscriber.uri_str().to_owned(),
                source: Box::new(error),
            })
    }
}

#[async_trait]
impl MessageForwarder for HttpForwarder {
    async fn forward(
        &self,
        record: &ConsumedRecord,
        subscriber: &SubscriberSpec,
    ) -> Result<(), ForwardError> {
        let Some(destination) = subscriber
            .subscriber_uri
            .as_ref()
            .or(subscriber.reply_uri.as_ref())
        else {
            debug!(uid = %subscriber.uid, "subscriber has no destination, skipping record");
            return Ok(());
        };

        let policy = self.retry_policy.for_delivery(subscriber.delivery.as_ref());
        let headers = record_headers(record);
        let body = record.payload.as_deref().unwrap_or_default();

        let delivery = match self
            .send_with_retries(destination, &headers, body, &policy)
            .await
        {
            Ok(response) => match (&subscriber.subscriber_uri, &subscriber.reply_uri) {
                (Some(_), Some(reply)) => {
                    self.forward_reply(response, reply, &policy, subscriber)
                        .await
                }
                _ => Ok(()),
            },
            Err(error) => Err(error),
        };

        let error = match delivery {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        let Some(dead_letter_sink) = subscriber
            .delivery
            .as_ref()
            .and_then(|d| d.dead_letter_sink.as_ref())
        else {
            return Err(error);
        };

        warn!(
            uri = subscriber.uri_str(),
            offset = record.offset,
            partition = record.partition,
            "delivery failed, sending record to dead letter sink: {}",
            error
        );
        self.send_with_retries(dead_letter_sink, &headers, body, &policy)
            .await
            .map(|_| ())
            .map_err(|e| ForwardError::DeadLetter(Box::new(e)))
    }
}

/// Build the HTTP headers for a record from its Kafka headers.
///
/// Headers that cannot be expressed in HTTP are dropped so the record can still be delivered.
fn record_headers(record: &ConsumedRecord) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (key, value) in &record.headers {
        let name = match key.strip_prefix(KAFKA_CE_PREFIX) {
            Some(attribute) => format!("{}{}", HTTP_CE_PREFIX, attribute),
            None => key.to_owned(),
        };
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_bytes(value),
        ) else {
            warn!(
                header = key.as_str(),
                offset = record.offset,
                partition = record.partition,
                "dropping record header that is not a valid http header"
            );
            continue;
        };
        headers.append(name, value);
    }

    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }

    headers
}

/// Keep only the headers of a response that describe the reply event.
fn reply_headers(response_headers: &HeaderMap) -> HeaderMap {
    response_headers
        .iter()
        .filter(|(name, _)| {
            *name == header::CONTENT_TYPE || name.as_str().starts_with(HTTP_CE_PREFIX)
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Make a single POST request to a destination.
async fn send_request(
    client: &reqwest::Client,
    url: &Url,
    headers: HeaderMap,
    body: Vec<u8>,
) -> Result<reqwest::Response, ForwardError> {
    let response = client
        .post(url.clone())
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| ForwardError::RetryableRequestError {
            error: e,
            retry_after: None,
        })?;

    let retry_after = parse_retry_after_header(response.headers());

    match response.error_for_status() {
        Ok(response) => Ok(response),
        Err(err) => match err.status() {
            Some(status) if is_retryable_status(status) => {
                Err(ForwardError::RetryableRequestError {
                    error: err,
                    retry_after,
                })
            }
            _ => Err(ForwardError::NonRetryableRequestError(err)),
        },
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Attempt to parse a Retry-After header as a number of seconds or an RFC2822 date,
/// returning None if the header is absent or not parseable.
fn parse_retry_after_header(header_map: &HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}
