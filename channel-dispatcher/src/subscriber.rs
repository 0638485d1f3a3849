use std::fmt;
use std::time;

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

/// Prefix of every consumer group name owned by a dispatcher.
pub const GROUP_ID_PREFIX: &str = "kafka.";

/// The stable identity of one subscription, independent of its delivery details.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SubscriberUid(String);

impl SubscriberUid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberUid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubscriberUid {
    fn from(uid: &str) -> Self {
        Self::new(uid)
    }
}

/// Derive the consumer group name for a subscription identity.
///
/// Kafka addresses group membership by name, so the same identity must always
/// map to the same group. The prefix is fixed, which keeps the mapping injective.
pub fn group_id(uid: &SubscriberUid) -> String {
    format!("{}{}", GROUP_ID_PREFIX, uid)
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    Linear,
    Exponential,
}

/// Delivery options attached to a subscription.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct DeliverySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_sink: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_policy: Option<BackoffPolicy>,
    /// ISO-8601 duration, e.g. `PT0.5S`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_delay: Option<String>,
}

impl DeliverySpec {
    /// The configured backoff delay, if present and parseable.
    pub fn backoff_delay(&self) -> Option<time::Duration> {
        let value = self.backoff_delay.as_deref()?;
        let delay = parse_iso8601_duration(value);
        if delay.is_none() {
            warn!(backoff_delay = value, "ignoring unparseable backoff delay");
        }
        delay
    }
}

/// A subscription as described by the controller that computes the desired state.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberSpec {
    pub uid: SubscriberUid,
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_uri: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_uri: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliverySpec>,
}

impl SubscriberSpec {
    pub fn new(uid: impl Into<String>, subscriber_uri: Option<Url>) -> Self {
        Self {
            uid: SubscriberUid::new(uid),
            generation: 1,
            subscriber_uri,
            reply_uri: None,
            delivery: None,
        }
    }

    pub fn group_id(&self) -> String {
        group_id(&self.uid)
    }

    /// Subscriber URI for log fields, empty when unset.
    pub fn uri_str(&self) -> &str {
        self.subscriber_uri.as_ref().map(Url::as_str).unwrap_or("")
    }
}

/// Parse an ISO-8601 duration such as `PT1H2M3.5S` or `P1DT12H`.
/// Years and months have no fixed length and are not supported.
fn parse_iso8601_duration(value: &str) -> Option<time::Duration> {
    let rest = value.strip_prefix('P')?;
    let (date, time_part) = match rest.split_once('T') {
        Some((date, time_part)) if !time_part.is_empty() => (date, Some(time_part)),
        Some(_) => return None,
        None => (rest, None),
    };
    if date.is_empty() && time_part.is_none() {
        return None;
    }

    let mut seconds = sum_components(date, |unit| match unit {
        'W' => Some(7.0 * 86400.0),
        'D' => Some(86400.0),
        _ => None,
    })?;
    if let Some(time_part) = time_part {
        seconds += sum_components(time_part, |unit| match unit {
            'H' => Some(3600.0),
            'M' => Some(60.0),
            'S' => Some(1.0),
            _ => None,
        })?;
    }

    time::Duration::try_from_secs_f64(seconds).ok()
}

/// Sum `<number><unit>` pairs, `scale` giving the seconds per unit.
fn sum_components(part: &str, scale: impl Fn(char) -> Option<f64>) -> Option<f64> {
    let mut seconds = 0f64;
    let mut number = String::new();
    for c in part.chars() {
        match c {
            '0'..='9' | '.' => number.push(c),
            unit => {
                let amount: f64 = number.parse().ok()?;
                number.clear();
                seconds += amount * scale(unit)?;
            }
        }
    }

    number.is_empty().then_some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_id_is_derived_from_uid_only() {
        let uid = SubscriberUid::new("0c7b3fd0-2c4e-4c05-8f5e-4d2a1b6c9e11");
        let mut spec = SubscriberSpec::new(uid.as_str(), None);

        assert_eq!(group_id(&uid), "kafka.0c7b3fd0-2c4e-4c05-8f5e-4d2a1b6c9e11");
        let before = spec.group_id();

        spec.generation = 7;
        spec.subscriber_uri = Some(Url::parse("http://elsewhere.example").unwrap());
        assert_eq!(spec.group_id(), before);
    }

    #[test]
    fn test_distinct_uids_never_share_a_group() {
        assert_ne!(
            group_id(&SubscriberUid::new("a")),
            group_id(&SubscriberUid::new("a."))
        );
        assert_ne!(
            group_id(&SubscriberUid::new("kafka.a")),
            group_id(&SubscriberUid::new("a"))
        );
    }

    #[test]
    fn test_parse_iso8601_duration() {
        assert_eq!(
            parse_iso8601_duration("PT0.5S"),
            Some(time::Duration::from_millis(500))
        );
        assert_eq!(
            parse_iso8601_duration("PT1M30S"),
            Some(time::Duration::from_secs(90))
        );
        assert_eq!(
            parse_iso8601_duration("PT2H"),
            Some(time::Duration::from_secs(7200))
        );
        assert_eq!(
            parse_iso8601_duration("P1D"),
            Some(time::Duration::from_secs(86400))
        );
        assert_eq!(
            parse_iso8601_duration("P0DT1S"),
            Some(time::Duration::from_secs(1))
        );
        assert_eq!(
            parse_iso8601_duration("P1WT0.5S"),
            Some(time::Duration::from_millis(604_800_500))
        );
        assert_eq!(parse_iso8601_duration("P1M"), None);
        assert_eq!(parse_iso8601_duration("P"), None);
        assert_eq!(parse_iso8601_duration("PT"), None);
        assert_eq!(parse_iso8601_duration("PT5"), None);
        assert_eq!(parse_iso8601_duration("5S"), None);
    }

    #[test]
    fn test_deserialize_subscriber_spec() {
        let json = r#"{
            "uid": "sub-1",
            "generation": 3,
            "subscriberUri": "http://subscriber.default.svc.cluster.local/",
            "replyUri": "http://reply.default.svc.cluster.local/",
            "delivery": {
                "deadLetterSink": "http://dls.default.svc.cluster.local/",
                "retry": 4,
                "backoffPolicy": "exponential",
                "backoffDelay": "PT0.2S"
            }
        }"#;

        let spec: SubscriberSpec = serde_json::from_str(json).unwrap();

        assert_eq!(spec.uid, SubscriberUid::new("sub-1"));
        assert_eq!(spec.generation, 3);
        assert_eq!(
            spec.uri_str(),
            "http://subscriber.default.svc.cluster.local/"
        );
        let delivery = spec.delivery.unwrap();
        assert_eq!(delivery.retry, Some(4));
        assert_eq!(delivery.backoff_policy, Some(BackoffPolicy::Exponential));
        assert_eq!(
            delivery.backoff_delay(),
            Some(time::Duration::from_millis(200))
        );
    }

    #[test]
    fn test_minimal_subscriber_spec() {
        let spec: SubscriberSpec = serde_json::from_str(r#"{"uid": "sub-2"}"#).unwrap();

        assert_eq!(spec.generation, 0);
        assert_eq!(spec.subscriber_uri, None);
        assert_eq!(spec.uri_str(), "");
        assert_eq!(spec.delivery, None);
    }
}
