use std::collections::BTreeMap;

use rdkafka::ClientConfig;
use serde_json::Value;

use crate::error::SettingsError;

pub const CLIENT_ID_PROPERTY: &str = "client.id";
pub const SASL_USERNAME_PROPERTY: &str = "sasl.username";
pub const SASL_PASSWORD_PROPERTY: &str = "sasl.password";

/// Consumer defaults applied before any overlay.
const DEFAULT_PROPERTIES: &[(&str, &str)] = &[
    ("auto.offset.reset", "latest"),
    ("enable.auto.commit", "true"),
    ("auto.commit.interval.ms", "5000"),
    ("session.timeout.ms", "10000"),
    ("heartbeat.interval.ms", "3000"),
    ("max.poll.interval.ms", "300000"),
    ("socket.timeout.ms", "10000"),
    ("statistics.interval.ms", "10000"),
];

/// librdkafka properties that only affect producers. A change to any of these
/// never requires a consumer group to be recreated.
const PRODUCER_ONLY_PROPERTIES: &[&str] = &[
    "acks",
    "batch.num.messages",
    "batch.size",
    "compression.codec",
    "compression.level",
    "compression.type",
    "delivery.timeout.ms",
    "enable.gapless.guarantee",
    "enable.idempotence",
    "linger.ms",
    "message.send.max.retries",
    "message.timeout.ms",
    "partitioner",
    "queue.buffering.backpressure.threshold",
    "queue.buffering.max.kbytes",
    "queue.buffering.max.messages",
    "queue.buffering.max.ms",
    "request.required.acks",
    "request.timeout.ms",
    "retries",
    "sticky.partitioning.linger.ms",
    "transaction.timeout.ms",
    "transactional.id",
];

fn is_producer_only(property: &str) -> bool {
    PRODUCER_ONLY_PROPERTIES.contains(&property)
}

/// A key-value settings bundle received from an external configuration source.
///
/// Values are kept as raw json until merged so that validation errors surface
/// from `ClientSettings::merge` rather than from parsing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsOverlay {
    entries: BTreeMap<String, Value>,
}

impl SettingsOverlay {
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| SettingsError::ParseError(e.to_string()))?;

        match value {
            Value::Object(map) => Ok(Self {
                entries: map.into_iter().collect(),
            }),
            _ => Err(SettingsError::NotAnObject),
        }
    }

    pub fn set(mut self, property: &str, value: impl Into<Value>) -> Self {
        self.entries.insert(property.to_owned(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for SettingsOverlay
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// An immutable snapshot of the librdkafka properties used to build consumer groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    properties: BTreeMap<String, String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            properties: DEFAULT_PROPERTIES
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl ClientSettings {
    /// Merge an overlay onto `base`, or onto the defaults when there is no base.
    /// A `null` value removes the property, falling back to the librdkafka default.
    pub fn merge(
        base: Option<&ClientSettings>,
        overlay: &SettingsOverlay,
    ) -> Result<ClientSettings, SettingsError> {
        let mut merged = base.cloned().unwrap_or_default();

        for (property, value) in &overlay.entries {
            let property = property.trim();
            if property.is_empty() {
                return Err(SettingsError::EmptyKey);
            }

            match value {
                Value::Null => {
                    merged.properties.remove(property);
                }
                Value::String(s) => {
                    merged.properties.insert(property.to_owned(), s.to_owned());
                }
                Value::Bool(b) => {
                    merged.properties.insert(property.to_owned(), b.to_string());
                }
                Value::Number(n) => {
                    merged.properties.insert(property.to_owned(), n.to_string());
                }
                Value::Array(_) | Value::Object(_) => {
                    return Err(SettingsError::UnsupportedValue(property.to_owned()))
                }
            }
        }

        Ok(merged)
    }

    /// Reapply the client identifier and credentials. Whatever the overlay carried
    /// for these properties is discarded, secrets never come from an overlay.
    pub fn with_identity(
        mut self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        self.properties
            .insert(CLIENT_ID_PROPERTY.to_owned(), client_id.to_owned());

        for (property, value) in [
            (SASL_USERNAME_PROPERTY, username),
            (SASL_PASSWORD_PROPERTY, password),
        ] {
            match value {
                Some(value) => {
                    self.properties.insert(property.to_owned(), value.to_owned());
                }
                None => {
                    self.properties.remove(property);
                }
            }
        }

        self
    }

    /// Equality over the consumer-relevant properties only.
    pub fn consumer_equal(&self, other: &ClientSettings) -> bool {
        let consumer_properties = |settings: &ClientSettings| {
            settings
                .properties
                .iter()
                .filter(|(k, _)| !is_producer_only(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>()
        };

        consumer_properties(self) == consumer_properties(other)
    }

    pub fn get(&self, property: &str) -> Option<&str> {
        self.properties.get(property).map(String::as_str)
    }

    pub fn client_id(&self) -> Option<&str> {
        self.get(CLIENT_ID_PROPERTY)
    }

    /// Copy every property onto an rdkafka client configuration.
    pub fn apply_to(&self, config: &mut ClientConfig) {
        for (property, value) in &self.properties {
            config.set(property, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity(settings: ClientSettings) -> ClientSettings {
        settings.with_identity("dispatcher-client", Some("user"), Some("secret"))
    }

    #[test]
    fn test_merge_onto_blank_base_starts_from_defaults() {
        let overlay = SettingsOverlay::default().set("fetch.min.bytes", 1024);

        let merged = ClientSettings::merge(None, &overlay).unwrap();

        assert_eq!(merged.get("fetch.min.bytes"), Some("1024"));
        assert_eq!(merged.get("enable.auto.commit"), Some("true"));
        assert_eq!(merged.get("auto.offset.reset"), Some("latest"));
    }

    #[test]
    fn test_merge_converts_scalars_and_removes_nulls() {
        let base = ClientSettings::merge(
            None,
            &SettingsOverlay::default().set("check.crcs", true),
        )
        .unwrap();
        let overlay: SettingsOverlay = [
            ("check.crcs", Value::Null),
            ("auto.offset.reset", json!("earliest")),
            ("fetch.wait.max.ms", json!(250)),
        ]
        .into_iter()
        .collect();

        let merged = ClientSettings::merge(Some(&base), &overlay).unwrap();

        assert_eq!(merged.get("check.crcs"), None);
        assert_eq!(merged.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(merged.get("fetch.wait.max.ms"), Some("250"));
    }

    #[test]
    fn test_merge_rejects_nested_values_and_empty_keys() {
        let nested = SettingsOverlay::from_json(r#"{"consumer": {"fetch.min.bytes": 1}}"#).unwrap();
        assert_eq!(
            ClientSettings::merge(None, &nested),
            Err(SettingsError::UnsupportedValue("consumer".to_owned()))
        );

        let empty = SettingsOverlay::default().set(" ", "x");
        assert_eq!(
            ClientSettings::merge(None, &empty),
            Err(SettingsError::EmptyKey)
        );
    }

    #[test]
    fn test_overlay_from_json() {
        assert_eq!(
            SettingsOverlay::from_json("[1, 2]"),
            Err(SettingsError::NotAnObject)
        );
        assert!(matches!(
            SettingsOverlay::from_json("{not json"),
            Err(SettingsError::ParseError(_))
        ));
        assert!(SettingsOverlay::from_json("{}").unwrap().is_empty());
    }

    #[test]
    fn test_identity_is_never_taken_from_overlay() {
        let overlay = SettingsOverlay::default()
            .set(CLIENT_ID_PROPERTY, "sneaky")
            .set(SASL_USERNAME_PROPERTY, "attacker")
            .set(SASL_PASSWORD_PROPERTY, "leaked");

        let merged = ClientSettings::merge(None, &overlay)
            .unwrap()
            .with_identity("dispatcher-client", None, None);

        assert_eq!(merged.client_id(), Some("dispatcher-client"));
        assert_eq!(merged.get(SASL_USERNAME_PROPERTY), None);
        assert_eq!(merged.get(SASL_PASSWORD_PROPERTY), None);

        let merged = merged.with_identity("dispatcher-client", Some("user"), Some("secret"));
        assert_eq!(merged.get(SASL_USERNAME_PROPERTY), Some("user"));
        assert_eq!(merged.get(SASL_PASSWORD_PROPERTY), Some("secret"));
    }

    #[test]
    fn test_consumer_equal_ignores_producer_only_properties() {
        let current = identity(ClientSettings::default());
        let overlay = SettingsOverlay::default()
            .set("linger.ms", 50)
            .set("compression.codec", "zstd")
            .set("enable.idempotence", true);

        let merged = identity(ClientSettings::merge(None, &overlay).unwrap());

        assert_ne!(merged, current);
        assert!(merged.consumer_equal(&current));
    }

    #[test]
    fn test_consumer_equal_detects_consumer_changes() {
        let current = identity(ClientSettings::default());

        let changed = identity(
            ClientSettings::merge(None, &SettingsOverlay::default().set("session.timeout.ms", 45000))
                .unwrap(),
        );
        assert!(!changed.consumer_equal(&current));

        let other_client = ClientSettings::default().with_identity("other-client", Some("user"), Some("secret"));
        assert!(!other_client.consumer_equal(&current));
    }

    #[test]
    fn test_apply_to_client_config() {
        let settings = identity(ClientSettings::default());
        let mut config = ClientConfig::new();

        settings.apply_to(&mut config);

        assert_eq!(config.get("client.id"), Some("dispatcher-client"));
        assert_eq!(config.get("sasl.username"), Some("user"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
    }
}
