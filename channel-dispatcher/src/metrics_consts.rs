// ==== Consumer group lifecycle ====
/// Counter for consumer groups created for a subscriber
pub const CONSUMER_GROUPS_CREATED: &str = "dispatcher_consumer_groups_created_total";

/// Counter for consumer groups that could not be created, labeled by error kind
pub const CONSUMER_GROUPS_CREATE_FAILED: &str = "dispatcher_consumer_groups_create_failed_total";

/// Counter for consumer groups closed when a subscriber was removed
pub const CONSUMER_GROUPS_CLOSED: &str = "dispatcher_consumer_groups_closed_total";

/// Counter for consumer group close calls that returned an error
pub const CONSUMER_GROUPS_CLOSE_FAILED: &str = "dispatcher_consumer_groups_close_failed_total";

/// Counter for errors reported by a consumer group, either on its error stream or by consume
pub const CONSUMER_GROUP_ERRORS: &str = "dispatcher_consumer_group_errors_total";

/// Gauge for the number of registered subscribers
pub const ACTIVE_SUBSCRIBERS: &str = "dispatcher_active_subscribers";

// ==== Dispatcher ====
/// Counter for dispatchers rebuilt after a consumer configuration change
pub const DISPATCHER_REBUILDS: &str = "dispatcher_rebuilds_total";

// ==== Delivery ====
/// Counter for records handed to the forwarder, labeled by outcome
pub const RECORDS_FORWARDED: &str = "dispatcher_records_forwarded_total";

/// Histogram for the time spent forwarding one record, retries included
pub const FORWARD_DURATION: &str = "dispatcher_forward_duration_seconds";

// ==== Kafka client statistics ====
/// Gauge for consumer lag per group and partition, from librdkafka statistics
pub const CONSUMER_LAG: &str = "dispatcher_kafka_consumer_lag";

// ==== Health and metrics server ====
/// Counter for requests served, labeled by method, route and status
pub const HTTP_REQUESTS: &str = "dispatcher_http_requests_total";

/// Histogram for the time spent serving a request
pub const HTTP_REQUEST_DURATION: &str = "dispatcher_http_request_duration_seconds";
