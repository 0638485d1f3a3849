use async_trait::async_trait;

use crate::consumer_group::ConsumedRecord;
use crate::error::ForwardError;
use crate::subscriber::SubscriberSpec;

pub mod http;
pub mod retry;

pub use http::HttpForwarder;
pub use retry::RetryPolicy;

/// Delivers consumed records to a subscriber's destination.
///
/// Retry, reply and dead-letter behavior belongs to implementations of this trait;
/// the dispatcher only cares whether the record ended up delivered.
#[async_trait]
pub trait MessageForwarder: Send + Sync {
    async fn forward(
        &self,
        record: &ConsumedRecord,
        subscriber: &SubscriberSpec,
    ) -> Result<(), ForwardError>;
}
