use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::error::FetchError;

/// A zero-argument async data source for one cache key.
///
/// Timeouts and retries are the producer's own business; the coordinator
/// never imposes one.
#[async_trait]
pub trait Producer: Send + Sync {
  async fn produce(&self) -> Result<serde_json::Value, FetchError>;
}

#[async_trait]
impl<F, Fut> Producer for F
where
  F: Fn() -> Fut + Send + Sync,
  Fut: Future<Output = Result<serde_json::Value, FetchError>> + Send + 'static,
{
  async fn produce(&self) -> Result<serde_json::Value, FetchError> {
    (self)().await
  }
}

pub type ProducerRef = Arc<dyn Producer>;

/// Wrap a closure as a shareable producer.
pub fn producer<F, Fut>(f: F) -> ProducerRef
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<serde_json::Value, FetchError>> + Send + 'static,
{
  Arc::new(f)
}
