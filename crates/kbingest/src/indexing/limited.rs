use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{DataSourceDescriptor, IndexingClient, PassReport};
use crate::error::IndexingError;
use crate::ratelimit::{Pool, RateLimitError, RateLimiter};

/// Multiplier applied when the service signals throttling.
pub const THROTTLE_BACKOFF: f64 = 2.0;

/// Re-sends allowed for a throttled registration or pass start.
pub const DEFAULT_THROTTLE_RETRIES: u32 = 2;

/// Longest server-requested pause we honor before re-sending.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Gates every call to the inner client through the shared [`RateLimiter`].
///
/// Registrations and pass starts draw from the restricted pool, status polls
/// from the general pool. A throttling response slows the limiter down; the
/// reconciler clears the slowdown after a clean tick.
///
/// Throttled registrations and pass starts are re-sent through the slowed
/// limiter up to `throttle_retries` times, after any `Retry-After` the
/// service gave. Polls are not re-sent here since the next reconcile tick
/// polls again anyway.
pub struct RateLimitedIndexing {
    inner: Arc<dyn IndexingClient>,
    limiter: Arc<RateLimiter>,
    shutdown: CancellationToken,
    throttle_retries: u32,
}

impl RateLimitedIndexing {
    pub fn new(
        inner: Arc<dyn IndexingClient>,
        limiter: Arc<RateLimiter>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner,
            limiter,
            shutdown,
            throttle_retries: DEFAULT_THROTTLE_RETRIES,
        }
    }

    pub fn with_throttle_retries(mut self, retries: u32) -> Self {
        self.throttle_retries = retries;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Sends `call` once a `pool` token is granted, re-sending up to
    /// `retries` times while the service answers with a throttle.
    async fn send<T, F, Fut>(
        &self,
        pool: Pool,
        retries: u32,
        mut call: F,
    ) -> Result<T, IndexingError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, IndexingError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            self.limiter.wait(pool, &self.shutdown).await?;
            let retry_after = match call().await {
                Err(IndexingError::Throttled { retry_after }) => retry_after,
                other => return other,
            };
            self.limiter.set_backoff_multiplier(THROTTLE_BACKOFF);

            if attempt >= retries {
                log::warn!(
                    "Indexing service still throttling {} requests after {} retries",
                    pool,
                    attempt
                );
                return Err(IndexingError::Throttled { retry_after });
            }
            attempt += 1;
            log::warn!(
                "Indexing service throttled {} request, retry {}/{} (retry after {:?})",
                pool,
                attempt,
                retries,
                retry_after
            );

            if let Some(delay) = retry_after {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        return Err(RateLimitError::Cancelled.into());
                    }
                    _ = tokio::time::sleep(delay.min(MAX_RETRY_AFTER)) => {}
                }
            }
        }
    }
}

#[async_trait]
impl IndexingClient for RateLimitedIndexing {
    async fn register_data_source(
        &self,
        index_ref: &str,
        source: &DataSourceDescriptor,
    ) -> Result<String, IndexingError> {
        let inner = &*self.inner;
        self.send(Pool::Restricted, self.throttle_retries, move || {
            inner.register_data_source(index_ref, source)
        })
        .await
    }

    async fn start_indexing_pass(
        &self,
        index_ref: &str,
        data_source_ids: &[String],
    ) -> Result<String, IndexingError> {
        let inner = &*self.inner;
        self.send(Pool::Restricted, self.throttle_retries, move || {
            inner.start_indexing_pass(index_ref, data_source_ids)
        })
        .await
    }

    async fn get_indexing_pass_status(&self, pass_id: &str) -> Result<PassReport, IndexingError> {
        let inner = &*self.inner;
        self.send(Pool::General, 0, move || inner.get_indexing_pass_status(pass_id)).await
    }
}
