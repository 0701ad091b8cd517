//! Dual-pool token bucket guarding calls to the indexing service.
//!
//! Tokens are refilled lazily from elapsed time whenever a pool is touched,
//! so no background timer is needed. Each pool also enforces a minimum gap
//! between consecutive grants. One `RateLimiter` is shared (behind an `Arc`)
//! by every job and by the reconciler.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound on a single computed wait, so a zero refill rate cannot
/// overflow duration arithmetic.
const MAX_WAIT: Duration = Duration::from_secs(3600);

/// Float slack when comparing token counts.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("wait cancelled")]
    Cancelled,

    #[error("deadline would pass before a token is available")]
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pool {
    /// Cheap, low-risk calls such as status polls.
    General,
    /// Calls the external service throttles aggressively.
    Restricted,
}

impl std::fmt::Display for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pool::General => f.write_str("general"),
            Pool::Restricted => f.write_str("restricted"),
        }
    }
}

/// Pools are configured as a whole. A partial object would silently mix in
/// another pool's defaults, so every field is required.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Bucket capacity.
    pub burst: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
    /// Minimum gap between two grants, in milliseconds.
    pub min_interval_ms: u64,
}

impl PoolConfig {
    pub fn general_defaults() -> Self {
        Self {
            burst: 10,
            refill_per_sec: 2.0,
            min_interval_ms: 200,
        }
    }

    pub fn restricted_defaults() -> Self {
        Self {
            burst: 3,
            refill_per_sec: 0.033,
            min_interval_ms: 30_000,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::general_defaults()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub general: PoolConfig,
    pub restricted: PoolConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            general: PoolConfig::general_defaults(),
            restricted: PoolConfig::restricted_defaults(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    base: PoolConfig,
    refill_per_sec: f64,
    min_interval: Duration,
    tokens: f64,
    last_refill: Instant,
    last_grant: Option<Instant>,
}

impl Bucket {
    fn new(base: PoolConfig, now: Instant) -> Self {
        Self {
            base,
            refill_per_sec: base.refill_per_sec,
            min_interval: base.min_interval(),
            tokens: f64::from(base.burst),
            last_refill: now,
            last_grant: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = f64::from(self.base.burst);
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(capacity);
        self.last_refill = now;
    }

    /// Time until both a token and the minimum interval are available.
    fn time_until_ready(&mut self, now: Instant) -> Duration {
        self.refill(now);

        let token_wait = if self.tokens + TOKEN_EPSILON >= 1.0 {
            Duration::ZERO
        } else if self.refill_per_sec <= 0.0 {
            MAX_WAIT
        } else {
            Duration::try_from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
                .unwrap_or(MAX_WAIT)
                .min(MAX_WAIT)
        };

        let interval_wait = match self.last_grant {
            Some(last) => self
                .min_interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        };

        token_wait.max(interval_wait)
    }

    /// Consumes a token if one is ready, otherwise reports how long to wait.
    fn try_grant(&mut self, now: Instant) -> Result<(), Duration> {
        let wait = self.time_until_ready(now);
        if !wait.is_zero() {
            return Err(wait);
        }
        self.tokens = (self.tokens - 1.0).max(0.0);
        self.last_grant = Some(now);
        Ok(())
    }

    fn apply_multiplier(&mut self, k: f64, now: Instant) {
        // Settle tokens earned at the old rate before switching.
        self.refill(now);
        self.refill_per_sec = self.base.refill_per_sec / k;
        self.min_interval = self.base.min_interval().mul_f64(k);
    }
}

/// Shared dual-pool limiter.
#[derive(Debug)]
pub struct RateLimiter {
    general: Mutex<Bucket>,
    restricted: Mutex<Bucket>,
    multiplier: Mutex<f64>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            general: Mutex::new(Bucket::new(config.general, now)),
            restricted: Mutex::new(Bucket::new(config.restricted, now)),
            multiplier: Mutex::new(1.0),
        }
    }

    fn bucket(&self, pool: Pool) -> MutexGuard<'_, Bucket> {
        let lock = match pool {
            Pool::General => &self.general,
            Pool::Restricted => &self.restricted,
        };
        // Bucket state is plain numbers; a panic elsewhere cannot leave it
        // half-written in a way that matters.
        lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits for a token from `pool`.
    ///
    /// Returns `RateLimitError::Cancelled` as soon as `cancel` fires. No token
    /// is consumed on that path.
    pub async fn wait(&self, pool: Pool, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        self.wait_inner(pool, cancel, None).await
    }

    /// Like [`wait`](Self::wait), but gives up with
    /// `RateLimitError::DeadlineExceeded` if no token can be granted before
    /// `deadline`.
    pub async fn wait_until(
        &self,
        pool: Pool,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<(), RateLimitError> {
        self.wait_inner(pool, cancel, Some(deadline)).await
    }

    async fn wait_inner(
        &self,
        pool: Pool,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), RateLimitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }

            let now = Instant::now();
            let wait = match self.bucket(pool).try_grant(now) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            if let Some(deadline) = deadline {
                if now + wait > deadline {
                    return Err(RateLimitError::DeadlineExceeded);
                }
            }

            log::trace!("{} pool not ready, waiting {:?}", pool, wait);
            tokio::select! {
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Takes a token only if one is ready right now.
    pub fn try_acquire(&self, pool: Pool) -> bool {
        self.bucket(pool).try_grant(Instant::now()).is_ok()
    }

    /// Tokens currently in the bucket, after refill.
    pub fn available_tokens(&self, pool: Pool) -> f64 {
        let mut bucket = self.bucket(pool);
        bucket.refill(Instant::now());
        bucket.tokens
    }

    /// Current minimum gap between grants for `pool`.
    pub fn min_interval(&self, pool: Pool) -> Duration {
        self.bucket(pool).min_interval
    }

    /// Slows both pools down by `k` relative to their configured rates.
    /// Values below 1.0 (or not finite) are treated as 1.0.
    pub fn set_backoff_multiplier(&self, k: f64) {
        let k = if k.is_finite() && k >= 1.0 { k } else { 1.0 };
        let now = Instant::now();
        self.bucket(Pool::General).apply_multiplier(k, now);
        self.bucket(Pool::Restricted).apply_multiplier(k, now);
        let mut current = self
            .multiplier
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if (*current - k).abs() > f64::EPSILON {
            log::warn!("Rate limiter backoff multiplier set to {}", k);
        }
        *current = k;
    }

    pub fn backoff_multiplier(&self) -> f64 {
        *self
            .multiplier
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Restores the configured refill rates and intervals.
    pub fn reset_to_defaults(&self) {
        if self.backoff_multiplier() > 1.0 {
            log::info!("Rate limiter backoff cleared");
        }
        self.set_backoff_multiplier(1.0);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
