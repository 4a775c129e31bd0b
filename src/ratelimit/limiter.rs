//! Core sliding-window admission logic.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::record::Record;
use super::sharded::{ShardedStore, DEFAULT_SHARDS, DEFAULT_SWEEP_INTERVAL};
use super::store::Store;
use crate::clock::{Clock, GlobalClock};
use crate::error::{Result, SlidegateError};

/// Default hits allowed per window.
pub const DEFAULT_MAX: u64 = 60;
/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Header carrying the configured limit.
pub const X_RATELIMIT_LIMIT: &str = "X-RateLimit-Limit";
/// Header carrying the remaining hits.
pub const X_RATELIMIT_REMAINING: &str = "X-RateLimit-Remaining";
/// Header carrying the seconds until the window rolls over.
pub const X_RATELIMIT_RESET: &str = "X-RateLimit-Reset";
/// Standard retry hint sent with rejections.
pub const RETRY_AFTER: &str = "Retry-After";

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Whether the hit may proceed
    pub admitted: bool,
    /// Hits allowed per window
    pub limit: u64,
    /// Hits left before rejection; negative once over the limit
    pub remaining: i64,
    /// Seconds until the current window rolls over
    pub reset_secs: u64,
    /// Window the hit was counted in, used to target refunds
    #[serde(skip)]
    pub(crate) window_end: u64,
}

impl Verdict {
    /// Retry hint for a rejected hit.
    pub fn retry_after(&self) -> Option<Duration> {
        (!self.admitted).then(|| Duration::from_secs(self.reset_secs))
    }

    /// Informational rate-limit headers for this verdict.
    pub fn headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining.max(0) as u64,
            reset: self.reset_secs,
            retry_after: self.retry_after().map(|d| d.as_secs()),
        }
    }
}

/// Rate-limit header values ready to be attached to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    /// Clamped at zero
    pub remaining: u64,
    pub reset: u64,
    /// Only set on rejection
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    /// Header name/value pairs in a stable order.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (X_RATELIMIT_LIMIT, self.limit.to_string()),
            (X_RATELIMIT_REMAINING, self.remaining.to_string()),
            (X_RATELIMIT_RESET, self.reset.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            pairs.push((RETRY_AFTER, retry_after.to_string()));
        }
        pairs
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Approximate sliding-window rate limiter.
///
/// Each key's hits are estimated over the trailing window by weighting the
/// previous fixed window by how much of it still overlaps, then adding the
/// current window's exact count. This struct is thread-safe and can be
/// shared across tasks.
pub struct Limiter {
    max: u64,
    /// Window length in whole seconds
    window: u64,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl Limiter {
    /// Start configuring a limiter.
    pub fn builder() -> LimiterBuilder {
        LimiterBuilder::default()
    }

    /// Hits allowed per window.
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window)
    }

    /// The store in use.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Count one hit against `key` and decide whether it may proceed.
    ///
    /// Rejected hits are not persisted.
    pub async fn check(&self, key: &str) -> Verdict {
        let ts = self.clock.now();
        let (max, window) = (self.max, self.window);
        let mut verdict = Verdict {
            admitted: false,
            limit: max,
            remaining: 0,
            reset_secs: 0,
            window_end: 0,
        };

        self.store
            .update(key, &mut |record: &mut Record| {
                record.advance(ts, window);
                record.current_hits = record.current_hits.saturating_add(1);

                let remaining = to_i64(max).saturating_sub(to_i64(record.estimate(ts, window)));
                verdict = Verdict {
                    admitted: remaining >= 0,
                    limit: max,
                    remaining,
                    reset_secs: record.reset_in(ts, window),
                    window_end: record.window_end,
                };

                verdict.admitted.then(|| record.ttl(ts, window))
            })
            .await;

        trace!(
            key = %key,
            admitted = verdict.admitted,
            remaining = verdict.remaining,
            reset_secs = verdict.reset_secs,
            "Checked rate limit"
        );

        if !verdict.admitted {
            debug!(
                key = %key,
                limit = max,
                remaining = verdict.remaining,
                reset_secs = verdict.reset_secs,
                "Rate limit exceeded"
            );
        }

        verdict
    }

    /// Take back the hit counted by an admitted `verdict`.
    ///
    /// Used when the guarded operation turns out not to count (skip
    /// successful / skip failed). If the key's window has rolled once since,
    /// the hit is taken from the previous window instead. Returns whether a
    /// hit was removed.
    pub async fn refund(&self, key: &str, verdict: &Verdict) -> bool {
        if !verdict.admitted {
            return false;
        }

        let ts = self.clock.now();
        let window = self.window;
        let counted_in = verdict.window_end;
        let mut refunded = false;

        self.store
            .update(key, &mut |record: &mut Record| {
                let hits = if record.window_end == counted_in {
                    &mut record.current_hits
                } else if record.window_end == counted_in.saturating_add(window) {
                    &mut record.previous_hits
                } else {
                    return None;
                };

                if *hits == 0 {
                    return None;
                }
                *hits -= 1;
                refunded = true;
                Some(record.ttl(ts, window))
            })
            .await;

        if refunded {
            trace!(key = %key, "Refunded hit");
        }
        refunded
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("max", &self.max)
            .field("window", &self.window)
            .finish()
    }
}

/// Builder for [`Limiter`].
pub struct LimiterBuilder {
    max: u64,
    window: Duration,
    store: Option<Arc<dyn Store>>,
    clock: Option<Arc<dyn Clock>>,
    shards: usize,
    sweep_interval: Duration,
}

impl Default for LimiterBuilder {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX,
            window: DEFAULT_WINDOW,
            store: None,
            clock: None,
            shards: DEFAULT_SHARDS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl LimiterBuilder {
    /// Hits allowed per window. Zero rejects everything.
    pub fn max(mut self, max: u64) -> Self {
        self.max = max;
        self
    }

    /// Window length, truncated to whole seconds.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Use a specific store instead of a fresh in-process one.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a specific clock instead of the process-wide one.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shard count for the default in-process store.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Sweep period for the default in-process store.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Build the limiter.
    ///
    /// When no store was given, a [`ShardedStore`] is created; its sweeper
    /// is started if a tokio runtime is available.
    pub fn build(self) -> Result<Limiter> {
        let window = self.window.as_secs();
        if window == 0 {
            return Err(SlidegateError::InvalidWindow);
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(GlobalClock));
        let store = match self.store {
            Some(store) => store,
            None => {
                let store = ShardedStore::new(self.shards, clock.clone())?;
                if tokio::runtime::Handle::try_current().is_ok() {
                    store.start_sweeper(self.sweep_interval);
                }
                Arc::new(store)
            }
        };

        debug!(max = self.max, window_secs = window, "Rate limiter built");

        Ok(Limiter {
            max: self.max,
            window,
            store,
            clock,
        })
    }
}
