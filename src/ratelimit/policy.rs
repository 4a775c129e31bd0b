//! Request-level admission policy around a [`Limiter`].
//!
//! A request pipeline rarely has a key in hand; it has a request. The policy
//! derives the key, lets some requests bypass limiting entirely, reports
//! rejections, and optionally gives the hit back once the outcome of the
//! admitted operation is known.

use std::sync::Arc;
use tracing::trace;

use super::limiter::{Limiter, Verdict};

type KeyFn<R> = Arc<dyn Fn(&R) -> String + Send + Sync>;
type SkipFn<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;
type RejectFn<R> = Arc<dyn Fn(&R, &Verdict) + Send + Sync>;

/// How an admitted operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation succeeded (e.g. a non-error response)
    Success,
    /// The operation failed (e.g. a 4xx/5xx response)
    Failure,
}

/// Result of running a request through a [`RequestPolicy`].
#[derive(Debug)]
pub enum Admission {
    /// The skip predicate matched; nothing was counted
    Skipped,
    /// The hit was counted and may proceed
    Admitted(Ticket),
    /// The hit was over the limit
    Rejected(Verdict),
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }
}

/// An admitted hit awaiting the outcome of its operation.
#[derive(Debug)]
#[must_use = "complete the ticket to apply skip-successful / skip-failed"]
pub struct Ticket {
    limiter: Arc<Limiter>,
    key: String,
    verdict: Verdict,
    refund_success: bool,
    refund_failure: bool,
}

impl Ticket {
    /// The verdict the hit was admitted with.
    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    /// The key the hit was counted against.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Report the outcome, refunding the hit if the policy skips it.
    ///
    /// Returns the verdict to derive response headers from, with `remaining`
    /// raised by one when the hit was given back.
    pub async fn complete(self, outcome: Outcome) -> Verdict {
        let refund = match outcome {
            Outcome::Success => self.refund_success,
            Outcome::Failure => self.refund_failure,
        };

        let mut verdict = self.verdict;
        if refund && self.limiter.refund(&self.key, &verdict).await {
            verdict.remaining += 1;
            trace!(key = %self.key, outcome = ?outcome, "Hit skipped by policy");
        }
        verdict
    }
}

/// Admission policy for requests of type `R`.
pub struct RequestPolicy<R> {
    limiter: Arc<Limiter>,
    key_fn: KeyFn<R>,
    skip: Option<SkipFn<R>>,
    on_reject: Option<RejectFn<R>>,
    skip_successful: bool,
    skip_failed: bool,
}

impl<R> RequestPolicy<R> {
    /// Create a policy that limits requests by the key `key_fn` derives.
    pub fn new<F>(limiter: Arc<Limiter>, key_fn: F) -> Self
    where
        F: Fn(&R) -> String + Send + Sync + 'static,
    {
        Self {
            limiter,
            key_fn: Arc::new(key_fn),
            skip: None,
            on_reject: None,
            skip_successful: false,
            skip_failed: false,
        }
    }

    /// Bypass limiting for requests matching `predicate`.
    pub fn skip_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    /// Call `callback` for every rejected request.
    pub fn on_reject<F>(mut self, callback: F) -> Self
    where
        F: Fn(&R, &Verdict) + Send + Sync + 'static,
    {
        self.on_reject = Some(Arc::new(callback));
        self
    }

    /// Give back hits whose operation succeeded.
    pub fn skip_successful(mut self, skip: bool) -> Self {
        self.skip_successful = skip;
        self
    }

    /// Give back hits whose operation failed.
    pub fn skip_failed(mut self, skip: bool) -> Self {
        self.skip_failed = skip;
        self
    }

    /// The limiter behind this policy.
    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }

    /// Decide whether `request` may proceed.
    pub async fn admit(&self, request: &R) -> Admission {
        if let Some(skip) = &self.skip {
            if skip(request) {
                return Admission::Skipped;
            }
        }

        let key = (self.key_fn)(request);
        let verdict = self.limiter.check(&key).await;

        if !verdict.admitted {
            if let Some(on_reject) = &self.on_reject {
                on_reject(request, &verdict);
            }
            return Admission::Rejected(verdict);
        }

        Admission::Admitted(Ticket {
            limiter: self.limiter.clone(),
            key,
            verdict,
            refund_success: self.skip_successful,
            refund_failure: self.skip_failed,
        })
    }
}

impl<R> Clone for RequestPolicy<R> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            key_fn: self.key_fn.clone(),
            skip: self.skip.clone(),
            on_reject: self.on_reject.clone(),
            skip_successful: self.skip_successful,
            skip_failed: self.skip_failed,
        }
    }
}
