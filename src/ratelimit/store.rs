//! Storage trait for abstracting in-process and external record stores.

use async_trait::async_trait;
use std::time::Duration;

use super::record::Record;

/// Closure handed to [`Store::update`].
///
/// It mutates the loaded record and returns the TTL to persist it with, or
/// `None` to leave the stored record untouched.
pub type Mutation<'a> = &'a mut (dyn FnMut(&mut Record) -> Option<Duration> + Send);

/// Trait for record store implementations.
///
/// This trait abstracts over the sharded in-process map and the external
/// key-value adapter so the limiter can work with either. No method returns
/// an error: implementations absorb their own failures and report "no
/// history" instead.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch the record for `key`, or a zeroed record if there is none.
    async fn get(&self, key: &str) -> Record;

    /// Upsert the record for `key` with an expiry hint.
    async fn set(&self, key: &str, record: Record, ttl: Duration);

    /// Load, mutate and persist the record for `key` as one step.
    ///
    /// Calls for the same key are serialized within the process, so two
    /// concurrent updates can never both observe the same starting record.
    /// Returns the record as left by `f`, whether or not it was persisted.
    async fn update(&self, key: &str, f: Mutation<'_>) -> Record;
}
