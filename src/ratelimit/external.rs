//! Record store backed by an external key-value service.
//!
//! Records are serialized to JSON and written with the backend's own TTL, so
//! several limiter processes can share one backend. Every failure on this
//! path (unreachable backend, timeout, corrupt bytes) degrades to "no
//! history for this key": the limiter becomes more permissive rather than
//! failing the request it guards.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::record::Record;
use super::sharded::shard_index;
use super::store::{Mutation, Store};
use crate::clock::Clock;
use crate::error::BackendError;

/// Default bound on a single backend round-trip.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_millis(250);

const LOCK_STRIPES: usize = 64;

/// A durable key-value service with per-key expiry.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch the raw bytes stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Store `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError>;
}

/// Adapter exposing a [`KvBackend`] as a record [`Store`].
pub struct ExternalStore<B: ?Sized = dyn KvBackend> {
    backend: Arc<B>,
    timeout: Duration,
    /// Serializes read-modify-write cycles per key within this process
    stripes: Box<[tokio::sync::Mutex<()>]>,
}

impl<B: KvBackend + ?Sized> ExternalStore<B> {
    /// Wrap `backend` with the default timeout.
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_timeout(backend, DEFAULT_BACKEND_TIMEOUT)
    }

    /// Wrap `backend`, bounding each round-trip by `timeout`.
    pub fn with_timeout(backend: Arc<B>, timeout: Duration) -> Self {
        let stripes = (0..LOCK_STRIPES)
            .map(|_| tokio::sync::Mutex::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            backend,
            timeout,
            stripes,
        }
    }

    async fn load(&self, key: &str) -> Record {
        let raw = match tokio::time::timeout(self.timeout, self.backend.get(key)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => {
                trace!(key = %key, "No stored record");
                return Record::default();
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Backend read failed, assuming no history");
                return Record::default();
            }
            Err(_) => {
                warn!(
                    key = %key,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Backend read timed out, assuming no history"
                );
                return Record::default();
            }
        };

        match decode(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %key, error = %e, "Corrupt record in backend, assuming no history");
                Record::default()
            }
        }
    }

    async fn persist(&self, key: &str, record: &Record, ttl: Duration) {
        let raw = match encode(record) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode record");
                return;
            }
        };

        match tokio::time::timeout(self.timeout, self.backend.set(key, raw, ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key = %key, error = %e, "Backend write failed"),
            Err(_) => warn!(
                key = %key,
                timeout_ms = self.timeout.as_millis() as u64,
                "Backend write timed out"
            ),
        }
    }
}

fn encode(record: &Record) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(record)
}

fn decode(raw: &[u8]) -> serde_json::Result<Record> {
    serde_json::from_slice(raw)
}

#[async_trait]
impl<B: KvBackend + ?Sized> Store for ExternalStore<B> {
    async fn get(&self, key: &str) -> Record {
        self.load(key).await
    }

    async fn set(&self, key: &str, record: Record, ttl: Duration) {
        self.persist(key, &record, ttl).await;
    }

    async fn update(&self, key: &str, f: Mutation<'_>) -> Record {
        let _guard = self.stripes[shard_index(key, self.stripes.len())].lock().await;

        let mut record = self.load(key).await;
        if let Some(ttl) = f(&mut record) {
            self.persist(key, &record, ttl).await;
        }
        record
    }
}

impl<B: ?Sized> std::fmt::Debug for ExternalStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalStore")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// In-memory [`KvBackend`] with TTL expiry.
///
/// One instance can be shared by several stores to stand in for a common
/// backend. It can also be told to fail or stall, to exercise the fail-open
/// path.
pub struct MemoryBackend {
    entries: DashMap<String, (Vec<u8>, u64)>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
    failing_gets: AtomicUsize,
    latency: parking_lot::Mutex<Option<Duration>>,
}

impl MemoryBackend {
    /// Create an empty backend whose TTLs are measured on `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            unavailable: AtomicBool::new(false),
            failing_gets: AtomicUsize::new(0),
            latency: parking_lot::Mutex::new(None),
        }
    }

    /// Make every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `n` reads fail.
    pub fn fail_next_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Store raw bytes directly, bypassing the record codec.
    pub fn insert_raw(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let expires_at = self.clock.now().saturating_add(ttl.as_secs());
        self.entries.insert(key.to_owned(), (value, expires_at));
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| e.value().1 > now).count()
    }

    /// Whether no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn simulate(&self) -> Result<(), BackendError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("backend marked unavailable".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("entries", &self.entries.len())
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.simulate().await?;

        let failed = self
            .failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BackendError::Other("injected read failure".to_string()));
        }

        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.value().1 > now => return Ok(Some(entry.value().0.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
            debug!(key = %key, "Dropped expired backend entry");
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError> {
        self.simulate().await?;
        self.insert_raw(key, value, ttl);
        Ok(())
    }
}
