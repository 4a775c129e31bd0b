//! Sharded in-process record store.
//!
//! Keys are spread over a fixed number of independently locked shards so
//! that checks for different keys rarely contend. A periodic sweep evicts
//! records whose retention has passed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::record::Record;
use super::store::{Mutation, Store};
use crate::clock::Clock;
use crate::error::{Result, SlidegateError};

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 32;
/// Default sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
fn fnv1a(key: &str) -> u32 {
    key.bytes()
        .fold(FNV_OFFSET_BASIS, |hash, byte| (hash ^ byte as u32).wrapping_mul(FNV_PRIME))
}

/// Index of the shard (or lock stripe) that owns `key`.
pub(crate) fn shard_index(key: &str, shard_count: usize) -> usize {
    let hash = fnv1a(key);
    // Fold the high half in; FNV's low bits only see the low bits of input.
    ((hash ^ (hash >> 16)) as usize) % shard_count
}

/// A stored record plus the absolute second at which it may be evicted.
#[derive(Debug, Clone, Copy)]
struct Slot {
    record: Record,
    expires_at: u64,
}

impl Slot {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

type Shard = Mutex<HashMap<String, Slot>>;

struct Inner {
    shards: Box<[Shard]>,
    clock: Arc<dyn Clock>,
}

impl Inner {
    fn shard(&self, key: &str) -> &Shard {
        &self.shards[shard_index(key, self.shards.len())]
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        self.clock.now().saturating_add(ttl.as_secs())
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut evicted = 0;

        for shard in self.shards.iter() {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, slot| !slot.is_expired(now));
            evicted += before - map.len();
        }

        if evicted > 0 {
            debug!(evicted, "Swept expired records");
        }
        evicted
    }
}

/// In-process store partitioned across lock-protected shards.
///
/// Records live inline in their shard's map and are overwritten in place,
/// so steady-state checks on known keys do not allocate.
pub struct ShardedStore {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ShardedStore {
    /// Create a store with `shard_count` shards reading time from `clock`.
    pub fn new(shard_count: usize, clock: Arc<dyn Clock>) -> Result<Self> {
        if shard_count == 0 {
            return Err(SlidegateError::InvalidShardCount);
        }

        let shards = (0..shard_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            inner: Arc::new(Inner { shards, clock }),
            sweeper: Mutex::new(None),
        })
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Number of stored records, expired or not.
    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every record whose retention has passed. Returns the count.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// Only the first successful call spawns a task; later calls return
    /// `false`. The task stops when the store is dropped. Returns `false`
    /// without starting anything when called outside a runtime.
    pub fn start_sweeper(&self, period: Duration) -> bool {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return false;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "No tokio runtime, record sweeper not started");
                return false;
            }
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        *sweeper = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        inner.sweep();
                    }
                    None => break,
                }
            }
        }));

        info!(
            period_ms = period.as_millis() as u64,
            shards = self.shard_count(),
            "Record sweeper started"
        );
        true
    }
}

impl Drop for ShardedStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("shards", &self.shard_count())
            .field("sweeper", &self.sweeper.lock().is_some())
            .finish()
    }
}

#[async_trait]
impl Store for ShardedStore {
    async fn get(&self, key: &str) -> Record {
        let now = self.inner.clock.now();
        let map = self.inner.shard(key).lock();
        match map.get(key) {
            Some(slot) if !slot.is_expired(now) => slot.record,
            _ => Record::default(),
        }
    }

    async fn set(&self, key: &str, record: Record, ttl: Duration) {
        let slot = Slot {
            record,
            expires_at: self.inner.expiry(ttl),
        };
        put(&mut self.inner.shard(key).lock(), key, slot);
    }

    async fn update(&self, key: &str, f: Mutation<'_>) -> Record {
        let now = self.inner.clock.now();
        let mut map = self.inner.shard(key).lock();

        let mut record = match map.get(key) {
            Some(slot) if !slot.is_expired(now) => slot.record,
            _ => Record::default(),
        };

        if let Some(ttl) = f(&mut record) {
            let slot = Slot {
                record,
                expires_at: now.saturating_add(ttl.as_secs()),
            };
            put(&mut map, key, slot);
            trace!(key = %key, ttl_secs = ttl.as_secs(), "Record persisted");
        }

        record
    }
}

/// Overwrite the slot in place, allocating the key only for new entries.
fn put(map: &mut HashMap<String, Slot>, key: &str, slot: Slot) {
    if let Some(existing) = map.get_mut(key) {
        *existing = slot;
    } else {
        map.insert(key.to_owned(), slot);
    }
}
