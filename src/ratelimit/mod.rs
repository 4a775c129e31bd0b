//! Rate limiting logic and state management.

mod external;
mod limiter;
mod policy;
mod record;
mod sharded;
mod store;

pub use external::{ExternalStore, KvBackend, MemoryBackend, DEFAULT_BACKEND_TIMEOUT};
pub use limiter::{
    Limiter, LimiterBuilder, RateLimitHeaders, Verdict, DEFAULT_MAX, DEFAULT_WINDOW,
    RETRY_AFTER, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use policy::{Admission, Outcome, RequestPolicy, Ticket};
pub use record::Record;
pub use sharded::{ShardedStore, DEFAULT_SHARDS, DEFAULT_SWEEP_INTERVAL};
pub use store::{Mutation, Store};
