//! Coarse time sources for the admission path.
//!
//! Admission decisions only need one-second resolution, so instead of asking
//! the OS for the time on every check, a background updater refreshes a
//! shared atomic once per tick and readers perform a single atomic load.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

/// A source of epoch seconds.
pub trait Clock: Send + Sync {
    /// Current time in whole seconds since the Unix epoch.
    fn now(&self) -> u64;
}

static GLOBAL: OnceLock<CoarseClock> = OnceLock::new();

/// Wall-clock seconds read directly from the OS.
fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

struct Shared {
    ts: AtomicU64,
    stopped: AtomicBool,
}

/// A clock refreshed by a background updater thread.
///
/// Staleness is bounded by the tick period.
pub struct CoarseClock {
    shared: Arc<Shared>,
    updater: Mutex<Option<JoinHandle<()>>>,
    period: Duration,
}

impl CoarseClock {
    /// Tick period of the process-wide clock.
    pub const TICK: Duration = Duration::from_secs(1);

    /// The process-wide clock, started on first use.
    ///
    /// Concurrent first callers race on a one-time initializer, so exactly
    /// one updater is ever spawned.
    pub fn global() -> &'static CoarseClock {
        GLOBAL.get_or_init(|| CoarseClock::start(Self::TICK))
    }

    /// Start an owned clock whose updater stops on [`shutdown`](Self::shutdown)
    /// or when the clock is dropped.
    pub fn start(period: Duration) -> Self {
        let shared = Arc::new(Shared {
            ts: AtomicU64::new(unix_now()),
            stopped: AtomicBool::new(false),
        });

        let worker = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("slidegate-clock".to_string())
            .spawn(move || {
                while !worker.stopped.load(Ordering::Acquire) {
                    thread::park_timeout(period);
                    worker.ts.store(unix_now(), Ordering::Release);
                }
            });

        let updater = match spawned {
            Ok(handle) => {
                info!(period_ms = period.as_millis() as u64, "Clock updater started");
                Some(handle)
            }
            Err(e) => {
                // Without an updater every read falls through to the OS clock.
                warn!(error = %e, "Failed to spawn clock updater");
                shared.stopped.store(true, Ordering::Release);
                None
            }
        };

        Self {
            shared,
            updater: Mutex::new(updater),
            period,
        }
    }

    /// Whether the background updater is still running.
    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stop the updater and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.updater.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Clock for CoarseClock {
    fn now(&self) -> u64 {
        if self.is_running() {
            self.shared.ts.load(Ordering::Acquire)
        } else {
            unix_now()
        }
    }
}

impl Drop for CoarseClock {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CoarseClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoarseClock")
            .field("now", &self.shared.ts.load(Ordering::Relaxed))
            .field("period", &self.period)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Handle onto [`CoarseClock::global`], usable wherever a `Clock` value is
/// injected.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalClock;

impl Clock for GlobalClock {
    fn now(&self) -> u64 {
        CoarseClock::global().now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    ts: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start` epoch seconds.
    pub fn new(start: u64) -> Self {
        Self {
            ts: AtomicU64::new(start),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, ts: u64) {
        self.ts.store(ts, Ordering::SeqCst);
    }

    /// Move forward by `secs` seconds.
    pub fn advance(&self, secs: u64) {
        self.ts.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.ts.load(Ordering::SeqCst)
    }
}
