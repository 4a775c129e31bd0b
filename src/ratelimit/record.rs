//! Per-key sliding window state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hit counts for one key across the current and previous window.
///
/// A zeroed record (`Record::default()`) means "no history". Records are
/// plain values so stores can keep them inline and overwrite them in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Hits observed since the current window began
    pub current_hits: u64,
    /// Hits observed in the window immediately before the current one
    pub previous_hits: u64,
    /// Epoch second at which the current window elapses (0 = never touched)
    pub window_end: u64,
}

impl Record {
    /// Whether this record has never been aligned to a window.
    pub fn is_fresh(&self) -> bool {
        self.window_end == 0
    }

    /// Align the record to instant `ts`, rolling the window over if it has
    /// elapsed.
    ///
    /// Reaching `window_end` exactly counts as elapsed. The new window ends
    /// one window length after the old one, so windows never drift. If the
    /// key was idle for longer than a full window, the rollover repeats until
    /// the window covers `ts`; the skipped windows were empty, so
    /// `previous_hits` ends up as zero. Window ends saturate at `u64::MAX`.
    pub fn advance(&mut self, ts: u64, window: u64) {
        if self.is_fresh() {
            self.window_end = ts.saturating_add(window);
            return;
        }

        if ts < self.window_end {
            return;
        }

        let rollovers = (ts - self.window_end) / window + 1;
        self.previous_hits = if rollovers == 1 { self.current_hits } else { 0 };
        self.current_hits = 0;
        self.window_end = self
            .window_end
            .saturating_add(rollovers.saturating_mul(window));
    }

    /// Seconds until the current window elapses, never more than one window.
    pub fn reset_in(&self, ts: u64, window: u64) -> u64 {
        self.window_end.saturating_sub(ts).min(window)
    }

    /// Weighted estimate of hits in the trailing window ending at `ts`.
    ///
    /// `floor(previous_hits * reset / window) + current_hits`, computed in
    /// integers so the floor is exact.
    pub fn estimate(&self, ts: u64, window: u64) -> u64 {
        let reset = self.reset_in(ts, window) as u128;
        let weighted = (self.previous_hits as u128 * reset) / window as u128;
        (weighted as u64).saturating_add(self.current_hits)
    }

    /// Retention needed so the previous-window counts outlive their use.
    pub fn ttl(&self, ts: u64, window: u64) -> Duration {
        Duration::from_secs(self.reset_in(ts, window).saturating_add(window))
    }
}
