//! Slidegate - Approximate Sliding-Window Rate Limiting
//!
//! This crate decides, per caller-supplied key, whether an operation may
//! proceed, using a weighted two-window estimate of recent hits. State lives
//! either in a sharded in-process map or in an external key-value backend
//! shared by several processes; time comes from a coarse clock refreshed in
//! the background.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use clock::{Clock, CoarseClock, GlobalClock, ManualClock};
pub use error::{BackendError, Result, SlidegateError};
pub use ratelimit::{Limiter, Verdict};
