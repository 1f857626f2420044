//! Per-caller rate limiting.
//!
//! Every caller may submit a bounded number of requests inside a trailing
//! time window. State lives in memory only.
//!
//! - [`RateLimiter`]: the sharded map of caller windows
//! - [`Window`]: timestamps of one caller's recent requests
//! - [`RateLimitConfig`]: limits and sweep interval
//! - [`SweepHandle`]: owner of the background task pruning idle windows

mod config;
mod limiter;
mod window;

pub use config::RateLimitConfig;
pub use limiter::{RateLimiter, SweepHandle};
pub use window::Window;
