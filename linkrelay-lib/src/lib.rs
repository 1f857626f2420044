//! `linkrelay` delivers links submitted by callers to a downstream HTTP
//! service each caller configures for themselves.
//!
//! Submissions are shed rather than queued when the gateway is busy, rate
//! limited per caller and bounded in how many may be in flight. Delivery
//! logs in on the caller's behalf when the service asks for it and retries
//! once after a transient network failure.
//!
//! "Hello world" example:
//!
//! ```no_run
//! use linkrelay_lib::{EndpointConfig, ForwardRequest, GatewayBuilder, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let gateway = GatewayBuilder::default().gateway();
//!   let endpoint = EndpointConfig::new("relay.example.com:5000", None)?;
//!   let request = ForwardRequest::new(1, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
//!   let outcome = gateway.submit(&request, &endpoint).await;
//!   println!("{outcome}");
//!   Ok(())
//! }
//! ```
//!
//! The building blocks are public as well, see [`RateLimiter`],
//! [`AdmissionController`], [`HttpPool`], [`AuthRetryExecutor`] and
//! [`ConnectivityProber`].
#![warn(missing_docs)]

#[cfg(doctest)]
doc_comment::doctest!("../../README.md");

mod admission;
mod auth;
mod client;
mod config;
mod gateway;
mod probe;
mod retry;
mod store;
mod types;
mod utils;

pub mod ratelimit;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionSlot, AdmissionStats};
pub use auth::{AuthRetryExecutor, ForwardConfig};
pub use client::{HttpPool, PoolConfig};
pub use config::GatewayConfig;
pub use gateway::{ForwardingGateway, GatewayBuilder, GatewayStats};
pub use probe::{ConnectivityProber, ProbeConfig};
pub use ratelimit::{RateLimitConfig, RateLimiter, SweepHandle};
pub use store::{
    CallerStats, ConfigStore, ForwardRecord, ForwardStatus, MemoryConfigStore, MemoryOutcomeSink,
    OutcomeSink,
};
pub use types::*;
