//! The entry point for submissions.
//!
//! [`ForwardingGateway`] puts the load-shedding checks in front of the
//! [`AuthRetryExecutor`] and hands every finished attempt to the
//! [`OutcomeSink`]. Build one with [`GatewayBuilder`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use linkrelay_lib::{GatewayBuilder, MemoryConfigStore, EndpointConfig, ConfigStore};
//!
//! # #[tokio::main]
//! # async fn main() -> linkrelay_lib::Result<()> {
//! let store = Arc::new(MemoryConfigStore::new());
//! store
//!     .save_endpoint_config(42, EndpointConfig::new("relay.example.com:5000", None)?)
//!     .await;
//!
//! let gateway = GatewayBuilder::builder()
//!     .config_store(store)
//!     .build()
//!     .gateway();
//! let outcome = gateway.forward(42, "https://www.youtube.com/watch?v=dQw4w9WgXcQ").await;
//! println!("{outcome}");
//! gateway.shutdown().await;
//! # Ok(())
//! # }
//! ```

use log::debug;
use serde::Serialize;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use typed_builder::TypedBuilder;

use crate::{
    AdmissionController, AdmissionStats, AuthRetryExecutor, CallerId, ConfigStore,
    ConnectivityProber, EndpointConfig, FailureKind, ForwardOutcome, ForwardRequest,
    GatewayConfig, HttpPool, OutcomeSink, ProbeReport, RateLimiter, SweepHandle,
};

const OVERLOADED_MESSAGE: &str = "The service is busy right now, try again in a moment";
const RATE_LIMITED_MESSAGE: &str = "Too many requests, wait a minute before sending more links";
const ADMISSION_DENIED_MESSAGE: &str =
    "Too many of your links are still being forwarded, wait for them to finish";
const NOT_CONFIGURED_MESSAGE: &str = "No endpoint is configured, set one up first";

/// Counters of submissions, by how they ended at the gateway
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    /// Turned away because the gateway was overloaded
    pub overloaded: u64,
    /// Turned away by the per-caller rate limit
    pub rate_limited: u64,
    /// Turned away because no admission slot was free
    pub admission_denied: u64,
    /// Handed to the executor
    pub forwarded: u64,
}

impl Display for GatewayStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} forwarded, {} overloaded, {} rate limited, {} admission denied",
            self.forwarded, self.overloaded, self.rate_limited, self.admission_denied
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    overloaded: AtomicU64,
    rate_limited: AtomicU64,
    admission_denied: AtomicU64,
    forwarded: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> GatewayStats {
        GatewayStats {
            overloaded: self.overloaded.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            admission_denied: self.admission_denied.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
        }
    }
}

/// Builder for [`ForwardingGateway`].
///
/// Every component is created from `config`, except for the pool, which
/// can be shared between gateways.
#[derive(TypedBuilder)]
#[builder(field_defaults(default))]
#[builder(builder_method(doc = "
Create a builder for building `GatewayBuilder`.

On the builder call, call methods with same name as its fields to set their values.

Finally, call `.build()` to create the instance of `GatewayBuilder`.
"))]
pub struct GatewayBuilder {
    /// Settings of all components
    config: GatewayConfig,

    /// Where endpoint configurations are read from.
    ///
    /// Defaults to an empty [`crate::MemoryConfigStore`].
    #[builder(default_code = "Arc::new(crate::MemoryConfigStore::new())")]
    config_store: Arc<dyn ConfigStore>,

    /// Where outcomes are recorded.
    ///
    /// Defaults to a fresh [`crate::MemoryOutcomeSink`].
    #[builder(default_code = "Arc::new(crate::MemoryOutcomeSink::new())")]
    outcome_sink: Arc<dyn OutcomeSink>,

    /// An existing pool to send through instead of a new one
    #[builder(setter(into))]
    pool: Option<Arc<HttpPool>>,
}

impl Default for GatewayBuilder {
    #[inline]
    fn default() -> Self {
        Self::builder().build()
    }
}

impl GatewayBuilder {
    /// Instantiates a [`ForwardingGateway`] and starts the rate limit sweep.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    #[must_use]
    pub fn gateway(self) -> ForwardingGateway {
        let Self {
            config,
            config_store,
            outcome_sink,
            pool,
        } = self;

        let pool = pool.unwrap_or_else(|| Arc::new(HttpPool::new(config.pool.clone())));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let sweep = limiter.spawn_sweep();

        ForwardingGateway {
            admission: Arc::new(AdmissionController::new(config.admission)),
            executor: AuthRetryExecutor::new(Arc::clone(&pool), config.forward),
            prober: ConnectivityProber::new(Arc::clone(&pool), config.probe)
                .with_max_redirects(config.forward.max_redirects)
                .with_body_preview(config.forward.body_preview),
            limiter,
            pool,
            config_store,
            outcome_sink,
            counters: Counters::default(),
            sweep: Mutex::new(Some(sweep)),
        }
    }
}

/// Accepts submissions and delivers them downstream.
///
/// A submission passes three checks before anything is sent, each with its
/// own rejection reason: the gateway must not be overloaded, the caller
/// must be within the rate limit and an admission slot must be free.
pub struct ForwardingGateway {
    limiter: Arc<RateLimiter>,
    admission: Arc<AdmissionController>,
    pool: Arc<HttpPool>,
    executor: AuthRetryExecutor,
    prober: ConnectivityProber,
    config_store: Arc<dyn ConfigStore>,
    outcome_sink: Arc<dyn OutcomeSink>,
    counters: Counters,
    sweep: Mutex<Option<SweepHandle>>,
}

impl std::fmt::Debug for ForwardingGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingGateway")
            .field("limiter", &self.limiter)
            .field("admission", &self.admission)
            .field("pool", &self.pool)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl ForwardingGateway {
    /// Deliver a submission to `endpoint`.
    ///
    /// Throttled submissions are answered right away and neither sent nor
    /// recorded. Everything else is recorded in the outcome sink. Dropping
    /// the returned future aborts the delivery and frees its admission slot.
    pub async fn submit(&self, request: &ForwardRequest, endpoint: &EndpointConfig) -> ForwardOutcome {
        let caller = request.caller;

        if self.admission.is_overloaded() {
            self.counters.overloaded.fetch_add(1, Ordering::Relaxed);
            debug!("Rejected {request}: gateway overloaded");
            return ForwardOutcome::failed(FailureKind::Overloaded, OVERLOADED_MESSAGE);
        }

        if !self.limiter.allow(caller) {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            debug!("Rejected {request}: rate limited");
            return ForwardOutcome::failed(FailureKind::RateLimited, RATE_LIMITED_MESSAGE);
        }

        let Some(slot) = self.admission.try_acquire(caller) else {
            self.counters.admission_denied.fetch_add(1, Ordering::Relaxed);
            debug!("Rejected {request}: no admission slot");
            return ForwardOutcome::failed(FailureKind::AdmissionDenied, ADMISSION_DENIED_MESSAGE);
        };

        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        let outcome = self.executor.execute(endpoint, &request.link).await;
        debug!("Forwarded {request}: {outcome}");

        self.outcome_sink
            .record_outcome(caller, &request.link, &outcome)
            .await;
        self.outcome_sink
            .increment_stats(caller, outcome.is_success())
            .await;

        slot.release(outcome.is_success());
        outcome
    }

    /// Deliver `link` to the endpoint `caller` has configured.
    ///
    /// The configuration is read from the config store on every call. A
    /// caller without one gets a [`FailureKind::NotConfigured`] outcome
    /// without counting against the rate limit.
    pub async fn forward(&self, caller: CallerId, link: impl Into<String>) -> ForwardOutcome {
        let Some(endpoint) = self.config_store.endpoint_config(caller).await else {
            return ForwardOutcome::failed(FailureKind::NotConfigured, NOT_CONFIGURED_MESSAGE);
        };
        self.submit(&ForwardRequest::new(caller, link), &endpoint)
            .await
    }

    /// Run a connectivity test against the endpoint `caller` has configured.
    ///
    /// Returns `None` if the caller has no endpoint.
    pub async fn test_connection(&self, caller: CallerId) -> Option<ProbeReport> {
        let endpoint = self.config_store.endpoint_config(caller).await?;
        Some(self.probe(&endpoint).await)
    }

    /// Run a connectivity test against `endpoint`
    pub async fn probe(&self, endpoint: &EndpointConfig) -> ProbeReport {
        self.prober.probe(endpoint).await
    }

    /// Rejection and delivery counters
    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        self.counters.snapshot()
    }

    /// Counters of the admission controller
    #[must_use]
    pub fn admission_stats(&self) -> AdmissionStats {
        self.admission.stats()
    }

    /// The per-caller rate limiter
    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The admission controller
    #[must_use]
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// The pooled HTTP client
    #[must_use]
    pub fn pool(&self) -> &Arc<HttpPool> {
        &self.pool
    }

    /// Stop the rate limit sweep and close pooled connections.
    ///
    /// Submissions after a shutdown still work: the pool is rebuilt on
    /// demand, only idle windows are no longer swept.
    pub async fn shutdown(&self) {
        let sweep = self
            .sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweep) = sweep {
            sweep.stop().await;
        }
        self.pool.shutdown();
        debug!("Gateway shut down: {}", self.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AdmissionConfig, RateLimitConfig};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LINK: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    async fn accepting_server() -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": true, "message": "queued"})),
            )
            .mount(&mock_server)
            .await;
        mock_server
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_excess() {
        let mock_server = accepting_server().await;
        let endpoint = EndpointConfig::new(&mock_server.uri(), None).unwrap();
        let gateway = GatewayBuilder::builder()
            .config(GatewayConfig {
                rate_limit: RateLimitConfig {
                    max_requests: 2,
                    ..RateLimitConfig::default()
                },
                ..GatewayConfig::default()
            })
            .build()
            .gateway();

        let request = ForwardRequest::new(1, LINK);
        assert!(gateway.submit(&request, &endpoint).await.is_success());
        assert!(gateway.submit(&request, &endpoint).await.is_success());

        let outcome = gateway.submit(&request, &endpoint).await;
        assert_eq!(outcome.failure(), Some(FailureKind::RateLimited));
        assert_eq!(
            gateway.stats(),
            GatewayStats {
                overloaded: 0,
                rate_limited: 1,
                admission_denied: 0,
                forwarded: 2,
            }
        );
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_forward_without_config() {
        let gateway = GatewayBuilder::default().gateway();

        let outcome = gateway.forward(7, LINK).await;

        assert_eq!(outcome.failure(), Some(FailureKind::NotConfigured));
        assert_eq!(gateway.rate_limiter().tracked_keys(), 0);
        assert!(gateway.test_connection(7).await.is_none());
    }

    #[tokio::test]
    async fn test_admission_denied_while_busy() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": true}))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&mock_server)
            .await;
        let endpoint = EndpointConfig::new(&mock_server.uri(), None).unwrap();
        let gateway = GatewayBuilder::builder()
            .config(GatewayConfig {
                admission: AdmissionConfig {
                    max_per_caller: 1,
                    ..AdmissionConfig::default()
                },
                ..GatewayConfig::default()
            })
            .build()
            .gateway();

        let request = ForwardRequest::new(1, LINK);
        let (first, second) = tokio::join!(gateway.submit(&request, &endpoint), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            gateway.submit(&request, &endpoint).await
        });

        assert!(first.is_success());
        assert_eq!(second.failure(), Some(FailureKind::AdmissionDenied));
        assert_eq!(gateway.admission().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_overloaded_gateway() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": true}))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&mock_server)
            .await;
        let endpoint = EndpointConfig::new(&mock_server.uri(), None).unwrap();
        let gateway = GatewayBuilder::builder()
            .config(GatewayConfig {
                admission: AdmissionConfig {
                    max_in_flight: 1,
                    max_per_caller: 1,
                    overload_percent: 50,
                },
                ..GatewayConfig::default()
            })
            .build()
            .gateway();

        let first_request = ForwardRequest::new(1, LINK);
        let second_request = ForwardRequest::new(2, LINK);
        let (first, second) = tokio::join!(gateway.submit(&first_request, &endpoint), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            gateway.submit(&second_request, &endpoint).await
        });

        assert!(first.is_success());
        assert_eq!(second.failure(), Some(FailureKind::Overloaded));
        assert_eq!(gateway.stats().overloaded, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweep_and_pool() {
        let mock_server = accepting_server().await;
        let endpoint = EndpointConfig::new(&mock_server.uri(), None).unwrap();
        let gateway = GatewayBuilder::default().gateway();

        assert!(
            gateway
                .submit(&ForwardRequest::new(1, LINK), &endpoint)
                .await
                .is_success()
        );
        assert!(gateway.pool().is_active());

        gateway.shutdown().await;
        assert!(!gateway.pool().is_active());

        // The pool comes back on demand
        assert!(
            gateway
                .submit(&ForwardRequest::new(1, LINK), &endpoint)
                .await
                .is_success()
        );
    }
}
