//! The pooled HTTP client shared by all outbound calls.
//!
//! [`HttpPool`] owns one `reqwest` client and the semaphores bounding how
//! many requests may be on the wire at once, in total and per destination.
//! The client is built lazily on first use and can be shut down; the next
//! use after a shutdown builds a fresh one.
//!
//! The pooled client follows no redirects and stores no cookies. Both are
//! handled per submission by [`crate::auth`], so sessions of different
//! callers never mix.
#![allow(clippy::module_name_repetitions)]

mod dns;

use dashmap::DashMap;
use http::header::{self, HeaderMap, HeaderValue};
use log::debug;
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};
use url::Url;

use crate::{ErrorKind, Result};
use dns::CachingResolver;

/// Default number of requests on the wire at once, 20.
pub const DEFAULT_MAX_CONNECTIONS: usize = 20;
/// Default number of requests on the wire to one host at once, 10.
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 10;
/// Default time a DNS answer is reused, 300 seconds.
pub const DEFAULT_DNS_TTL: Duration = Duration::from_secs(300);
/// Default timeout for a whole request, 30 seconds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default timeout for establishing a connection, 10 seconds.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default user agent, `linkrelay/<PKG_VERSION>`.
pub const DEFAULT_USER_AGENT: &str = concat!("linkrelay/", env!("CARGO_PKG_VERSION"));

/// TCP keepalive
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Limits and timeouts of the pooled client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum number of requests on the wire across all hosts
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of requests on the wire to a single host
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,

    /// How long a DNS answer is reused
    #[serde(default = "default_dns_ttl", with = "humantime_serde")]
    pub dns_ttl: Duration,

    /// Timeout for a whole request, body included
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Timeout for establishing a connection
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Value of the `User-Agent` header
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_connections_per_host: default_max_connections_per_host(),
            dns_ttl: default_dns_ttl(),
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

const fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

const fn default_max_connections_per_host() -> usize {
    DEFAULT_MAX_CONNECTIONS_PER_HOST
}

const fn default_dns_ttl() -> Duration {
    DEFAULT_DNS_TTL
}

const fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

const fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

/// Whether server certificates are validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlsMode {
    /// Normal certificate validation
    Verify,
    /// Accept any certificate. Diagnostics only, never used for forwarding.
    AcceptInvalid,
}

/// The body of an outbound request
#[derive(Clone)]
pub(crate) enum Payload {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(&'static str, String)>),
}

// Form values carry the credential.
impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Form(fields) => f
                .debug_list()
                .entries(fields.iter().map(|(name, _)| format!("{name}=[REDACTED]")))
                .finish(),
        }
    }
}

/// A single request to send through the pool
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) payload: Payload,
    pub(crate) cookie: Option<HeaderValue>,
    /// Overrides the pool's request timeout
    pub(crate) timeout: Option<Duration>,
}

impl Outbound {
    pub(crate) const fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            payload: Payload::Empty,
            cookie: None,
            timeout: None,
        }
    }

    pub(crate) fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub(crate) fn post(url: Url, payload: Payload) -> Self {
        Self {
            payload,
            ..Self::new(Method::POST, url)
        }
    }

    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fully read response.
///
/// Connection permits are held until the body has been read, so a `Reply`
/// no longer ties up a connection.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub(crate) status: StatusCode,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) text: String,
}

impl Reply {
    async fn from_response(response: Response) -> Result<Self> {
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let text = response.text().await.map_err(ErrorKind::ReadResponseBody)?;

        Ok(Self {
            status,
            url,
            headers,
            text,
        })
    }

    /// The `Content-Type` header, if present and readable
    pub(crate) fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

#[derive(Debug)]
struct Inner {
    client: reqwest::Client,
    insecure: OnceCell<reqwest::Client>,
    resolver: Arc<CachingResolver>,
    global: Semaphore,
    per_host: DashMap<String, Arc<Semaphore>>,
}

impl Inner {
    fn lease_host(&self, key: String, permits: usize) -> HostLease<'_> {
        let semaphore = self
            .per_host
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(permits)))
            .clone();
        HostLease {
            inner: self,
            key,
            semaphore,
        }
    }

    fn close(&self) {
        self.global.close();
        for entry in &self.per_host {
            entry.value().close();
        }
    }
}

/// Use of one host's semaphore.
///
/// The last lease of a host removes its semaphore from the map, so the map
/// only holds hosts with requests in flight.
struct HostLease<'a> {
    inner: &'a Inner,
    key: String,
    semaphore: Arc<Semaphore>,
}

impl Drop for HostLease<'_> {
    fn drop(&mut self) {
        // One reference is ours, the other one the map's.
        self.inner.per_host.remove_if(&self.key, |_, semaphore| {
            Arc::ptr_eq(semaphore, &self.semaphore) && Arc::strong_count(semaphore) == 2
        });
    }
}

/// The process-wide HTTP client.
///
/// Cloning is not supported; share the pool behind an [`Arc`].
#[derive(Debug)]
pub struct HttpPool {
    config: PoolConfig,
    slot: Mutex<Option<Arc<Inner>>>,
}

impl HttpPool {
    /// Create a new pool. No client is built until the first request.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            slot: Mutex::new(None),
        }
    }

    /// The configuration of this pool
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether a client is currently built
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Close all pooled connections.
    ///
    /// Requests still waiting for a connection fail with
    /// [`ErrorKind::PoolShutDown`]; requests already on the wire complete.
    /// The next request builds a new client.
    pub fn shutdown(&self) {
        if let Some(inner) = self.lock().take() {
            inner.close();
            debug!("HTTP connection pool shut down");
        }
    }

    /// Number of hosts with a connection semaphore
    #[cfg(test)]
    fn tracked_hosts(&self) -> usize {
        self.lock()
            .as_ref()
            .map_or(0, |inner| inner.per_host.len())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Inner>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the current client, building it if needed
    fn inner(&self) -> Result<Arc<Inner>> {
        let mut slot = self.lock();
        if let Some(inner) = slot.as_ref() {
            return Ok(Arc::clone(inner));
        }

        let resolver = Arc::new(CachingResolver::new(self.config.dns_ttl));
        let inner = Arc::new(Inner {
            client: self.build_client(&resolver, TlsMode::Verify)?,
            insecure: OnceCell::new(),
            resolver,
            global: Semaphore::new(self.config.max_connections),
            per_host: DashMap::new(),
        });
        debug!(
            "Built HTTP client ({} connections, {} per host)",
            self.config.max_connections, self.config.max_connections_per_host
        );

        *slot = Some(Arc::clone(&inner));
        Ok(inner)
    }

    fn build_client(&self, resolver: &Arc<CachingResolver>, tls: TlsMode) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(&self.config.user_agent)?,
        );

        reqwest::ClientBuilder::new()
            .gzip(true)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(tls == TlsMode::AcceptInvalid)
            .timeout(self.config.timeout)
            .connect_timeout(self.config.connect_timeout)
            .tcp_keepalive(TCP_KEEPALIVE)
            .pool_max_idle_per_host(self.config.max_connections_per_host)
            .dns_resolver(Arc::clone(resolver))
            .build()
            .map_err(ErrorKind::BuildRequestClient)
    }

    /// Send a request and read its response.
    ///
    /// Waits for a free connection permit, globally and for the
    /// destination. Redirects are returned as they are.
    pub(crate) async fn fetch(&self, request: Outbound, tls: TlsMode) -> Result<Reply> {
        let inner = self.inner()?;
        let host = inner.lease_host(
            host_key(&request.url)?,
            self.config.max_connections_per_host,
        );

        let _global = inner
            .global
            .acquire()
            .await
            .map_err(|_| ErrorKind::PoolShutDown)?;
        let _per_host = host
            .semaphore
            .acquire()
            .await
            .map_err(|_| ErrorKind::PoolShutDown)?;

        let client = match tls {
            TlsMode::Verify => &inner.client,
            TlsMode::AcceptInvalid => {
                inner
                    .insecure
                    .get_or_try_init(|| async {
                        self.build_client(&inner.resolver, TlsMode::AcceptInvalid)
                    })
                    .await?
            }
        };

        let Outbound {
            method,
            url,
            payload,
            cookie,
            timeout,
        } = request;

        let mut builder = client.request(method, url);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder = match payload {
            Payload::Empty => builder,
            Payload::Json(value) => builder.json(&value),
            Payload::Form(fields) => builder.form(&fields),
        };

        let response = builder.send().await.map_err(ErrorKind::NetworkRequest)?;
        Reply::from_response(response).await
    }
}

impl Default for HttpPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// The `host:port` a request connects to
fn host_key(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| ErrorKind::MissingHost(url.to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ErrorKind::UnsupportedScheme(url.to_string()))?;
    Ok(format!("{host}:{port}"))
}
