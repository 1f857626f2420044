//! Connectivity diagnosis for a configured endpoint.
//!
//! The prober walks a ladder of increasingly lenient requests and stops at
//! the first one that gets an HTTP answer:
//!
//! 1. `GET` the login page
//! 2. on a TLS error, the same without certificate validation
//! 3. on a connection error with `https`, the same over plain `http`
//! 4. `GET` the forward path itself
//!
//! Nothing here is used for forwarding. The lenient settings of the ladder
//! never leak into [`crate::AuthRetryExecutor`].

use log::debug;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::auth::{DEFAULT_BODY_PREVIEW, DEFAULT_MAX_REDIRECTS, Session, log_in};
use crate::client::{HttpPool, Outbound, Reply, TlsMode};
use crate::{
    EndpointConfig, ErrorKind, LoginCheck, NetworkErrorKind, ProbeClassification, ProbeReport,
    ProbeResult, ProbeStep, ProbeStepKind, Result,
};

/// Default timeout of each ladder step, 10 seconds.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings of the connectivity prober
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    /// Timeout of each ladder step, independent of forwarding timeouts
    #[serde(default = "default_step_timeout", with = "humantime_serde")]
    pub step_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            step_timeout: default_step_timeout(),
        }
    }
}

const fn default_step_timeout() -> Duration {
    DEFAULT_STEP_TIMEOUT
}

/// Runs connectivity tests.
#[derive(Debug, Clone)]
pub struct ConnectivityProber {
    pool: Arc<HttpPool>,
    config: ProbeConfig,
    max_redirects: usize,
    body_preview: usize,
}

/// Statuses on the forward path that show a service is listening there
const FORWARD_PATH_ANSWERS: &[StatusCode] = &[
    StatusCode::OK,
    StatusCode::BAD_REQUEST,
    StatusCode::UNAUTHORIZED,
    StatusCode::FORBIDDEN,
    StatusCode::NOT_FOUND,
    StatusCode::METHOD_NOT_ALLOWED,
];

impl ConnectivityProber {
    /// Create a new prober sending through `pool`
    #[must_use]
    pub const fn new(pool: Arc<HttpPool>, config: ProbeConfig) -> Self {
        Self {
            pool,
            config,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            body_preview: DEFAULT_BODY_PREVIEW,
        }
    }

    /// Follow at most `max_redirects` redirects per step
    #[must_use]
    pub const fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Include at most `body_preview` characters of replies in log messages
    #[must_use]
    pub const fn with_body_preview(mut self, body_preview: usize) -> Self {
        self.body_preview = body_preview;
        self
    }

    /// Diagnose whether `endpoint` can be reached.
    ///
    /// If the login page answers with `200` and a credential is configured,
    /// a login is attempted and its result included in the report. The
    /// login always goes to the configured URL with certificate validation.
    pub async fn probe(&self, endpoint: &EndpointConfig) -> ProbeReport {
        let mut steps = Vec::new();
        let login_url = endpoint.login_url();

        let mut insecure_tls_used = false;
        let mut downgraded_to_http = false;

        let mut attempt = self
            .step(ProbeStepKind::LoginPage, &login_url, TlsMode::Verify, &mut steps)
            .await;

        if matches!(&attempt, Err(e) if e.network_kind() == NetworkErrorKind::Tls) {
            attempt = self
                .step(
                    ProbeStepKind::LoginPageInsecure,
                    &login_url,
                    TlsMode::AcceptInvalid,
                    &mut steps,
                )
                .await;
            insecure_tls_used = attempt.is_ok();
        }

        if login_url.scheme() == "https" && matches!(&attempt, Err(e) if is_connection_error(e)) {
            if let Some(http_url) = downgrade(&login_url) {
                attempt = self
                    .step(ProbeStepKind::LoginPageHttp, &http_url, TlsMode::Verify, &mut steps)
                    .await;
                downgraded_to_http = attempt.is_ok();
            }
        }

        let lenient = insecure_tls_used || downgraded_to_http;
        let (result, login) = match attempt {
            Ok(reply) => self.grade_login_page(&reply, endpoint, lenient).await,
            Err(login_error) => {
                let fallback = self
                    .step(
                        ProbeStepKind::ForwardPath,
                        endpoint.forward_url(),
                        TlsMode::Verify,
                        &mut steps,
                    )
                    .await;
                match fallback {
                    // The service is there, only the login path is not
                    Ok(reply) if FORWARD_PATH_ANSWERS.contains(&reply.status) => (
                        ProbeResult::reachable(
                            reply.status.as_u16(),
                            ProbeClassification::ReachableWrongPath,
                        ),
                        None,
                    ),
                    _ => (ProbeResult::unreachable(grade_error(&login_error)), None),
                }
            }
        };

        let report = ProbeReport {
            result,
            login,
            steps,
            insecure_tls_used,
            downgraded_to_http,
        };
        debug!("Probe of {}: {report}", endpoint.forward_url());
        report
    }

    /// Grade the answer of the login page.
    ///
    /// The credential is only ever sent to the configured login URL with
    /// certificate validation. If the page answered only over a lenient
    /// channel, no login is attempted.
    async fn grade_login_page(
        &self,
        reply: &Reply,
        endpoint: &EndpointConfig,
        lenient: bool,
    ) -> (ProbeResult, Option<LoginCheck>) {
        let status = reply.status;
        match status {
            StatusCode::OK => {
                let login = match endpoint.credential() {
                    Some(_) if lenient => {
                        debug!(
                            "Not logging in at {}: only reachable over an insecure channel",
                            endpoint.login_url()
                        );
                        Some(LoginCheck::Skipped)
                    }
                    Some(credential) => {
                        let session = Session::new(&self.pool, self.max_redirects);
                        let succeeded = log_in(
                            &session,
                            &endpoint.login_url(),
                            credential,
                            self.body_preview,
                        )
                        .await;
                        Some(if succeeded {
                            LoginCheck::Succeeded
                        } else {
                            LoginCheck::Failed
                        })
                    }
                    None => None,
                };
                (
                    ProbeResult::reachable(status.as_u16(), ProbeClassification::Ok),
                    login,
                )
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => (
                ProbeResult::reachable(status.as_u16(), ProbeClassification::NeedsAuth),
                None,
            ),
            _ => (
                ProbeResult::reachable(status.as_u16(), ProbeClassification::ReachableWrongPath),
                None,
            ),
        }
    }

    /// Run one rung of the ladder and record it
    async fn step(
        &self,
        kind: ProbeStepKind,
        url: &Url,
        tls: TlsMode,
        steps: &mut Vec<ProbeStep>,
    ) -> Result<Reply> {
        let session = Session::new(&self.pool, self.max_redirects).with_tls(tls);
        let request = Outbound::get(url.clone()).with_timeout(self.config.step_timeout);
        let result = session.send(request).await;

        match &result {
            Ok(reply) => debug!("Probe step '{kind}' {url}: {}", reply.status),
            Err(e) => debug!("Probe step '{kind}' {url} failed: {}", e.user_message()),
        }
        steps.push(ProbeStep {
            kind,
            url: url.clone(),
            status_code: result.as_ref().ok().map(|reply| reply.status.as_u16()),
            error: result.as_ref().err().map(ErrorKind::user_message),
        });
        result
    }

    /// The configuration of this prober
    #[must_use]
    pub const fn config(&self) -> &ProbeConfig {
        &self.config
    }
}

/// Whether the error happened before any HTTP exchange
fn is_connection_error(error: &ErrorKind) -> bool {
    error.reqwest_error().is_some_and(reqwest::Error::is_connect)
        || matches!(
            error.network_kind(),
            NetworkErrorKind::ConnectionRefused | NetworkErrorKind::Connect | NetworkErrorKind::Tls
        )
}

/// Classify a probe that got no answer at all
fn grade_error(error: &ErrorKind) -> ProbeClassification {
    match error.network_kind() {
        NetworkErrorKind::Timeout => ProbeClassification::Timeout,
        NetworkErrorKind::Tls => ProbeClassification::TlsError,
        _ => ProbeClassification::Unreachable,
    }
}

/// The same URL over plain `http`, keeping host and explicit port
fn downgrade(url: &Url) -> Option<Url> {
    let mut http_url = url.clone();
    http_url.set_scheme("http").ok()?;
    Some(http_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PoolConfig;
    use pretty_assertions::assert_eq;
    use secrecy::SecretString;
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prober() -> ConnectivityProber {
        ConnectivityProber::new(
            Arc::new(HttpPool::default()),
            ProbeConfig {
                step_timeout: Duration::from_secs(2),
            },
        )
    }

    fn endpoint(server: &MockServer, password: Option<&str>) -> EndpointConfig {
        EndpointConfig::new(&server.uri(), password.map(SecretString::from)).unwrap()
    }

    async fn login_page(server: &MockServer, status: u16) {
        Mock::given(method("GET"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(status))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_login_page_ok() {
        let mock_server = MockServer::start().await;
        login_page(&mock_server, 200).await;

        let report = prober().probe(&endpoint(&mock_server, None)).await;

        assert_eq!(
            report.result,
            ProbeResult::reachable(200, ProbeClassification::Ok)
        );
        assert_eq!(report.login, None);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.message(), "Connection ok");
    }

    #[tokio::test]
    async fn test_login_during_probe() {
        let mock_server = MockServer::start().await;
        login_page(&mock_server, 200).await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("登录成功"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let report = prober()
            .probe(&endpoint(&mock_server, Some("hunter2")))
            .await;

        assert_eq!(report.result.classification, ProbeClassification::Ok);
        assert_eq!(report.login, Some(LoginCheck::Succeeded));
    }

    #[tokio::test]
    async fn test_failed_login_during_probe() {
        let mock_server = MockServer::start().await;
        login_page(&mock_server, 200).await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock_server)
            .await;

        let report = prober().probe(&endpoint(&mock_server, Some("nope"))).await;

        assert_eq!(report.login, Some(LoginCheck::Failed));
        assert_eq!(
            report.message(),
            "Connection ok, but login failed, check the password"
        );
    }

    #[tokio::test]
    async fn test_needs_auth() {
        let mock_server = MockServer::start().await;
        login_page(&mock_server, 403).await;

        let report = prober().probe(&endpoint(&mock_server, None)).await;

        assert_eq!(
            report.result,
            ProbeResult::reachable(403, ProbeClassification::NeedsAuth)
        );
    }

    #[tokio::test]
    async fn test_wrong_path() {
        let mock_server = MockServer::start().await;
        login_page(&mock_server, 404).await;

        let report = prober().probe(&endpoint(&mock_server, None)).await;

        assert_eq!(
            report.result,
            ProbeResult::reachable(404, ProbeClassification::ReachableWrongPath)
        );
        assert_eq!(report.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_forward_path_fallback() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/login"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/add_via_extension"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&mock_server)
            .await;

        let report = prober().probe(&endpoint(&mock_server, None)).await;

        assert_eq!(
            report.result,
            ProbeResult::reachable(405, ProbeClassification::ReachableWrongPath)
        );
        let kinds: Vec<_> = report.steps.iter().map(|step| step.kind).collect();
        assert_eq!(
            kinds,
            vec![ProbeStepKind::LoginPage, ProbeStepKind::ForwardPath]
        );
        assert!(report.message().contains("the login page is not"));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let endpoint = EndpointConfig::new("http://127.0.0.1:1", None).unwrap();
        let start = Instant::now();

        let report = prober().probe(&endpoint).await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(
            report.result,
            ProbeResult::unreachable(ProbeClassification::Unreachable)
        );
        assert!(!report.result.reachable);
        assert_eq!(report.steps.len(), 2);
        assert!(report.steps.iter().all(|step| step.error.is_some()));
    }

    #[tokio::test]
    async fn test_https_unreachable_tries_http() {
        let endpoint = EndpointConfig::new("https://127.0.0.1:1", None).unwrap();

        let report = prober().probe(&endpoint).await;

        assert_eq!(
            report.result.classification,
            ProbeClassification::Unreachable
        );
        assert!(
            report
                .steps
                .iter()
                .any(|step| step.kind == ProbeStepKind::LoginPageHttp
                    && step.url.as_str() == "http://127.0.0.1:1/login")
        );
        assert!(!report.downgraded_to_http);
    }

    #[tokio::test]
    async fn test_plain_http_server_behind_https_address() {
        let mock_server = MockServer::start().await;
        login_page(&mock_server, 200).await;
        let address = mock_server.uri().replace("http://", "https://");
        let endpoint = EndpointConfig::new(&address, None).unwrap();

        let report = prober().probe(&endpoint).await;

        assert_eq!(report.result.classification, ProbeClassification::Ok);
        assert!(report.downgraded_to_http);
        assert_eq!(
            report.steps.last().map(|step| step.kind),
            Some(ProbeStepKind::LoginPageHttp)
        );
    }

    #[tokio::test]
    async fn test_no_login_over_downgraded_channel() {
        let mock_server = MockServer::start().await;
        login_page(&mock_server, 200).await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("登录成功"))
            .expect(0)
            .mount(&mock_server)
            .await;
        let address = mock_server.uri().replace("http://", "https://");
        let endpoint =
            EndpointConfig::new(&address, Some(SecretString::from("hunter2"))).unwrap();

        let report = prober().probe(&endpoint).await;

        assert!(report.downgraded_to_http);
        assert_eq!(report.login, Some(LoginCheck::Skipped));
        let requests = mock_server.received_requests().await.unwrap();
        assert!(requests.iter().all(|request| request.method.as_str() == "GET"));
        assert!(
            report
                .message()
                .starts_with("Connection ok, login not attempted")
        );
    }

    #[tokio::test]
    async fn test_step_timeout_bounds_each_step() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&mock_server)
            .await;
        let pool = HttpPool::new(PoolConfig {
            timeout: Duration::from_secs(60),
            ..PoolConfig::default()
        });
        let prober = ConnectivityProber::new(
            Arc::new(pool),
            ProbeConfig {
                step_timeout: Duration::from_millis(300),
            },
        );
        let start = Instant::now();

        let report = prober.probe(&endpoint(&mock_server, None)).await;

        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(
            report.result,
            ProbeResult::unreachable(ProbeClassification::Timeout)
        );
        let kinds: Vec<_> = report.steps.iter().map(|step| step.kind).collect();
        assert_eq!(
            kinds,
            vec![ProbeStepKind::LoginPage, ProbeStepKind::ForwardPath]
        );
    }

    #[tokio::test]
    async fn test_server_error_on_forward_path_is_not_reachable() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/login"))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/add_via_extension"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let report = prober().probe(&endpoint(&mock_server, None)).await;

        assert_eq!(
            report.result,
            ProbeResult::unreachable(ProbeClassification::Unreachable)
        );
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[1].status_code, Some(503));
    }

    #[test]
    fn test_downgrade_keeps_port() {
        let url = Url::parse("https://example.com:8443/login").unwrap();
        assert_eq!(
            downgrade(&url).unwrap().as_str(),
            "http://example.com:8443/login"
        );
    }
}
