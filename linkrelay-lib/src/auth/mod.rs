//! Delivery of a link to the downstream service.
//!
//! [`AuthRetryExecutor`] runs one submission: it posts the link, logs in
//! once if the service asks for it, retries once after a transient network
//! failure and turns whatever happened into a [`ForwardOutcome`].
//!
//! A submission moves through these states:
//!
//! ```text
//! Sending -> Success | NeedsAuth | TransientError | PermanentError
//! NeedsAuth -> LoggingIn -> Sending | PermanentError
//! TransientError -> Sending (once) | PermanentError
//! ```

mod login_page;
mod session;

use log::{debug, info, warn};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::client::{HttpPool, Outbound, Payload, Reply};
use crate::retry::RetryExt;
use crate::{EndpointConfig, ErrorKind, FailureKind, ForwardOutcome};
use login_page::looks_like_login_page;
pub(crate) use session::Session;

/// Default number of redirects followed per request, 5.
pub const DEFAULT_MAX_REDIRECTS: usize = 5;
/// Default wait before repeating a request after a transient failure, 1 second.
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(1);
/// Default number of body characters included in log messages, 200.
pub const DEFAULT_BODY_PREVIEW: usize = 200;

/// How many times a submission is repeated after a transient failure
const MAX_TRANSIENT_RETRIES: u8 = 1;

/// Name of the JSON field carrying the link
const LINK_FIELD: &str = "youtube_url";

/// Name of the form field carrying the credential
const PASSWORD_FIELD: &str = "password";

/// Phrases in a login reply that mean the login worked
const LOGIN_SUCCESS_MARKERS: &[&str] = &["登录成功", "login successful"];

/// Reported when the service accepts a link without saying anything
const DEFAULT_SUCCESS_MESSAGE: &str = "task added";

/// Reported when the service declines a link without saying why
const DEFAULT_FAILURE_MESSAGE: &str = "unknown error";

/// Behavior of a single submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardConfig {
    /// Maximum number of redirects followed per request
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Wait before repeating a request after a transient failure
    #[serde(default = "default_retry_wait", with = "humantime_serde")]
    pub retry_wait: Duration,

    /// Number of body characters included in log messages
    #[serde(default = "default_body_preview")]
    pub body_preview: usize,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            max_redirects: default_max_redirects(),
            retry_wait: default_retry_wait(),
            body_preview: default_body_preview(),
        }
    }
}

const fn default_max_redirects() -> usize {
    DEFAULT_MAX_REDIRECTS
}

const fn default_retry_wait() -> Duration {
    DEFAULT_RETRY_WAIT
}

const fn default_body_preview() -> usize {
    DEFAULT_BODY_PREVIEW
}

/// The JSON answer of the downstream service
#[derive(Debug, Deserialize)]
struct DownstreamReply {
    #[serde(default)]
    success: bool,
    message: Option<String>,
}

/// What a reply to the forward request means
#[derive(Debug)]
enum Verdict {
    NeedsAuth,
    Done(ForwardOutcome),
}

/// Runs submissions against the downstream service.
#[derive(Debug, Clone)]
pub struct AuthRetryExecutor {
    pool: Arc<HttpPool>,
    config: ForwardConfig,
}

impl AuthRetryExecutor {
    /// Create a new executor sending through `pool`
    #[must_use]
    pub const fn new(pool: Arc<HttpPool>, config: ForwardConfig) -> Self {
        Self { pool, config }
    }

    /// Deliver `link` to the service described by `endpoint`.
    ///
    /// Never fails: every problem is reported through the outcome. At most
    /// one login and at most one transient retry happen per call.
    pub async fn execute(&self, endpoint: &EndpointConfig, link: &str) -> ForwardOutcome {
        let session = Session::new(&self.pool, self.config.max_redirects);
        let mut login_attempted = false;
        let mut transient_retries = MAX_TRANSIENT_RETRIES;

        loop {
            let request = Outbound::post(
                endpoint.forward_url().clone(),
                Payload::Json(json!({ LINK_FIELD: link })),
            );

            let reply = match session.send(request).await {
                Ok(reply) => reply,
                Err(e) if e.should_retry() && transient_retries > 0 => {
                    transient_retries -= 1;
                    debug!(
                        "Transient error forwarding to {}, retrying in {:?}: {}",
                        endpoint.forward_url(),
                        self.config.retry_wait,
                        e.user_message()
                    );
                    tokio::time::sleep(self.config.retry_wait).await;
                    continue;
                }
                Err(e) => return self.network_failure(endpoint, &e, login_attempted),
            };

            let status = reply.status;
            match self.interpret(&reply) {
                Verdict::Done(outcome) => return outcome.with_retried_after_login(login_attempted),
                Verdict::NeedsAuth => {}
            }

            let Some(credential) = endpoint.credential() else {
                return ForwardOutcome::failed(
                    FailureKind::AuthenticationRequired,
                    "The service requires a login, but no password is configured",
                )
                .with_status(status);
            };

            if login_attempted {
                warn!(
                    "Still not authorized at {} after logging in",
                    endpoint.forward_url()
                );
                return ForwardOutcome::failed(
                    FailureKind::AuthenticationRequired,
                    "The service still requires a login after logging in, check the password or log in on the web interface",
                )
                .with_status(status)
                .with_retried_after_login(true);
            }

            login_attempted = true;
            let logged_in = log_in(
                &session,
                &endpoint.login_url(),
                credential,
                self.config.body_preview,
            )
            .await;
            if !logged_in {
                return ForwardOutcome::failed(
                    FailureKind::AuthenticationRequired,
                    "The service requires a login and logging in failed, check the password",
                )
                .with_status(status);
            }
        }
    }

    /// Decide what a reply to the forward request means
    fn interpret(&self, reply: &Reply) -> Verdict {
        let status = reply.status;

        if status == StatusCode::UNAUTHORIZED {
            return Verdict::NeedsAuth;
        }

        if !status.is_success() {
            return Verdict::Done(
                ForwardOutcome::failed(
                    FailureKind::UpstreamRejected,
                    format!("The service rejected the request with status {status}"),
                )
                .with_status(status),
            );
        }

        if looks_like_login_page(reply.content_type(), &reply.text) {
            debug!("{} answered with a login page", reply.url);
            return Verdict::NeedsAuth;
        }

        match serde_json::from_str::<DownstreamReply>(&reply.text) {
            Ok(DownstreamReply {
                success: true,
                message,
            }) => Verdict::Done(ForwardOutcome::success(
                message.unwrap_or_else(|| DEFAULT_SUCCESS_MESSAGE.to_string()),
                status,
                false,
            )),
            Ok(DownstreamReply {
                success: false,
                message,
            }) => Verdict::Done(
                ForwardOutcome::failed(
                    FailureKind::Declined,
                    message.unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
                )
                .with_status(status),
            ),
            Err(e) => {
                warn!(
                    "Malformed reply from {} ({e}): {}",
                    reply.url,
                    preview(&reply.text, self.config.body_preview)
                );
                Verdict::Done(
                    ForwardOutcome::failed(
                        FailureKind::MalformedUpstreamResponse,
                        "The service answered with something that is not a valid reply",
                    )
                    .with_status(status),
                )
            }
        }
    }

    fn network_failure(
        &self,
        endpoint: &EndpointConfig,
        error: &ErrorKind,
        retried_after_login: bool,
    ) -> ForwardOutcome {
        warn!(
            "Forwarding to {} failed: {}",
            endpoint.forward_url(),
            error.user_message()
        );

        let kind = if error.reqwest_error().is_some() {
            FailureKind::TransientNetworkError(error.network_kind())
        } else {
            FailureKind::Unknown
        };
        ForwardOutcome::failed(kind, error.user_message())
            .with_retried_after_login(retried_after_login)
    }

    /// The configuration of this executor
    #[must_use]
    pub const fn config(&self) -> &ForwardConfig {
        &self.config
    }
}

/// Post `credential` to `login_url` within `session`.
///
/// Returns whether the login worked. Cookies the service sets stay in the
/// session for the following requests.
pub(crate) async fn log_in(
    session: &Session<'_>,
    login_url: &Url,
    credential: &SecretString,
    body_preview: usize,
) -> bool {
    let request = Outbound::post(
        login_url.clone(),
        Payload::Form(vec![(
            PASSWORD_FIELD,
            credential.expose_secret().to_string(),
        )]),
    );

    let reply = match session.send(request).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Login at {login_url} failed: {}", e.user_message());
            return false;
        }
    };

    if login_succeeded(&reply) {
        info!("Logged in at {login_url}");
        true
    } else {
        warn!(
            "Login at {login_url} failed with status {}: {}",
            reply.status,
            preview(&reply.text, body_preview)
        );
        false
    }
}

/// A login worked if the reply says so or ended on a directory-like page
fn login_succeeded(reply: &Reply) -> bool {
    if !reply.status.is_success() {
        return false;
    }
    let text = reply.text.to_lowercase();
    LOGIN_SUCCESS_MARKERS
        .iter()
        .any(|marker| text.contains(marker))
        || reply.url.path().ends_with('/')
}

/// The first `limit` characters of `text`
fn preview(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
