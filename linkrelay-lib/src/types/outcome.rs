use std::fmt::Display;

use http::StatusCode;
use serde::Serialize;

/// What kind of low-level failure ended a network exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    /// The request or the connect phase timed out
    #[strum(serialize = "timeout")]
    Timeout,
    /// The remote host actively refused the connection
    #[strum(serialize = "connection refused")]
    ConnectionRefused,
    /// The TLS handshake or certificate validation failed
    #[strum(serialize = "TLS error")]
    Tls,
    /// Any other failure while establishing the connection (DNS, routing, ...)
    #[strum(serialize = "connection error")]
    Connect,
    /// Everything else
    #[strum(serialize = "network error")]
    Other,
}

/// Why a forward did not succeed.
///
/// The first three variants are throttling decisions taken before any
/// network traffic; the rest describe how the downstream exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "network")]
pub enum FailureKind {
    /// The caller exceeded its request budget for the current window
    RateLimited,
    /// The gateway is under high load and sheds new work
    Overloaded,
    /// No admission slot was available for the caller
    AdmissionDenied,
    /// The caller has no endpoint configured
    NotConfigured,
    /// The downstream asked for a login and none succeeded
    AuthenticationRequired,
    /// The downstream answered with a non-2xx, non-401 status
    UpstreamRejected,
    /// The downstream answered 2xx but the body is not the expected JSON
    MalformedUpstreamResponse,
    /// The downstream answered with `{"success": false}`
    Declined,
    /// The exchange failed at the network level after the single retry
    TransientNetworkError(NetworkErrorKind),
    /// Anything that fits nowhere else
    Unknown,
}

impl FailureKind {
    /// Returns `true` for rejections made by the gateway itself, before
    /// contacting the downstream service.
    #[must_use]
    pub const fn is_throttled(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Overloaded | Self::AdmissionDenied
        )
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => f.write_str("rate limited"),
            Self::Overloaded => f.write_str("overloaded"),
            Self::AdmissionDenied => f.write_str("admission denied"),
            Self::NotConfigured => f.write_str("not configured"),
            Self::AuthenticationRequired => f.write_str("authentication required"),
            Self::UpstreamRejected => f.write_str("rejected by downstream"),
            Self::MalformedUpstreamResponse => f.write_str("unexpected response format"),
            Self::Declined => f.write_str("declined by downstream"),
            Self::TransientNetworkError(kind) => write!(f, "network failure ({kind})"),
            Self::Unknown => f.write_str("unknown error"),
        }
    }
}

/// The terminal result of one forward submission.
///
/// Produced once and never modified afterwards; it is handed both to the
/// caller and to the outcome sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardOutcome {
    success: bool,
    message: String,
    http_status: Option<u16>,
    retried_after_login: bool,
    failure: Option<FailureKind>,
}

impl ForwardOutcome {
    /// A successful forward
    #[must_use]
    pub fn success(message: impl Into<String>, status: StatusCode, retried_after_login: bool) -> Self {
        Self {
            success: true,
            message: message.into(),
            http_status: Some(status.as_u16()),
            retried_after_login,
            failure: None,
        }
    }

    /// A failed forward
    #[must_use]
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            http_status: None,
            retried_after_login: false,
            failure: Some(kind),
        }
    }

    /// Attach the HTTP status the downstream answered with
    #[must_use]
    pub const fn with_status(mut self, status: StatusCode) -> Self {
        self.http_status = Some(status.as_u16());
        self
    }

    /// Mark that the outcome was produced by the request repeated after a login
    #[must_use]
    pub const fn with_retried_after_login(mut self, retried: bool) -> Self {
        self.retried_after_login = retried;
        self
    }

    /// Whether the downstream accepted the link
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.success
    }

    /// Human-readable description of the result
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP status of the last downstream response, if one was received
    #[must_use]
    pub const fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    /// Whether the forward was repeated after a login
    #[must_use]
    pub const fn retried_after_login(&self) -> bool {
        self.retried_after_login
    }

    /// Why the forward failed, `None` on success
    #[must_use]
    pub const fn failure(&self) -> Option<FailureKind> {
        self.failure
    }
}

impl Display for ForwardOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.failure, self.http_status) {
            (None, _) => write!(f, "forwarded: {}", self.message),
            (Some(kind), Some(code)) => write!(f, "{kind} [{code}]: {}", self.message),
            (Some(kind), None) => write!(f, "{kind}: {}", self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use pretty_assertions::assert_eq;

    use super::{FailureKind, ForwardOutcome, NetworkErrorKind};

    #[test]
    fn test_success_has_no_failure() {
        let outcome = ForwardOutcome::success("task added", StatusCode::OK, true);
        assert!(outcome.is_success());
        assert_eq!(outcome.failure(), None);
        assert_eq!(outcome.http_status(), Some(200));
        assert!(outcome.retried_after_login());
        assert_eq!(outcome.to_string(), "forwarded: task added");
    }

    #[test]
    fn test_failure_display() {
        let outcome = ForwardOutcome::failed(FailureKind::UpstreamRejected, "status 500")
            .with_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(outcome.to_string(), "rejected by downstream [500]: status 500");

        let outcome = ForwardOutcome::failed(
            FailureKind::TransientNetworkError(NetworkErrorKind::ConnectionRefused),
            "down",
        );
        assert_eq!(outcome.to_string(), "network failure (connection refused): down");
    }

    #[test]
    fn test_throttling_kinds() {
        assert!(FailureKind::RateLimited.is_throttled());
        assert!(FailureKind::Overloaded.is_throttled());
        assert!(FailureKind::AdmissionDenied.is_throttled());
        assert!(!FailureKind::AuthenticationRequired.is_throttled());
    }
}
