use std::fmt::Display;

use serde::Serialize;
use url::Url;

/// How a connectivity probe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum ProbeClassification {
    /// The login page answered with 200
    #[strum(serialize = "connection ok")]
    Ok,
    /// The service answered, but requires authentication (401/403)
    #[strum(serialize = "reachable, authentication required")]
    NeedsAuth,
    /// The service answered, but not as expected on the login path
    #[strum(serialize = "reachable, unexpected path or status")]
    ReachableWrongPath,
    /// No answer, for a reason other than timeout or TLS
    #[strum(serialize = "unreachable")]
    Unreachable,
    /// No answer within the step timeout
    #[strum(serialize = "timed out")]
    Timeout,
    /// TLS could not be negotiated
    #[strum(serialize = "TLS/certificate error")]
    TlsError,
}

/// The graded result of a connectivity probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProbeResult {
    /// Whether any probed URL answered with an HTTP response
    pub reachable: bool,
    /// Status code of the answer that decided the classification
    pub status_code: Option<u16>,
    /// The diagnosis
    pub classification: ProbeClassification,
}

impl ProbeResult {
    /// A probe that got an answer
    #[must_use]
    pub const fn reachable(status_code: u16, classification: ProbeClassification) -> Self {
        Self {
            reachable: true,
            status_code: Some(status_code),
            classification,
        }
    }

    /// A probe that got no answer at all
    #[must_use]
    pub const fn unreachable(classification: ProbeClassification) -> Self {
        Self {
            reachable: false,
            status_code: None,
            classification,
        }
    }
}

/// The rung of the probe ladder a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStepKind {
    /// GET the login page with certificate validation
    #[strum(serialize = "login page")]
    LoginPage,
    /// GET the login page without certificate validation
    #[strum(serialize = "login page, certificate checks disabled")]
    LoginPageInsecure,
    /// GET the login page over plain HTTP
    #[strum(serialize = "login page over http")]
    LoginPageHttp,
    /// GET the forward path directly
    #[strum(serialize = "forward path")]
    ForwardPath,
}

/// One executed step of the probe ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeStep {
    /// Which rung this was
    pub kind: ProbeStepKind,
    /// The URL that was requested
    pub url: Url,
    /// The status code, when the step got an answer
    pub status_code: Option<u16>,
    /// A description of the error, when the step got no answer
    pub error: Option<String>,
}

/// Result of logging in during a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginCheck {
    /// The credential was accepted
    Succeeded,
    /// The credential was not accepted, or the login request failed
    Failed,
    /// The credential was not sent, because the login page only answered
    /// without certificate validation or over plain `http`
    Skipped,
}

/// Full diagnosis produced by a connectivity test
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    /// The graded result
    pub result: ProbeResult,
    /// Login outcome, present only when a login was attempted
    pub login: Option<LoginCheck>,
    /// Every step that ran, in order
    pub steps: Vec<ProbeStep>,
    /// The answer was only obtained with certificate checks disabled
    pub insecure_tls_used: bool,
    /// The answer was only obtained after switching from https to http
    pub downgraded_to_http: bool,
}

impl ProbeReport {
    /// A user-facing summary of the diagnosis
    #[must_use]
    pub fn message(&self) -> String {
        let mut message = match (self.result.classification, self.login) {
            (ProbeClassification::Ok, Some(LoginCheck::Succeeded)) => {
                "Connection ok, login succeeded".to_string()
            }
            (ProbeClassification::Ok, Some(LoginCheck::Failed)) => {
                "Connection ok, but login failed, check the password".to_string()
            }
            (ProbeClassification::Ok, Some(LoginCheck::Skipped)) => {
                "Connection ok, login not attempted over an insecure connection".to_string()
            }
            (ProbeClassification::Ok, None) => "Connection ok".to_string(),
            (ProbeClassification::NeedsAuth, _) => {
                "Service reachable, but it requires login or permissions, check the password or service settings".to_string()
            }
            (ProbeClassification::ReachableWrongPath, _) => match self.result.status_code {
                Some(code) if self.answered_on_forward_path() => format!(
                    "Service reachable (status {code}), but the login page is not, check the service configuration"
                ),
                Some(code) => format!("Service reachable, but it answered with status {code}"),
                None => "Service reachable, but it answered unexpectedly".to_string(),
            },
            (ProbeClassification::Timeout, _) => "Connection failed, the request timed out".to_string(),
            (ProbeClassification::TlsError, _) => {
                "Connection failed, TLS/certificate error, try http or fix the certificate".to_string()
            }
            (ProbeClassification::Unreachable, _) => {
                "Connection failed, cannot reach the server (network, port or firewall)".to_string()
            }
        };
        if self.insecure_tls_used {
            message.push_str(" (only with certificate checks disabled)");
        }
        if self.downgraded_to_http {
            message.push_str(" (only over plain http)");
        }
        message
    }

    fn answered_on_forward_path(&self) -> bool {
        self.steps
            .last()
            .is_some_and(|step| step.kind == ProbeStepKind::ForwardPath && step.status_code.is_some())
    }
}

impl Display for ProbeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}
