use std::error::Error;

use crate::NetworkErrorKind;

/// A rule for matching error message patterns to human-readable messages
struct ErrorRule {
    patterns: &'static [&'static str],
    message: &'static str,
}

impl ErrorRule {
    /// Create a new error rule
    const fn new(patterns: &'static [&'static str], message: &'static str) -> Self {
        Self { patterns, message }
    }

    /// Check if any of the patterns match the given text
    fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|pattern| text.contains(pattern))
    }
}

/// A builder for creating and matching against multiple error rules
struct ErrorRules {
    rules: Vec<ErrorRule>,
    fallback: Option<String>,
}

impl ErrorRules {
    /// Create a new `ErrorRules` builder
    const fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: None,
        }
    }

    /// Add a rule to the matcher
    fn rule(mut self, patterns: &'static [&'static str], message: &'static str) -> Self {
        self.rules.push(ErrorRule::new(patterns, message));
        self
    }

    /// Set a fallback message if no rules match
    fn fallback(mut self, message: impl Into<String>) -> Self {
        self.fallback = Some(message.into());
        self
    }

    /// Match against the error message and return the first matching message
    fn find(&self, error_msg: &str) -> Option<&'static str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(error_msg))
            .map(|rule| rule.message)
    }

    /// Match against the error message and return the appropriate response
    fn match_error(self, error_msg: &str) -> String {
        match self.find(error_msg) {
            Some(message) => message.to_string(),
            None => self
                .fallback
                .unwrap_or_else(|| format!("Unhandled error: {error_msg}")),
        }
    }
}

/// Markers of TLS and certificate failures in error messages.
///
/// Checked before connection errors because a failed handshake is also
/// reported as a connect error by `reqwest`.
const TLS_MARKERS: &[&str] = &[
    "certificate",
    "Certificate",
    "handshake",
    "TLS",
    "tls",
    "SSL",
    "ssl",
    "UnknownIssuer",
    "NotValidForName",
];

const REFUSED_MARKERS: &[&str] = &["Connection refused", "connection refused"];

const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout"];

/// Classify a `reqwest` error into the kinds callers need to distinguish.
pub(crate) fn classify_error(error: &reqwest::Error) -> NetworkErrorKind {
    if error.is_timeout() {
        return NetworkErrorKind::Timeout;
    }

    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io_error) = err.downcast_ref::<std::io::Error>() {
            match io_error.kind() {
                std::io::ErrorKind::TimedOut => return NetworkErrorKind::Timeout,
                std::io::ErrorKind::ConnectionRefused => {
                    return NetworkErrorKind::ConnectionRefused;
                }
                _ => {}
            }
        }

        let message = err.to_string();
        if TLS_MARKERS.iter().any(|marker| message.contains(marker)) {
            return NetworkErrorKind::Tls;
        }
        if REFUSED_MARKERS.iter().any(|marker| message.contains(marker)) {
            return NetworkErrorKind::ConnectionRefused;
        }
        if TIMEOUT_MARKERS.iter().any(|marker| message.contains(marker)) {
            return NetworkErrorKind::Timeout;
        }

        source = err.source();
    }

    if error.is_connect() {
        NetworkErrorKind::Connect
    } else {
        NetworkErrorKind::Other
    }
}

/// Analyze the error chain of a reqwest error and return a concise, actionable message.
///
/// This traverses the error chain to extract specific failure details and provides
/// user-friendly explanations with actionable suggestions when possible.
pub(crate) fn analyze_error_chain(error: &reqwest::Error) -> String {
    // First check reqwest's built-in categorization
    if let Some(basic_message) = analyze_basic_reqwest_error(error) {
        return basic_message;
    }

    // Traverse error chain for detailed analysis
    if let Some(chain_message) = analyze_error_source_chain(error) {
        return chain_message;
    }

    fallback_reqwest_analysis(error)
}

/// Analyze basic reqwest error types first
fn analyze_basic_reqwest_error(error: &reqwest::Error) -> Option<String> {
    if error.is_timeout() {
        return Some("Request timed out. Check that the service is running".to_string());
    }

    if let Some(status) = error.status() {
        let reason = status.canonical_reason().unwrap_or("Unknown");
        return Some(format!("HTTP {}: {reason}", status.as_u16()));
    }

    None
}

/// Traverse the error chain for detailed analysis
fn analyze_error_source_chain(error: &reqwest::Error) -> Option<String> {
    let mut source = error.source();
    while let Some(err) = source {
        // Check for I/O errors (most network issues)
        if let Some(io_error) = err.downcast_ref::<std::io::Error>() {
            return Some(analyze_io_error(io_error));
        }

        if let Some(hyper_error) = err.downcast_ref::<hyper::Error>() {
            return Some(analyze_hyper_error(hyper_error));
        }

        if let Some(generic_message) = analyze_generic_error_string(&err.to_string()) {
            return Some(generic_message);
        }

        source = err.source();
    }

    None
}

/// Analyze I/O errors with specific categorization
fn analyze_io_error(io_error: &std::io::Error) -> String {
    match io_error.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            "Connection refused - service may be down or port blocked".to_string()
        }
        std::io::ErrorKind::TimedOut => {
            "Request timed out. Check that the service is running".to_string()
        }
        std::io::ErrorKind::NotFound => {
            "DNS resolution failed - check hostname spelling".to_string()
        }
        std::io::ErrorKind::PermissionDenied => {
            "Permission denied - check firewall or proxy settings".to_string()
        }
        std::io::ErrorKind::NetworkUnreachable => {
            "Network unreachable. Check network connection or VPN settings".to_string()
        }
        std::io::ErrorKind::ConnectionReset => {
            "Connection reset by server. Server forcibly closed connection".to_string()
        }
        std::io::ErrorKind::UnexpectedEof => {
            "Connection closed unexpectedly. Server terminated early".to_string()
        }
        std::io::ErrorKind::Other => analyze_io_other_error(io_error),
        kind => format!("I/O error ({kind:?}). Check network connectivity and server status"),
    }
}

/// Analyze I/O errors with kind "Other" using rule-based pattern matching
fn analyze_io_other_error(io_error: &std::io::Error) -> String {
    let Some(inner) = io_error.get_ref() else {
        return "Connection failed. Check network connectivity and firewall settings".to_string();
    };
    let inner_msg = inner.to_string();

    if inner_msg.contains("certificate") {
        return analyze_certificate_error(&inner_msg);
    }

    ErrorRules::new()
        .rule(
            &["failed to lookup address", "nodename nor servname"],
            "DNS resolution failed. Check hostname and DNS settings",
        )
        .rule(
            &["handshake"],
            "TLS handshake failed. Check SSL/TLS configuration",
        )
        .fallback(format!("Network error: {inner_msg}"))
        .match_error(&inner_msg)
}

/// Analyze certificate-related errors using pattern matching rules
fn analyze_certificate_error(error_msg: &str) -> String {
    ErrorRules::new()
        .rule(
            &["expired", "NotValidAtThisTime", "certificate has expired"],
            "SSL certificate expired. The service needs to renew its certificate",
        )
        .rule(
            &["hostname", "NotValidForName"],
            "SSL certificate hostname mismatch. Check the endpoint address",
        )
        .rule(
            &["self signed", "self-signed", "UnknownIssuer", "not trusted"],
            "SSL certificate not trusted. Try http or install a trusted certificate",
        )
        .fallback("SSL certificate error. Check certificate validity")
        .match_error(error_msg)
}

/// Analyze hyper-specific errors
fn analyze_hyper_error(hyper_error: &hyper::Error) -> String {
    if hyper_error.is_parse() {
        return "Invalid HTTP response format. Server may be misconfigured".to_string();
    }
    if hyper_error.is_timeout() {
        return "Request timed out. Check that the service is running".to_string();
    }
    if hyper_error.is_canceled() {
        return "Request was canceled".to_string();
    }
    if hyper_error.is_closed() || hyper_error.is_incomplete_message() {
        return "Connection closed before response completed".to_string();
    }
    format!("HTTP protocol error: {hyper_error}")
}

/// Analyze generic error strings using a rule-based pattern matching system
fn analyze_generic_error_string(error_msg: &str) -> Option<String> {
    if error_msg.contains("certificate") {
        return Some(analyze_certificate_error(error_msg));
    }

    ErrorRules::new()
        .rule(
            &["handshake", "TLS", "SSL"],
            "TLS handshake failed. Check SSL/TLS configuration",
        )
        .rule(
            &["name resolution", "dns error"],
            "DNS resolution failed. Check hostname and DNS settings",
        )
        .rule(
            REFUSED_MARKERS,
            "Connection refused. Server is not accepting connections (check if service is running)",
        )
        .rule(
            &["No route to host", "no route"],
            "No route to host. Check network routing or firewall configuration",
        )
        .rule(
            TIMEOUT_MARKERS,
            "Request timed out. Check that the service is running",
        )
        .find(error_msg)
        .map(str::to_string)
}

/// Fallback analysis using basic reqwest error categorization
fn fallback_reqwest_analysis(error: &reqwest::Error) -> String {
    if error.is_connect() {
        "Connection failed. Check network connectivity and firewall settings".to_string()
    } else if error.is_decode() {
        "Response decoding failed. Server returned invalid data".to_string()
    } else {
        format!("Request failed: {error}")
    }
}
