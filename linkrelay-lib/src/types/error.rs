use std::path::PathBuf;

use serde::{Serialize, Serializer};
use thiserror::Error;
use url::Url;

use crate::NetworkErrorKind;
use crate::utils::reqwest::{analyze_error_chain, classify_error};

/// Possible errors when interacting with `linkrelay_lib`
///
/// These cover the plumbing around a forward: building clients, talking to
/// the network, parsing endpoint addresses and loading configuration.
/// Protocol-level results of a forward (rejected, throttled, needs login, ...)
/// are never errors; they are reported through [`crate::ForwardOutcome`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Network error while handling request
    #[error("Network error")]
    NetworkRequest(#[source] reqwest::Error),

    /// Cannot read the body of the received response
    #[error("Error reading response body: {0}")]
    ReadResponseBody(#[source] reqwest::Error),

    /// The network client required for making requests cannot be created
    #[error("Error creating request client: {0}")]
    BuildRequestClient(#[source] reqwest::Error),

    /// The endpoint the user configured cannot be parsed as a URL
    #[error("Cannot parse `{0}` as an endpoint address: {1}")]
    InvalidEndpoint(String, #[source] url::ParseError),

    /// The endpoint uses a scheme other than `http` or `https`
    #[error("Unsupported scheme in `{0}`, only http and https are allowed")]
    UnsupportedScheme(String),

    /// The endpoint has no host component
    #[error("Endpoint `{0}` is missing a host")]
    MissingHost(String),

    /// A redirect pointed to a location that is not a valid URL
    #[error("Invalid redirect location `{location}` from {url}")]
    InvalidRedirect {
        /// The URL that answered with the redirect
        url: Url,
        /// The raw `Location` header value
        location: String,
    },

    /// Redirects were followed more often than allowed
    #[error("Too many redirects ({1}) starting at {0}")]
    TooManyRedirects(Url, usize),

    /// The pooled client was shut down while a request waited for a connection
    #[error("HTTP connection pool was shut down")]
    PoolShutDown,

    /// The given header could not be parsed.
    #[error("Header could not be parsed.")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// The configuration file could not be read
    #[error("Cannot read config file `{}`: {}", .0.display(), .1)]
    ReadConfig(PathBuf, #[source] std::io::Error),

    /// A configuration value is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file is not valid TOML for a `GatewayConfig`
    #[error("Cannot parse config file: {0}")]
    ParseConfig(#[from] toml::de::Error),
}

impl ErrorKind {
    /// Return more details about the given [`ErrorKind`]
    ///
    /// Network errors are analysed through their source chain, which is
    /// considerably more useful to an end user than the top-level message.
    #[must_use]
    pub fn details(&self) -> Option<String> {
        match self {
            ErrorKind::NetworkRequest(e)
            | ErrorKind::ReadResponseBody(e)
            | ErrorKind::BuildRequestClient(e) => Some(analyze_error_chain(e)),
            ErrorKind::TooManyRedirects(_, _) => {
                Some("Too many redirects - check for redirect loops".to_string())
            }
            ErrorKind::PoolShutDown => {
                Some("The service is shutting down, try again later".to_string())
            }
            _ => None,
        }
    }

    /// Return the underlying source of the given [`ErrorKind`]
    /// if it is a `reqwest::Error`.
    #[must_use]
    pub const fn reqwest_error(&self) -> Option<&reqwest::Error> {
        match self {
            ErrorKind::NetworkRequest(e)
            | ErrorKind::ReadResponseBody(e)
            | ErrorKind::BuildRequestClient(e) => Some(e),
            _ => None,
        }
    }

    /// Classify this error for reporting a failed network exchange.
    ///
    /// Errors that never reached the network are [`NetworkErrorKind::Other`].
    #[must_use]
    pub fn network_kind(&self) -> NetworkErrorKind {
        self.reqwest_error()
            .map_or(NetworkErrorKind::Other, classify_error)
    }

    /// A concise, user-facing description of this error
    #[must_use]
    pub fn user_message(&self) -> String {
        self.details().unwrap_or_else(|| self.to_string())
    }
}

impl Serialize for ErrorKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}
