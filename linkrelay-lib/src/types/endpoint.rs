use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::{ErrorKind, Result};

/// Path of the downstream ingestion endpoint.
///
/// Every configured endpoint is normalized to end with this path, whatever
/// the user typed.
pub const FORWARD_PATH: &str = "/tasks/add_via_extension";

/// Path of the downstream login form.
///
/// The login URL is derived from the forward URL by replacing
/// [`FORWARD_PATH`] with this suffix, see [`login_url`].
pub const LOGIN_PATH: &str = "/login";

/// Scheme used when the user gives only a host (and maybe a port).
const DEFAULT_SCHEME: &str = "https";

/// Where to forward links for one caller, and how to log in there.
///
/// Owned by the config store and re-read for every call, so an update saved
/// by the user takes effect on the next forward.
pub struct EndpointConfig {
    forward_url: Url,
    credential: Option<SecretString>,
}

impl EndpointConfig {
    /// Create a config from user input, normalizing the address.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the address cannot be normalized, see
    /// [`normalize_endpoint`].
    pub fn new(address: &str, credential: Option<SecretString>) -> Result<Self> {
        Ok(Self {
            forward_url: normalize_endpoint(address)?,
            credential,
        })
    }

    /// Create a config from an already normalized forward URL
    #[must_use]
    pub const fn from_url(forward_url: Url, credential: Option<SecretString>) -> Self {
        Self {
            forward_url,
            credential,
        }
    }

    /// The URL links are posted to
    #[must_use]
    pub const fn forward_url(&self) -> &Url {
        &self.forward_url
    }

    /// The URL of the login form, derived from [`Self::forward_url`]
    #[must_use]
    pub fn login_url(&self) -> Url {
        login_url(&self.forward_url)
    }

    /// The configured credential.
    ///
    /// `None` means no credential was configured, which is different from
    /// an empty one.
    #[must_use]
    pub const fn credential(&self) -> Option<&SecretString> {
        self.credential.as_ref()
    }

    /// Replace the credential, keeping the address
    #[must_use]
    pub fn with_credential(mut self, credential: Option<SecretString>) -> Self {
        self.credential = credential;
        self
    }
}

impl Clone for EndpointConfig {
    fn clone(&self) -> Self {
        Self {
            forward_url: self.forward_url.clone(),
            credential: self
                .credential
                .as_ref()
                .map(|secret| SecretString::from(secret.expose_secret().to_owned())),
        }
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("forward_url", &self.forward_url.as_str())
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Normalize an endpoint address typed by a user.
///
/// - surrounding whitespace is removed
/// - a missing scheme defaults to `https`, so `example.com:5000` works
/// - only `http` and `https` are accepted
/// - credentials in the URL, the query and the fragment are dropped
/// - the path is always [`FORWARD_PATH`], without trailing slash
///
/// # Errors
///
/// Returns an `Err` if the address is not a URL, uses another scheme or has
/// no host.
pub fn normalize_endpoint(input: &str) -> Result<Url> {
    let raw = input.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("{DEFAULT_SCHEME}://{raw}")
    };

    let mut url =
        Url::parse(&with_scheme).map_err(|e| ErrorKind::InvalidEndpoint(raw.to_string(), e))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ErrorKind::UnsupportedScheme(raw.to_string()));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ErrorKind::MissingHost(raw.to_string()));
    }

    // Neither can fail for http(s) URLs with a host.
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_query(None);
    url.set_fragment(None);
    url.set_path(FORWARD_PATH.trim_end_matches('/'));

    Ok(url)
}

/// Derive the login URL from a forward URL.
///
/// The trailing [`FORWARD_PATH`] is replaced with [`LOGIN_PATH`]. A URL that
/// does not end with the forward path gets the login path appended to its
/// path instead.
#[must_use]
pub fn login_url(forward_url: &Url) -> Url {
    let mut url = forward_url.clone();
    let path = forward_url.path();
    let base = path.strip_suffix(FORWARD_PATH).unwrap_or(path);
    url.set_path(&format!("{}{LOGIN_PATH}", base.trim_end_matches('/')));
    url.set_query(None);
    url.set_fragment(None);
    url
}
