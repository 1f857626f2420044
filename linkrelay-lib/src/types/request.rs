use std::fmt::Display;
use std::time::SystemTime;

/// Identity on whose behalf a link is forwarded.
///
/// Callers are the unit of rate limiting and of per-caller admission.
pub type CallerId = u64;

/// A single link submitted by a caller
///
/// The link has been validated before it reaches the gateway; it is
/// forwarded verbatim.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct ForwardRequest {
    /// Who submitted the link
    pub caller: CallerId,

    /// The link to forward
    pub link: String,

    /// When the link was submitted
    pub submitted_at: SystemTime,
}

impl ForwardRequest {
    /// Create a new request submitted now
    #[must_use]
    pub fn new(caller: CallerId, link: impl Into<String>) -> Self {
        Self {
            caller,
            link: link.into(),
            submitted_at: SystemTime::now(),
        }
    }
}

impl Display for ForwardRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (caller {})", self.link, self.caller)
    }
}

impl<T: Into<String>> From<(CallerId, T)> for ForwardRequest {
    fn from((caller, link): (CallerId, T)) -> Self {
        Self::new(caller, link)
    }
}
