use std::io;

use crate::ErrorKind;

/// An extension trait to help determine if a failed exchange is worth
/// repeating.
///
/// Only low-level failures are transient: timeouts, refused or reset
/// connections and responses cut off halfway. HTTP status codes are never
/// retried here, the protocol handles them explicitly.
///
/// Modified from `Retryable` in [reqwest-middleware].
///
/// [reqwest-middleware]: https://github.com/TrueLayer/reqwest-middleware/blob/f854725791ccf4a02c401a26cab3d9db753f468c/reqwest-retry/src/retryable.rs
pub(crate) trait RetryExt {
    fn should_retry(&self) -> bool;
}

impl RetryExt for reqwest::Error {
    #[allow(clippy::if_same_then_else)]
    fn should_retry(&self) -> bool {
        if self.is_timeout() || self.is_connect() {
            true
        } else if self.is_body() || self.is_decode() || self.is_builder() || self.is_redirect() {
            false
        } else if self.is_request() {
            // It seems that hyper::Error(IncompleteMessage) is not correctly handled by reqwest.
            // Here we check if the Reqwest error was originated by hyper and map it consistently.
            if let Some(hyper_error) = get_source_error_type::<hyper::Error>(self) {
                // The hyper::Error(IncompleteMessage) is raised if the HTTP
                // response is well formatted but does not contain all the
                // bytes. This can happen when the server has started sending
                // back the response but the connection is cut halfway through.
                //
                // Instead hyper::Error(Canceled) is raised when the connection is
                // gracefully closed on the server side.
                if hyper_error.is_incomplete_message() || hyper_error.is_canceled() {
                    true
                } else if let Some(io_error) = get_source_error_type::<io::Error>(hyper_error) {
                    should_retry_io(io_error)
                } else {
                    false
                }
            } else {
                false
            }
        } else {
            false
        }
    }
}

impl RetryExt for ErrorKind {
    fn should_retry(&self) -> bool {
        match self {
            // A body that could not be read completely is as transient as the
            // connection it came over.
            Self::NetworkRequest(e) | Self::ReadResponseBody(e) => {
                e.should_retry() || get_source_error_type::<io::Error>(e).is_some_and(should_retry_io)
            }
            _ => false,
        }
    }
}

/// Classifies an `io::Error` into retryable or not.
fn should_retry_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
    )
}

/// Downcasts the given err source into T.
fn get_source_error_type<T: std::error::Error + 'static>(
    err: &dyn std::error::Error,
) -> Option<&T> {
    let mut source = err.source();

    while let Some(err) = source {
        if let Some(hyper_err) = err.downcast_ref::<T>() {
            return Some(hyper_err);
        }

        source = err.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{RetryExt, should_retry_io};
    use crate::ErrorKind;

    #[test]
    fn test_io_classification() {
        assert!(should_retry_io(&std::io::Error::from(
            std::io::ErrorKind::ConnectionReset
        )));
        assert!(should_retry_io(&std::io::Error::from(
            std::io::ErrorKind::TimedOut
        )));
        assert!(!should_retry_io(&std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        )));
    }

    #[test]
    fn test_plumbing_errors_are_not_retried() {
        assert!(!ErrorKind::PoolShutDown.should_retry());
        assert!(!ErrorKind::MissingHost("x".into()).should_retry());
    }

    #[tokio::test]
    async fn test_refused_connection_is_retried() {
        // Nothing listens on port 1 of the loopback interface.
        let error = reqwest::Client::new()
            .get("http://127.0.0.1:1/")
            .send()
            .await
            .unwrap_err();
        assert!(error.should_retry());
        assert!(ErrorKind::NetworkRequest(error).should_retry());
    }
}
