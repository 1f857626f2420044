#![allow(unreachable_pub)]

mod endpoint;
mod error;
mod outcome;
mod probe;
mod request;

pub use endpoint::{EndpointConfig, FORWARD_PATH, LOGIN_PATH, login_url, normalize_endpoint};
pub use error::ErrorKind;
pub use outcome::{FailureKind, ForwardOutcome, NetworkErrorKind};
pub use probe::{
    LoginCheck, ProbeClassification, ProbeReport, ProbeResult, ProbeStep, ProbeStepKind,
};
pub use request::{CallerId, ForwardRequest};

/// The linkrelay `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
