//! Error taxonomy for everything that talks to the router.

use thiserror::Error;

/// Failure while authenticating against, or reading from, the router.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Malformed challenge or response body. Never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The router refused the credentials and locked the account for a while.
    #[error("router rejected auth credentials, blocked for {block_time_secs} secs")]
    AuthRejected { block_time_secs: u64 },

    /// Network failure, timeout or non-2xx status on a single request.
    #[error("fetch failed: {0}")]
    TransientFetch(String),

    /// The router answered with something that is not a number (e.g. `inval`).
    #[error("non-numeric reading: {0:?}")]
    NumericFormat(String),
}

impl DeviceError {
    /// Errors that must stop the sampling loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::AuthRejected { .. })
    }

    /// Errors that may be caused by an expired session token.
    pub fn may_be_stale_session(&self) -> bool {
        matches!(self, DeviceError::TransientFetch(_))
    }
}

impl From<reqwest::Error> for DeviceError {
    fn from(err: reqwest::Error) -> Self {
        DeviceError::TransientFetch(err.to_string())
    }
}

impl From<quick_xml::DeError> for DeviceError {
    fn from(err: quick_xml::DeError) -> Self {
        DeviceError::Protocol(format!("invalid SessionInfo XML: {err}"))
    }
}
