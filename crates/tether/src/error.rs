use std::time::Duration;

/// Result type used by the supervisor APIs.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Transport and setup failures.
///
/// Guest failures never surface here: they come back as a [`RunOutput`] with
/// `ok: false`.
///
/// [`RunOutput`]: tether_protocol::RunOutput
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("execution host failed to initialize: {0}")]
    InitFailed(String),

    /// The host went away while the request was outstanding.
    #[error("execution host torn down")]
    TornDown,

    #[error("execution host is unavailable")]
    HostUnavailable,

    #[error("run timed out after {0:?}")]
    Timeout(Duration),

    /// `shutdown` was called on this supervisor.
    #[error("supervisor is shut down")]
    Closed,

    #[error("failed to spawn execution host: {0}")]
    Spawn(String),
}

impl From<tether_protocol::Error> for Error {
    fn from(value: tether_protocol::Error) -> Self {
        match value {
            tether_protocol::Error::TornDown => Self::TornDown,
            tether_protocol::Error::HostGone => Self::HostUnavailable,
        }
    }
}
