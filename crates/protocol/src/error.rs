use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The peer was reset or shut down while a request was outstanding.
    #[error("execution host torn down")]
    TornDown,

    /// The channel to the peer is closed.
    #[error("execution host is gone")]
    HostGone,
}
