use pyo3::{PyErr, Python, prelude::PyTracebackMethods};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Python error: {cause}")]
    PythonError {
        cause: String,
        traceback: Option<String>,
    },

    /// The host threads could not be started.
    #[error("failed to spawn host thread")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub fn from_pyerr(py: Python<'_>, e: impl Into<PyErr>) -> Self {
        let e = e.into();
        Self::PythonError {
            cause: e.to_string(),
            traceback: e.traceback(py).and_then(|e| e.format().ok()),
        }
    }

    /// Text reported to the supervisor; the traceback stays in the logs.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::PythonError { cause, .. } => cause.clone(),
            other => other.to_string(),
        }
    }
}
