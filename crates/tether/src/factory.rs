use std::sync::Arc;

use tether_protocol::HostLink;
use tether_python::{PythonHost, PythonHostConfig};

use crate::error::{Error, Result};

/// Creates execution hosts. Called once per session, so a host that dies is
/// replaced by a fresh one on next use.
pub trait HostFactory: Send + Sync + 'static {
    /// # Errors
    /// Returns [`Error::Spawn`] if the host cannot be started.
    fn spawn(&self) -> Result<HostLink>;
}

impl<T: HostFactory + ?Sized> HostFactory for Arc<T> {
    fn spawn(&self) -> Result<HostLink> {
        (**self).spawn()
    }
}

/// Spawns embedded Python hosts.
#[derive(Debug, Clone, Default)]
pub struct PythonHostFactory {
    config: PythonHostConfig,
}

impl PythonHostFactory {
    #[must_use]
    pub const fn new(config: PythonHostConfig) -> Self {
        Self { config }
    }
}

impl HostFactory for PythonHostFactory {
    fn spawn(&self) -> Result<HostLink> {
        PythonHost::spawn(self.config.clone()).map_err(|err| Error::Spawn(err.to_string()))
    }
}
