//! The execution host: a dispatcher thread reading the supervisor's messages
//! and an interpreter thread owning the guest namespace and event loop.

mod dispatcher;
mod interpreter;
mod state;

use std::{
    sync::{Arc, OnceLock},
    thread,
};

use parking_lot::Mutex;
use pyo3::{Py, PyAny, Python};
use tether_protocol::{Error as ProtocolError, HostEndpoint, HostLink, HostMessage, link};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

pub use self::state::{HostState, HostStatus};
use crate::{
    bridge::Bridge,
    config::PythonHostConfig,
    error::{Error, Result},
};

pub(crate) const NOT_READY: &str = "execution host is not ready";

/// Sending half of the host's reply channel.
///
/// Closing it is what the supervisor observes as host death, so it is closed
/// explicitly instead of relying on every clone being dropped.
#[derive(Debug)]
pub struct Outbox(Mutex<Option<UnboundedSender<HostMessage>>>);

impl Outbox {
    #[must_use]
    pub fn new(sender: UnboundedSender<HostMessage>) -> Self {
        Self(Mutex::new(Some(sender)))
    }

    /// # Errors
    /// Returns [`ProtocolError::HostGone`] once the outbox is closed.
    pub fn send(&self, message: HostMessage) -> core::result::Result<(), ProtocolError> {
        debug!(kind = message.kind(), "host sending");
        self.0
            .lock()
            .as_ref()
            .ok_or(ProtocolError::HostGone)?
            .send(message)
            .map_err(|_| ProtocolError::HostGone)
    }

    /// Returns whether this call closed it.
    pub fn close(&self) -> bool {
        self.0.lock().take().is_some()
    }
}

/// State shared by the two host threads.
struct Shared {
    config: PythonHostConfig,
    status: HostStatus,
    outbox: Arc<Outbox>,
    bridge: Arc<Bridge>,
    interrupt: OnceLock<Interrupt>,
}

// Raises `SystemExit` in the interpreter thread when a run must be abandoned.
struct Interrupt {
    helper: Py<PyAny>,
    thread_id: u64,
}

impl Shared {
    /// Move to `Terminated` and release everything waiting on this host.
    fn terminate(&self, reason: &'static str) {
        let previous = self.status.replace(HostState::Terminated);
        if previous == HostState::Terminated {
            return;
        }
        self.outbox.close();
        self.bridge.close();
        if previous == HostState::Running {
            self.interrupt();
        }
        info!(reason, ?previous, "execution host terminated");
    }

    fn interrupt(&self) {
        let Some(interrupt) = self.interrupt.get() else {
            return;
        };
        Python::attach(|py| {
            if let Err(err) = interrupt.helper.call1(py, (interrupt.thread_id,)) {
                warn!(%err, "failed to interrupt running program");
            }
        });
    }
}

pub struct PythonHost;

impl PythonHost {
    /// Start a host and return the supervisor's end of its channel.
    ///
    /// # Errors
    /// Returns [`Error::Spawn`] if a host thread cannot be started.
    pub fn spawn(config: PythonHostConfig) -> Result<HostLink> {
        let (host, endpoint) = link();
        Self::start(config, endpoint)?;
        Ok(host)
    }

    /// Serve `endpoint` on two new threads.
    ///
    /// # Errors
    /// Returns [`Error::Spawn`] if a host thread cannot be started.
    pub fn start(config: PythonHostConfig, endpoint: HostEndpoint) -> Result<()> {
        Python::initialize();

        let HostEndpoint { inbox, outbox } = endpoint;
        let outbox = Arc::new(Outbox::new(outbox));
        let bridge = Arc::new(Bridge::new(Arc::clone(&outbox)));
        let name = config.thread_name.clone();
        let shared = Arc::new(Shared {
            config,
            status: HostStatus::new(),
            outbox,
            bridge,
            interrupt: OnceLock::new(),
        });
        let (jobs, job_queue) = mpsc::unbounded_channel();

        let interpreter_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("{name}-interpreter"))
            .spawn(move || interpreter::serve(&interpreter_shared, job_queue))
            .map_err(Error::Spawn)?;
        thread::Builder::new()
            .name(format!("{name}-dispatcher"))
            .spawn(move || dispatcher::dispatch(&shared, inbox, jobs))
            .map_err(Error::Spawn)?;

        info!(name, "execution host spawned");
        Ok(())
    }
}
