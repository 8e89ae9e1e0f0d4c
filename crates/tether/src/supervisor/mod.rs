//! Owns the execution host on behalf of its callers.
//!
//! The host lives in a [`Session`](session::Session) created lazily by the
//! first call that needs it. Concurrent callers share the session's single
//! initialization. When the host dies, every run waiting on it fails with
//! [`Error::TornDown`] and the session is dropped; the next call spawns a new
//! host. A run whose message cannot be delivered to a host that died unnoticed
//! is retried once on a fresh host.

mod router;
mod session;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tether_protocol::{Context, RunOutput, SupervisorMessage};
use tether_python::PythonHostConfig;
use tracing::{debug, info, warn};

use self::{
    router::Router,
    session::{RunError, Session},
};
use crate::{
    config::SupervisorConfig,
    error::{Error, Result},
    factory::{HostFactory, PythonHostFactory},
    observer::ToolObserver,
    tools::ToolRegistry,
};

pub struct SupervisorBuilder {
    factory: Arc<dyn HostFactory>,
    config: SupervisorConfig,
    tools: Option<Arc<ToolRegistry>>,
    observer: Option<Arc<dyn ToolObserver>>,
}

impl SupervisorBuilder {
    #[must_use]
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Tools served to guest programs. Without a registry every tool call
    /// fails with "tool handler not configured".
    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(Arc::new(tools));
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: impl ToolObserver) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    #[must_use]
    pub fn build(self) -> Supervisor {
        Supervisor {
            inner: Arc::new(Inner {
                factory: self.factory,
                config: self.config,
                router: Arc::new(Router::new(self.tools, self.observer)),
                session: Mutex::new(None),
                generations: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

/// Cheap to clone; clones share the same host.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    factory: Arc<dyn HostFactory>,
    config: SupervisorConfig,
    router: Arc<Router>,
    session: Mutex<Option<Arc<Session>>>,
    generations: AtomicU64,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.teardown(Some(SupervisorMessage::Shutdown));
        }
    }
}

impl Supervisor {
    pub fn builder(factory: impl HostFactory) -> SupervisorBuilder {
        SupervisorBuilder {
            factory: Arc::new(factory),
            config: SupervisorConfig::default(),
            tools: None,
            observer: None,
        }
    }

    /// Builder for a supervisor over embedded Python hosts.
    #[must_use]
    pub fn python(host: PythonHostConfig) -> SupervisorBuilder {
        Self::builder(PythonHostFactory::new(host))
    }

    /// Start the host if needed and wait until it is ready.
    ///
    /// # Errors
    /// Returns [`Error::InitFailed`] if the host rejected initialization; a
    /// later call starts over with a new host.
    pub async fn init(&self) -> Result<()> {
        self.ready_session().await.map(|_| ())
    }

    /// Run `code` with the configured default deadline, if any.
    ///
    /// Guest failures are reported in the returned [`RunOutput`].
    ///
    /// # Errors
    /// Returns an [`Error`] when the host could not be reached or died during
    /// the run.
    pub async fn run(&self, code: &str, context: Option<Context>) -> Result<RunOutput> {
        self.execute(code, context, self.inner.config.run_timeout)
            .await
    }

    /// Run `code`, giving up if it has not finished within `deadline`.
    ///
    /// The deadline starts once the host is ready and covers both the wait
    /// behind other runs and execution. Only a run the host already received
    /// recycles the host on expiry; a run that timed out in the queue leaves
    /// the host and the run ahead of it untouched.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] on expiry, otherwise as [`Supervisor::run`].
    pub async fn run_with_timeout(
        &self,
        code: &str,
        context: Option<Context>,
        deadline: Duration,
    ) -> Result<RunOutput> {
        self.execute(code, context, Some(deadline)).await
    }

    /// Discard the current host. The next call starts a new one.
    ///
    /// # Errors
    /// Returns [`Error::Closed`] after [`Supervisor::shutdown`].
    pub fn reset(&self) -> Result<()> {
        let session = {
            let mut slot = self.inner.session.lock();
            if self.is_closed() {
                return Err(Error::Closed);
            }
            slot.take()
        };
        if let Some(session) = session {
            session.teardown(Some(SupervisorMessage::Reset));
            info!(generation = session.generation(), "execution host recycled");
        }
        Ok(())
    }

    /// Stop the host for good. Later calls fail with [`Error::Closed`].
    pub fn shutdown(&self) {
        let session = {
            let mut slot = self.inner.session.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            slot.take()
        };
        if let Some(session) = session {
            session.teardown(Some(SupervisorMessage::Shutdown));
        }
        info!("supervisor shut down");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn execute(
        &self,
        code: &str,
        context: Option<Context>,
        deadline: Option<Duration>,
    ) -> Result<RunOutput> {
        let mut retried = false;
        loop {
            let session = self.ready_session().await?;
            let outcome = session
                .run(code.to_owned(), context.clone(), deadline)
                .await;

            match outcome {
                Ok(output) => return Ok(output),
                Err(RunError::Failed(err)) => return Err(err),
                Err(RunError::Expired {
                    limit,
                    delivered: false,
                }) => {
                    debug!(
                        generation = session.generation(),
                        ?limit,
                        "run timed out while queued"
                    );
                    return Err(Error::Timeout(limit));
                }
                Err(RunError::Expired { limit, .. }) => {
                    warn!(
                        generation = session.generation(),
                        ?limit,
                        "run timed out; recycling execution host"
                    );
                    self.discard(&session, None);
                    return Err(Error::Timeout(limit));
                }
                Err(RunError::NotDelivered) => {
                    self.discard(&session, None);
                    if retried {
                        return Err(Error::HostUnavailable);
                    }
                    retried = true;
                    info!(
                        generation = session.generation(),
                        "execution host died unnoticed; retrying run on a new host"
                    );
                }
            }
        }
    }

    async fn ready_session(&self) -> Result<Arc<Session>> {
        let session = self.session()?;
        match session.ready().await {
            Ok(()) => Ok(session),
            Err(err) => {
                self.discard(&session, Some(SupervisorMessage::Shutdown));
                Err(err)
            }
        }
    }

    /// The live session, spawning a host if there is none.
    fn session(&self) -> Result<Arc<Session>> {
        let mut slot = self.inner.session.lock();
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if let Some(session) = slot.as_ref()
            && session.is_alive()
        {
            return Ok(Arc::clone(session));
        }

        let link = self.inner.factory.spawn()?;
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        info!(generation, "execution host spawned");
        let session = Session::start(
            generation,
            link,
            self.inner.config.init_request(),
            Arc::clone(&self.inner.router),
        );
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    fn discard(&self, session: &Arc<Session>, farewell: Option<SupervisorMessage>) {
        {
            let mut slot = self.inner.session.lock();
            if slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                slot.take();
            }
        }
        session.teardown(farewell);
    }
}
