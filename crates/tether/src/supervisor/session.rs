use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use tether_protocol::{
    CallIds, Context, Error as ProtocolError, HostLink, HostMessage, InitRequest, PendingCalls,
    RunOutput, SupervisorMessage,
};
use tokio::sync::{
    Semaphore,
    mpsc::{UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use super::router::Router;
use crate::error::{Error, Result};

type InitFuture = Shared<BoxFuture<'static, Result<()>>>;
type RunWaiter = oneshot::Sender<Result<RunOutput>>;

pub(super) enum RunError {
    /// The `Run` never reached the host.
    NotDelivered,
    /// The deadline passed. `delivered` is false if the run was still queued,
    /// in which case the host never saw it; otherwise the session is already
    /// torn down.
    Expired { limit: Duration, delivered: bool },
    Failed(Error),
}

/// One execution host and everything waiting on it.
///
/// A session never comes back to life: once torn down, the supervisor replaces
/// it with a new one.
pub(super) struct Session {
    generation: u64,
    sender: Mutex<Option<UnboundedSender<SupervisorMessage>>>,
    runs: PendingCalls<RunWaiter>,
    ids: CallIds,
    // Fair, so queued runs go in arrival order.
    gate: Semaphore,
    init: InitFuture,
    alive: AtomicBool,
}

impl Session {
    /// Send `Init` and start reading the host's messages.
    pub(super) fn start(
        generation: u64,
        link: HostLink,
        request: InitRequest,
        router: Arc<Router>,
    ) -> Arc<Self> {
        let HostLink { sender, receiver } = link;
        let (init_tx, init_rx) = oneshot::channel();
        let init = async move { init_rx.await.unwrap_or(Err(Error::HostUnavailable)) }
            .boxed()
            .shared();
        let session = Arc::new(Self {
            generation,
            sender: Mutex::new(Some(sender)),
            runs: PendingCalls::new(),
            ids: CallIds::new(),
            gate: Semaphore::new(1),
            init,
            alive: AtomicBool::new(true),
        });

        if let Err(err) = session.send(SupervisorMessage::Init(request)) {
            let _ = init_tx.send(Err(err.into()));
            session.teardown(None);
            return session;
        }
        tokio::spawn(read(Arc::clone(&session), receiver, init_tx, router));
        session
    }

    pub(super) const fn generation(&self) -> u64 {
        self.generation
    }

    pub(super) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Resolves once the host answered `Init`. Every clone sees the same outcome.
    pub(super) fn ready(&self) -> InitFuture {
        self.init.clone()
    }

    pub(super) fn send(&self, message: SupervisorMessage) -> core::result::Result<(), ProtocolError> {
        let sender = self.sender.lock();
        sender
            .as_ref()
            .ok_or(ProtocolError::HostGone)?
            .send(message)
            .map_err(|_| ProtocolError::HostGone)
    }

    /// Submit one program and wait for its result. Runs queue on the gate, so
    /// the host only ever sees one at a time. `deadline` bounds the wait from
    /// this call, queueing included.
    pub(super) async fn run(
        &self,
        code: String,
        context: Option<Context>,
        deadline: Option<Duration>,
    ) -> core::result::Result<RunOutput, RunError> {
        let expiry = deadline.map(|limit| (limit, Instant::now() + limit));

        let acquire = self.gate.acquire();
        let permit = match expiry {
            Some((limit, at)) => timeout_at(at, acquire).await.map_err(|_| RunError::Expired {
                limit,
                delivered: false,
            })?,
            None => acquire.await,
        };
        let _permit = permit.map_err(|_| RunError::Failed(Error::TornDown))?;

        let id = self.ids.next();
        let (waiter, result) = oneshot::channel();
        if self.runs.insert(id, waiter).is_err() {
            return Err(RunError::Failed(Error::TornDown));
        }
        debug!(generation = self.generation, %id, "run submitted");
        if self
            .send(SupervisorMessage::Run { id, code, context })
            .is_err()
        {
            self.runs.take(id);
            return Err(RunError::NotDelivered);
        }

        let outcome = match expiry {
            Some((limit, at)) => {
                if let Ok(outcome) = timeout_at(at, result).await {
                    outcome
                } else {
                    // Still holding the gate: nothing queued reaches this host.
                    self.runs.take(id);
                    self.teardown(Some(SupervisorMessage::Reset));
                    return Err(RunError::Expired {
                        limit,
                        delivered: true,
                    });
                }
            }
            None => result.await,
        };
        outcome
            .unwrap_or(Err(Error::TornDown))
            .map_err(RunError::Failed)
    }

    /// Stop talking to the host and fail everything waiting on it. Returns
    /// whether the session was alive before the call.
    pub(super) fn teardown(&self, farewell: Option<SupervisorMessage>) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        self.gate.close();
        if let Some(sender) = self.sender.lock().take()
            && let Some(farewell) = farewell
        {
            let _ = sender.send(farewell);
        }
        let pending = self.runs.close();
        if !pending.is_empty() {
            warn!(
                generation = self.generation,
                count = pending.len(),
                "failing runs outstanding on a dead execution host"
            );
        }
        for (_, waiter) in pending {
            let _ = waiter.send(Err(Error::TornDown));
        }
        was_alive
    }
}

async fn read(
    session: Arc<Session>,
    mut receiver: UnboundedReceiver<HostMessage>,
    init: oneshot::Sender<Result<()>>,
    router: Arc<Router>,
) {
    let generation = session.generation;
    let mut init = Some(init);
    while let Some(message) = receiver.recv().await {
        debug!(generation, kind = message.kind(), "supervisor received");
        match message {
            HostMessage::InitResult { ok, error } => {
                let Some(init) = init.take() else {
                    warn!(generation, "duplicate init result");
                    continue;
                };
                let outcome = if ok {
                    info!(generation, "execution host initialized");
                    Ok(())
                } else {
                    let error = error.unwrap_or_else(|| "unknown error".to_owned());
                    warn!(generation, %error, "execution host failed to initialize");
                    Err(Error::InitFailed(error))
                };
                let _ = init.send(outcome);
            }
            HostMessage::RunResult {
                id,
                ok,
                value,
                error,
                hint,
            } => match session.runs.take(id) {
                Some(waiter) => {
                    let _ = waiter.send(Ok(RunOutput {
                        ok,
                        value,
                        error,
                        hint,
                    }));
                }
                None => warn!(generation, %id, "run result for unknown run"),
            },
            HostMessage::ToolCall { id, name, args } => {
                router.route(Arc::clone(&session), id, name, args);
            }
        }
    }

    if session.teardown(None) {
        warn!(generation, "execution host exited");
    } else {
        debug!(generation, "execution host closed its channel");
    }
}
