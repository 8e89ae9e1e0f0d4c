use serde_json::Value;
use tether_protocol::{HostMessage, RunOutput, SupervisorMessage};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

use super::{HostState, NOT_READY, Shared, interpreter::Job};

/// Read the supervisor's messages until it hangs up or asks us to stop.
///
/// Guest code never runs here: jobs go to the interpreter thread and tool
/// results resume guest tasks through the event loop.
pub(super) fn dispatch(
    shared: &Shared,
    mut inbox: UnboundedReceiver<SupervisorMessage>,
    jobs: UnboundedSender<Job>,
) {
    let reason = loop {
        let Some(message) = inbox.blocking_recv() else {
            break "supervisor hung up";
        };
        debug!(kind = message.kind(), "host received");
        match message {
            SupervisorMessage::Init(request) => {
                if !shared
                    .status
                    .transition(HostState::Uninitialized, HostState::Initializing)
                {
                    let _ = shared.outbox.send(HostMessage::init_result(Err(
                        "execution host is already initialized".to_owned(),
                    )));
                } else if jobs.send(Job::Init(request)).is_err() {
                    break "interpreter exited";
                }
            }
            SupervisorMessage::Run { id, code, context } => {
                if !shared
                    .status
                    .transition(HostState::Ready, HostState::Running)
                {
                    let _ = shared
                        .outbox
                        .send(HostMessage::run_result(id, RunOutput::failure(NOT_READY)));
                } else if jobs.send(Job::Run { id, code, context }).is_err() {
                    break "interpreter exited";
                }
            }
            SupervisorMessage::ToolResult {
                id,
                ok,
                value,
                error,
            } => {
                let outcome = if ok {
                    Ok(value.unwrap_or(Value::Null))
                } else {
                    Err(error.unwrap_or_else(|| "tool call failed".to_owned()))
                };
                shared.bridge.resolve(id, outcome);
            }
            SupervisorMessage::Reset => break "reset",
            SupervisorMessage::Shutdown => break "shutdown",
        }
    };
    shared.terminate(reason);
}
