use std::{panic::AssertUnwindSafe, sync::Arc, time::Instant};

use futures::FutureExt;
use serde_json::Value;
use tether_protocol::{CallId, SupervisorMessage, is_reserved_tool, value::payload_size};
use tracing::debug;

use super::session::Session;
use crate::{
    observer::{ToolCallEvent, ToolObserver, notify},
    tools::{ToolError, ToolRegistry},
};

/// Serves the host's `ToolCall`s. Every call gets a `ToolResult`, whatever
/// happens to the handler.
pub(super) struct Router {
    tools: Option<Arc<ToolRegistry>>,
    observer: Option<Arc<dyn ToolObserver>>,
}

impl Router {
    pub(super) fn new(
        tools: Option<Arc<ToolRegistry>>,
        observer: Option<Arc<dyn ToolObserver>>,
    ) -> Self {
        Self { tools, observer }
    }

    /// Run the call on its own task and reply through `session`.
    pub(super) fn route(
        self: &Arc<Self>,
        session: Arc<Session>,
        id: CallId,
        name: String,
        args: Option<Value>,
    ) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let args_byte_size = args.as_ref().map_or(0, payload_size);
            let started = Instant::now();
            let outcome = AssertUnwindSafe(router.dispatch(&name, args))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ToolError::failed(format!("tool '{name}' panicked"))));
            let elapsed = started.elapsed();

            let error = outcome.as_ref().err().map(ToString::to_string);
            if let Some(error) = &error {
                debug!(%id, tool = %name, %error, "tool call failed");
            }
            let reply = SupervisorMessage::tool_result(id, outcome.map_err(|err| err.to_string()));
            if session.send(reply).is_err() {
                debug!(%id, tool = %name, "execution host gone before tool reply");
            }

            if let Some(observer) = &router.observer {
                let event = ToolCallEvent {
                    name,
                    args_byte_size,
                    duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    ok: error.is_none(),
                    error,
                };
                notify(observer.as_ref(), &event);
            }
        });
    }

    async fn dispatch(&self, name: &str, args: Option<Value>) -> Result<Value, ToolError> {
        if is_reserved_tool(name) {
            return Err(ToolError::Reserved(name.to_owned()));
        }
        match &self.tools {
            Some(tools) => tools.call(name, args).await,
            None => Err(ToolError::NotConfigured),
        }
    }
}
