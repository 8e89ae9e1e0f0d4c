use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::warn;

/// One routed tool call, reported after its reply has been queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallEvent {
    pub name: String,
    pub args_byte_size: usize,
    pub duration_ms: u64,
    pub ok: bool,
    pub error: Option<String>,
}

/// Receives a [`ToolCallEvent`] per tool call. Called synchronously on the
/// task that served the call; keep it cheap.
pub trait ToolObserver: Send + Sync + 'static {
    fn on_tool_call(&self, event: &ToolCallEvent);
}

impl<F> ToolObserver for F
where
    F: Fn(&ToolCallEvent) + Send + Sync + 'static,
{
    fn on_tool_call(&self, event: &ToolCallEvent) {
        self(event);
    }
}

/// Invoke `observer`, containing any panic.
pub(crate) fn notify(observer: &dyn ToolObserver, event: &ToolCallEvent) {
    if catch_unwind(AssertUnwindSafe(|| observer.on_tool_call(event))).is_err() {
        warn!(tool = %event.name, "tool observer panicked");
    }
}
