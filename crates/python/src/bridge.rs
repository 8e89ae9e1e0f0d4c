//! Guest side of the tool bridge.
//!
//! `call_tool` hands the guest an asyncio future registered under a fresh
//! [`CallId`] before the `ToolCall` leaves. The dispatcher thread resolves it
//! through `loop.call_soon_threadsafe` when the matching `ToolResult` arrives,
//! so only the awaiting guest task is suspended.

use std::sync::{Arc, OnceLock};

use pyo3::{
    Bound, Py, PyAny, PyErr, PyResult, Python, create_exception,
    exceptions::{PyException, PyRuntimeError},
    intern,
    types::{PyAnyMethods, PyCFunction, PyDict, PyDictMethods, PyTuple, PyTupleMethods},
};
use serde_json::Value;
use tether_protocol::{
    CallId, CallIds, Error as ProtocolError, HostMessage, PendingCalls, is_reserved_tool,
    reserved_tool_message, value::clamp_depth,
};
use tracing::{debug, warn};

use crate::{
    handle::{BorrowedHandle, OwnedHandle},
    host::Outbox,
    normalize::Normalizer,
    serde::PyObjectDeserializer,
};

create_exception!(
    tether,
    ToolError,
    PyException,
    "Raised in guest code when a tool call fails."
);

pub struct Bridge {
    pending: PendingCalls<OwnedHandle>,
    ids: CallIds,
    outbox: Arc<Outbox>,
    attached: OnceLock<Attached>,
}

// Interpreter objects the bridge needs once the prelude has run.
struct Attached {
    event_loop: Py<PyAny>,
    resolve: Py<PyAny>,
    normalizer: Normalizer,
}

impl Bridge {
    pub fn new(outbox: Arc<Outbox>) -> Self {
        Self {
            pending: PendingCalls::new(),
            ids: CallIds::new(),
            outbox,
            attached: OnceLock::new(),
        }
    }

    /// Bind `_tether_bridge_call` into `helpers`.
    pub fn install(self: &Arc<Self>, py: Python<'_>, helpers: &Bound<'_, PyDict>) -> PyResult<()> {
        let bridge = Arc::clone(self);
        let entry = PyCFunction::new_closure(
            py,
            Some(c"_tether_bridge_call"),
            None,
            move |args: &Bound<'_, PyTuple>, _kwargs: Option<&Bound<'_, PyDict>>| {
                let name: String = args.get_item(0)?.extract()?;
                let call_args = args.get_item(1).ok().filter(|a| !a.is_none());
                bridge.call(args.py(), &name, call_args.as_ref())
            },
        )?;
        helpers.set_item("_tether_bridge_call", entry)
    }

    /// Attach the event loop and helpers created during init. Later calls are ignored.
    pub fn bind(&self, event_loop: Py<PyAny>, resolve: Py<PyAny>, normalizer: Normalizer) {
        let _ = self.attached.set(Attached {
            event_loop,
            resolve,
            normalizer,
        });
    }

    fn attached(&self) -> PyResult<&Attached> {
        self.attached
            .get()
            .ok_or_else(|| PyRuntimeError::new_err("tool bridge is not initialized"))
    }

    fn call(
        &self,
        py: Python<'_>,
        name: &str,
        args: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<Py<PyAny>> {
        if is_reserved_tool(name) {
            return Err(ToolError::new_err(reserved_tool_message(name)));
        }
        let attached = self.attached()?;
        let args = args.map(|args| normalize_arguments(&attached.normalizer, BorrowedHandle::new(args)));

        let future = attached
            .event_loop
            .bind(py)
            .call_method0(intern!(py, "create_future"))?;
        let guest_future = future.clone().unbind();
        let id = self.ids.next();
        if let Err(future) = self.pending.insert(id, OwnedHandle::adopt(future)) {
            future.release(py);
            return Err(ToolError::new_err(ProtocolError::TornDown.to_string()));
        }

        debug!(%id, tool = name, "tool call");
        let message = HostMessage::ToolCall {
            id,
            name: name.to_owned(),
            args,
        };
        if let Err(err) = self.outbox.send(message) {
            if let Some(future) = self.pending.take(id) {
                future.release(py);
            }
            return Err(ToolError::new_err(err.to_string()));
        }
        Ok(guest_future)
    }

    /// Complete the guest future registered under `id`.
    pub fn resolve(&self, id: CallId, outcome: Result<Value, String>) {
        let Some(future) = self.pending.take(id) else {
            warn!(%id, "tool result for unknown call");
            return;
        };
        Python::attach(|py| {
            if let Err(err) = self.schedule(py, future.bind(py), outcome) {
                warn!(%id, %err, "failed to resume guest task");
            }
            future.release(py);
        });
    }

    /// Fail every outstanding call and refuse new ones.
    pub fn close(&self) {
        let drained = self.pending.close();
        if drained.is_empty() {
            return;
        }
        debug!(count = drained.len(), "failing outstanding tool calls");
        Python::attach(|py| {
            for (id, future) in drained {
                let outcome = Err(ProtocolError::TornDown.to_string());
                if let Err(err) = self.schedule(py, future.bind(py), outcome) {
                    debug!(%id, %err, "failed to fail guest task");
                }
                future.release(py);
            }
        });
    }

    fn schedule(
        &self,
        py: Python<'_>,
        future: &Bound<'_, PyAny>,
        outcome: Result<Value, String>,
    ) -> PyResult<()> {
        let attached = self.attached()?;
        let (ok, value, error) = match outcome {
            Ok(mut value) => {
                if clamp_depth(&mut value) {
                    debug!("tool result exceeded nesting bound");
                }
                match PyObjectDeserializer::new(py).to_python(value) {
                    Ok(value) => (true, value.unbind(), None),
                    Err(err) => (
                        false,
                        py.None(),
                        Some(format!("tool result could not be converted: {err}")),
                    ),
                }
            }
            Err(error) => (false, py.None(), Some(error)),
        };
        attached.event_loop.bind(py).call_method1(
            intern!(py, "call_soon_threadsafe"),
            (&attached.resolve, future, ok, value, error),
        )?;
        Ok(())
    }
}

/// Normalize tool-call arguments through an owned handle that is always released.
pub fn normalize_arguments(normalizer: &Normalizer, args: BorrowedHandle<'_, '_>) -> Value {
    let py = args.py();
    let owned = args.clone_owned();
    let normalized = normalizer.normalize(owned.borrow(py));
    owned.release(py);
    normalized.value
}

/// Text of a guest error as reported to the supervisor.
///
/// A [`ToolError`] carries the tool's own message verbatim.
pub fn error_text(py: Python<'_>, err: &PyErr) -> String {
    if err.is_instance_of::<ToolError>(py)
        && let Ok(text) = err.value(py).str()
    {
        return text.to_string();
    }
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude;

    #[test]
    fn argument_normalization_keeps_refcounts() {
        Python::initialize();
        Python::attach(|py| {
            let helpers = PyDict::new(py);
            prelude::load(py, &helpers).unwrap();
            let flatten = helpers.get_item("_tether_flatten").unwrap().unwrap();
            let normalizer = Normalizer::new(flatten.unbind());

            let args = py
                .eval(c"{'when': __import__('datetime').date(2024, 3, 1), 'ids': {5}}", None, None)
                .unwrap();
            let baseline = args.get_refcnt();
            let value = normalize_arguments(&normalizer, BorrowedHandle::new(&args));
            assert_eq!(value, serde_json::json!({"when": "2024-03-01", "ids": [5]}));
            assert_eq!(args.get_refcnt(), baseline);
        });
    }

    #[test]
    fn tool_errors_report_their_message_verbatim() {
        Python::initialize();
        Python::attach(|py| {
            let err = ToolError::new_err("tool handler not configured");
            assert_eq!(error_text(py, &err), "tool handler not configured");

            let err = PyRuntimeError::new_err("boom");
            assert_eq!(error_text(py, &err), "RuntimeError: boom");
        });
    }
}
