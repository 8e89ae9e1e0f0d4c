use pyo3::{
    Bound, Py, PyAny, PyErr, PyResult, Python,
    exceptions::{PyModuleNotFoundError, PyRuntimeError, PyTypeError, PyValueError},
    intern,
    types::{PyAnyMethods, PyDict, PyDictMethods, PyTracebackMethods},
};
use tether_protocol::{
    CallId, Context, FailureKind, HostMessage, InitRequest, RunOutput, value::payload_size,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use super::{HostState, Interrupt, NOT_READY, Shared};
use crate::{
    bridge::error_text,
    checks,
    error::{Error, Result},
    handle::BorrowedHandle,
    loader::PackageLoader,
    normalize::Normalizer,
    prelude::{self, GUEST_NAMES},
    serde::PyObjectDeserializer,
};

/// Globals a context snapshot may not replace.
const PROTECTED_GLOBALS: [&str; 5] = [
    "call_tool",
    "ToolError",
    "index_config",
    "__builtins__",
    "__name__",
];

pub(super) enum Job {
    Init(InitRequest),
    Run {
        id: CallId,
        code: String,
        context: Option<Context>,
    },
}

// Marks the host terminated however the interpreter thread ends.
struct TerminateOnExit<'a>(&'a Shared);

impl Drop for TerminateOnExit<'_> {
    fn drop(&mut self) {
        let reason = if std::thread::panicking() {
            "interpreter panicked"
        } else {
            "interpreter exited"
        };
        self.0.terminate(reason);
    }
}

pub(super) fn serve(shared: &Shared, mut jobs: UnboundedReceiver<Job>) {
    let _guard = TerminateOnExit(shared);
    let mut interpreter: Option<Interpreter> = None;

    while let Some(job) = jobs.blocking_recv() {
        match job {
            Job::Init(request) => match Interpreter::init(shared, request) {
                Ok(ready) => {
                    interpreter = Some(ready);
                    shared
                        .status
                        .transition(HostState::Initializing, HostState::Ready);
                    info!("execution host ready");
                    let _ = shared.outbox.send(HostMessage::init_result(Ok(())));
                }
                Err(err) => {
                    warn!(%err, "execution host failed to initialize");
                    if let Error::PythonError {
                        traceback: Some(traceback),
                        ..
                    } = &err
                    {
                        debug!(%traceback, "initialization traceback");
                    }
                    let _ = shared
                        .outbox
                        .send(HostMessage::init_result(Err(err.message())));
                    break;
                }
            },
            Job::Run { id, code, context } => {
                let output = interpreter.as_mut().map_or_else(
                    || RunOutput::failure(NOT_READY),
                    |interpreter| interpreter.run(&code, context),
                );
                // Ready before the result leaves, so the next run is accepted.
                shared.status.transition(HostState::Running, HostState::Ready);
                let _ = shared.outbox.send(HostMessage::run_result(id, output));
            }
        }
    }

    if let Some(interpreter) = interpreter {
        interpreter.close();
    }
}

struct Interpreter {
    namespace: Py<PyDict>,
    event_loop: Py<PyAny>,
    run: Py<PyAny>,
    normalizer: Normalizer,
    loader: PackageLoader,
    max_context_bytes: usize,
    injected: Vec<String>,
}

impl Interpreter {
    fn init(shared: &Shared, request: InitRequest) -> Result<Self> {
        Python::attach(|py| {
            Self::init_in(py, shared, request).map_err(|e| Error::from_pyerr(py, e))
        })
    }

    fn init_in(py: Python<'_>, shared: &Shared, request: InitRequest) -> PyResult<Self> {
        let asyncio = py.import(intern!(py, "asyncio"))?;
        let event_loop = asyncio.call_method0(intern!(py, "new_event_loop"))?;
        asyncio.call_method1(intern!(py, "set_event_loop"), (&event_loop,))?;

        let helpers = PyDict::new(py);
        shared.bridge.install(py, &helpers)?;
        prelude::load(py, &helpers)?;

        let namespace = PyDict::new(py);
        namespace.set_item("__name__", "__main__")?;
        namespace.set_item("__builtins__", py.import(intern!(py, "builtins"))?)?;
        for name in GUEST_NAMES {
            namespace.set_item(name, helper(&helpers, name)?)?;
        }
        let index_config = PyObjectDeserializer::new(py)
            .to_python(request.index_config)
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        namespace.set_item("index_config", index_config)?;

        let flatten = helper(&helpers, "_tether_flatten")?;
        shared.bridge.bind(
            event_loop.clone().unbind(),
            helper(&helpers, "_tether_resolve")?.unbind(),
            Normalizer::new(flatten.clone().unbind()),
        );
        let thread_id: u64 = py
            .import(intern!(py, "threading"))?
            .call_method0(intern!(py, "get_ident"))?
            .extract()?;
        let _ = shared.interrupt.set(Interrupt {
            helper: helper(&helpers, "_tether_interrupt")?.unbind(),
            thread_id,
        });

        Ok(Self {
            namespace: namespace.unbind(),
            event_loop: event_loop.unbind(),
            run: helper(&helpers, "_tether_run")?.unbind(),
            normalizer: Normalizer::new(flatten.unbind()),
            loader: PackageLoader::new(
                shared.config.auto_load.clone(),
                request.package_cache_dir,
            ),
            max_context_bytes: shared.config.max_context_bytes,
            injected: Vec::new(),
        })
    }

    fn run(&mut self, code: &str, context: Option<Context>) -> RunOutput {
        if let Err(violation) = checks::scan(code) {
            debug!(pattern = violation.pattern, "program rejected before execution");
            return RunOutput::categorized(violation.message(), FailureKind::DisallowedApi);
        }
        if let Some(context) = &context {
            let size = payload_size(context);
            if size > self.max_context_bytes {
                return RunOutput::categorized(
                    format!(
                        "context snapshot is {size} bytes, the limit is {} bytes",
                        self.max_context_bytes
                    ),
                    FailureKind::OversizedContext,
                );
            }
        }

        Python::attach(|py| {
            if let Err(err) = self.inject(py, context) {
                return failure(py, &err);
            }

            let mut loaded = None;
            loop {
                let err = match self.execute(py, code) {
                    Ok(result) => return self.finish(&result),
                    Err(err) => err,
                };
                let Some(module) = missing_module(py, &err) else {
                    return failure(py, &err);
                };
                if loaded.is_none() && self.loader.allows(&module) {
                    match self.loader.load(py, &module) {
                        Ok(_) => {
                            info!(%module, "retrying program after loading package");
                            loaded = Some(module);
                            continue;
                        }
                        Err(load_err) => debug!(%module, %load_err, "package load failed"),
                    }
                }
                return RunOutput::categorized(error_text(py, &err), FailureKind::MissingDependency);
            }
        })
    }

    fn inject(&mut self, py: Python<'_>, context: Option<Context>) -> PyResult<()> {
        let namespace = self.namespace.bind(py);
        for key in self.injected.drain(..) {
            if namespace.contains(&key)? {
                namespace.del_item(&key)?;
            }
        }
        let Some(context) = context else {
            return Ok(());
        };
        let deserializer = PyObjectDeserializer::new(py);
        for (key, value) in context {
            if PROTECTED_GLOBALS.contains(&key.as_str()) {
                warn!(%key, "context key shadows a protected global; skipped");
                continue;
            }
            let value = deserializer
                .to_python(value)
                .map_err(|e| PyValueError::new_err(e.to_string()))?;
            namespace.set_item(&key, value)?;
            self.injected.push(key);
        }
        Ok(())
    }

    fn execute<'py>(&self, py: Python<'py>, code: &str) -> PyResult<Bound<'py, PyAny>> {
        let program = self.run.bind(py).call1((code, self.namespace.bind(py)))?;
        self.event_loop
            .bind(py)
            .call_method1(intern!(py, "run_until_complete"), (program,))
    }

    fn finish(&self, result: &Bound<'_, PyAny>) -> RunOutput {
        let normalized = self.normalizer.normalize(BorrowedHandle::new(result));
        let lossy = normalized.is_lossy();
        let mut output = RunOutput::success(normalized.value);
        if lossy {
            output.hint = Some(FailureKind::ValueConversion.hint().to_owned());
        }
        output
    }

    fn close(self) {
        Python::attach(|py| {
            if let Err(err) = self.event_loop.bind(py).call_method0(intern!(py, "close")) {
                debug!(%err, "event loop did not close cleanly");
            }
        });
    }
}

fn helper<'py>(helpers: &Bound<'py, PyDict>, name: &str) -> PyResult<Bound<'py, PyAny>> {
    helpers
        .get_item(name)?
        .ok_or_else(|| PyRuntimeError::new_err(format!("prelude did not define {name}")))
}

/// Name of the module a `ModuleNotFoundError` refers to.
fn missing_module(py: Python<'_>, err: &PyErr) -> Option<String> {
    if !err.is_instance_of::<PyModuleNotFoundError>(py) {
        return None;
    }
    err.value(py)
        .getattr(intern!(py, "name"))
        .ok()
        .and_then(|name| name.extract::<String>().ok())
}

fn failure(py: Python<'_>, err: &PyErr) -> RunOutput {
    if let Some(traceback) = err
        .traceback(py)
        .and_then(|traceback| traceback.format().ok())
    {
        debug!(%traceback, "program raised");
    }
    let message = error_text(py, err);
    match classify(py, err, &message) {
        Some(kind) => RunOutput::categorized(message, kind),
        None => RunOutput::failure(message),
    }
}

fn classify(py: Python<'_>, err: &PyErr, message: &str) -> Option<FailureKind> {
    if err.is_instance_of::<PyRuntimeError>(py) && message.contains("event loop") {
        Some(FailureKind::DisallowedApi)
    } else if err.is_instance_of::<PyTypeError>(py) && message.contains("serializable") {
        Some(FailureKind::ValueConversion)
    } else {
        None
    }
}
