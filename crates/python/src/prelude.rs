use std::ffi::CString;

use pyo3::{
    Bound, PyResult, Python,
    exceptions::PyValueError,
    types::{PyDict, PyDictMethods},
};

use crate::bridge::ToolError;

const SOURCE: &str = include_str!("prelude.py");

/// Evaluate the guest-side helpers into `helpers`.
///
/// `ToolError` is bound first; `_tether_bridge_call` is looked up lazily so it
/// may be bound before or after.
pub fn load(py: Python<'_>, helpers: &Bound<'_, PyDict>) -> PyResult<()> {
    helpers.set_item("ToolError", py.get_type::<ToolError>())?;
    if !helpers.contains("__name__")? {
        helpers.set_item("__name__", "_tether_prelude")?;
    }
    let source = CString::new(SOURCE).map_err(|e| PyValueError::new_err(e.to_string()))?;
    py.run(&source, Some(helpers), None)
}

/// Names defined by the prelude that guest code may use.
pub const GUEST_NAMES: [&str; 2] = ["call_tool", "ToolError"];
