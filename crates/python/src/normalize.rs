use pyo3::{Py, PyAny, types::PyAnyMethods};
use serde_json::Value;
use tether_protocol::value::probe;
use tracing::debug;

use crate::{
    handle::{BorrowedHandle, OwnedHandle},
    serde::{Mode, to_json},
};

/// How closely a normalized value matches the object it came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fidelity {
    /// Plain data, converted as is.
    Native,
    /// Converted after the guest-side flatten helper turned it into plain data.
    Flattened,
    /// Unsupported members were replaced by approximations.
    Reconstructed,
    /// Nothing usable was left; the value is `null`.
    Empty,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Normalized {
    pub value: Value,
    pub fidelity: Fidelity,
}

impl Normalized {
    const fn new(value: Value, fidelity: Fidelity) -> Self {
        Self { value, fidelity }
    }

    #[must_use]
    pub const fn is_lossy(&self) -> bool {
        matches!(self.fidelity, Fidelity::Reconstructed | Fidelity::Empty)
    }
}

/// Turns any guest object into a transportable JSON value. Never fails.
#[derive(Debug)]
pub struct Normalizer {
    flatten: Py<PyAny>,
}

impl Normalizer {
    /// `flatten` is the prelude's `_tether_flatten`.
    #[must_use]
    pub const fn new(flatten: Py<PyAny>) -> Self {
        Self { flatten }
    }

    pub fn normalize(&self, object: BorrowedHandle<'_, '_>) -> Normalized {
        let py = object.py();
        let native = match transportable(to_json(object.get(), Mode::Strict)) {
            Ok(value) => return Normalized::new(value, Fidelity::Native),
            Err(err) => err,
        };
        debug!(%native, "native conversion failed; flattening");

        let flattened = match self.flatten.bind(py).call1((object.get(),)) {
            Ok(flat) => Some(OwnedHandle::adopt(flat)),
            Err(err) => {
                debug!(%err, "flatten helper raised");
                None
            }
        };
        let source = flattened
            .as_ref()
            .map_or(object, |flat| flat.borrow(py));

        let flattened_value = flattened
            .as_ref()
            .and_then(|_| transportable(to_json(source.get(), Mode::Strict)).ok());
        let normalized = if let Some(value) = flattened_value {
            Normalized::new(value, Fidelity::Flattened)
        } else {
            match transportable(to_json(source.get(), Mode::Lenient)) {
                Ok(value) => Normalized::new(value, Fidelity::Reconstructed),
                Err(err) => {
                    debug!(%err, "reconstruction failed");
                    Normalized::new(Value::Null, Fidelity::Empty)
                }
            }
        };
        if let Some(flat) = flattened {
            flat.release(py);
        }

        if normalized.is_lossy() {
            debug!(fidelity = ?normalized.fidelity, "lossy normalization");
        }
        normalized
    }
}

fn transportable(result: Result<Value, serde_json::Error>) -> Result<Value, String> {
    let value = result.map_err(|e| e.to_string())?;
    probe(&value).map_err(|e| e.to_string())?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use pyo3::{
        Bound, Python,
        types::{PyDict, PyDictMethods},
    };
    use serde_json::json;

    use super::*;
    use crate::prelude;

    fn with_normalizer(f: impl for<'py> FnOnce(Python<'py>, &Bound<'py, PyDict>, &Normalizer)) {
        Python::initialize();
        Python::attach(|py| {
            let helpers = PyDict::new(py);
            prelude::load(py, &helpers).unwrap();
            let flatten = helpers.get_item("_tether_flatten").unwrap().unwrap();
            let normalizer = Normalizer::new(flatten.unbind());
            f(py, &helpers, &normalizer);
        });
    }

    fn eval<'py>(py: Python<'py>, helpers: &Bound<'py, PyDict>, code: &str) -> Bound<'py, PyAny> {
        let code = CString::new(code).unwrap();
        py.eval(&code, Some(helpers), None).unwrap()
    }

    fn run(py: Python<'_>, helpers: &Bound<'_, PyDict>, code: &str) {
        let code = CString::new(code).unwrap();
        py.run(&code, Some(helpers), None).unwrap();
    }

    #[test]
    fn plain_data_is_native() {
        with_normalizer(|py, helpers, normalizer| {
            let object = eval(py, helpers, "{'a': [1, 2, 3], 'b': (None, 'x')}");
            let normalized = normalizer.normalize(BorrowedHandle::new(&object));
            assert_eq!(normalized.fidelity, Fidelity::Native);
            assert_eq!(normalized.value, json!({"a": [1, 2, 3], "b": [null, "x"]}));
        });
    }

    #[test]
    fn library_shapes_are_flattened() {
        with_normalizer(|py, helpers, normalizer| {
            run(
                py,
                helpers,
                r"
import collections, dataclasses, datetime, enum

class Color(enum.Enum):
    RED = 'red'

@dataclasses.dataclass
class Point:
    x: int
    y: int

Pair = collections.namedtuple('Pair', 'left right')

sample = {
    'range': range(3),
    'set': {7},
    'point': Point(1, 2),
    'pair': Pair('l', 'r'),
    'color': Color.RED,
    'when': datetime.date(2024, 1, 2),
    'gen': (i * i for i in range(3)),
    'bytes': b'abc',
}
",
            );
            let object = eval(py, helpers, "sample");
            let normalized = normalizer.normalize(BorrowedHandle::new(&object));
            assert_eq!(normalized.fidelity, Fidelity::Flattened);
            assert_eq!(
                normalized.value,
                json!({
                    "range": [0, 1, 2],
                    "set": [7],
                    "point": {"x": 1, "y": 2},
                    "pair": {"left": "l", "right": "r"},
                    "color": "red",
                    "when": "2024-01-02",
                    "gen": [0, 1, 4],
                    "bytes": "abc",
                })
            );
        });
    }

    #[test]
    fn scalar_subclasses_are_exact_without_a_lossy_label() {
        with_normalizer(|py, helpers, normalizer| {
            run(
                py,
                helpers,
                r"
import enum

class Meters(float):
    pass

class Count(int):
    pass

class Label(str):
    def __str__(self):
        return 'shadowed'

class Tag(str, enum.Enum):
    HOT = 'hot'

scalars = {
    'meters': Meters(1.5),
    'count': Count(3),
    'label': Label('plain'),
    'tag': Tag.HOT,
    Label('key'): [Count(1), Meters(2.5)],
}
",
            );
            let object = eval(py, helpers, "scalars");
            let normalized = normalizer.normalize(BorrowedHandle::new(&object));
            assert_eq!(normalized.fidelity, Fidelity::Flattened);
            assert!(!normalized.is_lossy());
            assert_eq!(
                normalized.value,
                json!({
                    "meters": 1.5,
                    "count": 3,
                    "label": "plain",
                    "tag": "hot",
                    "key": [1, 2.5],
                })
            );
        });
    }

    #[test]
    fn cyclic_and_non_data_members_are_approximated() {
        with_normalizer(|py, helpers, normalizer| {
            run(
                py,
                helpers,
                r"
class Node:
    def __init__(self):
        self.name = 'n'
        self.weight = float('inf')
        self.me = self

cyclic = [1]
cyclic.append(cyclic)
awkward = {'node': Node(), 'cyclic': cyclic, 'fn': print}
",
            );
            let object = eval(py, helpers, "awkward");
            let normalized = normalizer.normalize(BorrowedHandle::new(&object));
            assert!(normalized.is_lossy());
            assert_eq!(
                normalized.value,
                json!({
                    "node": {"name": "n", "weight": "inf", "me": null},
                    "cyclic": [1, null],
                    "fn": null,
                })
            );
            assert_eq!(probe(&normalized.value), Ok(()));
        });
    }

    #[test]
    fn flatten_result_is_released_once() {
        Python::initialize();
        Python::attach(|py| {
            let helpers = PyDict::new(py);
            run(py, &helpers, "keep = [1, 2]\nflatten = lambda obj: keep");
            let keep = eval(py, &helpers, "keep");
            let flatten = eval(py, &helpers, "flatten");
            let normalizer = Normalizer::new(flatten.unbind());

            let object = eval(py, &helpers, "{3, 4}");
            let baseline = keep.get_refcnt();
            let normalized = normalizer.normalize(BorrowedHandle::new(&object));
            assert_eq!(normalized.fidelity, Fidelity::Flattened);
            assert_eq!(normalized.value, json!([1, 2]));
            assert_eq!(keep.get_refcnt(), baseline);
        });
    }
}
