use std::{cell::RefCell, fmt};

use base64::Engine as _;
use pyo3::{
    Bound, IntoPyObjectExt, Py, PyAny, PyTypeInfo, Python,
    types::{
        PyAnyMethods, PyBool, PyBoolMethods, PyByteArray, PyByteArrayMethods, PyBytes,
        PyBytesMethods, PyDict, PyDictMethods, PyFloat, PyFloatMethods, PyInt, PyList,
        PyListMethods, PyString, PyStringMethods, PyTuple, PyTupleMethods,
    },
};
use serde::{
    Serialize, Serializer,
    de::{DeserializeSeed, Visitor},
    ser::{Error as _, SerializeMap, SerializeSeq},
};
use serde_json::Value;
use smallvec::SmallVec;
use tether_protocol::value::MAX_DEPTH;

/// How [`PyObjectSerializer`] treats objects that have no JSON counterpart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Fail on the first unsupported object.
    Strict,
    /// Substitute an approximation and keep going.
    Lenient,
}

/// Convert a guest object into JSON.
///
/// Only exact builtin containers and scalars are walked; no guest code runs in
/// [`Mode::Strict`]. Lenient mode may call `repr` on leftovers.
///
/// # Errors
/// In strict mode, fails on unsupported types, non-finite floats, integers
/// outside the 64-bit range, cycles and nesting deeper than [`MAX_DEPTH`].
pub fn to_json(object: &Bound<'_, PyAny>, mode: Mode) -> Result<Value, serde_json::Error> {
    let walk = Walk {
        mode,
        path: RefCell::new(SmallVec::new()),
    };
    serde_json::to_value(PyObjectSerializer {
        object,
        depth: 0,
        walk: &walk,
    })
}

struct Walk {
    mode: Mode,
    // Ids of the containers between the root and the current object.
    path: RefCell<SmallVec<[usize; 16]>>,
}

impl Walk {
    fn lenient(&self) -> bool {
        self.mode == Mode::Lenient
    }
}

pub struct PyObjectSerializer<'a, 'py> {
    object: &'a Bound<'py, PyAny>,
    depth: usize,
    walk: &'a Walk,
}

impl<'py> PyObjectSerializer<'_, 'py> {
    fn child<'b>(&'b self, object: &'b Bound<'py, PyAny>) -> PyObjectSerializer<'b, 'py> {
        PyObjectSerializer {
            object,
            depth: self.depth + 1,
            walk: self.walk,
        }
    }

    fn is_container(&self) -> bool {
        let object = self.object;
        if PyDict::is_exact_type_of(object)
            || PyList::is_exact_type_of(object)
            || PyTuple::is_exact_type_of(object)
        {
            return true;
        }
        self.walk.lenient()
            && (PyDict::is_type_of(object)
                || PyList::is_type_of(object)
                || PyTuple::is_type_of(object))
    }

    fn serialize_container<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let lenient = self.walk.lenient();
        if let Ok(dict) = self.object.cast::<PyDict>() {
            let mut map = serializer.serialize_map(if lenient { None } else { Some(dict.len()) })?;
            for (key, value) in dict {
                if lenient && value.is_callable() {
                    continue;
                }
                let Some(key) = self.map_key(&key).map_err(S::Error::custom)? else {
                    continue;
                };
                map.serialize_entry(&key, &self.child(&value))?;
            }
            map.end()
        } else if let Ok(list) = self.object.cast::<PyList>() {
            let mut seq = serializer.serialize_seq(Some(list.len()))?;
            for elem in list {
                seq.serialize_element(&self.child(&elem))?;
            }
            seq.end()
        } else if let Ok(tuple) = self.object.cast::<PyTuple>() {
            let mut seq = serializer.serialize_seq(Some(tuple.len()))?;
            for elem in tuple {
                seq.serialize_element(&self.child(&elem))?;
            }
            seq.end()
        } else {
            Err(S::Error::custom("not a container"))
        }
    }

    /// Object keys follow the `json` module: scalars become their JSON text.
    fn map_key(&self, key: &Bound<'py, PyAny>) -> Result<Option<String>, String> {
        if let Ok(s) = key.cast::<PyString>() {
            return s.to_cow().map(|s| Some(s.into_owned())).map_err(|e| e.to_string());
        }
        if let Ok(b) = key.cast::<PyBool>() {
            return Ok(Some(if b.is_true() { "true" } else { "false" }.to_owned()));
        }
        if key.is_none() {
            return Ok(Some("null".to_owned()));
        }
        if PyInt::is_type_of(key) || PyFloat::is_type_of(key) {
            return key
                .str()
                .and_then(|s| s.to_cow().map(|s| Some(s.into_owned())))
                .map_err(|e| e.to_string());
        }
        if self.walk.lenient() {
            return Ok(key
                .repr()
                .ok()
                .and_then(|s| s.to_cow().ok().map(|s| s.into_owned())));
        }
        Err(format!(
            "keys must be str, int, float, bool or None, not '{}'",
            type_name(key)
        ))
    }

    fn serialize_int<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if let Ok(i) = self.object.extract::<i64>() {
            serializer.serialize_i64(i)
        } else if let Ok(i) = self.object.extract::<u64>() {
            serializer.serialize_u64(i)
        } else if self.walk.lenient() {
            let text = self.object.str().map_err(S::Error::custom)?;
            serializer.serialize_str(&text.to_cow().map_err(S::Error::custom)?)
        } else {
            Err(S::Error::custom(format!(
                "object of type '{}' does not fit into an integer",
                type_name(self.object)
            )))
        }
    }

    fn serialize_float<S: Serializer>(&self, value: f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(value)
        } else if self.walk.lenient() {
            serializer.serialize_str(if value.is_nan() {
                "nan"
            } else if value.is_sign_positive() {
                "inf"
            } else {
                "-inf"
            })
        } else {
            Err(S::Error::custom(format!("float value {value} is not JSON compliant")))
        }
    }

    /// Lenient rendering of anything that is not a builtin scalar or container.
    fn serialize_loose<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let object = self.object;
        if PyInt::is_type_of(object) {
            self.serialize_int(serializer)
        } else if let Ok(f) = object.cast::<PyFloat>() {
            self.serialize_float(f.value(), serializer)
        } else if let Ok(s) = object.cast::<PyString>() {
            serializer.serialize_str(&s.to_cow().map_err(S::Error::custom)?)
        } else if let Ok(b) = object.cast::<PyBytes>() {
            serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(b.as_bytes()))
        } else if let Ok(b) = object.cast::<PyByteArray>() {
            serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(b.to_vec()))
        } else if object.is_callable() {
            serializer.serialize_unit()
        } else {
            match object.repr().and_then(|s| s.to_cow().map(|s| s.into_owned())) {
                Ok(text) => serializer.serialize_str(&text),
                Err(_) => serializer.serialize_unit(),
            }
        }
    }
}

impl Serialize for PyObjectSerializer<'_, '_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let object = self.object;
        if object.is_none() {
            return serializer.serialize_unit();
        }
        if let Ok(b) = object.cast_exact::<PyBool>() {
            return serializer.serialize_bool(b.is_true());
        }
        if PyInt::is_exact_type_of(object) {
            return self.serialize_int(serializer);
        }
        if let Ok(f) = object.cast_exact::<PyFloat>() {
            return self.serialize_float(f.value(), serializer);
        }
        if let Ok(s) = object.cast_exact::<PyString>() {
            return serializer.serialize_str(&s.to_cow().map_err(S::Error::custom)?);
        }

        if self.is_container() {
            let lenient = self.walk.lenient();
            if self.depth >= MAX_DEPTH {
                return if lenient {
                    serializer.serialize_unit()
                } else {
                    Err(S::Error::custom("maximum serialization depth exceeded"))
                };
            }
            let id = object.as_ptr() as usize;
            if self.walk.path.borrow().contains(&id) {
                return if lenient {
                    serializer.serialize_unit()
                } else {
                    Err(S::Error::custom("circular reference detected"))
                };
            }
            self.walk.path.borrow_mut().push(id);
            let result = self.serialize_container(serializer);
            self.walk.path.borrow_mut().pop();
            return result;
        }

        if self.walk.lenient() {
            self.serialize_loose(serializer)
        } else {
            Err(S::Error::custom(format!(
                "object of type '{}' is not JSON serializable",
                type_name(object)
            )))
        }
    }
}

fn type_name(object: &Bound<'_, PyAny>) -> String {
    object.get_type().to_string()
}

/// Builds guest objects from JSON.
pub struct PyObjectDeserializer<'py> {
    py: Python<'py>,
}

impl<'py> PyObjectDeserializer<'py> {
    #[must_use]
    pub const fn new(py: Python<'py>) -> Self {
        Self { py }
    }

    /// # Errors
    /// Fails only if the interpreter cannot allocate the objects.
    pub fn to_python(&self, value: Value) -> Result<Bound<'py, PyAny>, serde_json::Error> {
        self.deserialize(value).map(|object| object.into_bound(self.py))
    }
}

impl<'de> DeserializeSeed<'de> for &PyObjectDeserializer<'_> {
    type Value = Py<PyAny>;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for &PyObjectDeserializer<'_> {
    type Value = Py<PyAny>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a JSON value")
    }

    fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.into_py_any(self.py).map_err(E::custom)
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.into_py_any(self.py).map_err(E::custom)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.into_py_any(self.py).map_err(E::custom)
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.into_py_any(self.py).map_err(E::custom)
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.into_py_any(self.py).map_err(E::custom)
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(self.py.None())
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(self.py.None())
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        self.deserialize(deserializer)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        use serde::de::Error;

        let mut elems = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(elem) = seq.next_element_seed(self)? {
            elems.push(elem);
        }
        PyList::new(self.py, elems)
            .map(|list| list.into_any().unbind())
            .map_err(A::Error::custom)
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::MapAccess<'de>,
    {
        use serde::de::Error;

        let dict = PyDict::new(self.py);
        while let Some((key, value)) = map.next_entry_seed(self, self)? {
            dict.set_item(key, value).map_err(A::Error::custom)?;
        }
        Ok(dict.into_any().unbind())
    }
}
