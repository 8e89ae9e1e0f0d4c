//! Transportability checks for JSON values crossing the host boundary.

use serde::Serialize;
use serde_json::Value;

/// Deepest container nesting a value may carry across the boundary.
pub const MAX_DEPTH: usize = 128;

/// Default bound on the serialized size of a context snapshot.
pub const MAX_CONTEXT_BYTES: usize = 8 * 1024;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    #[error("value nests {0} levels deep, the limit is {MAX_DEPTH}")]
    TooDeep(usize),
    #[error("value is not serializable")]
    Unserializable,
}

/// Container nesting depth; scalars have depth 0.
#[must_use]
pub fn depth(value: &Value) -> usize {
    let mut deepest = 0;
    let mut stack = vec![(value, 0usize)];
    while let Some((value, level)) = stack.pop() {
        match value {
            Value::Array(items) => {
                deepest = deepest.max(level + 1);
                stack.extend(items.iter().map(|child| (child, level + 1)));
            }
            Value::Object(map) => {
                deepest = deepest.max(level + 1);
                stack.extend(map.values().map(|child| (child, level + 1)));
            }
            _ => {}
        }
    }
    deepest
}

/// Check that `value` serializes and stays within [`MAX_DEPTH`].
///
/// # Errors
/// Returns the first violated bound.
pub fn probe(value: &Value) -> Result<(), ProbeError> {
    let depth = depth(value);
    if depth > MAX_DEPTH {
        return Err(ProbeError::TooDeep(depth));
    }
    serde_json::to_vec(value)
        .map(drop)
        .map_err(|_| ProbeError::Unserializable)
}

/// Replace every member nested deeper than [`MAX_DEPTH`] with `null`.
///
/// Returns whether anything was replaced.
pub fn clamp_depth(value: &mut Value) -> bool {
    fn clamp(value: &mut Value, level: usize) -> bool {
        match value {
            Value::Array(_) | Value::Object(_) if level >= MAX_DEPTH => {
                *value = Value::Null;
                true
            }
            Value::Array(items) => items
                .iter_mut()
                .fold(false, |clamped, item| clamp(item, level + 1) | clamped),
            Value::Object(map) => map
                .values_mut()
                .fold(false, |clamped, item| clamp(item, level + 1) | clamped),
            _ => false,
        }
    }
    clamp(value, 0)
}

/// Serialized size in bytes.
#[must_use]
pub fn payload_size<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value).map_or(0, |bytes| bytes.len())
}
