use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recognized failure categories of a guest run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DisallowedApi,
    MissingDependency,
    ValueConversion,
    OversizedContext,
}

impl FailureKind {
    /// Remediation text attached to a failed [`RunOutput`].
    #[must_use]
    pub const fn hint(self) -> &'static str {
        match self {
            Self::DisallowedApi => {
                "Programs already run inside an event loop: use top-level `await` instead of \
                 starting or blocking on a loop, and do not install packages at run time."
            }
            Self::MissingDependency => {
                "Only preinstalled packages and the auto-load allow-list are importable; fetch \
                 the data through call_tool instead."
            }
            Self::ValueConversion => {
                "Return plain data (dict, list, str, int, float, bool, None); convert library \
                 objects with .tolist(), .to_dict() or str() first."
            }
            Self::OversizedContext => {
                "Context values are for small constants; expose larger data through a tool and \
                 read it with call_tool."
            }
        }
    }
}

/// Outcome of one guest run as seen by the caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl RunOutput {
    #[must_use]
    pub fn success(value: Value) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
            hint: None,
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(error.into()),
            hint: None,
        }
    }

    #[must_use]
    pub fn categorized(error: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            hint: Some(kind.hint().to_owned()),
            ..Self::failure(error)
        }
    }

    /// The returned value, with an absent value read as `null`.
    #[must_use]
    pub fn value_or_null(&self) -> &Value {
        self.value.as_ref().unwrap_or(&Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn categorized_failures_carry_hint() {
        let output = RunOutput::categorized("No module named 'polars'", FailureKind::MissingDependency);
        assert!(!output.ok);
        assert_eq!(output.hint.as_deref(), Some(FailureKind::MissingDependency.hint()));
        assert_eq!(output.value_or_null(), &Value::Null);
    }

    #[test]
    fn success_omits_error_fields() {
        let output = RunOutput::success(json!({"a": [1, 2, 3]}));
        assert_eq!(
            serde_json::to_value(&output).unwrap(),
            json!({"ok": true, "value": {"a": [1, 2, 3]}})
        );
    }
}
