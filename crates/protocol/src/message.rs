use std::{
    fmt,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::failure::RunOutput;

/// Values bound as guest globals before a run.
pub type Context = Map<String, Value>;

/// Tool names that would re-enter code execution from inside a guest program.
pub const RESERVED_TOOL_NAMES: [&str; 2] = ["run", "run_code"];

#[must_use]
pub fn is_reserved_tool(name: &str) -> bool {
    RESERVED_TOOL_NAMES.contains(&name)
}

#[must_use]
pub fn reserved_tool_message(name: &str) -> String {
    format!("tool '{name}' executes code and cannot be called from a running program")
}

/// Correlation id echoed by the responder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-instance id generator. Ids start at 1 and never repeat within an instance.
#[derive(Debug, Default)]
pub struct CallIds(AtomicU64);

impl CallIds {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next(&self) -> CallId {
        CallId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    #[serde(default)]
    pub index_config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_cache_dir: Option<PathBuf>,
}

/// Messages sent from the supervisor to the execution host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SupervisorMessage {
    Init(InitRequest),
    Run {
        id: CallId,
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Context>,
    },
    ToolResult {
        id: CallId,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Reset,
    Shutdown,
}

impl SupervisorMessage {
    #[must_use]
    pub fn tool_result(id: CallId, outcome: Result<Value, String>) -> Self {
        match outcome {
            Ok(value) => Self::ToolResult {
                id,
                ok: true,
                value: Some(value),
                error: None,
            },
            Err(error) => Self::ToolResult {
                id,
                ok: false,
                value: None,
                error: Some(error),
            },
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Run { .. } => "run",
            Self::ToolResult { .. } => "tool_result",
            Self::Reset => "reset",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Messages sent from the execution host to the supervisor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HostMessage {
    InitResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RunResult {
        id: CallId,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
    ToolCall {
        id: CallId,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
    },
}

impl HostMessage {
    #[must_use]
    pub fn init_result(outcome: Result<(), String>) -> Self {
        match outcome {
            Ok(()) => Self::InitResult {
                ok: true,
                error: None,
            },
            Err(error) => Self::InitResult {
                ok: false,
                error: Some(error),
            },
        }
    }

    #[must_use]
    pub fn run_result(id: CallId, output: RunOutput) -> Self {
        Self::RunResult {
            id,
            ok: output.ok,
            value: output.value,
            error: output.error,
            hint: output.hint,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InitResult { .. } => "init_result",
            Self::RunResult { .. } => "run_result",
            Self::ToolCall { .. } => "tool_call",
        }
    }
}
