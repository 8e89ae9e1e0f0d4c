//! Runs untrusted Python programs in a supervised execution host.
//!
//! A [`Supervisor`] starts the host on first use, submits programs one at a
//! time and serves the host's tool calls from a [`ToolRegistry`]. Guest code
//! reaches those tools with `await call_tool(name, args)`.
//!
//! ```no_run
//! # async fn demo() -> tether::Result<()> {
//! use serde_json::json;
//! use tether::{PythonHostConfig, Supervisor, ToolRegistry};
//!
//! let mut tools = ToolRegistry::new();
//! tools
//!     .register_fn("echo", |args: serde_json::Value| async move { Ok(args) })
//!     .expect("echo is not a reserved name");
//!
//! let supervisor = Supervisor::python(PythonHostConfig::default())
//!     .tools(tools)
//!     .build();
//! let output = supervisor
//!     .run("return await call_tool('echo', {'n': 1})", None)
//!     .await?;
//! assert_eq!(output.value, Some(json!({"n": 1})));
//! supervisor.shutdown();
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod factory;
mod observer;
mod supervisor;
mod tools;

pub use config::SupervisorConfig;
pub use error::{Error, Result};
pub use factory::{HostFactory, PythonHostFactory};
pub use observer::{ToolCallEvent, ToolObserver};
pub use supervisor::{Supervisor, SupervisorBuilder};
pub use tether_protocol::{Context, FailureKind, RunOutput};
pub use tether_python::PythonHostConfig;
pub use tools::{DynTool, FnTool, Tool, ToolError, ToolRegistry};
