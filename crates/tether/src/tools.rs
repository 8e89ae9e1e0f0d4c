//! Host operations callable from guest programs through `call_tool`.

use std::{collections::HashMap, fmt, future::Future, marker::PhantomData, sync::Arc};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tether_protocol::{is_reserved_tool, reserved_tool_message};

/// Failure of a single tool call. The display text is what the guest sees as
/// the `ToolError` message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool handler not configured")]
    NotConfigured,

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("{}", reserved_tool_message(.0))]
    Reserved(String),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// A typed tool. Arguments arrive as the JSON object the guest passed and are
/// deserialized into [`Tool::Args`] before [`Tool::call`] runs; a call without
/// arguments is read as `{}`.
#[async_trait::async_trait]
pub trait Tool: Send + Sync + 'static {
    const NAME: &'static str;
    type Args: DeserializeOwned + Send;

    async fn call(&self, args: Self::Args) -> core::result::Result<Value, ToolError>;
}

/// Type-erased tool as stored in a [`ToolRegistry`].
#[async_trait::async_trait]
pub trait DynTool: Send + Sync + 'static {
    async fn call_json(&self, args: Option<Value>) -> core::result::Result<Value, ToolError>;
}

fn parse_args<A: DeserializeOwned>(tool: &str, args: Option<Value>) -> Result<A, ToolError> {
    let args = args.unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::from_value(args).map_err(|err| ToolError::InvalidArguments {
        tool: tool.to_owned(),
        reason: err.to_string(),
    })
}

struct Typed<T>(T);

#[async_trait::async_trait]
impl<T: Tool> DynTool for Typed<T> {
    async fn call_json(&self, args: Option<Value>) -> core::result::Result<Value, ToolError> {
        let args = parse_args::<T::Args>(T::NAME, args)?;
        self.0.call(args).await
    }
}

/// A tool backed by an async closure.
pub struct FnTool<A, F> {
    name: String,
    f: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F> FnTool<A, F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            _args: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<A, F, Fut> DynTool for FnTool<A, F>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = core::result::Result<Value, ToolError>> + Send + 'static,
{
    async fn call_json(&self, args: Option<Value>) -> core::result::Result<Value, ToolError> {
        let args = parse_args::<A>(&self.name, args)?;
        (self.f)(args).await
    }
}

/// Name-indexed tool table.
///
/// A name may be declared without a handler; calling it fails with
/// [`ToolError::NotConfigured`] rather than [`ToolError::UnknownTool`].
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Option<Arc<dyn DynTool>>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`ToolError::Reserved`] for the run-code names.
    pub fn register<T: Tool>(&mut self, tool: T) -> Result<(), ToolError> {
        self.insert(T::NAME, Some(Arc::new(Typed(tool))))
    }

    /// # Errors
    /// Returns [`ToolError::Reserved`] for the run-code names.
    pub fn register_fn<A, F, Fut>(&mut self, name: &str, f: F) -> Result<(), ToolError>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = core::result::Result<Value, ToolError>> + Send + 'static,
    {
        self.insert(name, Some(Arc::new(FnTool::new(name, f))))
    }

    /// # Errors
    /// Returns [`ToolError::Reserved`] for the run-code names.
    pub fn register_dyn(&mut self, name: &str, tool: Arc<dyn DynTool>) -> Result<(), ToolError> {
        self.insert(name, Some(tool))
    }

    /// Make `name` known without a handler.
    ///
    /// # Errors
    /// Returns [`ToolError::Reserved`] for the run-code names.
    pub fn declare(&mut self, name: &str) -> Result<(), ToolError> {
        self.insert(name, None)
    }

    fn insert(&mut self, name: &str, tool: Option<Arc<dyn DynTool>>) -> Result<(), ToolError> {
        if is_reserved_tool(name) {
            return Err(ToolError::Reserved(name.to_owned()));
        }
        self.tools.insert(name.to_owned(), tool);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run the tool registered under `name`.
    ///
    /// # Errors
    /// Returns the tool's own error, or why it could not be called.
    pub async fn call(&self, name: &str, args: Option<Value>) -> core::result::Result<Value, ToolError> {
        if is_reserved_tool(name) {
            return Err(ToolError::Reserved(name.to_owned()));
        }
        match self.tools.get(name) {
            None => Err(ToolError::UnknownTool(name.to_owned())),
            Some(None) => Err(ToolError::NotConfigured),
            Some(Some(tool)) => tool.call_json(args).await,
        }
    }
}
