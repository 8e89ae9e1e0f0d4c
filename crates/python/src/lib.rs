//! Python execution host.
//!
//! Guest programs run in an embedded CPython on a dedicated interpreter thread
//! with a private namespace and asyncio event loop. Tool calls made from guest
//! code travel to the supervisor as [`tether_protocol::HostMessage::ToolCall`]
//! and resume the awaiting guest task when the result comes back.

mod bridge;
pub mod checks;
mod config;
mod error;
pub mod handle;
mod host;
mod loader;
pub mod normalize;
mod prelude;
pub mod serde;

pub use bridge::ToolError;
pub use config::{DEFAULT_AUTO_LOAD, PythonHostConfig};
pub use error::{Error, Result};
pub use host::PythonHost;
pub use loader::PackageLoader;
