//! Wire protocol shared by the supervisor and the execution host.
//!
//! The two sides never share memory: every interaction is a [`SupervisorMessage`]
//! or a [`HostMessage`] travelling over the ordered channel pair created by
//! [`link`]. Requests that expect a reply carry a [`CallId`] generated by the
//! sender; the waiting side parks a waiter in its own [`PendingCalls`] table
//! until the reply with the same id arrives or the peer goes away.

mod error;
mod failure;
mod link;
mod message;
mod pending;
pub mod value;

pub use error::{Error, Result};
pub use failure::{FailureKind, RunOutput};
pub use link::{HostEndpoint, HostLink, link};
pub use message::{
    CallId, CallIds, Context, HostMessage, InitRequest, RESERVED_TOOL_NAMES, SupervisorMessage,
    is_reserved_tool, reserved_tool_message,
};
pub use pending::PendingCalls;
