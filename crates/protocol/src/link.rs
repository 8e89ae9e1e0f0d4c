use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    error::{Error, Result},
    message::{HostMessage, SupervisorMessage},
};

/// Supervisor end of a host channel pair.
#[derive(Debug)]
pub struct HostLink {
    pub sender: UnboundedSender<SupervisorMessage>,
    pub receiver: UnboundedReceiver<HostMessage>,
}

/// Host end of a host channel pair.
#[derive(Debug)]
pub struct HostEndpoint {
    pub inbox: UnboundedReceiver<SupervisorMessage>,
    pub outbox: UnboundedSender<HostMessage>,
}

#[must_use]
pub fn link() -> (HostLink, HostEndpoint) {
    let (sender, inbox) = mpsc::unbounded_channel();
    let (outbox, receiver) = mpsc::unbounded_channel();
    (HostLink { sender, receiver }, HostEndpoint { inbox, outbox })
}

impl HostLink {
    /// # Errors
    /// Returns [`Error::HostGone`] if the host dropped its inbox.
    pub fn send(&self, message: SupervisorMessage) -> Result<()> {
        self.sender.send(message).map_err(|_| Error::HostGone)
    }
}

impl HostEndpoint {
    /// # Errors
    /// Returns [`Error::HostGone`] if the supervisor stopped listening.
    pub fn reply(&self, message: HostMessage) -> Result<()> {
        self.outbox.send(message).map_err(|_| Error::HostGone)
    }
}
