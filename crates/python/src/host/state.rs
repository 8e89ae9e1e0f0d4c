use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HostState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    Terminated,
}

impl HostState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::Running,
            _ => Self::Terminated,
        }
    }
}

/// Lock-free host state shared by the dispatcher and interpreter threads.
#[derive(Debug)]
pub struct HostStatus(AtomicU8);

impl Default for HostStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl HostStatus {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(HostState::Uninitialized as u8))
    }

    #[must_use]
    pub fn get(&self) -> HostState {
        HostState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; fails if the state was anything else.
    pub fn transition(&self, from: HostState, to: HostState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Set unconditionally, returning the previous state.
    pub fn replace(&self, to: HostState) -> HostState {
        HostState::from_u8(self.0.swap(to as u8, Ordering::AcqRel))
    }
}
