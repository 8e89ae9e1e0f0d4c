use std::collections::HashMap;

use parking_lot::Mutex;

use crate::message::CallId;

/// Waiters parked until the reply with their [`CallId`] arrives.
///
/// Every entry leaves the table exactly once, either through [`take`] when the
/// reply arrives or through [`close`] when the peer goes away. After `close` the
/// table refuses new entries, so a waiter registered during teardown is handed
/// straight back to its owner instead of hanging.
///
/// [`take`]: PendingCalls::take
/// [`close`]: PendingCalls::close
#[derive(Debug)]
pub struct PendingCalls<E> {
    inner: Mutex<Inner<E>>,
}

#[derive(Debug)]
struct Inner<E> {
    entries: HashMap<CallId, E>,
    closed: bool,
}

impl<E> Default for PendingCalls<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> PendingCalls<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register a waiter. Must happen before the request leaves.
    ///
    /// # Errors
    /// Returns the entry back if the table has been closed.
    pub fn insert(&self, id: CallId, entry: E) -> Result<(), E> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(entry);
        }
        let previous = inner.entries.insert(id, entry);
        debug_assert!(previous.is_none(), "duplicate call id {id}");
        Ok(())
    }

    pub fn take(&self, id: CallId) -> Option<E> {
        self.inner.lock().entries.remove(&id)
    }

    /// Drain every waiter and refuse further inserts.
    pub fn close(&self) -> Vec<(CallId, E)> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let mut drained: Vec<_> = inner.entries.drain().collect();
        drop(inner);
        drained.sort_unstable_by_key(|(id, _)| *id);
        drained
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_leave_exactly_once() {
        let pending = PendingCalls::new();
        pending.insert(CallId::new(1), "a").unwrap();
        pending.insert(CallId::new(2), "b").unwrap();

        assert_eq!(pending.take(CallId::new(1)), Some("a"));
        assert_eq!(pending.take(CallId::new(1)), None);

        assert_eq!(pending.close(), vec![(CallId::new(2), "b")]);
        assert!(pending.close().is_empty());
        assert!(pending.is_empty());
    }

    #[test]
    fn closed_table_hands_entries_back() {
        let pending = PendingCalls::new();
        assert!(pending.close().is_empty());
        assert!(pending.is_closed());
        assert_eq!(pending.insert(CallId::new(5), 5u8), Err(5));
        assert_eq!(pending.take(CallId::new(5)), None);
    }
}
