//! Handles to guest objects held by the host.
//!
//! A [`BorrowedHandle`] is a reference the host was lent for the duration of a
//! call; it has no release operation. An [`OwnedHandle`] is a reference the
//! host created for itself and must give back, which [`OwnedHandle::release`]
//! does by consuming the handle.

use pyo3::{Borrowed, Bound, Py, PyAny, Python};

#[derive(Clone, Copy, Debug)]
pub struct BorrowedHandle<'a, 'py>(Borrowed<'a, 'py, PyAny>);

impl<'a, 'py> BorrowedHandle<'a, 'py> {
    pub fn new(object: &'a Bound<'py, PyAny>) -> Self {
        Self(object.as_borrowed())
    }

    #[must_use]
    pub fn py(&self) -> Python<'py> {
        self.0.py()
    }

    #[must_use]
    pub fn get(&self) -> &Bound<'py, PyAny> {
        &self.0
    }

    /// Take a new strong reference to the same object.
    #[must_use]
    pub fn clone_owned(&self) -> OwnedHandle {
        OwnedHandle(self.0.to_owned().unbind())
    }
}

#[derive(Debug)]
pub struct OwnedHandle(Py<PyAny>);

impl OwnedHandle {
    /// Take ownership of a new reference returned from a guest call.
    #[must_use]
    pub fn adopt(object: Bound<'_, PyAny>) -> Self {
        Self(object.unbind())
    }

    pub fn borrow<'a, 'py>(&'a self, py: Python<'py>) -> BorrowedHandle<'a, 'py> {
        BorrowedHandle(self.0.bind_borrowed(py))
    }

    #[must_use]
    pub fn bind<'py>(&self, py: Python<'py>) -> &Bound<'py, PyAny> {
        self.0.bind(py)
    }

    /// Give the reference back to the interpreter.
    pub fn release(self, py: Python<'_>) {
        self.0.drop_ref(py);
    }
}

#[cfg(test)]
mod tests {
    use pyo3::{
        Python,
        types::{PyAnyMethods, PyDict},
    };

    use super::*;

    #[test]
    fn owned_handles_return_their_reference() {
        Python::initialize();
        Python::attach(|py| {
            let object = PyDict::new(py).into_any();
            let baseline = object.get_refcnt();

            let borrowed = BorrowedHandle::new(&object);
            assert_eq!(object.get_refcnt(), baseline);

            let owned = borrowed.clone_owned();
            assert_eq!(object.get_refcnt(), baseline + 1);
            assert!(owned.borrow(py).get().is(&object));

            owned.release(py);
            assert_eq!(object.get_refcnt(), baseline);
        });
    }
}
