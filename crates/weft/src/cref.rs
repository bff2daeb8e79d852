//! Mutable cells.
//!
//! A `CRef` is a shared mutable value with no blocking behavior: reads
//! observe the most recently committed value in global step order, and
//! modification is a single atomic step.

use std::fmt;
use std::marker::PhantomData;

use weft_types::CRefId;

use crate::action::SharedValue;

/// A typed handle to a mutable cell.
///
/// Handles are only constructible by a running interpreter; `new_cref` is
/// the way to get one.
pub struct CRef<T> {
    id: CRefId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CRef<T> {
    pub(crate) fn new(id: CRefId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The underlying cell id.
    #[must_use]
    pub fn id(&self) -> CRefId {
        self.id
    }
}

impl<T> Clone for CRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CRef<T> {}

impl<T> fmt::Debug for CRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CRef({})", self.id.as_u32())
    }
}

/// The interpreter-side state of one cell.
pub(crate) struct CRefState {
    value: SharedValue,
}

impl CRefState {
    pub(crate) fn new(value: SharedValue) -> Self {
        Self { value }
    }

    pub(crate) fn value(&self) -> SharedValue {
        self.value.clone()
    }

    pub(crate) fn set(&mut self, value: SharedValue) {
        self.value = value;
    }
}
