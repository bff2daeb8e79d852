//! Synchronized variables.
//!
//! A `CVar` is a single-slot cell with three waiter queues: threads blocked
//! taking, putting, and reading. The wakeup policy is wake-all: a put that
//! fills an empty slot wakes every blocked taker and reader, and a take
//! that empties a full slot wakes every blocked putter. Woken threads
//! re-execute their blocked operation when next scheduled, so which of them
//! actually progresses is decided entirely by the scheduler.

use std::fmt;
use std::marker::PhantomData;

use smallvec::SmallVec;
use weft_types::{CVarId, ThreadId};

use crate::action::SharedValue;

/// A typed handle to a synchronized variable.
///
/// Handles are only constructible by a running interpreter; `new_empty_cvar`
/// is the way to get one.
pub struct CVar<T> {
    id: CVarId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CVar<T> {
    pub(crate) fn new(id: CVarId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The underlying variable id.
    #[must_use]
    pub fn id(&self) -> CVarId {
        self.id
    }
}

impl<T> Clone for CVar<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CVar<T> {}

impl<T> fmt::Debug for CVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CVar({})", self.id.as_u32())
    }
}

type Waiters = SmallVec<[ThreadId; 4]>;

/// The interpreter-side state of one variable.
pub(crate) struct CVarState {
    slot: Option<SharedValue>,
    takers: Waiters,
    putters: Waiters,
    readers: Waiters,
}

impl CVarState {
    pub(crate) fn new() -> Self {
        Self {
            slot: None,
            takers: Waiters::new(),
            putters: Waiters::new(),
            readers: Waiters::new(),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.slot.is_some()
    }

    /// The current value, if any, without emptying the slot.
    pub(crate) fn value(&self) -> Option<SharedValue> {
        self.slot.clone()
    }

    /// Fill an empty slot and drain every blocked taker and reader.
    ///
    /// Returns the woken threads in ascending id order. The caller must
    /// only invoke this on an empty slot.
    pub(crate) fn fill(&mut self, value: SharedValue) -> Vec<ThreadId> {
        debug_assert!(self.slot.is_none());
        self.slot = Some(value);
        let mut woken: Vec<ThreadId> = self.takers.drain(..).chain(self.readers.drain(..)).collect();
        woken.sort_unstable();
        woken
    }

    /// Empty a full slot and drain every blocked putter.
    ///
    /// Returns the value and the woken threads in ascending id order. The
    /// caller must only invoke this on a full slot.
    pub(crate) fn empty_slot(&mut self) -> (SharedValue, Vec<ThreadId>) {
        let value = self.slot.take().expect("emptying a full variable");
        let mut woken: Vec<ThreadId> = self.putters.drain(..).collect();
        woken.sort_unstable();
        (value, woken)
    }

    pub(crate) fn block_taker(&mut self, tid: ThreadId) {
        self.takers.push(tid);
    }

    pub(crate) fn block_putter(&mut self, tid: ThreadId) {
        self.putters.push(tid);
    }

    pub(crate) fn block_reader(&mut self, tid: ThreadId) {
        self.readers.push(tid);
    }

    /// Remove a thread from every waiter queue (it was woken by an
    /// asynchronous exception rather than by this variable).
    pub(crate) fn forget(&mut self, tid: ThreadId) {
        self.takers.retain(|t| *t != tid);
        self.putters.retain(|t| *t != tid);
        self.readers.retain(|t| *t != tid);
    }
}
