//! The opaque transactional boundary.
//!
//! The interpreter treats a transaction as a single atomic step: it hands
//! the transaction a [`TxStore`] view of the world's transactional
//! variables, and the transaction either commits a value, retries (blocking
//! the thread on the variables it read), or throws. What happens inside the
//! transaction is not the interpreter's business; the driver only rolls the
//! store back on anything other than a commit and wakes retriers whose read
//! set was written.

use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use weft_types::{IdSource, TxVarId};

use crate::action::{Exception, SharedValue, Value};

/// A typed handle to a transactional variable.
///
/// Handles are only constructible through a [`TxStore`], inside a running
/// transaction.
pub struct TVar<T> {
    id: TxVarId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TVar<T> {
    fn new(id: TxVarId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The underlying variable id.
    #[must_use]
    pub fn id(&self) -> TxVarId {
        self.id
    }
}

impl<T> Clone for TVar<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TVar<T> {}

impl<T> fmt::Debug for TVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TVar({})", self.id.as_u32())
    }
}

/// How one attempt at a transaction ended.
pub enum TxOutcome {
    /// The transaction committed, producing this (erased) result.
    Committed(Value),
    /// The transaction cannot proceed under the state it observed; block
    /// until something it read changes, then attempt it again.
    Retry,
    /// The transaction raised an exception; its writes are discarded.
    Thrown(Exception),
}

impl TxOutcome {
    /// Commit with a typed result.
    #[must_use]
    pub fn committed<T: 'static>(value: T) -> Self {
        Self::Committed(Box::new(value))
    }

    /// Throw a typed exception out of the transaction.
    #[must_use]
    pub fn thrown<E: 'static>(exc: E) -> Self {
        Self::Thrown(Exception::new(exc))
    }
}

/// The view of transactional state one attempt runs against.
///
/// Tracks the attempt's read and write sets so the driver knows what to
/// block a retry on and whom to wake after a commit.
pub struct TxStore<'w> {
    ids: &'w mut IdSource,
    vars: &'w mut FxHashMap<TxVarId, SharedValue>,
    written: Vec<TxVarId>,
    read: Vec<TxVarId>,
}

impl<'w> TxStore<'w> {
    pub(crate) fn new(
        ids: &'w mut IdSource,
        vars: &'w mut FxHashMap<TxVarId, SharedValue>,
    ) -> Self {
        Self {
            ids,
            vars,
            written: Vec::new(),
            read: Vec::new(),
        }
    }

    /// Allocate a transactional variable holding `value`.
    pub fn new_var<T: Clone + 'static>(&mut self, value: T) -> TVar<T> {
        let id = self.ids.fresh_txvar();
        self.vars.insert(id, Rc::new(value));
        self.written.push(id);
        TVar::new(id)
    }

    /// Read a transactional variable, recording it in the read set.
    pub fn read<T: Clone + 'static>(&mut self, var: TVar<T>) -> T {
        self.read.push(var.id());
        self.vars
            .get(&var.id())
            .and_then(|value| value.downcast_ref::<T>())
            .expect("transactional variable holds a value of its handle's type")
            .clone()
    }

    /// Overwrite a transactional variable, recording it in the write set.
    pub fn write<T: Clone + 'static>(&mut self, var: TVar<T>, value: T) {
        self.written.push(var.id());
        self.vars.insert(var.id(), Rc::new(value));
    }

    pub(crate) fn written_set(&self) -> Vec<TxVarId> {
        let mut set = self.written.clone();
        set.sort_unstable();
        set.dedup();
        set
    }

    pub(crate) fn read_set(&self) -> Vec<TxVarId> {
        let mut set = self.read.clone();
        set.sort_unstable();
        set.dedup();
        set
    }
}

/// An opaque atomic transaction.
///
/// A transaction may be attempted many times (after every wakeup from a
/// retry), so it takes `&self` and must derive everything it does from the
/// store it is handed.
pub trait Transaction {
    /// Attempt the transaction against the given store view.
    fn atomically(&self, store: &mut TxStore<'_>) -> TxOutcome;
}

/// Adapter making any suitable closure a [`Transaction`].
pub struct FnTransaction<F>(pub F);

impl<F> Transaction for FnTransaction<F>
where
    F: Fn(&mut TxStore<'_>) -> TxOutcome,
{
    fn atomically(&self, store: &mut TxStore<'_>) -> TxOutcome {
        (self.0)(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_read_write_sets() {
        let mut ids = IdSource::new();
        let mut vars = FxHashMap::default();
        let mut store = TxStore::new(&mut ids, &mut vars);

        let a = store.new_var(1_i32);
        let b = store.new_var(2_i32);

        assert_eq!(store.read(a), 1);
        store.write(b, 20);
        assert_eq!(store.read(b), 20);

        assert_eq!(store.read_set(), vec![a.id(), b.id()]);
        assert_eq!(store.written_set(), vec![a.id(), b.id()]);
    }

    #[test]
    fn test_fn_transaction() {
        let mut ids = IdSource::new();
        let mut vars = FxHashMap::default();

        let tx = FnTransaction(|store: &mut TxStore<'_>| {
            let var = store.new_var(41_i32);
            let seen = store.read(var);
            TxOutcome::committed(seen + 1)
        });

        let mut store = TxStore::new(&mut ids, &mut vars);
        match tx.atomically(&mut store) {
            TxOutcome::Committed(value) => {
                assert_eq!(*value.downcast::<i32>().unwrap(), 42);
            }
            _ => panic!("transaction should commit"),
        }
    }
}
