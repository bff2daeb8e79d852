//! The program-construction surface.
//!
//! A [`Program<T>`] is a value describing a concurrent computation that
//! produces a `T`; nothing executes until it is handed to a run entry
//! point. Internally a program is continuation-passing: a function from a
//! continuation for `T` to the first [`Action`] of the computation. The
//! free functions in this module build programs over the primitive
//! vocabulary; `and_then`/`map`/`then` compose them.

use std::cell::RefCell;
use std::rc::Rc;

use weft_types::{KnownRef, MaskState, ThreadId};

use crate::action::{
    Action, Cont, ErasedProgram, Exception, Handler, HostEffect, MaskRestore, Next, SharedValue,
    ThreadKilled, Value,
};
use crate::cref::CRef;
use crate::cvar::CVar;
use crate::stm::{TVar, Transaction};
use crate::substrate::ScopedStore;

/// A suspended concurrent computation producing a `T`.
pub struct Program<T> {
    run: Box<dyn FnOnce(Cont<T>) -> Action>,
}

impl<T: 'static> Program<T> {
    pub(crate) fn from_cont(run: impl FnOnce(Cont<T>) -> Action + 'static) -> Self {
        Self { run: Box::new(run) }
    }

    /// Reify this program into its first action, given the final
    /// continuation.
    pub(crate) fn into_action(self, k: Cont<T>) -> Action {
        (self.run)(k)
    }

    /// A program that does nothing and returns `value`.
    #[must_use]
    pub fn pure(value: T) -> Self {
        Self::from_cont(move |k| k(value))
    }

    /// Monadic sequencing: run this program, feed its result to `f`, run
    /// the program `f` builds.
    #[must_use]
    pub fn and_then<U: 'static>(
        self,
        f: impl FnOnce(T) -> Program<U> + 'static,
    ) -> Program<U> {
        Program::from_cont(move |k| self.into_action(Box::new(move |value| f(value).into_action(k))))
    }

    /// Map the result.
    #[must_use]
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Program<U> {
        self.and_then(move |value| Program::pure(f(value)))
    }

    /// Sequence, discarding this program's result.
    #[must_use]
    pub fn then<U: 'static>(self, next: Program<U>) -> Program<U> {
        self.and_then(move |_| next)
    }

    /// Erase the result type so the program can cross an action seam.
    pub(crate) fn erase(self) -> ErasedProgram {
        Box::new(move |k: Cont<Value>| {
            self.into_action(Box::new(move |value| k(Box::new(value) as Value)))
        })
    }
}

/// Recover a typed value from a linear continuation seam.
fn cast<T: 'static>(value: Value) -> T {
    *value
        .downcast::<T>()
        .expect("continuation value matches the type its handle was created with")
}

/// Recover a typed value from a shared slot.
fn shared_cast<T: Clone + 'static>(value: &SharedValue) -> T {
    value
        .downcast_ref::<T>()
        .expect("shared value matches the type its handle was created with")
        .clone()
}

/// Split one continuation between the normal path and the handler path of a
/// `catch`. Exactly one side ever runs: either the body completes, or a
/// matching exception unwinds it.
fn split_cont<T: 'static>(k: Cont<T>) -> (Cont<T>, Cont<T>) {
    let shared = Rc::new(RefCell::new(Some(k)));
    let left = {
        let shared = Rc::clone(&shared);
        Box::new(move |value: T| {
            let k = shared
                .borrow_mut()
                .take()
                .expect("only one side of a catch resumes");
            k(value)
        }) as Cont<T>
    };
    let right = Box::new(move |value: T| {
        let k = shared
            .borrow_mut()
            .take()
            .expect("only one side of a catch resumes");
        k(value)
    }) as Cont<T>;
    (left, right)
}

/// Fork a thread running `child`; returns the child's id.
#[must_use]
pub fn fork(child: Program<()>) -> Program<ThreadId> {
    fork_with_unmask(move |_| child)
}

/// Fork a thread whose body receives a restore handle re-applying the
/// parent's mask as of the fork.
#[must_use]
pub fn fork_with_unmask(
    child: impl FnOnce(MaskRestore) -> Program<()> + 'static,
) -> Program<ThreadId> {
    Program::from_cont(move |k| {
        Action::Fork(
            Box::new(move |restore| child(restore).into_action(Box::new(|()| Action::Stop))),
            k,
        )
    })
}

/// Fork `child` and collect its result in a fresh variable.
#[must_use]
pub fn spawn<T: Clone + 'static>(child: Program<T>) -> Program<CVar<T>> {
    new_empty_cvar::<T>().and_then(move |var| {
        fork(child.and_then(move |value| put_cvar(var, value))).map(move |_| var)
    })
}

/// The id of the calling thread.
#[must_use]
pub fn my_thread_id() -> Program<ThreadId> {
    Program::from_cont(Action::MyThreadId)
}

/// Allocate a fresh, empty synchronized variable.
#[must_use]
pub fn new_empty_cvar<T: 'static>() -> Program<CVar<T>> {
    Program::from_cont(|k| Action::New(Box::new(move |id| k(CVar::new(id)))))
}

/// Allocate a synchronized variable already holding `value`.
#[must_use]
pub fn new_cvar<T: Clone + 'static>(value: T) -> Program<CVar<T>> {
    new_empty_cvar::<T>().and_then(move |var| put_cvar(var, value).map(move |()| var))
}

/// Fill a variable, blocking while it is full.
#[must_use]
pub fn put_cvar<T: Clone + 'static>(var: CVar<T>, value: T) -> Program<()> {
    Program::from_cont(move |k| {
        Action::Put(var.id(), Rc::new(value), Box::new(move || k(())) as Next)
    })
}

/// Fill a variable if it is empty; returns whether the put won.
#[must_use]
pub fn try_put_cvar<T: Clone + 'static>(var: CVar<T>, value: T) -> Program<bool> {
    Program::from_cont(move |k| Action::TryPut(var.id(), Rc::new(value), k))
}

/// Observe a variable without emptying it, blocking while it is empty.
#[must_use]
pub fn read_cvar<T: Clone + 'static>(var: CVar<T>) -> Program<T> {
    Program::from_cont(move |k| {
        Action::Read(
            var.id(),
            Box::new(move |value| k(shared_cast::<T>(&value))),
        )
    })
}

/// Empty a variable, blocking while it is empty.
#[must_use]
pub fn take_cvar<T: Clone + 'static>(var: CVar<T>) -> Program<T> {
    Program::from_cont(move |k| {
        Action::Take(
            var.id(),
            Box::new(move |value| k(shared_cast::<T>(&value))),
        )
    })
}

/// Empty a variable if it is full.
#[must_use]
pub fn try_take_cvar<T: Clone + 'static>(var: CVar<T>) -> Program<Option<T>> {
    Program::from_cont(move |k| {
        Action::TryTake(
            var.id(),
            Box::new(move |value| k(value.as_ref().map(shared_cast::<T>))),
        )
    })
}

/// Allocate a mutable cell holding `value`.
#[must_use]
pub fn new_cref<T: Clone + 'static>(value: T) -> Program<CRef<T>> {
    Program::from_cont(move |k| {
        Action::NewRef(Rc::new(value), Box::new(move |id| k(CRef::new(id))))
    })
}

/// Read a mutable cell.
#[must_use]
pub fn read_cref<T: Clone + 'static>(cell: CRef<T>) -> Program<T> {
    Program::from_cont(move |k| {
        Action::ReadRef(
            cell.id(),
            Box::new(move |value| k(shared_cast::<T>(&value))),
        )
    })
}

/// Atomically replace a cell's value and produce a result, in one step.
#[must_use]
pub fn mod_cref<T: Clone + 'static, U: 'static>(
    cell: CRef<T>,
    f: impl FnOnce(T) -> (T, U) + 'static,
) -> Program<U> {
    Program::from_cont(move |k| {
        Action::ModRef(
            cell.id(),
            Box::new(move |value| {
                let (next, out) = f(shared_cast::<T>(&value));
                (Rc::new(next) as SharedValue, Box::new(out) as Value)
            }),
            Box::new(move |out| k(cast::<U>(out))),
        )
    })
}

/// Unconditionally overwrite a mutable cell.
#[must_use]
pub fn write_cref<T: Clone + 'static>(cell: CRef<T>, value: T) -> Program<()> {
    mod_cref(cell, move |_| (value, ()))
}

/// Raise an exception in the calling thread.
#[must_use]
pub fn throw<T: 'static, E: 'static>(exc: E) -> Program<T> {
    Program::from_cont(move |_k| Action::Throw(Exception::new(exc)))
}

/// Deliver an exception to another thread, blocking while the target is
/// not interruptible. Delivery to a terminated thread is a no-op.
#[must_use]
pub fn throw_to<E: 'static>(target: ThreadId, exc: E) -> Program<()> {
    Program::from_cont(move |k| {
        Action::ThrowTo(target, Exception::new(exc), Box::new(move || k(())) as Next)
    })
}

/// Deliver [`ThreadKilled`] to another thread.
#[must_use]
pub fn kill_thread(target: ThreadId) -> Program<()> {
    throw_to(target, ThreadKilled)
}

/// Run `body` with a handler for exceptions of type `E`.
///
/// Exceptions of other types propagate past this frame unchanged.
#[must_use]
pub fn catch<T: 'static, E: 'static>(
    body: Program<T>,
    handler: impl FnOnce(E) -> Program<T> + 'static,
) -> Program<T> {
    Program::from_cont(move |k| {
        let (normal, caught) = split_cont(k);
        let frame: Handler = Box::new(move |exc| match exc.downcast::<E>() {
            Ok(exc) => Ok(handler(exc).into_action(caught)),
            Err(exc) => Err(exc),
        });
        let guarded: Next = Box::new(move || {
            body.into_action(Box::new(move |value| {
                Action::PopCatching(Box::new(move || normal(value)))
            }))
        });
        Action::Catching(frame, guarded)
    })
}

fn masking<T: 'static>(
    state: MaskState,
    body: impl FnOnce(MaskRestore) -> Program<T> + 'static,
) -> Program<T> {
    Program::from_cont(move |k| {
        Action::Masking(
            state,
            Box::new(move |restore| {
                let outer = restore.outer();
                body(restore).into_action(Box::new(move |value| {
                    Action::ResetMask(true, false, outer, Box::new(move || k(value)))
                }))
            }),
        )
    })
}

/// Run `body` with asynchronous exceptions deferred to blocking points.
///
/// The body receives a restore handle re-establishing the outer mask.
#[must_use]
pub fn mask<T: 'static>(body: impl FnOnce(MaskRestore) -> Program<T> + 'static) -> Program<T> {
    masking(MaskState::MaskedInterruptible, body)
}

/// Run `body` with asynchronous exceptions fully deferred.
#[must_use]
pub fn uninterruptible_mask<T: 'static>(
    body: impl FnOnce(MaskRestore) -> Program<T> + 'static,
) -> Program<T> {
    masking(MaskState::MaskedUninterruptible, body)
}

impl MaskRestore {
    /// Run `program` under the mask in force outside the masked region this
    /// handle was created in, returning to the region's mask afterwards.
    #[must_use]
    pub fn restore<T: 'static>(self, program: Program<T>) -> Program<T> {
        Program::from_cont(move |k| {
            Action::ResetMask(
                true,
                false,
                self.outer(),
                Box::new(move || {
                    program.into_action(Box::new(move |value| {
                        Action::ResetMask(false, true, self.inner(), Box::new(move || k(value)))
                    }))
                }),
            )
        })
    }
}

/// Run an opaque transaction as a single atomic step.
#[must_use]
pub fn atomically<T: 'static>(tx: impl Transaction + 'static) -> Program<T> {
    Program::from_cont(move |k| {
        Action::Atom(Box::new(tx), Box::new(move |value| k(cast::<T>(value))))
    })
}

/// Run a sub-computation to completion as one opaque step.
///
/// If the sub-computation deadlocks or dies, the whole run fails with
/// `FailureInNoTest`.
#[must_use]
pub fn no_test<T: 'static>(program: Program<T>) -> Program<T> {
    Program::from_cont(move |k| {
        Action::NoTest(program.erase(), Box::new(move |value| k(cast::<T>(value))))
    })
}

/// Declare acquaintance with a resource, for search layers.
#[must_use]
pub fn knows_about(resource: impl Into<KnownRef>) -> Program<()> {
    let resource = resource.into();
    Program::from_cont(move |k| Action::KnowsAbout(resource, Box::new(move || k(())) as Next))
}

/// Revoke acquaintance with a resource.
#[must_use]
pub fn forgets(resource: impl Into<KnownRef>) -> Program<()> {
    let resource = resource.into();
    Program::from_cont(move |k| Action::Forgets(resource, Box::new(move || k(())) as Next))
}

/// Declare the calling thread's acquaintance set complete.
#[must_use]
pub fn all_known() -> Program<()> {
    Program::from_cont(move |k| Action::AllKnown(Box::new(move || k(())) as Next))
}

impl<T> From<CVar<T>> for KnownRef {
    fn from(var: CVar<T>) -> Self {
        Self::Var(var.id())
    }
}

impl<T> From<TVar<T>> for KnownRef {
    fn from(var: TVar<T>) -> Self {
        Self::TxVar(var.id())
    }
}

/// Lift a reproducible host effect over the run's scoped store.
#[must_use]
pub fn lift<T: 'static>(effect: impl FnOnce(&mut ScopedStore) -> T + 'static) -> Program<T> {
    Program::from_cont(move |k| {
        Action::Lift(HostEffect::Scoped(Box::new(move |store| k(effect(store)))))
    })
}

/// Lift an arbitrary host effect; only the IO run entry points execute
/// these.
#[must_use]
pub fn lift_io<T: 'static>(effect: impl FnOnce() -> T + 'static) -> Program<T> {
    Program::from_cont(move |k| Action::Lift(HostEffect::Io(Box::new(move || k(effect())))))
}
