//! The primitive action vocabulary.
//!
//! A thread's continuation is an [`Action`]: one suspended primitive
//! together with the closure that produces the next action from the
//! primitive's result. Actions are inert data; their effects happen only
//! when the driver matches on them, exactly one per step.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use weft_types::{CRefId, CVarId, KnownRef, Lookahead, MaskState, ThreadId};

use crate::stm::Transaction;
use crate::substrate::ScopedStore;

/// An erased value moving linearly through a continuation.
pub type Value = Box<dyn Any>;

/// An erased value that may be observed by several threads at once.
///
/// Synchronized-variable slots and mutable cells hold shared values because
/// `read` observes without emptying and every woken reader sees the same
/// payload.
pub type SharedValue = Rc<dyn Any>;

/// A continuation from an operation's result to the next action.
pub type Cont<T> = Box<dyn FnOnce(T) -> Action>;

/// A nullary continuation.
pub type Next = Box<dyn FnOnce() -> Action>;

/// A program with its result type erased, ready to cross an action seam.
pub type ErasedProgram = Box<dyn FnOnce(Cont<Value>) -> Action>;

/// An exception handler installed by [`Action::Catching`].
///
/// Invoked with the in-flight exception: returns the handler continuation
/// when the exception matches the handler's type, or hands the exception
/// back so propagation can try the next frame down.
pub type Handler = Box<dyn FnOnce(Exception) -> Result<Action, Exception>>;

/// An in-program exception: an erased value with a typed downcast.
pub struct Exception(Box<dyn Any>);

impl Exception {
    /// Wrap any value as an exception.
    #[must_use]
    pub fn new<E: Any>(exc: E) -> Self {
        Self(Box::new(exc))
    }

    /// Recover the typed payload, or hand the exception back unchanged.
    pub fn downcast<E: Any>(self) -> Result<E, Self> {
        match self.0.downcast::<E>() {
            Ok(exc) => Ok(*exc),
            Err(other) => Err(Self(other)),
        }
    }

    /// Whether the payload is of type `E`.
    #[must_use]
    pub fn is<E: Any>(&self) -> bool {
        self.0.is::<E>()
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<exception>")
    }
}

/// The exception `kill_thread` delivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadKilled;

/// A restore handle given to the bodies of `mask` and forked threads.
///
/// Carries, by value, the mask to re-establish (the one in force outside
/// the masked region) and the mask of the region itself, so a restore
/// bracket can return to both sides.
#[derive(Clone, Copy, Debug)]
pub struct MaskRestore {
    outer: MaskState,
    inner: MaskState,
}

impl MaskRestore {
    pub(crate) fn new(outer: MaskState, inner: MaskState) -> Self {
        Self { outer, inner }
    }

    /// The mask in force outside the masked region.
    #[must_use]
    pub fn outer(self) -> MaskState {
        self.outer
    }

    /// The mask of the region this restore was created in.
    #[must_use]
    pub fn inner(self) -> MaskState {
        self.inner
    }
}

/// A lifted host effect.
pub enum HostEffect {
    /// A reproducible effect over the run's private scoped store.
    Scoped(Box<dyn FnOnce(&mut ScopedStore) -> Action>),
    /// An arbitrary host effect; only the IO entry points execute these.
    Io(Box<dyn FnOnce() -> Action>),
}

/// One suspended primitive and its continuation.
///
/// Variant operands identify the target resource; payloads and results are
/// erased at this seam and recovered by the typed program surface.
pub enum Action {
    /// Spawn a thread from the body, which receives a restore handle for
    /// the parent's mask captured at fork time; the continuation receives
    /// the child's id.
    Fork(Box<dyn FnOnce(MaskRestore) -> Action>, Cont<ThreadId>),
    /// Look up the running thread's id.
    MyThreadId(Cont<ThreadId>),
    /// Allocate a fresh, empty synchronized variable.
    New(Cont<CVarId>),
    /// Fill a variable, blocking while it is full.
    Put(CVarId, SharedValue, Next),
    /// Fill a variable if it is empty; the continuation learns whether the
    /// put won.
    TryPut(CVarId, SharedValue, Cont<bool>),
    /// Observe a variable without emptying it, blocking while it is empty.
    Read(CVarId, Cont<SharedValue>),
    /// Empty a variable, blocking while it is empty.
    Take(CVarId, Cont<SharedValue>),
    /// Empty a variable if it is full.
    TryTake(CVarId, Cont<Option<SharedValue>>),
    /// Allocate a mutable cell holding the given value.
    NewRef(SharedValue, Cont<CRefId>),
    /// Read a mutable cell.
    ReadRef(CRefId, Cont<SharedValue>),
    /// Atomically replace a cell's value and produce a result, in one step.
    ModRef(
        CRefId,
        Box<dyn FnOnce(SharedValue) -> (SharedValue, Value)>,
        Cont<Value>,
    ),
    /// Perform a lifted host effect.
    Lift(HostEffect),
    /// Run an opaque transaction as a single atomic step.
    Atom(Box<dyn Transaction>, Cont<Value>),
    /// Raise an exception in the running thread.
    Throw(Exception),
    /// Deliver an exception to another thread, blocking while the target is
    /// not interruptible.
    ThrowTo(ThreadId, Exception, Next),
    /// Install a handler frame, then run the guarded body.
    Catching(Handler, Next),
    /// Remove the most recent handler frame.
    PopCatching(Next),
    /// Enter a masked region; the body receives a restore handle.
    Masking(MaskState, Box<dyn FnOnce(MaskRestore) -> Action>),
    /// Re-establish a mask on unwind; the flags record which side of a
    /// restore bracket emitted the reset (outer, inner).
    ResetMask(bool, bool, MaskState, Next),
    /// Run a sub-computation to completion as one opaque step.
    NoTest(ErasedProgram, Cont<Value>),
    /// Declare acquaintance with a resource.
    KnowsAbout(KnownRef, Next),
    /// Revoke acquaintance with a resource.
    Forgets(KnownRef, Next),
    /// Declare the acquaintance set complete.
    AllKnown(Next),
    /// Terminate the running thread.
    Stop,
}

impl Action {
    /// The one-step preview of this action.
    ///
    /// Inspects the head tag only; never executes effects or mutates
    /// anything, so outcome-dependent detail (success flags, woken sets,
    /// whether a primitive will block) is absent.
    #[must_use]
    pub fn lookahead(&self) -> Lookahead {
        match self {
            Self::Fork(..) => Lookahead::WillFork,
            Self::MyThreadId(_) => Lookahead::WillMyThreadId,
            Self::New(_) => Lookahead::WillNew,
            Self::Put(var, ..) => Lookahead::WillPut(*var),
            Self::TryPut(var, ..) => Lookahead::WillTryPut(*var),
            Self::Read(var, _) => Lookahead::WillRead(*var),
            Self::Take(var, _) => Lookahead::WillTake(*var),
            Self::TryTake(var, _) => Lookahead::WillTryTake(*var),
            Self::NewRef(..) => Lookahead::WillNewRef,
            Self::ReadRef(cell, _) => Lookahead::WillReadRef(*cell),
            Self::ModRef(cell, ..) => Lookahead::WillModRef(*cell),
            Self::Lift(_) => Lookahead::WillLift,
            Self::Atom(..) => Lookahead::WillAtom,
            Self::Throw(_) => Lookahead::WillThrow,
            Self::ThrowTo(target, ..) => Lookahead::WillThrowTo(*target),
            Self::Catching(..) => Lookahead::WillCatching,
            Self::PopCatching(_) => Lookahead::WillPopCatching,
            Self::Masking(state, _) => Lookahead::WillMasking(*state),
            Self::ResetMask(outer, inner, state, _) => {
                Lookahead::WillResetMask(*outer, *inner, *state)
            }
            Self::NoTest(..) => Lookahead::WillNoTest,
            Self::KnowsAbout(..) => Lookahead::WillKnowsAbout,
            Self::Forgets(..) => Lookahead::WillForgets,
            Self::AllKnown(_) => Lookahead::WillAllKnown,
            Self::Stop => Lookahead::WillStop,
        }
    }

    /// Whether this primitive can suspend the thread that executes it.
    pub(crate) fn can_block(&self) -> bool {
        matches!(
            self,
            Self::Put(..) | Self::Read(..) | Self::Take(..) | Self::ThrowTo(..) | Self::Atom(..)
        )
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{:?}>", self.lookahead())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_downcast() {
        let exc = Exception::new(7_i32);
        assert!(exc.is::<i32>());
        assert!(!exc.is::<&str>());

        let exc = exc.downcast::<String>().unwrap_err();
        assert_eq!(exc.downcast::<i32>().unwrap(), 7);
    }

    #[test]
    fn test_lookahead_is_pure_preview() {
        let action = Action::Take(CVarId::new(3), Box::new(|_| Action::Stop));
        assert_eq!(action.lookahead(), Lookahead::WillTake(CVarId::new(3)));
        assert!(action.can_block());
        assert!(!Action::Stop.can_block());
    }
}
