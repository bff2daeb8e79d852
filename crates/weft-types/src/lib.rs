//! Identifier, trace, and failure vocabulary for the weft engine.
//!
//! This crate holds the pure data types shared between the interpreter and
//! its consumers: identifier newtypes and their allocator, mask states,
//! scheduler decisions, per-step thread actions and lookaheads, blocking
//! reasons, the failure taxonomy, and execution traces. Everything here is
//! plain data with `serde` support so search layers can persist and compare
//! traces; no interpreter logic lives in this crate.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A simulated thread identifier.
///
/// The initial thread of every run has id 0; forked threads receive strictly
/// increasing ids from the run's [`IdSource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// The initial thread of a run.
    pub const MAIN: Self = Self(0);

    /// Create a thread id from a raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// A synchronized variable identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CVarId(pub u32);

impl CVarId {
    /// Create a variable id from a raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// A mutable cell identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct CRefId(pub u32);

impl CRefId {
    /// Create a cell id from a raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// A transactional variable identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TxVarId(pub u32);

impl TxVarId {
    /// Create a transactional variable id from a raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Allocator for the four disjoint identifier spaces.
///
/// Each `fresh_*` call returns a value strictly greater than every value it
/// has previously returned for that space; ids are never reused within a
/// run. Thread ids start handing out 1, since the initial thread is
/// [`ThreadId::MAIN`] and is not allocated through the source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdSource {
    threads: u32,
    cvars: u32,
    crefs: u32,
    txvars: u32,
}

impl IdSource {
    /// Create a fresh source with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next thread id.
    pub fn fresh_thread(&mut self) -> ThreadId {
        self.threads += 1;
        ThreadId(self.threads)
    }

    /// Allocate the next synchronized variable id.
    pub fn fresh_cvar(&mut self) -> CVarId {
        self.cvars += 1;
        CVarId(self.cvars)
    }

    /// Allocate the next mutable cell id.
    pub fn fresh_cref(&mut self) -> CRefId {
        self.crefs += 1;
        CRefId(self.crefs)
    }

    /// Allocate the next transactional variable id.
    pub fn fresh_txvar(&mut self) -> TxVarId {
        self.txvars += 1;
        TxVarId(self.txvars)
    }
}

/// The asynchronous-exception mask of a thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaskState {
    /// Asynchronous exceptions are delivered freely.
    #[default]
    Unmasked,
    /// Delivery is deferred to blocking points.
    MaskedInterruptible,
    /// Delivery is deferred until the mask is lifted.
    MaskedUninterruptible,
}

/// A resource a thread can declare acquaintance with.
///
/// Acquaintance annotations are bookkeeping for search layers; the
/// interpreter records them and otherwise ignores them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KnownRef {
    /// A synchronized variable.
    Var(CVarId),
    /// A transactional variable.
    TxVar(TxVarId),
}

/// Why a thread is not runnable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockedOn {
    /// Waiting to take from an empty variable.
    Take(CVarId),
    /// Waiting to put into a full variable.
    Put(CVarId),
    /// Waiting to read an empty variable.
    Read(CVarId),
    /// Waiting for a throw target to become interruptible.
    ThrowTo(ThreadId),
    /// A transaction retried; waiting for one of its read set to change.
    Stm(Vec<TxVarId>),
}

/// A labelled scheduler choice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Run a thread where the previously scheduled one no longer could run
    /// (or this is the first step of the run).
    Start(ThreadId),
    /// Keep running the thread scheduled on the previous step.
    Continue,
    /// Preempt the previous thread, which could have continued.
    SwitchTo(ThreadId),
}

impl Decision {
    /// The thread this decision selects, given the previously scheduled one.
    ///
    /// Returns `None` only for `Continue` with no prior thread, which a
    /// well-formed trace never contains.
    #[must_use]
    pub fn thread(self, prior: Option<ThreadId>) -> Option<ThreadId> {
        match self {
            Self::Start(tid) | Self::SwitchTo(tid) => Some(tid),
            Self::Continue => prior,
        }
    }
}

/// What a thread did in one interpreter step.
///
/// The `woken` lists on variable operations record every thread moved back
/// to runnable by that step, in ascending id order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadAction {
    /// Forked a new thread with the given id.
    Fork(ThreadId),
    /// Looked up its own id.
    MyThreadId,
    /// Allocated a new, empty synchronized variable.
    New(CVarId),
    /// Filled a variable, waking the listed threads.
    Put(CVarId, Vec<ThreadId>),
    /// Blocked trying to fill an already-full variable.
    BlockedPut(CVarId),
    /// Attempted a non-blocking put; the flag records success.
    TryPut(CVarId, bool, Vec<ThreadId>),
    /// Observed the value of a variable without emptying it.
    Read(CVarId),
    /// Blocked reading an empty variable.
    BlockedRead(CVarId),
    /// Emptied a variable, waking the listed threads.
    Take(CVarId, Vec<ThreadId>),
    /// Blocked taking from an empty variable.
    BlockedTake(CVarId),
    /// Attempted a non-blocking take; the flag records success.
    TryTake(CVarId, bool, Vec<ThreadId>),
    /// Allocated a new mutable cell.
    NewRef(CRefId),
    /// Read a mutable cell.
    ReadRef(CRefId),
    /// Atomically modified a mutable cell.
    ModRef(CRefId),
    /// Committed a transaction, waking the listed threads.
    Atom(Vec<ThreadId>),
    /// A transaction retried; the thread blocked on its read set.
    BlockedAtom,
    /// Performed a lifted host effect.
    Lift,
    /// Raised an exception (synchronously, or by consuming a pending
    /// asynchronous one that a handler caught).
    Throw,
    /// Delivered an exception to the given thread.
    ThrowTo(ThreadId),
    /// Blocked delivering to an uninterruptible thread.
    BlockedThrowTo(ThreadId),
    /// Died consuming an asynchronous exception no handler matched.
    Killed,
    /// Installed an exception handler frame.
    Catching,
    /// Removed the most recent handler frame.
    PopCatching,
    /// Entered a masked region.
    Masking(MaskState),
    /// Re-established a mask; the flags record which side of a restore
    /// bracket emitted the reset (outer, inner).
    ResetMask(bool, bool, MaskState),
    /// Ran an opaque sub-computation to completion in one step.
    NoTest,
    /// Declared acquaintance with a resource.
    KnowsAbout,
    /// Revoked acquaintance with a resource.
    Forgets,
    /// Declared its acquaintance set complete.
    AllKnown,
    /// Finished.
    Stop,
}

/// A one-step preview of what a thread will do next.
///
/// Lookaheads are produced without executing effects, so outcome-dependent
/// detail (success flags, woken sets) is absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lookahead {
    /// Will fork a thread.
    WillFork,
    /// Will look up its own id.
    WillMyThreadId,
    /// Will allocate a synchronized variable.
    WillNew,
    /// Will put into the given variable (possibly blocking).
    WillPut(CVarId),
    /// Will attempt a non-blocking put.
    WillTryPut(CVarId),
    /// Will read the given variable (possibly blocking).
    WillRead(CVarId),
    /// Will take from the given variable (possibly blocking).
    WillTake(CVarId),
    /// Will attempt a non-blocking take.
    WillTryTake(CVarId),
    /// Will allocate a mutable cell.
    WillNewRef,
    /// Will read the given cell.
    WillReadRef(CRefId),
    /// Will modify the given cell.
    WillModRef(CRefId),
    /// Will run a transaction.
    WillAtom,
    /// Will perform a lifted host effect.
    WillLift,
    /// Will raise an exception.
    WillThrow,
    /// Will deliver an exception to the given thread.
    WillThrowTo(ThreadId),
    /// Will install a handler frame.
    WillCatching,
    /// Will remove a handler frame.
    WillPopCatching,
    /// Will enter a masked region.
    WillMasking(MaskState),
    /// Will re-establish a mask.
    WillResetMask(bool, bool, MaskState),
    /// Will run an opaque sub-computation.
    WillNoTest,
    /// Will declare acquaintance with a resource.
    WillKnowsAbout,
    /// Will revoke acquaintance with a resource.
    WillForgets,
    /// Will declare its acquaintance set complete.
    WillAllKnown,
    /// Will finish.
    WillStop,
}

impl Lookahead {
    /// Whether `action` is an outcome this lookahead predicted.
    ///
    /// Blocking variants, success flags, and woken sets are refinements the
    /// preview cannot see; asynchronous-exception delivery replaces the
    /// predicted action outright, so `Throw` and `Killed` are admitted
    /// everywhere.
    #[must_use]
    pub fn admits(self, action: &ThreadAction) -> bool {
        use ThreadAction as A;
        match (self, action) {
            // A pending asynchronous exception preempts whatever the
            // lookahead saw.
            (_, A::Throw | A::Killed) => true,
            (Self::WillFork, A::Fork(_)) => true,
            (Self::WillMyThreadId, A::MyThreadId) => true,
            (Self::WillNew, A::New(_)) => true,
            (Self::WillPut(v), A::Put(w, _) | A::BlockedPut(w)) => v == *w,
            (Self::WillTryPut(v), A::TryPut(w, _, _)) => v == *w,
            (Self::WillRead(v), A::Read(w) | A::BlockedRead(w)) => v == *w,
            (Self::WillTake(v), A::Take(w, _) | A::BlockedTake(w)) => v == *w,
            (Self::WillTryTake(v), A::TryTake(w, _, _)) => v == *w,
            (Self::WillNewRef, A::NewRef(_)) => true,
            (Self::WillReadRef(r), A::ReadRef(s)) => r == *s,
            (Self::WillModRef(r), A::ModRef(s)) => r == *s,
            (Self::WillAtom, A::Atom(_) | A::BlockedAtom) => true,
            (Self::WillLift, A::Lift) => true,
            (Self::WillThrowTo(t), A::ThrowTo(u) | A::BlockedThrowTo(u)) => t == *u,
            (Self::WillCatching, A::Catching) => true,
            (Self::WillPopCatching, A::PopCatching) => true,
            (Self::WillMasking(m), A::Masking(n)) => m == *n,
            (Self::WillResetMask(o, i, m), A::ResetMask(p, j, n)) => {
                o == *p && i == *j && m == *n
            }
            (Self::WillNoTest, A::NoTest) => true,
            (Self::WillKnowsAbout, A::KnowsAbout) => true,
            (Self::WillForgets, A::Forgets) => true,
            (Self::WillAllKnown, A::AllKnown) => true,
            (Self::WillStop, A::Stop) => true,
            _ => false,
        }
    }
}

/// How a run can end without producing a value.
///
/// Failures are the run's outcome, returned by the driver; they never flow
/// through the action stream.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum Failure {
    /// The interpreter broke one of its own invariants, usually because a
    /// scheduler chose a thread outside the runnable set.
    #[error("internal error in the interpreter or scheduler")]
    InternalError,

    /// Every live thread was blocked on a synchronized variable or a throw.
    #[error("every live thread is blocked")]
    Deadlock,

    /// Every live thread was blocked on transactional variables.
    #[error("every live thread is blocked inside a transaction")]
    STMDeadlock,

    /// The initial thread was killed by an uncaught exception.
    #[error("uncaught exception on the initial thread")]
    UncaughtException,

    /// An opaque sub-computation failed to produce a value.
    #[error("failure inside an opaque sub-computation")]
    FailureInNoTest,
}

/// One step of an execution trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// The decision the scheduler made.
    pub decision: Decision,
    /// Every other runnable thread at the decision point, labelled with the
    /// decision that would have selected it and its lookahead.
    pub alternatives: Vec<(Decision, Lookahead)>,
    /// What the selected thread actually did.
    pub action: ThreadAction,
}

/// The full ordered log of a run, one entry per scheduler invocation.
pub type Trace = Vec<TraceEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_source_monotonic() {
        let mut ids = IdSource::new();

        let t1 = ids.fresh_thread();
        let t2 = ids.fresh_thread();
        assert!(t1 < t2);
        assert!(ThreadId::MAIN < t1);

        let v1 = ids.fresh_cvar();
        let v2 = ids.fresh_cvar();
        assert!(v1 < v2);

        // Spaces are disjoint: allocating in one does not advance another.
        assert_eq!(ids.fresh_cref(), CRefId::new(1));
        assert_eq!(ids.fresh_txvar(), TxVarId::new(1));
    }

    #[test]
    fn test_decision_thread() {
        let t0 = ThreadId::MAIN;
        let t1 = ThreadId::new(1);

        assert_eq!(Decision::Start(t1).thread(None), Some(t1));
        assert_eq!(Decision::SwitchTo(t1).thread(Some(t0)), Some(t1));
        assert_eq!(Decision::Continue.thread(Some(t0)), Some(t0));
        assert_eq!(Decision::Continue.thread(None), None);
    }

    #[test]
    fn test_lookahead_admits_refinements() {
        let v = CVarId::new(1);

        assert!(Lookahead::WillTake(v).admits(&ThreadAction::BlockedTake(v)));
        assert!(Lookahead::WillTake(v).admits(&ThreadAction::Take(v, vec![])));
        assert!(!Lookahead::WillTake(v).admits(&ThreadAction::Read(v)));
        assert!(!Lookahead::WillTake(CVarId::new(2)).admits(&ThreadAction::Take(v, vec![])));

        // Pending-exception delivery replaces the predicted action.
        assert!(Lookahead::WillTake(v).admits(&ThreadAction::Killed));
        assert!(Lookahead::WillStop.admits(&ThreadAction::Throw));
    }

    #[test]
    fn test_failure_display() {
        assert_eq!(
            Failure::Deadlock.to_string(),
            "every live thread is blocked"
        );
        assert_ne!(
            Failure::STMDeadlock.to_string(),
            Failure::Deadlock.to_string()
        );
    }
}
