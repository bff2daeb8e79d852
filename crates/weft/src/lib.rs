//! Deterministic concurrency testing engine.
//!
//! `weft` interprets concurrent programs step-by-step under the control of
//! an external scheduler. "Threads" are data structures, the interpreter
//! runs on one OS thread, and exactly one primitive action executes per
//! step, so the scheduler's decisions are the sole source of interleaving.
//! A run produces a result (or a diagnosed failure) together with a
//! complete trace: the decision taken at every step, what the chosen
//! thread did, and every alternative with its one-step lookahead. Search
//! layers re-run the same program under different schedulers and use the
//! trace to enumerate preemptions systematically.
//!
//! Programs are built with the combinators in [`program`] and executed
//! with [`run`] (pure substrate) or [`run_io`]:
//!
//! ```
//! use weft::{execute, fork, new_empty_cvar, put_cvar, take_cvar, LeastId};
//!
//! let program = new_empty_cvar::<i32>()
//!     .and_then(|v| fork(put_cvar(v, 42)).and_then(move |_child| take_cvar(v)));
//!
//! assert_eq!(execute(LeastId, program), Ok(42));
//! ```

#![warn(missing_docs)]

pub mod action;
pub mod cref;
pub mod cvar;
pub mod program;
pub mod runner;
pub mod sched;
pub mod stm;
pub mod substrate;

mod thread;

pub use action::{
    Action, Exception, HostEffect, MaskRestore, SharedValue, ThreadKilled, Value,
};
pub use cref::CRef;
pub use cvar::CVar;
pub use program::{
    all_known, atomically, catch, fork, fork_with_unmask, forgets, kill_thread, knows_about, lift,
    lift_io, mask, mod_cref, my_thread_id, new_cref, new_cvar, new_empty_cvar, no_test, put_cvar,
    read_cref, read_cvar, spawn, take_cvar, throw, throw_to, try_put_cvar, try_take_cvar,
    uninterruptible_mask, write_cref, Program,
};
pub use runner::{execute, run, run_io, run_io_with, run_with};
pub use sched::{LeastId, Random, RoundRobin, Scheduler};
pub use stm::{FnTransaction, TVar, Transaction, TxOutcome, TxStore};
pub use substrate::{HostRef, RunConfig, ScopedStore};

pub use weft_types::{
    BlockedOn, CRefId, CVarId, Decision, Failure, IdSource, KnownRef, Lookahead, MaskState,
    ThreadAction, ThreadId, Trace, TraceEntry, TxVarId,
};
