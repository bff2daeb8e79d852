//! The driver loop.
//!
//! The driver owns the world — identifier source, thread table, resource
//! maps, scoped store — and advances it one action per step: compute the
//! runnable set with lookaheads, ask the scheduler, execute exactly one
//! action of the chosen thread, record a trace entry, repeat. It is the
//! only thing that mutates the world; actions are pure descriptions whose
//! effects happen here. Runs in separate worlds share nothing.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use weft_types::{
    BlockedOn, CRefId, CVarId, Decision, Failure, IdSource, Lookahead, MaskState, ThreadAction,
    ThreadId, Trace, TraceEntry, TxVarId,
};

use crate::action::{Action, ErasedProgram, HostEffect, MaskRestore, SharedValue, Value};
use crate::cref::CRefState;
use crate::cvar::CVarState;
use crate::program::Program;
use crate::sched::Scheduler;
use crate::stm::{TxOutcome, TxStore};
use crate::substrate::{RunConfig, ScopedStore};
use crate::thread::{Cause, HandlerFrame, Status, Thread};

/// Run a program under the pure substrate with default settings.
///
/// Returns the result (or failure), the scheduler in its final state, and
/// the full trace. A lifted IO effect under this entry point is an
/// `InternalError`.
pub fn run<T: 'static, S: Scheduler>(
    scheduler: S,
    program: Program<T>,
) -> (Result<T, Failure>, S, Trace) {
    run_with(RunConfig::new(), scheduler, program)
}

/// [`run`] with explicit settings.
pub fn run_with<T: 'static, S: Scheduler>(
    config: RunConfig,
    scheduler: S,
    program: Program<T>,
) -> (Result<T, Failure>, S, Trace) {
    run_inner(config, false, scheduler, program)
}

/// Run a program that may lift arbitrary IO effects.
pub fn run_io<T: 'static, S: Scheduler>(
    scheduler: S,
    program: Program<T>,
) -> (Result<T, Failure>, S, Trace) {
    run_io_with(RunConfig::new(), scheduler, program)
}

/// [`run_io`] with explicit settings.
pub fn run_io_with<T: 'static, S: Scheduler>(
    config: RunConfig,
    scheduler: S,
    program: Program<T>,
) -> (Result<T, Failure>, S, Trace) {
    run_inner(config, true, scheduler, program)
}

/// The simple entry point: just the result.
pub fn execute<T: 'static, S: Scheduler>(scheduler: S, program: Program<T>) -> Result<T, Failure> {
    run(scheduler, program).0
}

fn run_inner<T: 'static, S: Scheduler>(
    config: RunConfig,
    io_allowed: bool,
    mut scheduler: S,
    program: Program<T>,
) -> (Result<T, Failure>, S, Trace) {
    let result: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
    let cell = Rc::clone(&result);
    let root = program.into_action(Box::new(move |value| {
        *cell.borrow_mut() = Some(value);
        Action::Stop
    }));

    debug!(io_allowed, safe_io = config.is_safe_io(), "starting run");

    let mut world = World::new(io_allowed, root);
    let mut full_trace = Trace::new();
    let mut prior: Option<(ThreadId, ThreadAction)> = None;

    let failure = loop {
        match world.main_status() {
            Some(Status::Terminated(Cause::Finished)) => break None,
            Some(Status::Terminated(Cause::Killed)) => break Some(Failure::UncaughtException),
            Some(_) => {}
            None => break Some(Failure::InternalError),
        }

        let runnable = world.runnable();
        if runnable.is_empty() {
            break Some(world.classify_deadlock());
        }

        let chosen = scheduler.schedule(prior.as_ref(), &runnable);
        if !runnable.iter().any(|(tid, _)| *tid == chosen) {
            break Some(Failure::InternalError);
        }

        let prior_tid = prior.as_ref().map(|(tid, _)| *tid);
        let decision = decision_for(chosen, prior_tid, &runnable);
        let alternatives = runnable
            .iter()
            .filter(|(tid, _)| *tid != chosen)
            .map(|(tid, lookahead)| (decision_for(*tid, prior_tid, &runnable), *lookahead))
            .collect();

        let action = match world.step(chosen) {
            Ok(action) => action,
            Err(failure) => break Some(failure),
        };
        trace!(step = world.step_no, thread = %chosen, ?action, "step");

        full_trace.push(TraceEntry {
            decision,
            alternatives,
            action: action.clone(),
        });
        prior = Some((chosen, action));
        world.step_no += 1;
    };

    debug!(steps = world.step_no, ?failure, "run finished");

    let outcome = match failure {
        Some(failure) => Err(failure),
        None => result
            .borrow_mut()
            .take()
            .ok_or(Failure::InternalError),
    };
    (outcome, scheduler, full_trace)
}

/// Classify the decision that selects `tid`, given the previous thread and
/// the current runnable set.
fn decision_for(
    tid: ThreadId,
    prior: Option<ThreadId>,
    runnable: &[(ThreadId, Lookahead)],
) -> Decision {
    match prior {
        None => Decision::Start(tid),
        Some(prev) if prev == tid => Decision::Continue,
        Some(prev) if runnable.iter().any(|(t, _)| *t == prev) => Decision::SwitchTo(tid),
        Some(_) => Decision::Start(tid),
    }
}

/// The interpreter's entire mutable state, owned for the duration of one
/// run.
struct World {
    ids: IdSource,
    threads: IndexMap<ThreadId, Thread>,
    cvars: FxHashMap<CVarId, CVarState>,
    crefs: FxHashMap<CRefId, CRefState>,
    txvars: FxHashMap<TxVarId, SharedValue>,
    store: ScopedStore,
    io_allowed: bool,
    step_no: usize,
}

impl World {
    fn new(io_allowed: bool, root: Action) -> Self {
        let mut threads = IndexMap::new();
        threads.insert(
            ThreadId::MAIN,
            Thread::new(ThreadId::MAIN, MaskState::Unmasked, root),
        );
        Self {
            ids: IdSource::new(),
            threads,
            cvars: FxHashMap::default(),
            crefs: FxHashMap::default(),
            txvars: FxHashMap::default(),
            store: ScopedStore::new(),
            io_allowed,
            step_no: 0,
        }
    }

    fn main_status(&self) -> Option<&Status> {
        self.threads.get(&ThreadId::MAIN).map(|t| &t.status)
    }

    fn thread(&self, tid: ThreadId) -> Result<&Thread, Failure> {
        self.threads.get(&tid).ok_or(Failure::InternalError)
    }

    fn thread_mut(&mut self, tid: ThreadId) -> Result<&mut Thread, Failure> {
        self.threads.get_mut(&tid).ok_or(Failure::InternalError)
    }

    /// Hand a runnable thread its next action.
    fn resume(&mut self, tid: ThreadId, next: Action) -> Result<(), Failure> {
        self.thread_mut(tid)?.continuation = Some(next);
        Ok(())
    }

    /// The runnable set with one-step lookaheads, ascending by thread id.
    ///
    /// Thread ids are allocated monotonically and the table keeps creation
    /// order, so no re-sort is needed. Never mutates the world.
    fn runnable(&self) -> Vec<(ThreadId, Lookahead)> {
        self.threads
            .values()
            .filter(|t| t.is_runnable())
            .filter_map(|t| t.continuation.as_ref().map(|a| (t.id, a.lookahead())))
            .collect()
    }

    /// No thread is runnable and the main thread is alive: decide which
    /// flavor of deadlock this is.
    fn classify_deadlock(&self) -> Failure {
        let all_stm = self
            .threads
            .values()
            .filter(|t| t.is_blocked())
            .all(|t| matches!(t.blocked_on(), Some(BlockedOn::Stm(_))));
        if all_stm {
            Failure::STMDeadlock
        } else {
            Failure::Deadlock
        }
    }

    /// Advance the chosen thread by exactly one step.
    fn step(&mut self, tid: ThreadId) -> Result<ThreadAction, Failure> {
        let acted = if self.deliverable_pending(tid)? {
            // The pending asynchronous exception preempts the ordinary
            // action: consuming it is the thread's entire step.
            let thread = self.thread_mut(tid)?;
            let exc = thread.pending.take().ok_or(Failure::InternalError)?;
            thread.continuation = None;
            if thread.raise(exc) {
                ThreadAction::Throw
            } else {
                ThreadAction::Killed
            }
        } else {
            let action = self
                .thread_mut(tid)?
                .continuation
                .take()
                .ok_or(Failure::InternalError)?;
            self.execute(tid, action)?
        };
        self.wake_throwers();
        Ok(acted)
    }

    /// Whether the thread's inbox must be consumed before its next action.
    ///
    /// Unmasked threads consume immediately; masked-interruptible threads
    /// only when the head of their continuation is a blocking-capable
    /// primitive. A delivery never interrupts mid-action.
    fn deliverable_pending(&self, tid: ThreadId) -> Result<bool, Failure> {
        let thread = self.thread(tid)?;
        Ok(thread.pending.is_some()
            && match thread.mask {
                MaskState::Unmasked => true,
                MaskState::MaskedInterruptible => thread
                    .continuation
                    .as_ref()
                    .map_or(false, Action::can_block),
                MaskState::MaskedUninterruptible => false,
            })
    }

    /// Execute one action on behalf of `tid`, returning what it did.
    fn execute(&mut self, tid: ThreadId, action: Action) -> Result<ThreadAction, Failure> {
        match action {
            Action::Fork(body, k) => {
                let child = self.ids.fresh_thread();
                let mask = self.thread(tid)?.mask;
                let restore = MaskRestore::new(mask, mask);
                self.threads
                    .insert(child, Thread::new(child, mask, body(restore)));
                self.resume(tid, k(child))?;
                Ok(ThreadAction::Fork(child))
            }

            Action::MyThreadId(k) => {
                self.resume(tid, k(tid))?;
                Ok(ThreadAction::MyThreadId)
            }

            Action::New(k) => {
                let id = self.ids.fresh_cvar();
                self.cvars.insert(id, CVarState::new());
                self.resume(tid, k(id))?;
                Ok(ThreadAction::New(id))
            }

            Action::Put(var_id, value, k) => {
                let var = self.cvars.get_mut(&var_id).ok_or(Failure::InternalError)?;
                if var.is_full() {
                    var.block_putter(tid);
                    self.thread_mut(tid)?
                        .block(BlockedOn::Put(var_id), Action::Put(var_id, value, k));
                    Ok(ThreadAction::BlockedPut(var_id))
                } else {
                    let woken = var.fill(value);
                    self.wake(&woken)?;
                    self.resume(tid, k())?;
                    Ok(ThreadAction::Put(var_id, woken))
                }
            }

            Action::TryPut(var_id, value, k) => {
                let var = self.cvars.get_mut(&var_id).ok_or(Failure::InternalError)?;
                if var.is_full() {
                    self.resume(tid, k(false))?;
                    Ok(ThreadAction::TryPut(var_id, false, Vec::new()))
                } else {
                    let woken = var.fill(value);
                    self.wake(&woken)?;
                    self.resume(tid, k(true))?;
                    Ok(ThreadAction::TryPut(var_id, true, woken))
                }
            }

            Action::Read(var_id, k) => {
                let var = self.cvars.get_mut(&var_id).ok_or(Failure::InternalError)?;
                match var.value() {
                    Some(value) => {
                        self.resume(tid, k(value))?;
                        Ok(ThreadAction::Read(var_id))
                    }
                    None => {
                        var.block_reader(tid);
                        self.thread_mut(tid)?
                            .block(BlockedOn::Read(var_id), Action::Read(var_id, k));
                        Ok(ThreadAction::BlockedRead(var_id))
                    }
                }
            }

            Action::Take(var_id, k) => {
                let var = self.cvars.get_mut(&var_id).ok_or(Failure::InternalError)?;
                if var.is_full() {
                    let (value, woken) = var.empty_slot();
                    self.wake(&woken)?;
                    self.resume(tid, k(value))?;
                    Ok(ThreadAction::Take(var_id, woken))
                } else {
                    var.block_taker(tid);
                    self.thread_mut(tid)?
                        .block(BlockedOn::Take(var_id), Action::Take(var_id, k));
                    Ok(ThreadAction::BlockedTake(var_id))
                }
            }

            Action::TryTake(var_id, k) => {
                let var = self.cvars.get_mut(&var_id).ok_or(Failure::InternalError)?;
                if var.is_full() {
                    let (value, woken) = var.empty_slot();
                    self.wake(&woken)?;
                    self.resume(tid, k(Some(value)))?;
                    Ok(ThreadAction::TryTake(var_id, true, woken))
                } else {
                    self.resume(tid, k(None))?;
                    Ok(ThreadAction::TryTake(var_id, false, Vec::new()))
                }
            }

            Action::NewRef(value, k) => {
                let id = self.ids.fresh_cref();
                self.crefs.insert(id, CRefState::new(value));
                self.resume(tid, k(id))?;
                Ok(ThreadAction::NewRef(id))
            }

            Action::ReadRef(cell_id, k) => {
                let value = self
                    .crefs
                    .get(&cell_id)
                    .ok_or(Failure::InternalError)?
                    .value();
                self.resume(tid, k(value))?;
                Ok(ThreadAction::ReadRef(cell_id))
            }

            Action::ModRef(cell_id, f, k) => {
                let cell = self.crefs.get_mut(&cell_id).ok_or(Failure::InternalError)?;
                let (next, out) = f(cell.value());
                cell.set(next);
                self.resume(tid, k(out))?;
                Ok(ThreadAction::ModRef(cell_id))
            }

            Action::Lift(effect) => {
                let next = match effect {
                    HostEffect::Scoped(run) => run(&mut self.store),
                    HostEffect::Io(run) => {
                        if !self.io_allowed {
                            return Err(Failure::InternalError);
                        }
                        run()
                    }
                };
                self.resume(tid, next)?;
                Ok(ThreadAction::Lift)
            }

            Action::Atom(tx, k) => {
                let snapshot = self.txvars.clone();
                let (outcome, written, read) = {
                    let mut txstore = TxStore::new(&mut self.ids, &mut self.txvars);
                    let outcome = tx.atomically(&mut txstore);
                    (outcome, txstore.written_set(), txstore.read_set())
                };
                match outcome {
                    TxOutcome::Committed(value) => {
                        let woken = self.wake_stm(&written);
                        self.resume(tid, k(value))?;
                        Ok(ThreadAction::Atom(woken))
                    }
                    TxOutcome::Retry => {
                        self.txvars = snapshot;
                        self.thread_mut(tid)?
                            .block(BlockedOn::Stm(read), Action::Atom(tx, k));
                        Ok(ThreadAction::BlockedAtom)
                    }
                    TxOutcome::Thrown(exc) => {
                        self.txvars = snapshot;
                        self.thread_mut(tid)?.raise(exc);
                        Ok(ThreadAction::Throw)
                    }
                }
            }

            Action::Throw(exc) => {
                self.thread_mut(tid)?.raise(exc);
                Ok(ThreadAction::Throw)
            }

            Action::ThrowTo(target, exc, k) => {
                if target == tid {
                    // Throwing to yourself is synchronous: the exception is
                    // raised on the spot and the continuation never runs.
                    self.thread_mut(tid)?.raise(exc);
                    return Ok(ThreadAction::ThrowTo(target));
                }
                let (terminated, deliverable) = {
                    let t = self.thread(target)?;
                    (t.is_terminated(), t.interruptible())
                };
                if terminated {
                    self.resume(tid, k())?;
                    Ok(ThreadAction::ThrowTo(target))
                } else if deliverable {
                    let t = self.thread_mut(target)?;
                    t.pending = Some(exc);
                    let parked = t.blocked_on().cloned();
                    if parked.is_some() {
                        t.unblock();
                    }
                    match parked {
                        Some(
                            BlockedOn::Take(var)
                            | BlockedOn::Put(var)
                            | BlockedOn::Read(var),
                        ) => {
                            if let Some(state) = self.cvars.get_mut(&var) {
                                state.forget(target);
                            }
                        }
                        _ => {}
                    }
                    self.resume(tid, k())?;
                    Ok(ThreadAction::ThrowTo(target))
                } else {
                    self.thread_mut(tid)?.block(
                        BlockedOn::ThrowTo(target),
                        Action::ThrowTo(target, exc, k),
                    );
                    Ok(ThreadAction::BlockedThrowTo(target))
                }
            }

            Action::Catching(handler, guarded) => {
                let thread = self.thread_mut(tid)?;
                let mask = thread.mask;
                thread.handlers.push(HandlerFrame {
                    handle: handler,
                    mask,
                });
                thread.continuation = Some(guarded());
                Ok(ThreadAction::Catching)
            }

            Action::PopCatching(next) => {
                let thread = self.thread_mut(tid)?;
                thread.handlers.pop();
                thread.continuation = Some(next());
                Ok(ThreadAction::PopCatching)
            }

            Action::Masking(state, body) => {
                let thread = self.thread_mut(tid)?;
                let outer = thread.mask;
                thread.mask = state;
                thread.continuation = Some(body(MaskRestore::new(outer, state)));
                Ok(ThreadAction::Masking(state))
            }

            Action::ResetMask(outer, inner, state, next) => {
                let thread = self.thread_mut(tid)?;
                thread.mask = state;
                thread.continuation = Some(next());
                Ok(ThreadAction::ResetMask(outer, inner, state))
            }

            Action::NoTest(program, k) => {
                let value = self.run_no_test(program)?;
                self.resume(tid, k(value))?;
                Ok(ThreadAction::NoTest)
            }

            Action::KnowsAbout(resource, next) => {
                let thread = self.thread_mut(tid)?;
                thread.known.insert(resource);
                thread.continuation = Some(next());
                Ok(ThreadAction::KnowsAbout)
            }

            Action::Forgets(resource, next) => {
                let thread = self.thread_mut(tid)?;
                thread.known.remove(&resource);
                thread.continuation = Some(next());
                Ok(ThreadAction::Forgets)
            }

            Action::AllKnown(next) => {
                let thread = self.thread_mut(tid)?;
                thread.all_known = true;
                thread.continuation = Some(next());
                Ok(ThreadAction::AllKnown)
            }

            Action::Stop => {
                let thread = self.thread_mut(tid)?;
                thread.status = Status::Terminated(Cause::Finished);
                thread.continuation = None;
                Ok(ThreadAction::Stop)
            }
        }
    }

    /// Move woken threads back to runnable; their stashed actions
    /// re-execute when next scheduled.
    fn wake(&mut self, woken: &[ThreadId]) -> Result<(), Failure> {
        for tid in woken {
            self.thread_mut(*tid)?.unblock();
        }
        Ok(())
    }

    /// Wake retrying transactions whose read set was written.
    fn wake_stm(&mut self, written: &[TxVarId]) -> Vec<ThreadId> {
        let mut woken = Vec::new();
        for thread in self.threads.values_mut() {
            if let Status::Blocked(BlockedOn::Stm(reads)) = &thread.status {
                if reads.iter().any(|read| written.contains(read)) {
                    thread.unblock();
                    woken.push(thread.id);
                }
            }
        }
        woken.sort_unstable();
        woken
    }

    /// Wake senders parked on a throw whose target became interruptible or
    /// terminated.
    fn wake_throwers(&mut self) {
        let mut senders = Vec::new();
        for thread in self.threads.values() {
            if let Status::Blocked(BlockedOn::ThrowTo(target)) = &thread.status {
                let ready = self
                    .threads
                    .get(target)
                    .map_or(true, |t| t.is_terminated() || t.interruptible());
                if ready {
                    senders.push(thread.id);
                }
            }
        }
        for tid in senders {
            if let Some(thread) = self.threads.get_mut(&tid) {
                thread.unblock();
            }
        }
    }

    /// Run an opaque sub-computation to completion as one step.
    ///
    /// The sub-run shares the world's resources but gets a private thread
    /// table, stepped least-id-first without tracing; any failure inside it
    /// becomes `FailureInNoTest` for the enclosing run.
    fn run_no_test(&mut self, program: ErasedProgram) -> Result<Value, Failure> {
        let result: Rc<RefCell<Option<Value>>> = Rc::new(RefCell::new(None));
        let cell = Rc::clone(&result);
        let root = program(Box::new(move |value| {
            *cell.borrow_mut() = Some(value);
            Action::Stop
        }));

        let sub_main = self.ids.fresh_thread();
        let outer = std::mem::take(&mut self.threads);
        self.threads
            .insert(sub_main, Thread::new(sub_main, MaskState::Unmasked, root));

        let outcome = loop {
            match self.threads.get(&sub_main).map(|t| &t.status) {
                Some(Status::Terminated(Cause::Finished)) => break Ok(()),
                Some(Status::Terminated(Cause::Killed)) | None => {
                    break Err(Failure::FailureInNoTest)
                }
                Some(_) => {}
            }
            let runnable = self.runnable();
            if runnable.is_empty() {
                break Err(Failure::FailureInNoTest);
            }
            if self.step(runnable[0].0).is_err() {
                break Err(Failure::FailureInNoTest);
            }
        };

        self.threads = outer;
        outcome.and_then(|()| {
            result
                .borrow_mut()
                .take()
                .ok_or(Failure::FailureInNoTest)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{
        fork, lift, lift_io, new_empty_cvar, no_test, put_cvar, take_cvar, Program,
    };
    use crate::sched::LeastId;

    #[test]
    fn test_ping() {
        let program = new_empty_cvar::<i32>()
            .and_then(|v| fork(put_cvar(v, 42)).and_then(move |_| take_cvar(v)));
        let (result, _, trace) = run(LeastId, program);

        assert_eq!(result, Ok(42));
        assert_eq!(trace.len(), 6);
    }

    #[test]
    fn test_scheduler_returning_bogus_id_is_internal_error() {
        struct Bogus;
        impl Scheduler for Bogus {
            fn schedule(
                &mut self,
                _prior: Option<&(ThreadId, ThreadAction)>,
                _runnable: &[(ThreadId, Lookahead)],
            ) -> ThreadId {
                ThreadId::new(99)
            }
        }

        let (result, _, trace) = run(Bogus, Program::pure(0_i32));
        assert_eq!(result, Err(Failure::InternalError));
        assert!(trace.is_empty());
    }

    #[test]
    fn test_io_effect_under_pure_runner_is_internal_error() {
        let program = lift_io(|| 1_i32);
        assert_eq!(execute(LeastId, program), Err(Failure::InternalError));

        let program = lift_io(|| 1_i32);
        let (result, _, _) = run_io(LeastId, program);
        assert_eq!(result, Ok(1));
    }

    #[test]
    fn test_scoped_effects_run_everywhere() {
        let program = lift(|store| {
            let r = store.new_ref(20_i32);
            store.set(r, store.get(r) + 1);
            store.get(r)
        });
        assert_eq!(execute(LeastId, program), Ok(21));
    }

    #[test]
    fn test_no_test_wraps_a_result() {
        let program = no_test(Program::pure(5_i32)).map(|n| n * 2);
        assert_eq!(execute(LeastId, program), Ok(10));
    }

    #[test]
    fn test_no_test_failure_poisons_the_run() {
        let program = no_test(new_empty_cvar::<i32>().and_then(take_cvar));
        assert_eq!(execute(LeastId, program), Err(Failure::FailureInNoTest));
    }
}
