//! Universal properties, driven by seeded random schedulers.
//!
//! Each property runs the same program under many random interleavings and
//! checks an invariant the interpreter must uphold regardless of
//! scheduling.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;

use weft::{
    fork, mod_cref, new_cref, new_empty_cvar, put_cvar, read_cref, run, spawn, take_cvar,
    uninterruptible_mask, Decision, Lookahead, Program, Random, Scheduler, ThreadAction,
    ThreadId,
};

// ============================================================
// Programs under test
// ============================================================

/// Two producers race to fill one variable; the main thread drains it.
fn ping_pong() -> Program<i32> {
    new_empty_cvar::<i32>().and_then(|v| {
        fork(put_cvar(v, 1))
            .then(fork(put_cvar(v, 2)))
            .and_then(move |_| {
                take_cvar(v).and_then(move |x| take_cvar(v).map(move |y| x + y))
            })
    })
}

/// Two children bump a shared cell through atomic modifies; the main
/// thread joins both and reads.
fn contended_cell() -> Program<i32> {
    let bump = |r, by: i32| mod_cref(r, move |n: i32| (n + by, ()));
    new_cref(0_i32).and_then(move |r| {
        spawn(bump(r, 1)).and_then(move |a| {
            spawn(bump(r, 10)).and_then(move |b| {
                take_cvar(a).then(take_cvar(b)).then(read_cref(r))
            })
        })
    })
}

/// Three producers with distinct values; the main thread takes three
/// times.
fn producers() -> Program<Vec<i32>> {
    new_empty_cvar::<i32>().and_then(|v| {
        fork(put_cvar(v, 1))
            .then(fork(put_cvar(v, 2)))
            .then(fork(put_cvar(v, 3)))
            .and_then(move |_| {
                take_cvar(v).and_then(move |a| {
                    take_cvar(v).and_then(move |b| {
                        take_cvar(v).map(move |c| {
                            let mut all = vec![a, b, c];
                            all.sort_unstable();
                            all
                        })
                    })
                })
            })
    })
}

/// A signals from inside an uninterruptible region while B tries to
/// interrupt it; the signal must always land. B only throws once A is
/// provably inside the region (the `ready` handshake is the region's first
/// step), so no interleaving lets the exception land before the mask is up.
fn shielded() -> Program<()> {
    new_empty_cvar::<()>().and_then(|ready| {
        new_empty_cvar::<()>().and_then(move |done| {
            fork(uninterruptible_mask(move |_| {
                put_cvar(ready, ())
                    .then(weft::my_thread_id().map(drop))
                    .then(put_cvar(done, ()))
            }))
            .and_then(move |a| {
                fork(take_cvar(ready).then(weft::throw_to(a, "interrupt")))
                    .then(take_cvar(done))
            })
        })
    })
}

// ============================================================
// A scheduler wrapper that records what the driver was told
// ============================================================

struct Recording<S> {
    inner: S,
    calls: Rc<RefCell<usize>>,
    picks: Rc<RefCell<Vec<(ThreadId, Lookahead)>>>,
}

impl<S> Recording<S> {
    fn new(inner: S) -> (Self, Rc<RefCell<usize>>, Rc<RefCell<Vec<(ThreadId, Lookahead)>>>) {
        let calls = Rc::new(RefCell::new(0));
        let picks = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                inner,
                calls: Rc::clone(&calls),
                picks: Rc::clone(&picks),
            },
            calls,
            picks,
        )
    }
}

impl<S: Scheduler> Scheduler for Recording<S> {
    fn schedule(
        &mut self,
        prior: Option<&(ThreadId, ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> ThreadId {
        *self.calls.borrow_mut() += 1;
        let pick = self.inner.schedule(prior, runnable);
        if let Some((tid, lookahead)) = runnable.iter().find(|(tid, _)| *tid == pick) {
            self.picks.borrow_mut().push((*tid, *lookahead));
        }
        pick
    }
}

// ============================================================
// Properties
// ============================================================

proptest! {
    #[test]
    fn test_runs_are_deterministic_per_seed(seed in any::<u64>()) {
        let (r1, _, t1) = run(Random::from_seed(seed), ping_pong());
        let (r2, _, t2) = run(Random::from_seed(seed), ping_pong());
        prop_assert_eq!(r1, r2);
        prop_assert_eq!(t1, t2);
    }

    #[test]
    fn test_both_puts_land_under_any_schedule(seed in any::<u64>()) {
        let (result, _, _) = run(Random::from_seed(seed), ping_pong());
        prop_assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_mod_cref_is_atomic_under_any_schedule(seed in any::<u64>()) {
        let (result, _, _) = run(Random::from_seed(seed), contended_cell());
        prop_assert_eq!(result, Ok(11));
    }

    #[test]
    fn test_every_take_pairs_with_a_unique_put(seed in any::<u64>()) {
        let (result, _, _) = run(Random::from_seed(seed), producers());
        prop_assert_eq!(result, Ok(vec![1, 2, 3]));
    }

    #[test]
    fn test_uninterruptible_region_always_completes(seed in any::<u64>()) {
        let (result, _, _) = run(Random::from_seed(seed), shielded());
        prop_assert_eq!(result, Ok(()));
    }

    #[test]
    fn test_trace_length_equals_scheduler_invocations(seed in any::<u64>()) {
        let (scheduler, calls, _) = Recording::new(Random::from_seed(seed));
        let (_, _, trace) = run(scheduler, ping_pong());
        prop_assert_eq!(*calls.borrow(), trace.len());
    }

    #[test]
    fn test_decisions_name_the_thread_that_acted(seed in any::<u64>()) {
        let (scheduler, _, picks) = Recording::new(Random::from_seed(seed));
        let (_, _, trace) = run(scheduler, producers());
        let picks = picks.borrow();

        prop_assert_eq!(picks.len(), trace.len());
        let mut prior: Option<ThreadId> = None;
        for (entry, (picked, _)) in trace.iter().zip(picks.iter()) {
            let decided = entry.decision.thread(prior);
            prop_assert_eq!(decided, Some(*picked));
            prior = decided;
        }
    }

    #[test]
    fn test_first_decision_is_a_start(seed in any::<u64>()) {
        let (_, _, trace) = run(Random::from_seed(seed), ping_pong());
        prop_assert!(matches!(trace[0].decision, Decision::Start(_)));
    }

    #[test]
    fn test_lookahead_admits_every_recorded_action(seed in any::<u64>()) {
        let (scheduler, _, picks) = Recording::new(Random::from_seed(seed));
        let (_, _, trace) = run(scheduler, producers());
        let picks = picks.borrow();

        for (entry, (_, lookahead)) in trace.iter().zip(picks.iter()) {
            prop_assert!(
                lookahead.admits(&entry.action),
                "lookahead {:?} does not admit {:?}",
                lookahead,
                entry.action
            );
        }
    }

    #[test]
    fn test_alternatives_never_include_the_chosen_thread(seed in any::<u64>()) {
        let (_, _, trace) = run(Random::from_seed(seed), producers());
        let mut prior: Option<ThreadId> = None;
        for entry in &trace {
            let chosen = entry.decision.thread(prior);
            for (alt, _) in &entry.alternatives {
                prop_assert_ne!(alt.thread(prior), chosen);
            }
            prior = chosen;
        }
    }
}
