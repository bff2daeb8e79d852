//! Per-thread records.
//!
//! Simulated threads are data owned by the driver: a continuation, a block
//! status, a mask, a LIFO of installed handler frames, and an inbox of at
//! most one pending asynchronous exception.

use rustc_hash::FxHashSet;
use weft_types::{BlockedOn, KnownRef, MaskState, ThreadId};

use crate::action::{Action, Exception, Handler};

/// Why a thread terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Cause {
    /// Reached `Stop`.
    Finished,
    /// An exception exhausted the handler stack.
    Killed,
}

/// The lifecycle state of a thread.
#[derive(Debug)]
pub(crate) enum Status {
    Runnable,
    Blocked(BlockedOn),
    Terminated(Cause),
}

/// One installed catch frame: the typed handler and the mask in force when
/// it was installed, re-established if the handler catches.
pub(crate) struct HandlerFrame {
    pub(crate) handle: Handler,
    pub(crate) mask: MaskState,
}

/// A simulated thread.
pub(crate) struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) status: Status,
    /// The next action to execute; `None` once terminated.
    pub(crate) continuation: Option<Action>,
    pub(crate) handlers: Vec<HandlerFrame>,
    pub(crate) mask: MaskState,
    /// At most one externally delivered exception awaiting an interruptible
    /// point.
    pub(crate) pending: Option<Exception>,
    pub(crate) known: FxHashSet<KnownRef>,
    /// Whether the thread declared its acquaintance set complete. Recorded
    /// for search layers; the interpreter itself never reads it.
    #[allow(dead_code)]
    pub(crate) all_known: bool,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, mask: MaskState, continuation: Action) -> Self {
        Self {
            id,
            status: Status::Runnable,
            continuation: Some(continuation),
            handlers: Vec::new(),
            mask,
            pending: None,
            known: FxHashSet::default(),
            all_known: false,
        }
    }

    pub(crate) fn is_runnable(&self) -> bool {
        matches!(self.status, Status::Runnable)
    }

    pub(crate) fn is_blocked(&self) -> bool {
        matches!(self.status, Status::Blocked(_))
    }

    pub(crate) fn is_terminated(&self) -> bool {
        matches!(self.status, Status::Terminated(_))
    }

    pub(crate) fn blocked_on(&self) -> Option<&BlockedOn> {
        match &self.status {
            Status::Blocked(on) => Some(on),
            _ => None,
        }
    }

    /// Whether an asynchronous exception may be delivered right now.
    ///
    /// Unmasked threads are always interruptible; masked-interruptible
    /// threads only while parked at a blocking point. Delivery also
    /// requires an empty inbox, since a thread holds at most one pending
    /// exception.
    pub(crate) fn interruptible(&self) -> bool {
        self.pending.is_none()
            && match self.mask {
                MaskState::Unmasked => true,
                MaskState::MaskedInterruptible => self.is_blocked(),
                MaskState::MaskedUninterruptible => false,
            }
    }

    /// Park this thread on a blocking reason, stashing the action to
    /// re-execute on wakeup.
    pub(crate) fn block(&mut self, on: BlockedOn, action: Action) {
        self.status = Status::Blocked(on);
        self.continuation = Some(action);
    }

    /// Move a blocked thread back to runnable; its stashed action
    /// re-executes when it is next scheduled.
    pub(crate) fn unblock(&mut self) {
        self.status = Status::Runnable;
    }

    /// Propagate an exception through the handler stack.
    ///
    /// Pops frames until one matches; a match re-establishes the frame's
    /// saved mask and installs the handler continuation. Returns `false` if
    /// the stack emptied, in which case the thread is dead.
    pub(crate) fn raise(&mut self, exc: Exception) -> bool {
        let mut exc = exc;
        while let Some(frame) = self.handlers.pop() {
            match (frame.handle)(exc) {
                Ok(next) => {
                    self.mask = frame.mask;
                    self.status = Status::Runnable;
                    self.continuation = Some(next);
                    return true;
                }
                Err(unmatched) => exc = unmatched,
            }
        }
        self.status = Status::Terminated(Cause::Killed);
        self.continuation = None;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interruptible_by_mask() {
        let mut thread = Thread::new(ThreadId::MAIN, MaskState::Unmasked, Action::Stop);
        assert!(thread.interruptible());

        thread.mask = MaskState::MaskedInterruptible;
        assert!(!thread.interruptible());
        thread.block(BlockedOn::Take(weft_types::CVarId::new(1)), Action::Stop);
        assert!(thread.interruptible());

        thread.mask = MaskState::MaskedUninterruptible;
        assert!(!thread.interruptible());
    }

    #[test]
    fn test_full_inbox_defers_delivery() {
        let mut thread = Thread::new(ThreadId::MAIN, MaskState::Unmasked, Action::Stop);
        thread.pending = Some(Exception::new(()));
        assert!(!thread.interruptible());
    }

    #[test]
    fn test_raise_without_handlers_kills() {
        let mut thread = Thread::new(ThreadId::MAIN, MaskState::Unmasked, Action::Stop);
        assert!(!thread.raise(Exception::new("boom")));
        assert!(thread.is_terminated());
        assert!(thread.continuation.is_none());
    }

    #[test]
    fn test_raise_restores_handler_mask() {
        let mut thread = Thread::new(
            ThreadId::MAIN,
            MaskState::MaskedUninterruptible,
            Action::Stop,
        );
        thread.handlers.push(HandlerFrame {
            handle: Box::new(|exc| match exc.downcast::<i32>() {
                Ok(_) => Ok(Action::Stop),
                Err(exc) => Err(exc),
            }),
            mask: MaskState::Unmasked,
        });

        assert!(thread.raise(Exception::new(1_i32)));
        assert_eq!(thread.mask, MaskState::Unmasked);
        assert!(thread.is_runnable());
    }

    #[test]
    fn test_raise_skips_nonmatching_frames() {
        let mut thread = Thread::new(ThreadId::MAIN, MaskState::Unmasked, Action::Stop);
        thread.handlers.push(HandlerFrame {
            handle: Box::new(|exc| match exc.downcast::<i32>() {
                Ok(_) => Ok(Action::Stop),
                Err(exc) => Err(exc),
            }),
            mask: MaskState::Unmasked,
        });
        thread.handlers.push(HandlerFrame {
            handle: Box::new(|exc| match exc.downcast::<String>() {
                Ok(_) => Ok(Action::Stop),
                Err(exc) => Err(exc),
            }),
            mask: MaskState::Unmasked,
        });

        // The i32 exception skips the String frame and lands in the one
        // below it.
        assert!(thread.raise(Exception::new(3_i32)));
        assert!(thread.handlers.is_empty());
    }
}
