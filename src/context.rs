//! Worker contexts and the task resume entry points.
//!
//! A [`WorkerContext`] is the shareable half of a worker: the deque other
//! workers steal from, the submission list external threads schedule onto,
//! and the notification hook a pool uses to wake the worker. The worker
//! thread itself pairs the context with a thread-local [`Stack`] for the
//! duration of its life.
//!
//! [`Stack`]: crate::stack::Stack

use core::ptr::NonNull;

use tracing::trace;

use crate::deque::{Deque, Steal};
use crate::frame::{FrameHeader, TaskHandle, Transfer};
use crate::list::{Drain, SubmissionList, SubmitHandle};
use crate::tls;

// -----------------------------------------------------------------------------
// Worker context

/// The per-worker scheduling state shared with the rest of the pool.
pub struct WorkerContext {
    index: usize,
    deque: Deque<TaskHandle>,
    submissions: SubmissionList,
    notify: Box<dyn Fn() + Send + Sync>,
}

impl WorkerContext {
    /// Creates a context. `notify` is invoked (on the submitting thread) for
    /// every submission, and must not panic.
    pub(crate) fn new(index: usize, notify: Box<dyn Fn() + Send + Sync>) -> WorkerContext {
        WorkerContext {
            index,
            deque: Deque::new(),
            submissions: SubmissionList::new(),
            notify,
        }
    }

    /// The worker's index within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Submits a task to this worker. Any thread may call this; the
    /// notification hook runs unconditionally after the push so a sleeping
    /// worker is always told about new work.
    pub fn schedule(&self, task: SubmitHandle) {
        self.submissions.push(task);
        (self.notify)();
    }

    /// Attempts to steal the oldest ready task. Any thread may call this.
    pub(crate) fn try_steal(&self) -> Steal<TaskHandle> {
        self.deque.steal()
    }

    /// Whether the submission list appears non-empty.
    pub(crate) fn has_submissions(&self) -> bool {
        !self.submissions.is_empty()
    }

    /// Drains the submission list in FIFO order.
    ///
    /// # Safety
    ///
    /// Owner only.
    pub(crate) unsafe fn drain_submissions(&self) -> Drain {
        // SAFETY: Forwarded contract.
        unsafe { self.submissions.drain() }
    }

    /// Exposes a suspended task for stealing.
    ///
    /// # Safety
    ///
    /// Owner only.
    pub(crate) unsafe fn push_task(&self, task: TaskHandle) {
        // SAFETY: Forwarded contract.
        unsafe { self.deque.push(task) }
    }

    /// Takes back the most recently pushed task, if nobody stole it.
    ///
    /// # Safety
    ///
    /// Owner only.
    pub(crate) unsafe fn pop_task(&self) -> Option<TaskHandle> {
        // SAFETY: Forwarded contract.
        unsafe { self.deque.pop() }
    }
}

// -----------------------------------------------------------------------------
// Resume entry points

/// Runs a submitted frame to its next yield point.
///
/// A frame that has never been stolen brings its stack with it: the
/// submitter released the chain when the frame suspended, and this worker
/// adopts it before stepping. A frame with steals outstanding leaves its
/// chain with the original worker and runs against our (empty) stack.
///
/// # Safety
///
/// May only be called from a worker's main loop, between tasks, with the
/// thread-local stack empty.
pub(crate) unsafe fn resume_submission(frame: NonNull<FrameHeader>) {
    // SAFETY: The submission hand-off makes us the frame's exclusive owner.
    unsafe {
        trace!("resuming a submitted task");
        if frame.as_ref().steals() == 0 {
            tls::stack().adopt(frame.as_ref().stacklet());
        }
        trampoline(frame);
    }
}

/// Runs a freshly stolen frame to its next yield point, counting the steal.
///
/// # Safety
///
/// May only be called by the worker whose steal CAS succeeded, from its main
/// loop, with the thread-local stack empty.
pub(crate) unsafe fn resume_stolen(task: TaskHandle) {
    // SAFETY: Winning the steal made us the frame's exclusive owner.
    unsafe {
        trace!("resuming a stolen task");
        task.0.as_ref().count_steal();
        trampoline(task.0);
    }
}

/// Steps frames until one yields back to the main loop.
///
/// This loop is what symmetric transfer lowers to: a completed child hands
/// back its parent, a fork hands over its new child, and the native call
/// stack stays flat no matter how deep the task tree gets.
///
/// # Safety
///
/// The caller must own `first` exclusively and have the thread-local stack
/// and context installed.
pub(crate) unsafe fn trampoline(first: NonNull<FrameHeader>) {
    let mut current = first;
    loop {
        // SAFETY: Each handle returned by `step` is owned by this worker.
        match unsafe { FrameHeader::step(current) } {
            Transfer::Resume(next) => current = next,
            Transfer::Yield => break,
        }
    }
    // Every yield path leaves the worker with an empty stack: a completed
    // root empties its adopted chain, and losing paths release theirs.
    debug_assert!(unsafe { tls::stack().is_empty() });
}
