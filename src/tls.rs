//! Worker thread-local state.
//!
//! Each worker thread pins two values for its lifetime: the segmented stack
//! frames are allocated on, and the worker context holding its deque and
//! submission list. Both live on the worker function's own call stack and
//! are published here by pointer, in the same install-and-restore pattern a
//! thread uses to occupy a pool lease. The root entry path briefly installs
//! a temporary stack the same way while it builds a root frame.
//!
//! Two more slots support the suspension protocol: the frame currently being
//! stepped (so awaitables can find their task), and the deferred action an
//! awaitable records for the trampoline to perform once the frame has
//! actually suspended.

use core::cell::Cell;
use core::ptr::NonNull;
use std::thread_local;

use crate::context::WorkerContext;
use crate::frame::FrameHeader;
use crate::list::SubmitHandle;
use crate::stack::Stack;

// -----------------------------------------------------------------------------
// Deferred actions

/// Work an awaitable hands to the trampoline.
///
/// An awaitable must not publish its frame (push it, submit it, or open its
/// join) while the frame is still inside `poll`: another worker could win
/// the frame and step it concurrently. Recording the action here and
/// performing it after `poll` returns preserves the suspend-then-act order.
pub(crate) enum Deferred {
    /// Push the suspending frame for stealing, then run its new child.
    Fork { child: NonNull<FrameHeader> },
    /// Run the suspending frame's new child; the frame stays private.
    Call { child: NonNull<FrameHeader> },
    /// Publish the suspending frame's join and settle the race.
    Join,
    /// Hand the suspending frame to another scheduler.
    Switch {
        task: SubmitHandle,
        target: NonNull<()>,
        submit: unsafe fn(NonNull<()>, SubmitHandle),
    },
}

// -----------------------------------------------------------------------------
// Slots

thread_local! {
    static STACK: Cell<Option<NonNull<Stack>>> = const { Cell::new(None) };
    static CONTEXT: Cell<Option<NonNull<WorkerContext>>> = const { Cell::new(None) };
    static CURRENT_TASK: Cell<Option<NonNull<FrameHeader>>> = const { Cell::new(None) };
    static DEFERRED: Cell<Option<Deferred>> = const { Cell::new(None) };
}

/// Restores the previous stack pointer when dropped.
pub(crate) struct StackGuard {
    previous: Option<NonNull<Stack>>,
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        STACK.with(|slot| slot.set(self.previous));
    }
}

/// Restores the previous context pointer when dropped.
pub(crate) struct ContextGuard {
    previous: Option<NonNull<WorkerContext>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with(|slot| slot.set(self.previous));
    }
}

/// Installs `stack` as this thread's stack until the guard drops.
///
/// The caller must not move or otherwise touch `stack` through the original
/// reference while the guard lives.
pub(crate) fn occupy_stack(stack: &mut Stack) -> StackGuard {
    let previous = STACK.with(|slot| slot.replace(Some(NonNull::from(stack))));
    StackGuard { previous }
}

/// Installs `context` as this thread's worker context until the guard drops.
pub(crate) fn occupy_context(context: &WorkerContext) -> ContextGuard {
    let previous = CONTEXT.with(|slot| slot.replace(Some(NonNull::from(context))));
    ContextGuard { previous }
}

/// The installed stack.
///
/// # Safety
///
/// The caller must be on a thread with a stack installed, and must not let
/// the reference outlive the current step (the single-threaded stack has no
/// other aliasing protection).
pub(crate) unsafe fn stack<'a>() -> &'a mut Stack {
    let ptr = STACK
        .with(Cell::get)
        .expect("no stack installed on this thread");
    // SAFETY: The guard keeps the pointee alive; exclusivity is the caller's
    // contract.
    unsafe { &mut *ptr.as_ptr() }
}

/// The installed worker context, if this thread is a worker.
pub(crate) fn context() -> Option<NonNull<WorkerContext>> {
    CONTEXT.with(Cell::get)
}

/// The installed worker context.
///
/// # Safety
///
/// The caller must be on a worker thread.
pub(crate) unsafe fn context_ref<'a>() -> &'a WorkerContext {
    let ptr = context().expect("no worker context installed on this thread");
    // SAFETY: The guard keeps the pointee alive for the worker's lifetime.
    unsafe { ptr.as_ref() }
}

/// Whether the calling thread is currently a pool worker.
pub(crate) fn is_worker() -> bool {
    context().is_some()
}

/// The frame currently being stepped on this thread.
pub(crate) fn current_task() -> Option<NonNull<FrameHeader>> {
    CURRENT_TASK.with(Cell::get)
}

pub(crate) fn set_current_task(frame: NonNull<FrameHeader>) {
    CURRENT_TASK.with(|slot| slot.set(Some(frame)));
}

/// Records the action to perform once the current frame suspends.
pub(crate) fn defer(action: Deferred) {
    DEFERRED.with(|slot| {
        let stale = slot.replace(Some(action));
        debug_assert!(stale.is_none(), "a deferred action was never performed");
    });
}

pub(crate) fn take_deferred() -> Option<Deferred> {
    DEFERRED.with(Cell::take)
}
