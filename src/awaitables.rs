//! The suspension primitives: `fork`, `call`, `join`, and `resume_on`.
//!
//! These are the only awaitables a task may suspend on. Each one runs in two
//! halves. Inside `poll`, the awaitable does everything that is safe while
//! the frame is still live on this thread's call stack: it builds the child
//! frame, records which action to take, and returns `Pending`. The second
//! half runs in [`perform_deferred`], after `poll` has returned and the
//! frame is genuinely suspended; only then is the frame published -- pushed
//! for stealing, its join opened, or submitted to another scheduler. An
//! awaitable's second `poll` is its resumption.
//!
//! # Safety contract for `fork` and `call`
//!
//! The borrow checker cannot see that a forked child finishes before its
//! parent's `join` returns, so the dispatch functions are `unsafe`. The
//! caller promises that:
//!
//! - the task `.await`s the returned awaitable immediately, and
//! - every `fork` in a scope is followed by a `join().await` on all paths
//!   before the scope's locals (including the return [`Slot`](crate::Slot))
//!   go away.

use core::cell::Cell;
use core::future::Future;
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};
use core::task::{Context, Poll};

use tracing::trace;

use crate::frame::{FrameHeader, Return, Tag, TaskFrame, TaskHandle, Transfer, PENDING_JOINS};
use crate::list::{SubmissionNode, SubmitHandle};
use crate::root::Scheduler;
use crate::tls;
use crate::tls::Deferred;
use crate::unwind;

// -----------------------------------------------------------------------------
// Dispatch

/// Spawns `future` as a child that runs now, exposing the current task for
/// stealing until the matching [`join`].
///
/// The child's result is delivered to `ret`: a `&Slot<R>` owned by the
/// caller, or [`Discard`](crate::Discard).
///
/// # Safety
///
/// See the [module contract](self). Additionally `ret` must stay alive until
/// the matching `join` resolves.
///
/// # Panics
///
/// Panics if called outside a task.
#[must_use = "fork does nothing until awaited"]
pub unsafe fn fork<R, F>(ret: R, future: F) -> ForkAwait
where
    F: Future + Send,
    R: Return<F::Output>,
{
    ForkAwait {
        child: Cell::new(Some(dispatch(Tag::Fork, ret, future))),
    }
}

/// Like [`fork`], but the resumed awaitable reports whether the child
/// completed synchronously (without the current task being stolen), and
/// eagerly re-raises a pending child panic when it did.
///
/// # Safety
///
/// See [`fork`].
#[must_use = "fork does nothing until awaited"]
pub unsafe fn fork_sync<R, F>(ret: R, future: F) -> SyncForkAwait
where
    F: Future + Send,
    R: Return<F::Output>,
{
    // SAFETY: Forwarded contract.
    sync_fork(ret, future, false)
}

/// Like [`fork_sync`], for a fork outside any enclosing fork-join scope:
/// no sibling can hold the panic cell hostage, so a pending panic is always
/// re-raised directly.
///
/// # Safety
///
/// See [`fork`]; additionally the current task must have no unjoined forks.
#[must_use = "fork does nothing until awaited"]
pub unsafe fn fork_sync_outside<R, F>(ret: R, future: F) -> SyncForkAwait
where
    F: Future + Send,
    R: Return<F::Output>,
{
    // SAFETY: Forwarded contract.
    sync_fork(ret, future, true)
}

unsafe fn sync_fork<R, F>(ret: R, future: F, outside: bool) -> SyncForkAwait
where
    F: Future + Send,
    R: Return<F::Output>,
{
    let steals_before = tls::current_task()
        .map(|task| {
            // SAFETY: The current task's frame is live while it runs.
            unsafe { task.as_ref().steals() }
        })
        .unwrap_or(0);
    SyncForkAwait {
        child: Cell::new(Some(dispatch(Tag::Fork, ret, future))),
        steals_before,
        outside,
    }
}

/// Spawns `future` as a child that must complete before the current task
/// continues. The current task is not exposed for stealing.
///
/// # Safety
///
/// `ret` must stay alive until the awaitable resolves. (A called child
/// cannot outlive its awaiter, so no join obligation is incurred.)
///
/// # Panics
///
/// Panics if called outside a task.
#[must_use = "call does nothing until awaited"]
pub unsafe fn call<R, F>(ret: R, future: F) -> CallAwait
where
    F: Future + Send,
    R: Return<F::Output>,
{
    CallAwait {
        child: Cell::new(Some(dispatch(Tag::Call, ret, future))),
    }
}

/// Like [`call`], but the resumed awaitable eagerly re-raises a pending
/// child panic instead of waiting for the next `join`.
///
/// # Safety
///
/// See [`call`].
#[must_use = "call does nothing until awaited"]
pub unsafe fn call_eager<R, F>(ret: R, future: F) -> EagerCallAwait
where
    F: Future + Send,
    R: Return<F::Output>,
{
    EagerCallAwait {
        child: Cell::new(Some(dispatch(Tag::Call, ret, future))),
        outside: false,
    }
}

/// Like [`call_eager`], for a call outside any enclosing fork-join scope.
///
/// # Safety
///
/// See [`call`]; additionally the current task must have no unjoined forks.
#[must_use = "call does nothing until awaited"]
pub unsafe fn call_eager_outside<R, F>(ret: R, future: F) -> EagerCallAwait
where
    F: Future + Send,
    R: Return<F::Output>,
{
    EagerCallAwait {
        child: Cell::new(Some(dispatch(Tag::Call, ret, future))),
        outside: true,
    }
}

/// Builds a child frame on the current worker's stack.
fn dispatch<R, F>(tag: Tag, ret: R, future: F) -> NonNull<FrameHeader>
where
    F: Future + Send,
    R: Return<F::Output>,
{
    let parent = tls::current_task().expect("fork/call used outside of a task");
    // SAFETY: A running task implies an installed stack, and the reference
    // does not escape this call.
    let stack = unsafe { tls::stack() };
    TaskFrame::allocate(stack, tag, parent, ret.into_outbox(), future)
}

/// Waits for every forked child of the current task, then re-raises the
/// first panic any of them parked.
///
/// # Panics
///
/// Panics if awaited outside a task (and re-raises child panics, which is
/// its job).
#[must_use = "join does nothing until awaited"]
pub fn join() -> JoinAwait {
    JoinAwait {
        published: Cell::new(false),
    }
}

/// Migrates the current task to a worker of `target`.
///
/// On resumption the task is running on a thread of the target scheduler;
/// if the task had never been stolen its stack chain travels with it.
///
/// # Panics
///
/// Panics if awaited outside a task.
#[must_use = "resume_on does nothing until awaited"]
pub fn resume_on<S: Scheduler>(target: &'static S) -> SwitchAwait<S> {
    SwitchAwait {
        target,
        node: SubmissionNode::new(),
        queued: Cell::new(false),
        _pinned: PhantomPinned,
    }
}

// -----------------------------------------------------------------------------
// Awaitables

/// Awaitable returned by [`fork`].
pub struct ForkAwait {
    child: Cell<Option<NonNull<FrameHeader>>>,
}

// SAFETY: The raw frame pointer is owned by the suspension protocol; the
// awaitable itself is just a one-shot state machine.
unsafe impl Send for ForkAwait {}

impl Future for ForkAwait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        match self.child.take() {
            Some(child) => {
                tls::defer(Deferred::Fork { child });
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

/// Awaitable returned by [`fork_sync`] and [`fork_sync_outside`].
pub struct SyncForkAwait {
    child: Cell<Option<NonNull<FrameHeader>>>,
    steals_before: u16,
    outside: bool,
}

// SAFETY: As for `ForkAwait`.
unsafe impl Send for SyncForkAwait {}

impl Future for SyncForkAwait {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<bool> {
        if let Some(child) = self.child.take() {
            tls::defer(Deferred::Fork { child });
            return Poll::Pending;
        }

        let task = tls::current_task().expect("awaitable resumed outside of a task");
        // SAFETY: We are the running task; the frame is live and ours.
        unsafe {
            let steals_after = task.as_ref().steals();
            if steals_after != self.steals_before {
                // The child is (or was) running elsewhere.
                return Poll::Ready(false);
            }
            if self.outside || steals_after == 0 {
                debug_assert!(!self.outside || steals_after == 0);
                // No sibling can be racing the cell; surface the panic now.
                rethrow_pending(task);
            } else if task.as_ref().panic_cell().is_flagged() {
                // The payload belongs to the join; raise a stand-in.
                unwind::raise_substitute();
            }
        }
        Poll::Ready(true)
    }
}

/// Awaitable returned by [`call`].
pub struct CallAwait {
    child: Cell<Option<NonNull<FrameHeader>>>,
}

// SAFETY: As for `ForkAwait`.
unsafe impl Send for CallAwait {}

impl Future for CallAwait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        match self.child.take() {
            Some(child) => {
                tls::defer(Deferred::Call { child });
                Poll::Pending
            }
            None => Poll::Ready(()),
        }
    }
}

/// Awaitable returned by [`call_eager`] and [`call_eager_outside`].
pub struct EagerCallAwait {
    child: Cell<Option<NonNull<FrameHeader>>>,
    outside: bool,
}

// SAFETY: As for `ForkAwait`.
unsafe impl Send for EagerCallAwait {}

impl Future for EagerCallAwait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if let Some(child) = self.child.take() {
            tls::defer(Deferred::Call { child });
            return Poll::Pending;
        }

        let task = tls::current_task().expect("awaitable resumed outside of a task");
        // SAFETY: We are the running task; the frame is live and ours.
        unsafe {
            if self.outside || task.as_ref().steals() == 0 {
                rethrow_pending(task);
            } else if task.as_ref().panic_cell().is_flagged() {
                unwind::raise_substitute();
            }
        }
        Poll::Ready(())
    }
}

/// Awaitable returned by [`join`].
pub struct JoinAwait {
    published: Cell<bool>,
}

impl Future for JoinAwait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let task = tls::current_task().expect("join used outside of a task");

        if self.published.get() {
            // Resumed by the winning child (or by our own deferred publish);
            // the winner already took the stack and reset the counters.
            // SAFETY: We are the exclusive owner again.
            unsafe {
                debug_assert_eq!(task.as_ref().steals(), 0);
                rethrow_pending(task);
            }
            return Poll::Ready(());
        }

        // SAFETY: We are the running task.
        unsafe {
            let steals = task.as_ref().steals();
            if steals == 0 {
                // Nobody touched the subtree; every child ran to completion
                // on this worker and the counters were never disturbed.
                trace!("join ready, no steals");
                rethrow_pending(task);
                return Poll::Ready(());
            }

            // A stolen child may have finished already; prefer observing all
            // the decrements over suspending.
            let joined = PENDING_JOINS - task.as_ref().joins().load(Ordering::Acquire);
            if steals == joined {
                trace!("join ready, all stolen children accounted for");
                take_stack_and_reset(task);
                rethrow_pending(task);
                return Poll::Ready(());
            }
        }

        trace!("join not ready, suspending");
        self.published.set(true);
        tls::defer(Deferred::Join);
        Poll::Pending
    }
}

/// Awaitable returned by [`resume_on`].
pub struct SwitchAwait<S: 'static> {
    target: &'static S,
    node: SubmissionNode,
    queued: Cell<bool>,
    // The node's address is handed to the target scheduler.
    _pinned: PhantomPinned,
}

impl<S: Scheduler> Future for SwitchAwait<S> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // SAFETY: We never move out of `this`; the address-sensitive node
        // stays put inside the suspended frame.
        let this = unsafe { self.get_unchecked_mut() };
        if this.queued.replace(true) {
            return Poll::Ready(());
        }

        let task = tls::current_task().expect("resume_on used outside of a task");
        this.node.set_frame(task);
        tls::defer(Deferred::Switch {
            task: SubmitHandle::new(&this.node),
            target: NonNull::from(this.target).cast(),
            submit: submit_to::<S>,
        });
        Poll::Pending
    }
}

unsafe fn submit_to<S: Scheduler>(target: NonNull<()>, task: SubmitHandle) {
    // SAFETY: `target` was erased from a `&'static S` in `resume_on`.
    unsafe { target.cast::<S>().as_ref() }.schedule(task);
}

// -----------------------------------------------------------------------------
// Deferred second halves

/// Performs the action the suspending frame's awaitable recorded.
///
/// # Safety
///
/// `frame` must have just returned `Pending` on this thread, with the
/// thread-local stack and context installed.
pub(crate) unsafe fn perform_deferred(frame: NonNull<FrameHeader>) -> Transfer {
    let action = tls::take_deferred()
        .expect("task suspended on a foreign future; only weft awaitables may be awaited");
    // SAFETY: Per-arm comments.
    unsafe {
        match action {
            Deferred::Fork { child } => {
                trace!("fork, exposing parent");
                // The frame is now quiescent; it is safe to let thieves
                // have it.
                tls::context_ref().push_task(TaskHandle(frame));
                Transfer::Resume(child)
            }
            Deferred::Call { child } => {
                trace!("call");
                Transfer::Resume(child)
            }
            Deferred::Join => publish_join(frame),
            Deferred::Switch {
                task,
                target,
                submit,
            } => switch(frame, task, target, submit),
        }
    }
}

/// Opens the join race and settles it if every child has already finished.
unsafe fn publish_join(frame: NonNull<FrameHeader>) -> Transfer {
    // SAFETY: The frame is suspended; losing the race below forfeits all
    // access to it.
    unsafe {
        let steals = frame.as_ref().steals();
        let joined = frame
            .as_ref()
            .joins()
            .fetch_sub(PENDING_JOINS - steals, Ordering::Release);

        if steals == PENDING_JOINS - joined {
            // Every stolen child had completed before we published; the race
            // is ours. Acquire their writes and carry on.
            fence(Ordering::Acquire);
            trace!("joiner wins the join race");
            take_stack_and_reset(frame);
            return Transfer::Resume(frame);
        }

        // A child still runs; the last one to finish resumes the frame.
        trace!("joiner loses the join race");
        try_self_steal()
    }
}

/// Hands the frame to another scheduler and scavenges our own deque.
unsafe fn switch(
    frame: NonNull<FrameHeader>,
    task: SubmitHandle,
    target: NonNull<()>,
    submit: unsafe fn(NonNull<()>, SubmitHandle),
) -> Transfer {
    // SAFETY: The frame is suspended but not yet published; until `submit`
    // runs we remain its exclusive owner.
    unsafe {
        let stack = tls::stack();
        if frame.as_ref().steals() == 0 {
            // We own the frame's chain; detach it so the target worker can
            // adopt it on resumption.
            debug_assert_eq!(frame.as_ref().stacklet(), stack.top());
            let _suspended = stack.release();
        }
        debug_assert!(tls::stack().is_empty());

        trace!("switching task to another scheduler");
        submit(target, task);

        // Tasks left in our deque were pushed below the migrated frame; when
        // we pop them back they count as stolen, exactly as if the target
        // worker had taken them from us.
        try_self_steal()
    }
}

/// Pops and resumes an effectively stolen task, or yields to the main loop.
unsafe fn try_self_steal() -> Transfer {
    // SAFETY: Owner-side deque access on our own context.
    unsafe {
        if let Some(task) = tls::context_ref().pop_task() {
            trace!("self-stealing a task left by a switch");
            task.0.as_ref().count_steal();
            return Transfer::Resume(task.0);
        }
    }
    Transfer::Yield
}

/// After winning a join: make the frame's chain our stack and rearm the
/// counters.
unsafe fn take_stack_and_reset(frame: NonNull<FrameHeader>) {
    // SAFETY: The caller won the join race and owns the frame exclusively.
    unsafe {
        let stack = tls::stack();
        if frame.as_ref().stacklet() != stack.top() {
            stack.adopt(frame.as_ref().stacklet());
        }
        frame.as_ref().reset();
    }
}

/// Re-raises the pending child panic, if there is one.
unsafe fn rethrow_pending(task: NonNull<FrameHeader>) {
    // SAFETY: The caller is the frame's exclusive owner at a resume point.
    if let Some(payload) = unsafe { task.as_ref().panic_cell().take() } {
        unwind::resume_unwinding(payload);
    }
}
