//! Per-task frames and the machinery that steps them.
//!
//! A frame is the runtime's unit of bookkeeping for one task: it holds the
//! task's suspended state machine, the stacklet it was allocated on, a link
//! to its parent (or to the root completion channel), and the steal/join
//! counters that drive the join race. Frames live on a worker's segmented
//! stack and are referred to by type-erased [`FrameHeader`] pointers; the
//! header's `step` function pointer recovers the concrete type, much like a
//! type-erased job reference recovers its closure.
//!
//! Stepping a frame polls the task's future once. A `Pending` result means
//! the task suspended on one of the runtime's awaitables, which recorded a
//! deferred action for the trampoline to carry out now that the frame is
//! quiescent; a `Ready` result or a panic runs the final-suspend protocol.

use core::cell::{Cell, UnsafeCell};
use core::future::Future;
use core::pin::Pin;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, AtomicBool, AtomicU16, Ordering};
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::sync::Arc;

use tracing::trace;

use crate::awaitables;
use crate::root::Channel;
use crate::signal::Signal;
use crate::stack::{Stack, StackletHandle, ALIGN};
use crate::tls;
use crate::unwind;
use crate::unwind::Payload;

/// The initial value of a frame's join counter. A joiner subtracts
/// `PENDING_JOINS - steals` so that the counter nets out to the number of
/// stolen children that have not yet completed.
pub(crate) const PENDING_JOINS: u16 = u16::MAX;

// -----------------------------------------------------------------------------
// Dispatch tags and transfer

/// How a frame was dispatched; decides its behavior at final suspend and
/// which kind of link it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tag {
    /// Submitted from outside the pool; links to a completion channel.
    Root,
    /// Spawned by `call`; the parent was not exposed for stealing.
    Call,
    /// Spawned by `fork`; the parent was pushed on the owner's deque.
    Fork,
}

/// What the trampoline should do after stepping a frame.
pub(crate) enum Transfer {
    /// Run this frame next, without returning to the worker's main loop.
    Resume(NonNull<FrameHeader>),
    /// Return to the worker's main loop.
    Yield,
}

/// A copyable frame pointer, as stored in deques.
///
/// Ownership of the underlying frame is tracked by the suspension protocol,
/// not by this handle: a suspended frame is owned either by the deque slot
/// holding it or by the worker that wins its join race.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskHandle(pub(crate) NonNull<FrameHeader>);

// SAFETY: Plain pointer; the suspension protocol synchronizes access.
unsafe impl Send for TaskHandle {}

// -----------------------------------------------------------------------------
// Panic cell

/// A write-once cell for a captured panic payload.
///
/// Completing children race to store their payload in the parent's cell; the
/// first CAS wins ownership and later payloads are dropped. The payload
/// itself is published to the eventual reader by the join protocol's
/// release/acquire pair, so only the flag needs to be atomic.
pub(crate) struct PanicCell {
    flagged: AtomicBool,
    slot: UnsafeCell<Option<Payload>>,
}

impl PanicCell {
    fn new() -> PanicCell {
        PanicCell {
            flagged: AtomicBool::new(false),
            slot: UnsafeCell::new(None),
        }
    }

    /// Stores `payload` if the cell is empty; otherwise drops it.
    pub(crate) fn capture(&self, payload: Payload) {
        if self
            .flagged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: Winning the flag race grants exclusive write access;
            // readers are ordered after us by the join protocol.
            unsafe { *self.slot.get() = Some(payload) };
        } else {
            // A sibling already captured a payload; at most one panic
            // propagates per join.
            drop(payload);
        }
    }

    /// Whether a payload has been flagged. Safe from any thread; says
    /// nothing about the payload's visibility.
    pub(crate) fn is_flagged(&self) -> bool {
        self.flagged.load(Ordering::Acquire)
    }

    /// Takes the payload.
    ///
    /// # Safety
    ///
    /// Only the frame's exclusive owner, at a resume point ordered after the
    /// capturing write, may call this.
    pub(crate) unsafe fn take(&self) -> Option<Payload> {
        if !self.flagged.load(Ordering::Acquire) {
            return None;
        }
        self.flagged.store(false, Ordering::Relaxed);
        // SAFETY: Covered by the function contract.
        unsafe { (*self.slot.get()).take() }
    }
}

// -----------------------------------------------------------------------------
// Frame header

/// The type-erased prefix shared by all frames.
#[repr(C)]
pub struct FrameHeader {
    /// Polls the concrete frame once and reports what to run next.
    step: unsafe fn(NonNull<FrameHeader>) -> Transfer,
    /// Dispatch mode; also discriminates the `link` field.
    tag: Tag,
    /// The stacklet this frame was allocated on.
    stacklet: StackletHandle,
    /// The parent frame (`Call`/`Fork`) or the completion channel (`Root`).
    link: *mut (),
    /// How many times this frame has been stolen. Written only by the
    /// frame's current owner, in regions made exclusive by the protocol.
    steals: Cell<u16>,
    /// The join counter; decremented by completing children and published
    /// against by the joiner.
    joins: AtomicU16,
    /// Where children park a panic for the join to re-raise.
    panic: PanicCell,
}

// SAFETY: `steals` is single-writer (the owner at any instant); `joins` and
// the panic flag are atomic; everything else is immutable after
// construction. Shared references cross threads only through the protocol.
unsafe impl Send for FrameHeader {}
unsafe impl Sync for FrameHeader {}

impl FrameHeader {
    fn new(
        step: unsafe fn(NonNull<FrameHeader>) -> Transfer,
        tag: Tag,
        stacklet: StackletHandle,
        link: *mut (),
    ) -> FrameHeader {
        FrameHeader {
            step,
            tag,
            stacklet,
            link,
            steals: Cell::new(0),
            joins: AtomicU16::new(PENDING_JOINS),
            panic: PanicCell::new(),
        }
    }

    /// Steps the frame once.
    ///
    /// # Safety
    ///
    /// The caller must be the frame's exclusive owner, with the thread-local
    /// stack and context installed.
    #[inline]
    pub(crate) unsafe fn step(frame: NonNull<FrameHeader>) -> Transfer {
        // SAFETY: The header is valid while the frame is live.
        unsafe { (frame.as_ref().step)(frame) }
    }

    #[inline]
    pub(crate) fn steals(&self) -> u16 {
        self.steals.get()
    }

    /// Counts a successful steal. Called by the stealing worker, which owns
    /// the frame from the moment the steal CAS succeeds.
    #[inline]
    pub(crate) fn count_steal(&self) {
        self.steals.set(self.steals.get() + 1);
    }

    /// Restores the counters to their initial state. Only the exclusive
    /// owner, after winning a join race, may do this.
    #[inline]
    pub(crate) fn reset(&self) {
        self.steals.set(0);
        self.joins.store(PENDING_JOINS, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn stacklet(&self) -> StackletHandle {
        self.stacklet
    }

    #[inline]
    pub(crate) fn joins(&self) -> &AtomicU16 {
        &self.joins
    }

    #[inline]
    pub(crate) fn panic_cell(&self) -> &PanicCell {
        &self.panic
    }

    /// The parent frame of a non-root task.
    #[inline]
    pub(crate) fn parent(&self) -> NonNull<FrameHeader> {
        debug_assert_ne!(self.tag, Tag::Root);
        NonNull::new(self.link.cast()).expect("non-root frame without a parent")
    }
}

// -----------------------------------------------------------------------------
// Return addresses

/// Writes a completed child's value to wherever the parent wants it.
///
/// This is an implementation seam of [`fork`](crate::fork) and
/// [`call`](crate::call); see [`Return`].
pub trait Outbox<R> {
    /// Delivers the value.
    ///
    /// # Safety
    ///
    /// Called exactly once, by the completing child, before the child's
    /// completion is published to the parent.
    unsafe fn deliver(&self, value: R);
}

/// A once-written result cell, owned by a parent task and filled by a forked
/// or called child.
///
/// The parent may read the slot only after the child has provably completed:
/// after `join` for a fork, or after the awaiter resolves for a call.
pub struct Slot<T> {
    value: UnsafeCell<Option<T>>,
}

// SAFETY: The writing child and the reading parent are ordered by the join
// protocol (or by same-thread execution for calls).
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    pub fn new() -> Slot<T> {
        Slot {
            value: UnsafeCell::new(None),
        }
    }

    /// Takes the delivered value, if any.
    pub fn take(&mut self) -> Option<T> {
        self.value.get_mut().take()
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Slot<T> {
        Slot::new()
    }
}

/// A pointer to a parent-owned [`Slot`], captured at dispatch time.
pub struct SlotPtr<R>(NonNull<Slot<R>>);

impl<R> Outbox<R> for SlotPtr<R> {
    unsafe fn deliver(&self, value: R) {
        // SAFETY: The dispatch contract keeps the slot alive until the
        // enclosing join, and the child is the only writer.
        unsafe { *(*self.0.as_ptr()).value.get() = Some(value) };
    }
}

/// A return address that throws the child's value away.
pub struct Discard;

impl<R> Outbox<R> for Discard {
    unsafe fn deliver(&self, value: R) {
        drop(value);
    }
}

/// Things that can serve as the return address of a `fork` or `call`:
/// a borrowed [`Slot`] or [`Discard`].
pub trait Return<R> {
    #[doc(hidden)]
    type Outbox: Outbox<R>;
    #[doc(hidden)]
    fn into_outbox(self) -> Self::Outbox;
}

impl<'a, R> Return<R> for &'a Slot<R> {
    type Outbox = SlotPtr<R>;
    fn into_outbox(self) -> SlotPtr<R> {
        SlotPtr(NonNull::from(self))
    }
}

impl<R> Return<R> for Discard {
    type Outbox = Discard;
    fn into_outbox(self) -> Discard {
        Discard
    }
}

// -----------------------------------------------------------------------------
// Typed task frames

/// The frame of a forked or called task.
#[repr(C)]
pub(crate) struct TaskFrame<F: Future, O> {
    header: FrameHeader,
    outbox: O,
    future: F,
}

impl<F, O> TaskFrame<F, O>
where
    F: Future,
    O: Outbox<F::Output>,
{
    /// Bump-allocates a child frame on `stack` and moves the future into it.
    pub(crate) fn allocate(
        stack: &mut Stack,
        tag: Tag,
        parent: NonNull<FrameHeader>,
        outbox: O,
        future: F,
    ) -> NonNull<FrameHeader> {
        assert!(
            align_of::<Self>() <= ALIGN,
            "task state demands an unsupported alignment"
        );
        let frame = stack.allocate(size_of::<Self>()).cast::<Self>();
        let header = FrameHeader::new(Self::step, tag, stack.top(), parent.as_ptr().cast());
        // SAFETY: The allocation is sized and aligned for `Self` and not yet
        // aliased.
        unsafe {
            frame.write(TaskFrame {
                header,
                outbox,
                future,
            });
        }
        frame.cast()
    }

    unsafe fn step(frame: NonNull<FrameHeader>) -> Transfer {
        let this = frame.cast::<Self>().as_ptr();
        tls::set_current_task(frame);

        let poll = unwind::halt_unwinding(|| {
            // SAFETY: Frames never move; pinning the future in place is
            // sound. The owner steps one frame at a time, so the mutable
            // access is exclusive.
            let future = unsafe { Pin::new_unchecked(&mut (*this).future) };
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            future.poll(&mut cx)
        });

        // A panic past this point is the scheduler's own, with bookkeeping
        // in an unknown state; abort rather than unwind through the worker.
        let abort_guard = unwind::AbortOnDrop;
        // SAFETY: All paths below uphold their own contracts; see each call.
        let transfer = unsafe {
            match poll {
                Ok(Poll::Pending) => awaitables::perform_deferred(frame),
                Ok(Poll::Ready(value)) => {
                    (*this).outbox.deliver(value);
                    Self::finish(frame)
                }
                Err(payload) => {
                    // Park the panic with the parent; `join` re-raises it.
                    frame.as_ref().parent().as_ref().panic_cell().capture(payload);
                    Self::finish(frame)
                }
            }
        };
        core::mem::forget(abort_guard);
        transfer
    }

    /// The final-suspend protocol for a completed child.
    unsafe fn finish(frame: NonNull<FrameHeader>) -> Transfer {
        // SAFETY: The frame is complete: its future has returned (or
        // panicked) and no other thread can reach it any more.
        unsafe {
            let tag = frame.as_ref().tag;
            let parent = frame.as_ref().parent();

            // Reclaim the frame. If this worker's stack is empty the frame
            // lives on a chain owned elsewhere and the deallocation is
            // skipped; the bytes are reclaimed when that chain unwinds.
            ptr::drop_in_place(frame.cast::<Self>().as_ptr());
            tls::stack().deallocate(frame.cast());

            match tag {
                // A called child always hands control straight back.
                Tag::Call => Transfer::Resume(parent),
                Tag::Fork => Self::finish_forked(parent),
                Tag::Root => unreachable!("root frames complete through their channel"),
            }
        }
    }

    unsafe fn finish_forked(parent: NonNull<FrameHeader>) -> Transfer {
        // SAFETY: Deque access is owner-side; parent reads are ordered as
        // commented below.
        unsafe {
            // If the parent is still in our deque nobody stole it: we own it
            // exclusively and keep ripping down the fast path.
            if let Some(task) = tls::context_ref().pop_task() {
                debug_assert_eq!(task.0, parent);
                trace!("forked child resumes its parent in place");
                return Transfer::Resume(parent);
            }

            // The parent was stolen. If our stack still holds the parent's
            // suspended state, detach it now: the decrement below is what
            // licenses the race's winner to adopt the chain, so the chain
            // must already be free when the decrement lands.
            let stack = tls::stack();
            if !stack.is_empty() {
                let _suspended = stack.release();
            }

            // Count this child's completion; a decrement from one means the
            // parent had published its join and every sibling is accounted
            // for.
            if parent.as_ref().joins().fetch_sub(1, Ordering::Release) == 1 {
                // Acquire the writes of every completed sibling.
                fence(Ordering::Acquire);
                trace!("last forked child wins the join race");
                let stack = tls::stack();
                if parent.as_ref().stacklet() != stack.top() {
                    // Eat the parent's stack.
                    stack.adopt(parent.as_ref().stacklet());
                }
                parent.as_ref().reset();
                return Transfer::Resume(parent);
            }

            // Someone else resumes the parent; it may already be running, so
            // the parent frame is off limits from here on.
            trace!("forked child loses the join race");
            Transfer::Yield
        }
    }
}

// -----------------------------------------------------------------------------
// Root frames

/// The frame of a task submitted from outside the pools.
#[repr(C)]
pub(crate) struct RootFrame<F: Future> {
    header: FrameHeader,
    future: F,
}

impl<F> RootFrame<F>
where
    F: Future,
    F::Output: Send,
{
    /// Bump-allocates a root frame on `stack`, linking it to `channel`.
    ///
    /// `channel` must come from `Arc::into_raw`; the frame owns that
    /// reference and releases it on completion.
    pub(crate) fn allocate(
        stack: &mut Stack,
        channel: *const Channel<F::Output>,
        future: F,
    ) -> NonNull<FrameHeader> {
        assert!(
            align_of::<Self>() <= ALIGN,
            "task state demands an unsupported alignment"
        );
        let frame = stack.allocate(size_of::<Self>()).cast::<Self>();
        let header = FrameHeader::new(
            Self::step,
            Tag::Root,
            stack.top(),
            channel.cast_mut().cast(),
        );
        // SAFETY: The allocation is sized and aligned for `Self` and not yet
        // aliased.
        unsafe { frame.write(RootFrame { header, future }) };
        frame.cast()
    }

    unsafe fn step(frame: NonNull<FrameHeader>) -> Transfer {
        let this = frame.cast::<Self>().as_ptr();
        tls::set_current_task(frame);

        let poll = unwind::halt_unwinding(|| {
            // SAFETY: As for `TaskFrame::step`.
            let future = unsafe { Pin::new_unchecked(&mut (*this).future) };
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            future.poll(&mut cx)
        });

        // As in `TaskFrame::step`: never unwind out of the scheduler.
        let abort_guard = unwind::AbortOnDrop;
        // SAFETY: See each call.
        let transfer = unsafe {
            match poll {
                Ok(Poll::Pending) => awaitables::perform_deferred(frame),
                Ok(Poll::Ready(value)) => Self::finish(frame, Ok(value)),
                Err(payload) => Self::finish(frame, Err(payload)),
            }
        };
        core::mem::forget(abort_guard);
        transfer
    }

    /// Destroys the frame and releases the root semaphore.
    unsafe fn finish(frame: NonNull<FrameHeader>, outcome: std::thread::Result<F::Output>) -> Transfer {
        // SAFETY: The frame is complete and exclusively ours.
        unsafe {
            let channel = frame.as_ref().link.cast_const().cast::<Channel<F::Output>>();
            ptr::drop_in_place(frame.cast::<Self>().as_ptr());
            tls::stack().deallocate(frame.cast());

            trace!("root task complete");
            // Reconstitute the frame's channel reference: it keeps the
            // signal alive through the send even if the external caller
            // consumes the value immediately.
            let channel = Arc::from_raw(channel);
            Signal::send(&channel.signal, outcome);
            drop(channel);
        }
        Transfer::Yield
    }
}

// -----------------------------------------------------------------------------
// Waker

// Task futures are driven by the trampoline, never by a reactor, so the
// waker they see does nothing.
const NOOP_VTABLE: RawWakerVTable = RawWakerVTable::new(
    |_| RawWaker::new(ptr::null(), &NOOP_VTABLE),
    |_| {},
    |_| {},
    |_| {},
);

fn noop_waker() -> Waker {
    // SAFETY: Every vtable entry is a no-op, which trivially satisfies the
    // RawWaker contract.
    unsafe { Waker::from_raw(RawWaker::new(ptr::null(), &NOOP_VTABLE)) }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_cell_first_capture_wins() {
        let cell = PanicCell::new();
        assert!(!cell.is_flagged());

        cell.capture(Box::new("first"));
        cell.capture(Box::new("second"));
        assert!(cell.is_flagged());

        let payload = unsafe { cell.take() }.unwrap();
        assert_eq!(*payload.downcast::<&str>().unwrap(), "first");
        assert!(!cell.is_flagged());
        assert!(unsafe { cell.take() }.is_none());
    }

    #[test]
    fn slot_round_trip() {
        let mut slot = Slot::new();
        let ptr = (&slot).into_outbox();
        unsafe { ptr.deliver(42) };
        assert_eq!(slot.take(), Some(42));
        assert_eq!(slot.take(), None);
    }
}
