//! The external entry points: building, submitting, and awaiting root tasks.
//!
//! A root task is built by the calling thread on a short-lived temporary
//! stack, which is immediately released into the new frame; the worker that
//! picks the submission up adopts the chain and runs the task as if it had
//! spawned it locally. Completion flows back over a semaphore-like signal
//! embedded in a shared channel, which both the caller's [`JoinHandle`] and
//! the frame hold alive.

use core::future::Future;
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tracing::trace;

use crate::frame::RootFrame;
use crate::list::{SubmissionNode, SubmitHandle};
use crate::signal::Signal;
use crate::stack::Stack;
use crate::tls;
use crate::unwind;

// -----------------------------------------------------------------------------
// Scheduler trait

/// Something that can accept task submissions: the two pools, or any
/// user-built scheduler that routes a [`SubmitHandle`] to a
/// [`WorkerContext`](crate::WorkerContext).
///
/// `schedule` must either enqueue the task or panic leaving the queues
/// unchanged (the built-in contexts never fail to enqueue).
pub trait Scheduler: Sync {
    /// Accepts a task for execution.
    fn schedule(&self, task: SubmitHandle);
}

// -----------------------------------------------------------------------------
// Errors

/// Errors surfaced by the external API.
///
/// Task panics are not errors: they unwind out of [`JoinHandle::get`] just
/// as they would from a thread join.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// `schedule` was called from a pool worker, which would deadlock the
    /// pool if the returned handle were waited on.
    #[error("cannot schedule a root task from a worker thread")]
    ScheduleInWorker,
    /// The handle's result was already consumed by a previous `get`.
    #[error("the task's result was already taken")]
    EmptyFuture,
    /// The handle was detached and no longer owns a result.
    #[error("the handle was detached from its task")]
    BrokenFuture,
}

// -----------------------------------------------------------------------------
// Completion channel

/// Shared state between a root frame and its [`JoinHandle`]: the completion
/// signal and the submission node that carried the frame to a worker.
pub(crate) struct Channel<R> {
    pub(crate) signal: Signal<thread::Result<R>>,
    pub(crate) node: SubmissionNode,
}

impl<R: Send> Channel<R> {
    fn new() -> Channel<R> {
        Channel {
            signal: Signal::new(),
            node: SubmissionNode::new(),
        }
    }
}

// -----------------------------------------------------------------------------
// Join handle

#[derive(Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Pending,
    Consumed,
    Detached,
}

/// An owning handle to a scheduled root task.
///
/// Dropping a live handle blocks until the task completes, so a root task
/// can never outlive the borrows its future captured; call
/// [`JoinHandle::detach`] to opt out of that synchronization.
pub struct JoinHandle<R: Send> {
    channel: Arc<Channel<R>>,
    state: HandleState,
}

impl<R: Send> JoinHandle<R> {
    /// Blocks until the task completes, without consuming the result.
    pub fn wait(&self) -> Result<(), Error> {
        match self.state {
            HandleState::Pending => {
                self.channel.signal.wait();
                Ok(())
            }
            HandleState::Consumed => Err(Error::EmptyFuture),
            HandleState::Detached => Err(Error::BrokenFuture),
        }
    }

    /// Blocks until the task completes, then returns its result. If the
    /// task panicked, the panic is resumed on this thread.
    pub fn get(&mut self) -> Result<R, Error> {
        match self.state {
            HandleState::Pending => {
                self.state = HandleState::Consumed;
                // SAFETY: The state machine makes this handle the single
                // receiver, and `&mut self` pins the call to one thread at a
                // time.
                match unsafe { self.channel.signal.recv() } {
                    Ok(value) => Ok(value),
                    Err(payload) => unwind::resume_unwinding(payload),
                }
            }
            HandleState::Consumed => Err(Error::EmptyFuture),
            HandleState::Detached => Err(Error::BrokenFuture),
        }
    }

    /// Whether the handle still owns a result.
    pub fn is_valid(&self) -> bool {
        self.state == HandleState::Pending
    }

    /// Whether the task has completed, without blocking.
    pub fn is_finished(&self) -> bool {
        self.channel.signal.is_set()
    }

    /// Disowns the task. The task keeps running; the caller must keep its
    /// scheduler alive until the task completes.
    pub fn detach(&mut self) {
        if self.state == HandleState::Pending {
            self.state = HandleState::Detached;
        }
    }
}

impl<R: Send> Drop for JoinHandle<R> {
    fn drop(&mut self) {
        if self.state == HandleState::Pending {
            self.channel.signal.wait();
        }
    }
}

// -----------------------------------------------------------------------------
// Entry points

/// Builds a root task around `future`, submits it to `scheduler`, and
/// returns a handle to its completion.
///
/// Fails with [`Error::ScheduleInWorker`] on a pool worker thread: a worker
/// blocking on a handle would starve the very pool that has to run the task.
pub fn schedule<S, F>(scheduler: &S, future: F) -> Result<JoinHandle<F::Output>, Error>
where
    S: Scheduler + ?Sized,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    if tls::is_worker() {
        return Err(Error::ScheduleInWorker);
    }

    trace!("scheduling a root task");
    let channel = Arc::new(Channel::new());

    // Build the frame on a temporary stack and release the chain into it;
    // whichever worker resumes the submission adopts the chain.
    let mut stack = Stack::new();
    let frame = RootFrame::allocate(&mut stack, Arc::into_raw(Arc::clone(&channel)), future);
    let chain = stack.release();
    // SAFETY: The frame is live until the task completes.
    debug_assert_eq!(unsafe { frame.as_ref().stacklet() }, chain);

    channel.node.set_frame(frame);
    scheduler.schedule(SubmitHandle::new(&channel.node));

    Ok(JoinHandle {
        channel,
        state: HandleState::Pending,
    })
}

/// Schedules `future` and blocks for its result.
pub fn sync_wait<S, F>(scheduler: &S, future: F) -> Result<F::Output, Error>
where
    S: Scheduler + ?Sized,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    schedule(scheduler, future)?.get()
}

/// Schedules `future` and abandons the handle. The scheduler must outlive
/// the task.
pub fn detach<S, F>(scheduler: &S, future: F) -> Result<(), Error>
where
    S: Scheduler + ?Sized,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let mut handle = schedule(scheduler, future)?;
    handle.detach();
    Ok(())
}
