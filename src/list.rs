//! An intrusive lock-free MPSC list for externally scheduled tasks.
//!
//! Producers link nodes at the head; the owning worker periodically drains
//! the whole list and resumes the submitted frames in FIFO order. Nodes are
//! never allocated by the list itself: the root entry embeds its node in the
//! completion channel, and `resume_on` embeds its node in the awaiter, so a
//! node lives exactly as long as the submission it carries.

use core::cell::Cell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::frame::FrameHeader;

// -----------------------------------------------------------------------------
// Nodes and handles

/// A single submission, owned by whoever built it.
///
/// The frame pointer is written by the submitter before the node is pushed;
/// the `next` link is owned by the list from push until drain.
pub struct SubmissionNode {
    frame: Cell<Option<NonNull<FrameHeader>>>,
    next: AtomicPtr<SubmissionNode>,
}

// SAFETY: A node is written by one thread before publication and read by one
// thread after the list's release/acquire pair; the cells are never touched
// concurrently.
unsafe impl Sync for SubmissionNode {}
unsafe impl Send for SubmissionNode {}

impl SubmissionNode {
    pub(crate) fn new() -> SubmissionNode {
        SubmissionNode {
            frame: Cell::new(None),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn set_frame(&self, frame: NonNull<FrameHeader>) {
        self.frame.set(Some(frame));
    }
}

/// A type-erased pointer to a [`SubmissionNode`], the currency of the
/// [`Scheduler`](crate::Scheduler) trait.
///
/// The node (and the frame it carries) must stay alive until a worker
/// consumes the submission.
#[derive(Clone, Copy)]
pub struct SubmitHandle {
    node: NonNull<SubmissionNode>,
}

// SAFETY: The handle is just a pointer; the submission protocol provides the
// synchronization.
unsafe impl Send for SubmitHandle {}

impl SubmitHandle {
    pub(crate) fn new(node: &SubmissionNode) -> SubmitHandle {
        SubmitHandle {
            node: NonNull::from(node),
        }
    }
}

// -----------------------------------------------------------------------------
// List

/// The MPSC head. Many producers push; only the owning worker drains.
pub(crate) struct SubmissionList {
    head: AtomicPtr<SubmissionNode>,
}

impl SubmissionList {
    pub(crate) fn new() -> SubmissionList {
        SubmissionList {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Returns `true` if the list appeared empty. The result is advisory; it
    /// is used by workers deciding whether to sleep, with the event-count
    /// protocol covering the race.
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Links a node at the head. Called from any thread.
    pub(crate) fn push(&self, handle: SubmitHandle) {
        let node = handle.node.as_ptr();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: The node is owned by the producer until consumed; the
            // `next` link is ours to set until then.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Takes the whole list, reversing it so that iteration yields
    /// submissions in the order they were pushed.
    ///
    /// # Safety
    ///
    /// May only be called by the owning worker.
    pub(crate) unsafe fn drain(&self) -> Drain {
        let mut taken = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut reversed: *mut SubmissionNode = ptr::null_mut();
        while let Some(node) = NonNull::new(taken) {
            // SAFETY: The swap above made this thread the exclusive owner of
            // every node in the detached segment.
            unsafe {
                taken = node.as_ref().next.load(Ordering::Relaxed);
                node.as_ref().next.store(reversed, Ordering::Relaxed);
            }
            reversed = node.as_ptr();
        }
        Drain { head: reversed }
    }
}

/// Destructive FIFO iteration over a drained segment.
///
/// The frame is read out of each node before the iterator advances; once
/// yielded, the node belongs to its submitter again and may be freed (for
/// example by the resumed task completing).
pub(crate) struct Drain {
    head: *mut SubmissionNode,
}

impl Iterator for Drain {
    type Item = NonNull<FrameHeader>;

    fn next(&mut self) -> Option<NonNull<FrameHeader>> {
        let node = NonNull::new(self.head)?;
        // SAFETY: Nodes in a drained segment are exclusively ours until
        // yielded. Read everything before handing the node back.
        let frame = unsafe {
            self.head = node.as_ref().next.load(Ordering::Relaxed);
            node.as_ref().frame.get()
        };
        Some(frame.expect("submission node pushed without a frame"))
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn fake_frame(tag: usize) -> NonNull<FrameHeader> {
        // The list never dereferences the frames it carries; synthesize
        // pointers from small integers.
        NonNull::new((tag * align_of::<FrameHeader>()) as *mut FrameHeader).unwrap()
    }

    fn frame_tag(frame: NonNull<FrameHeader>) -> usize {
        frame.as_ptr() as usize / align_of::<FrameHeader>()
    }

    #[test]
    fn drain_is_fifo() {
        let list = SubmissionList::new();
        let nodes: Vec<SubmissionNode> = (0..8).map(|_| SubmissionNode::new()).collect();
        for (i, node) in nodes.iter().enumerate() {
            node.set_frame(fake_frame(i + 1));
            list.push(SubmitHandle::new(node));
        }
        let order: Vec<usize> = unsafe { list.drain() }.map(frame_tag).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(list.is_empty());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 500;

        let list = Arc::new(SubmissionList::new());
        let barrier = Arc::new(Barrier::new(PRODUCERS));

        // Nodes must outlive consumption; keep them in leaked boxes.
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let list = Arc::clone(&list);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_PRODUCER {
                        let node: &'static SubmissionNode =
                            Box::leak(Box::new(SubmissionNode::new()));
                        node.set_frame(fake_frame(p * PER_PRODUCER + i + 1));
                        list.push(SubmitHandle::new(node));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut tags: Vec<usize> = unsafe { list.drain() }.map(frame_tag).collect();
        tags.sort_unstable();
        let expected: Vec<usize> = (1..=PRODUCERS * PER_PRODUCER).collect();
        assert_eq!(tags, expected);
    }
}
