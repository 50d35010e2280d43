//! An event-count: the lazy pool's "check, then sleep" primitive.
//!
//! A worker that found no work publishes its intent to sleep by reading the
//! epoch ([`EventCount::prepare_wait`]), re-checks its wake conditions, and
//! then either commits the wait or cancels it. A notification between the
//! prepare and the commit bumps the epoch, so the commit's futex wait returns
//! immediately -- the wakeup can never be lost in that window. This is the
//! epoch-only formulation of an event-count; the waiter bookkeeping lives in
//! the kernel's futex queue.

use core::sync::atomic::{AtomicU32, Ordering};

pub(crate) struct EventCount {
    epoch: AtomicU32,
}

impl EventCount {
    pub(crate) fn new() -> EventCount {
        EventCount {
            epoch: AtomicU32::new(0),
        }
    }

    /// Publishes the intent to wait and returns the key to commit with.
    #[inline]
    pub(crate) fn prepare_wait(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Abandons a prepared wait.
    ///
    /// Nothing to undo in the epoch scheme; this exists so call sites spell
    /// out the commit-or-cancel protocol.
    #[inline]
    pub(crate) fn cancel_wait(&self) {}

    /// Commits a prepared wait, sleeping until notified.
    ///
    /// Returns immediately if the epoch has moved since `prepare_wait`.
    /// Spurious returns are allowed; callers loop.
    #[inline]
    pub(crate) fn commit_wait(&self, key: u32) {
        atomic_wait::wait(&self.epoch, key);
    }

    /// Wakes one committed waiter.
    #[inline]
    pub(crate) fn notify_one(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
        atomic_wait::wake_one(&self.epoch);
    }

    /// Wakes every committed waiter.
    #[inline]
    pub(crate) fn notify_all(&self) {
        self.epoch.fetch_add(1, Ordering::Release);
        atomic_wait::wake_all(&self.epoch);
    }
}

// -----------------------------------------------------------------------------
// Tests
