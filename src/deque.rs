//! A lock-free work-stealing deque of ready tasks.
//!
//! This is the Chase-Lev deque in its weak-memory formulation (Le, Pop,
//! Cocke, and Maranget's "Correct and efficient work-stealing for weak
//! memory models"). The owning worker pushes and pops at the bottom; any
//! other thread may steal from the top. Entries must be small and trivially
//! copyable -- in practice they are frame pointers.
//!
//! The buffer grows by doubling. Retired buffers are kept on an owner-side
//! garbage list until the deque is dropped, so a stealer that loaded a stale
//! buffer pointer never reads freed memory.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicIsize, AtomicPtr, Ordering};

// -----------------------------------------------------------------------------
// Steal outcome

/// The result of a [`Deque::steal`] attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Steal<T> {
    /// A task was stolen.
    Success(T),
    /// The deque was observed empty.
    Empty,
    /// A competing stealer (or the owner) won the race; the caller should
    /// move on to another victim rather than retry.
    Lost,
}

// -----------------------------------------------------------------------------
// Ring buffer

struct Buffer<T> {
    storage: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T: Copy> Buffer<T> {
    fn alloc(capacity: usize) -> NonNull<Buffer<T>> {
        debug_assert!(capacity.is_power_of_two());
        let storage = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        // The box is reclaimed through the garbage list or on drop.
        NonNull::from(Box::leak(Box::new(Buffer { storage })))
    }

    #[inline]
    fn mask(&self) -> usize {
        self.storage.len() - 1
    }

    /// Reads the slot for `index`.
    ///
    /// # Safety
    ///
    /// The slot must have been written by the owner at a point that is
    /// ordered before this read by the deque protocol.
    #[inline]
    unsafe fn read(&self, index: isize) -> T {
        let slot = &self.storage[index as usize & self.mask()];
        // SAFETY: Covered by the function contract.
        unsafe { (*slot.get()).assume_init() }
    }

    /// Writes the slot for `index`.
    ///
    /// # Safety
    ///
    /// Only the owner may write, and the slot must not be concurrently read
    /// outside the deque protocol.
    #[inline]
    unsafe fn write(&self, index: isize, value: T) {
        let slot = &self.storage[index as usize & self.mask()];
        // SAFETY: Covered by the function contract.
        unsafe { (*slot.get()).write(value) };
    }
}

// -----------------------------------------------------------------------------
// Deque

const INITIAL_CAPACITY: usize = 64;

/// An unbounded single-owner, multi-stealer deque.
///
/// The owner methods [`Deque::push`] and [`Deque::pop`] are unsafe because
/// nothing in the type system pins the deque to a thread; the worker context
/// that embeds it guarantees the single-owner discipline.
pub(crate) struct Deque<T> {
    /// Stealers advance `top`.
    top: AtomicIsize,
    /// The owner advances (and briefly retreats) `bottom`.
    bottom: AtomicIsize,
    /// The current ring buffer.
    buffer: AtomicPtr<Buffer<T>>,
    /// Retired buffers, freed when the deque drops. Owner-only.
    garbage: UnsafeCell<Vec<NonNull<Buffer<T>>>>,
}

// SAFETY: The protocol below synchronizes all cross-thread access; entries
// are plain copyable values.
unsafe impl<T: Copy + Send> Send for Deque<T> {}
unsafe impl<T: Copy + Send> Sync for Deque<T> {}

impl<T: Copy> Deque<T> {
    pub(crate) fn new() -> Deque<T> {
        Deque {
            top: AtomicIsize::new(0),
            bottom: AtomicIsize::new(0),
            buffer: AtomicPtr::new(Buffer::alloc(INITIAL_CAPACITY).as_ptr()),
            garbage: UnsafeCell::new(Vec::new()),
        }
    }

    /// Pushes a task at the bottom.
    ///
    /// # Safety
    ///
    /// May only be called by the owning worker.
    pub(crate) unsafe fn push(&self, value: T) {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);
        let mut buffer = self.buffer.load(Ordering::Relaxed);

        // SAFETY: The owner is the only thread that replaces the buffer.
        let capacity = unsafe { (&(*buffer).storage).len() };
        if bottom - top >= capacity as isize {
            // SAFETY: We are the owner.
            buffer = unsafe { self.resize(top, bottom) };
        }

        // SAFETY: Slot `bottom` is outside the readable [top, bottom) window
        // until the store below publishes it.
        unsafe { (*buffer).write(bottom, value) };
        // Publish the element before the new bottom becomes visible.
        fence(Ordering::Release);
        self.bottom.store(bottom + 1, Ordering::Relaxed);
    }

    /// Pops a task from the bottom.
    ///
    /// # Safety
    ///
    /// May only be called by the owning worker.
    pub(crate) unsafe fn pop(&self) -> Option<T> {
        let bottom = self.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.buffer.load(Ordering::Relaxed);
        self.bottom.store(bottom, Ordering::Relaxed);
        // Order the speculative bottom decrement against the stealers' reads
        // of it; this is the heart of the owner/stealer race.
        fence(Ordering::SeqCst);
        let top = self.top.load(Ordering::Relaxed);

        if top > bottom {
            // The deque was empty; undo the decrement.
            self.bottom.store(bottom + 1, Ordering::Relaxed);
            return None;
        }

        // SAFETY: The slot was published by a prior push on this thread.
        let value = unsafe { (*buffer).read(bottom) };
        if top < bottom {
            // More than one element; no stealer can reach this slot.
            return Some(value);
        }

        // Exactly one element: race any stealers for it by advancing top.
        let won = self
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(bottom + 1, Ordering::Relaxed);
        won.then_some(value)
    }

    /// Steals a task from the top. Any thread may call this.
    pub(crate) fn steal(&self) -> Steal<T> {
        let top = self.top.load(Ordering::Acquire);
        // Order the top read before the bottom read; pairs with the owner's
        // full fence in `pop`.
        fence(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::Acquire);

        if top >= bottom {
            return Steal::Empty;
        }

        // Acquire pairs with the release store in `resize`, so the buffer
        // contents for [top, bottom) are visible.
        let buffer = self.buffer.load(Ordering::Acquire);
        // SAFETY: `top < bottom`, so the slot holds a published element. The
        // buffer itself, even if stale, stays alive on the garbage list. A
        // stale read is discarded by the CAS below.
        let value = unsafe { (*buffer).read(top) };

        match self
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => Steal::Success(value),
            Err(_) => Steal::Lost,
        }
    }

    /// Doubles the buffer, retiring the old one to the garbage list.
    ///
    /// # Safety
    ///
    /// May only be called by the owning worker.
    #[cold]
    unsafe fn resize(&self, top: isize, bottom: isize) -> *mut Buffer<T> {
        let old = self.buffer.load(Ordering::Relaxed);
        // SAFETY: The owner is the only thread that replaces the buffer.
        let old_ref = unsafe { &*old };
        let new = Buffer::alloc(2 * old_ref.storage.len());

        for index in top..bottom {
            // SAFETY: [top, bottom) is published in the old buffer; the new
            // buffer is not yet visible to anyone else.
            unsafe { new.as_ref().write(index, old_ref.read(index)) };
        }

        self.buffer.store(new.as_ptr(), Ordering::Release);
        // SAFETY: The garbage list is owner-only.
        unsafe { (*self.garbage.get()).push(NonNull::new_unchecked(old)) };
        new.as_ptr()
    }
}

impl<T> Drop for Deque<T> {
    fn drop(&mut self) {
        // SAFETY: Entries are `Copy` and never dropped; buffers were created
        // by `Buffer::alloc` and are only reclaimed here.
        unsafe {
            drop(Box::from_raw(self.buffer.load(Ordering::Relaxed)));
            for buffer in self.garbage.get_mut().drain(..) {
                drop(Box::from_raw(buffer.as_ptr()));
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn owner_is_lifo() {
        let deque = Deque::new();
        unsafe {
            deque.push(1);
            deque.push(2);
            deque.push(3);
            assert_eq!(deque.pop(), Some(3));
            assert_eq!(deque.pop(), Some(2));
            deque.push(4);
            assert_eq!(deque.pop(), Some(4));
            assert_eq!(deque.pop(), Some(1));
            assert_eq!(deque.pop(), None);
        }
    }

    #[test]
    fn stealers_are_fifo() {
        let deque = Deque::new();
        unsafe {
            deque.push(1);
            deque.push(2);
        }
        assert_eq!(deque.steal(), Steal::Success(1));
        assert_eq!(deque.steal(), Steal::Success(2));
        assert_eq!(deque.steal(), Steal::Empty);
    }

    #[test]
    fn growth_keeps_every_element() {
        let deque = Deque::new();
        unsafe {
            for i in 0..10_000 {
                deque.push(i);
            }
            let mut seen = HashSet::new();
            while let Some(value) = deque.pop() {
                assert!(seen.insert(value));
            }
            assert_eq!(seen.len(), 10_000);
        }
    }

    // Every pushed value is returned exactly once across the owner and a
    // gang of stealers, regardless of interleaving.
    #[test]
    fn concurrent_multiset_property() {
        const PUSHES: usize = 50_000;
        const STEALERS: usize = 4;

        let deque = Arc::new(Deque::new());
        let done = Arc::new(AtomicBool::new(false));

        let stealers: Vec<_> = (0..STEALERS)
            .map(|_| {
                let deque = Arc::clone(&deque);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    loop {
                        match deque.steal() {
                            Steal::Success(value) => taken.push(value),
                            Steal::Empty if done.load(Ordering::Acquire) => break,
                            Steal::Empty | Steal::Lost => thread::yield_now(),
                        }
                    }
                    taken
                })
            })
            .collect();

        let mut kept = Vec::new();
        for i in 0..PUSHES {
            unsafe {
                deque.push(i);
                if i % 3 == 0 {
                    if let Some(value) = deque.pop() {
                        kept.push(value);
                    }
                }
            }
        }
        unsafe {
            while let Some(value) = deque.pop() {
                kept.push(value);
            }
        }
        done.store(true, Ordering::Release);

        let mut all: Vec<usize> = kept;
        for stealer in stealers {
            all.extend(stealer.join().unwrap());
        }
        all.sort_unstable();
        let expected: Vec<usize> = (0..PUSHES).collect();
        assert_eq!(all, expected);
    }
}
