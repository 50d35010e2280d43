//! A one-shot value-carrying signal, used as the root task's semaphore.
//!
//! When a root task completes, the finishing worker sends the task's outcome
//! over a signal embedded in the shared completion channel; the external
//! caller blocks on the same signal in `JoinHandle::get` or `wait`. The
//! implementation is a small futex state machine in the spirit of oneshot
//! channels, with the wait/wake calls provided by `atomic-wait`.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

// -----------------------------------------------------------------------------
// States

/// No value sent, no receiver waiting.
const IDLE: u32 = 0b00;

/// Set by a receiver that is about to block and needs waking.
const WAIT: u32 = 0b01;

/// Set by the sender once the value has been written.
const SENT: u32 = 0b10;

// -----------------------------------------------------------------------------
// Signal

/// Transmits a single value across threads, exactly once.
pub(crate) struct Signal<T> {
    state: AtomicU32,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: The sender writes the value before setting `SENT` (release); the
// receiver reads it only after observing `SENT` (acquire).
unsafe impl<T: Send> Sync for Signal<T> {}

impl<T: Send> Signal<T> {
    pub(crate) fn new() -> Signal<T> {
        Signal {
            state: AtomicU32::new(IDLE),
            value: UnsafeCell::new(None),
        }
    }

    /// Returns `true` once a value has been sent.
    pub(crate) fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) & SENT != 0
    }

    /// Blocks until a value has been sent, without consuming it.
    pub(crate) fn wait(&self) {
        loop {
            // Announce the intent to sleep and check the state in a single
            // atomic step; a sender that sets SENT after this sees WAIT and
            // wakes us.
            let state = self.state.fetch_or(WAIT, Ordering::Acquire);
            if state & SENT != 0 {
                return;
            }
            atomic_wait::wait(&self.state, state | WAIT);
        }
    }

    /// Blocks until a value has been sent, then takes it.
    ///
    /// # Panics
    ///
    /// Panics if the value has already been taken.
    ///
    /// # Safety
    ///
    /// `recv` may only ever be called from one thread per signal.
    pub(crate) unsafe fn recv(&self) -> T {
        self.wait();
        // SAFETY: SENT is observed with acquire ordering, so the sender's
        // write to the slot is visible, and the sender never touches the slot
        // again. The single-receiver contract rules out a competing take.
        unsafe { (*self.value.get()).take() }.expect("signal value taken twice")
    }

    /// Sends the value, waking the receiver if it is blocked.
    ///
    /// # Panics
    ///
    /// Panics if called twice on the same signal.
    ///
    /// # Safety
    ///
    /// Waking the receiver may free the signal's memory: the caller must not
    /// touch `signal` after this call, and must guarantee the pointer stays
    /// valid until the final state store inside it completes (holding a
    /// reference count on the enclosing allocation suffices).
    pub(crate) unsafe fn send(signal: *const Signal<T>, value: T) {
        // SAFETY: The pointer is valid on entry and nothing below publishes
        // the value before this write completes.
        unsafe {
            let state = (*signal).state.load(Ordering::Relaxed);
            assert!(state & SENT == 0, "signal sent twice");

            // The receiver only reads the slot after observing SENT, which is
            // published with release ordering below.
            *(*signal).value.get() = Some(value);

            let state = (*signal).state.fetch_or(SENT, Ordering::Release);
            if state & WAIT != 0 {
                // A receiver in the WAIT state is asleep or about to be; it
                // cannot free the signal before it wakes and observes SENT.
                atomic_wait::wake_all(&(*signal).state);
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn send_then_recv() {
        let signal = Signal::new();
        unsafe {
            Signal::send(&signal, 17);
            assert!(signal.is_set());
            assert_eq!(signal.recv(), 17);
        }
    }

    #[test]
    fn recv_blocks_until_sent() {
        let signal = Arc::new(Signal::new());
        let sender = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                unsafe { Signal::send(&*signal, "hello") };
            })
        };
        assert_eq!(unsafe { signal.recv() }, "hello");
        sender.join().unwrap();
    }

    #[test]
    fn wait_does_not_consume() {
        let signal = Arc::new(Signal::new());
        let sender = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || unsafe { Signal::send(&*signal, 5u32) })
        };
        signal.wait();
        signal.wait();
        assert_eq!(unsafe { signal.recv() }, 5);
        sender.join().unwrap();
    }
}
