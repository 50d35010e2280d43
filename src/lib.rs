//! A continuation-stealing fork-join runtime with per-worker segmented
//! stacks.
//!
//! Weft runs divide-and-conquer computations written as `async fn` tasks.
//! A task spawns children with [`fork`] (the child runs now and the *parent*
//! becomes stealable) or [`call`] (the child must finish first), waits for
//! its forked children with [`join`], and can migrate itself to another
//! scheduler with [`resume_on`]. Workers execute tasks busy-leaf style: the
//! spawning worker always dives into the child, and an idle worker steals
//! the suspended parent continuation instead of the child. Task frames are
//! bump-allocated on a per-worker segmented stack, so a fork costs an
//! allocation-free pointer bump and the native call stack stays flat no
//! matter how deep the task tree grows.
//!
//! ```rust
//! use weft::prelude::*;
//!
//! async fn fib(n: u64) -> u64 {
//!     if n < 2 {
//!         return n;
//!     }
//!     let mut a = Slot::new();
//!     let mut b = Slot::new();
//!     // SAFETY: Both children are joined before the slots go away.
//!     unsafe {
//!         fork(&a, fib(n - 1)).await;
//!         call(&b, fib(n - 2)).await;
//!     }
//!     join().await;
//!     a.take().unwrap() + b.take().unwrap()
//! }
//!
//! let pool = BusyPool::new(4);
//! assert_eq!(weft::sync_wait(&pool, fib(20)).unwrap(), 6765);
//! ```
//!
//! Two schedulers are provided: [`BusyPool`], whose idle workers spin, and
//! [`LazyPool`], whose idle workers sleep on per-locality-group
//! event-counts. Anything implementing [`Scheduler`] can accept root tasks.
//!
//! # Panics
//!
//! A panicking task does not tear down the pool. The payload is parked in
//! its parent's frame and re-raised by the parent's [`join`]; a panic that
//! reaches the root of a task tree is re-raised by
//! [`JoinHandle::get`].
//!
//! # Acknowledgments
//!
//! The scheduling discipline -- fork/call/join dispatch, the steal/join
//! counters, stack eating, and the lazy pool's wakeup invariant -- follows
//! the design of the libfork C++ library. The worker plumbing borrows
//! liberally from the lineage of rayon-like Rust pools.

// -----------------------------------------------------------------------------
// Modules

mod awaitables;
mod busy_pool;
mod context;
mod deque;
mod event_count;
mod frame;
mod lazy_pool;
mod list;
mod root;
mod signal;
mod stack;
mod tls;
mod topology;
mod unwind;
mod util;

// -----------------------------------------------------------------------------
// Top-level exports

pub use awaitables::call;
pub use awaitables::call_eager;
pub use awaitables::call_eager_outside;
pub use awaitables::fork;
pub use awaitables::fork_sync;
pub use awaitables::fork_sync_outside;
pub use awaitables::join;
pub use awaitables::resume_on;
pub use awaitables::CallAwait;
pub use awaitables::EagerCallAwait;
pub use awaitables::ForkAwait;
pub use awaitables::JoinAwait;
pub use awaitables::SwitchAwait;
pub use awaitables::SyncForkAwait;
pub use busy_pool::BusyPool;
pub use context::WorkerContext;
pub use frame::Discard;
pub use frame::Outbox;
pub use frame::Return;
pub use frame::Slot;
pub use lazy_pool::LazyPool;
pub use list::SubmitHandle;
pub use root::detach;
pub use root::schedule;
pub use root::sync_wait;
pub use root::Error;
pub use root::JoinHandle;
pub use root::Scheduler;
pub use topology::distribute;
pub use topology::flat;
pub use topology::Distribution;
pub use topology::TopologyNode;
pub use unwind::PanicBeforeJoin;

/// The common imports for writing tasks.
pub mod prelude {
    pub use crate::call;
    pub use crate::fork;
    pub use crate::join;
    pub use crate::resume_on;
    pub use crate::BusyPool;
    pub use crate::Discard;
    pub use crate::LazyPool;
    pub use crate::Scheduler;
    pub use crate::Slot;
}
