//! A pool of workers that spin when idle.
//!
//! The busy pool is the simplest scheduler that exercises the whole
//! suspension protocol: each worker loops over its private submissions,
//! then over steal probes of its peers, and otherwise spins. It trades idle
//! CPU for the lowest possible wakeup latency; use the
//! [`LazyPool`](crate::LazyPool) when idle workers should sleep.

use std::num::NonZero;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tracing::{debug, trace};

use crate::context::{resume_stolen, resume_submission, WorkerContext};
use crate::deque::Steal;
use crate::list::SubmitHandle;
use crate::root::Scheduler;
use crate::stack::Stack;
use crate::tls;
use crate::topology::{self, TopologyNode};
use crate::util::XorShift64Star;

// -----------------------------------------------------------------------------
// Pool

/// A work-stealing pool whose idle workers spin.
pub struct BusyPool {
    contexts: Vec<Arc<WorkerContext>>,
    stop: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl BusyPool {
    /// Spawns a pool of `workers` spinning workers on a flat topology.
    pub fn new(workers: usize) -> BusyPool {
        BusyPool::with_topology(topology::flat(workers.max(1)))
    }

    /// Spawns one worker per hardware thread.
    pub fn with_available_parallelism() -> BusyPool {
        let workers = thread::available_parallelism().map(NonZero::get).unwrap_or(1);
        BusyPool::new(workers)
    }

    /// Spawns one worker per node of an injected topology. Neighbor lists
    /// order each worker's steal probes; closer peers are probed first.
    pub fn with_topology(nodes: Vec<TopologyNode>) -> BusyPool {
        assert!(!nodes.is_empty(), "a pool needs at least one worker");
        debug!(workers = nodes.len(), "starting busy pool");

        let stop = Arc::new(AtomicBool::new(false));
        let contexts: Vec<Arc<WorkerContext>> = (0..nodes.len())
            .map(|index| {
                // Spinning workers notice submissions on their own; the
                // notification hook has nothing to do.
                Arc::new(WorkerContext::new(index, Box::new(|| {})))
            })
            .collect();

        let barrier = Arc::new(Barrier::new(nodes.len() + 1));
        let threads = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let context = Arc::clone(&contexts[index]);
                // Flatten the neighbor tiers into a probe order, nearest
                // first, skipping ourselves.
                let victims: Vec<Arc<WorkerContext>> = node
                    .neighbors
                    .iter()
                    .flatten()
                    .filter(|&&peer| peer != index)
                    .map(|&peer| Arc::clone(&contexts[peer]))
                    .collect();
                let stop = Arc::clone(&stop);
                let barrier = Arc::clone(&barrier);
                thread::Builder::new()
                    .name(format!("weft-busy-{index}"))
                    .spawn(move || worker(context, victims, stop, barrier))
                    .expect("failed to spawn a pool worker")
            })
            .collect();

        // Don't hand out the pool until every worker is in its loop.
        barrier.wait();

        BusyPool {
            contexts,
            stop,
            threads,
        }
    }

    /// Whether the calling thread is one of this pool's workers.
    pub fn is_worker_thread(&self) -> bool {
        let Some(current) = tls::context() else {
            return false;
        };
        self.contexts
            .iter()
            .any(|context| core::ptr::eq(current.as_ptr(), Arc::as_ptr(context)))
    }

    /// The number of workers.
    pub fn workers(&self) -> usize {
        self.contexts.len()
    }
}

impl Scheduler for BusyPool {
    /// Hands the submission to a uniformly random worker.
    fn schedule(&self, task: SubmitHandle) {
        let target = XorShift64Star::new().next_usize(self.contexts.len());
        trace!(worker = target, "distributing submission");
        self.contexts[target].schedule(task);
    }
}

impl Drop for BusyPool {
    fn drop(&mut self) {
        debug!("stopping busy pool");
        self.stop.store(true, Ordering::Release);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

// -----------------------------------------------------------------------------
// Worker loop

fn worker(
    context: Arc<WorkerContext>,
    victims: Vec<Arc<WorkerContext>>,
    stop: Arc<AtomicBool>,
    barrier: Arc<Barrier>,
) {
    let mut stack = Stack::new();
    let _stack = tls::occupy_stack(&mut stack);
    let _context = tls::occupy_context(&context);
    barrier.wait();
    trace!("busy worker running");

    let rng = XorShift64Star::new();
    let mut order: Vec<usize> = (0..victims.len()).collect();

    while !stop.load(Ordering::Acquire) {
        if run_submissions(&context) {
            continue;
        }
        if steal_round(&victims, &mut order, &rng) {
            continue;
        }
        core::hint::spin_loop();
    }

    // Submissions accepted before the stop flag must still run.
    run_submissions(&context);
    trace!("busy worker exiting");
}

/// Drains and runs this worker's submissions. Returns `true` if any ran.
fn run_submissions(context: &WorkerContext) -> bool {
    let mut ran = false;
    // SAFETY: We are the owning worker, between tasks.
    unsafe {
        for frame in context.drain_submissions() {
            ran = true;
            resume_submission(frame);
        }
    }
    ran
}

/// Probes every victim once in random order. Returns `true` on a successful
/// steal (after running the task).
fn steal_round(
    victims: &[Arc<WorkerContext>],
    order: &mut [usize],
    rng: &XorShift64Star,
) -> bool {
    rng.shuffle(order);
    for &index in order.iter() {
        if let Steal::Success(task) = victims[index].try_steal() {
            // SAFETY: The steal succeeded, so the task is exclusively ours,
            // and our stack is empty between tasks.
            unsafe { resume_stolen(task) };
            return true;
        }
    }
    false
}
