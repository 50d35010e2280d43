//! A pool of workers that sleep when idle.
//!
//! Workers are partitioned into locality groups, each with an event-count
//! and a count of its thieves (workers currently searching for work); a
//! global count tracks workers actively running a task. Together they
//! maintain the wakeup invariant: **whenever any worker is active, every
//! group has at least one thief or no sleepers.** A group can therefore
//! never doze off collectively while work that might spawn more work is
//! live somewhere else.
//!
//! The invariant is kept by two symmetric transitions. A thief that finds
//! work gives up its thief token -- waking a replacement if it was the
//! group's last -- and increments the active count, waking one worker in
//! every group if the whole pool had gone quiet. A worker about to sleep
//! gives up its token only if it is not the group's last thief while anyone
//! is active; otherwise it cancels the sleep and keeps searching.

use std::num::NonZero;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tracing::{debug, trace};

use crate::context::{resume_stolen, resume_submission, WorkerContext};
use crate::deque::Steal;
use crate::event_count::EventCount;
use crate::frame::TaskHandle;
use crate::list::SubmitHandle;
use crate::root::Scheduler;
use crate::stack::Stack;
use crate::tls;
use crate::topology::{self, Distribution, TopologyNode};
use crate::util::XorShift64Star;

// -----------------------------------------------------------------------------
// Shared pool state

struct Group {
    event: EventCount,
    thieves: AtomicUsize,
}

struct Shared {
    groups: Vec<Group>,
    active: AtomicUsize,
    stop: AtomicBool,
}

impl Shared {
    /// Thief to active. Consumes the caller's thief token.
    fn enter_active(&self, group: usize) {
        let home = &self.groups[group];
        if home.thieves.fetch_sub(1, Ordering::AcqRel) == 1 {
            // We were the group's last thief; draft a sleeper to replace us.
            home.event.notify_one();
        }
        if self.active.fetch_add(1, Ordering::AcqRel) == 0 {
            // The pool was fully idle; every group needs a thief again.
            for group in &self.groups {
                group.event.notify_one();
            }
        }
    }

    /// Active back to thief. Restores the caller's thief token.
    fn exit_active(&self, group: usize) {
        // Become a thief before shrinking the active count, so the invariant
        // holds at every instant in between.
        self.groups[group].thieves.fetch_add(1, Ordering::Release);
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

// -----------------------------------------------------------------------------
// Pool

/// A work-stealing pool whose idle workers sleep on per-group event-counts.
pub struct LazyPool {
    contexts: Vec<Arc<WorkerContext>>,
    shared: Arc<Shared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl LazyPool {
    /// Spawns a pool of `workers` sleeping workers on a flat topology.
    pub fn new(workers: usize) -> LazyPool {
        LazyPool::with_topology(topology::flat(workers.max(1)))
    }

    /// Spawns one worker per hardware thread.
    pub fn with_available_parallelism() -> LazyPool {
        let workers = thread::available_parallelism().map(NonZero::get).unwrap_or(1);
        LazyPool::new(workers)
    }

    /// Spawns `workers` workers spread over `groups` locality groups with
    /// the given distribution strategy.
    pub fn with_distribution(workers: usize, groups: usize, strategy: Distribution) -> LazyPool {
        LazyPool::with_topology(topology::distribute(workers.max(1), groups, strategy))
    }

    /// Spawns one worker per node of an injected topology. Group tags scope
    /// the sleep bookkeeping; neighbor tiers order and weight steal probes.
    pub fn with_topology(nodes: Vec<TopologyNode>) -> LazyPool {
        assert!(!nodes.is_empty(), "a pool needs at least one worker");
        let group_count = nodes.iter().map(|node| node.group).max().unwrap_or(0) + 1;
        debug!(
            workers = nodes.len(),
            groups = group_count,
            "starting lazy pool"
        );

        let shared = Arc::new(Shared {
            groups: (0..group_count)
                .map(|_| Group {
                    event: EventCount::new(),
                    thieves: AtomicUsize::new(0),
                })
                .collect(),
            active: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });

        let contexts: Vec<Arc<WorkerContext>> = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                // Submitting to a worker pokes its group so a sleeper will
                // find the submission.
                let shared = Arc::clone(&shared);
                let group = node.group;
                let notify = Box::new(move || shared.groups[group].event.notify_one());
                Arc::new(WorkerContext::new(index, notify))
            })
            .collect();

        let barrier = Arc::new(Barrier::new(nodes.len() + 1));
        let threads = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let context = Arc::clone(&contexts[index]);
                let victims = StealSet::new(index, node, &contexts);
                let shared = Arc::clone(&shared);
                let group = node.group;
                let barrier = Arc::clone(&barrier);
                thread::Builder::new()
                    .name(format!("weft-lazy-{index}"))
                    .spawn(move || worker(context, victims, shared, group, barrier))
                    .expect("failed to spawn a pool worker")
            })
            .collect();

        barrier.wait();

        LazyPool {
            contexts,
            shared,
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

impl Scheduler for LazyPool {
    /// Hands the submission to a uniformly random worker; the context's
    /// notification hook takes care of waking its group.
    fn schedule(&self, task: SubmitHandle) {
        let target = XorShift64Star::new().next_usize(self.contexts.len());
        trace!(worker = target, "distributing submission");
        self.contexts[target].schedule(task);
    }
}

impl Drop for LazyPool {
    fn drop(&mut self) {
        debug!("stopping lazy pool");
        self.shared.stop.store(true, Ordering::Release);
        for group in &self.shared.groups {
            group.event.notify_all();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

// -----------------------------------------------------------------------------
// Worker loop

fn worker(
    context: Arc<WorkerContext>,
    mut victims: StealSet,
    shared: Arc<Shared>,
    group: usize,
    barrier: Arc<Barrier>,
) {
    let mut stack = Stack::new();
    let _stack = tls::occupy_stack(&mut stack);
    let _context = tls::occupy_context(&context);
    barrier.wait();
    trace!("lazy worker running");

    let rng = XorShift64Star::new();
    let home = &shared.groups[group];

    // The loop invariant: we hold one of our group's thief tokens.
    home.thieves.fetch_add(1, Ordering::Release);
    loop {
        if find_and_run(&context, &mut victims, &rng, &shared, group) {
            continue;
        }

        // Out of work: announce the nap, then re-check everything that
        // could have raced past us.
        let key = home.event.prepare_wait();
        if context.has_submissions() {
            home.event.cancel_wait();
            continue;
        }
        if shared.stop.load(Ordering::Acquire) {
            home.event.cancel_wait();
            break;
        }
        if home.thieves.fetch_sub(1, Ordering::AcqRel) == 1
            && shared.active.load(Ordering::Acquire) > 0
        {
            // We would be leaving an active pool with a thief-less group;
            // keep searching instead.
            home.event.cancel_wait();
            home.thieves.fetch_add(1, Ordering::Release);
            continue;
        }
        home.event.commit_wait(key);
        home.thieves.fetch_add(1, Ordering::Release);
    }
    home.thieves.fetch_sub(1, Ordering::Release);

    // Submissions accepted before the stop flag must still run.
    run_submissions(&context);
    trace!("lazy worker exiting");
}

/// One search round: own submissions first, then steal probes. Returns
/// `true` if any task ran.
fn find_and_run(
    context: &WorkerContext,
    victims: &mut StealSet,
    rng: &XorShift64Star,
    shared: &Shared,
    group: usize,
) -> bool {
    if context.has_submissions() {
        shared.enter_active(group);
        run_submissions(context);
        shared.exit_active(group);
        return true;
    }
    if let Some(task) = victims.probe(rng) {
        shared.enter_active(group);
        // SAFETY: The steal succeeded, so the task is exclusively ours, and
        // our stack is empty between tasks.
        unsafe { resume_stolen(task) };
        shared.exit_active(group);
        return true;
    }
    false
}

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

// -----------------------------------------------------------------------------
// Steal probing

/// Fixed-point scale for the tier weights.
const WEIGHT_SCALE: u64 = 720720; // divisible by 1..=16

/// A worker's view of its victims, bucketed by topological distance.
struct StealSet {
    /// Immediate neighbors; each is probed once per round, in random order.
    close: Vec<Arc<WorkerContext>>,
    /// Scratch for shuffling the close probe order.
    order: Vec<usize>,
    /// All victims by tier, nearest first.
    tiers: Vec<Vec<Arc<WorkerContext>>>,
    /// Cumulative tier weights: tier `t` is picked with probability
    /// proportional to `1 / (t + 1)`, which makes each of its members'
    /// probability inversely proportional to both the distance and the
    /// number of peers at that distance.
    cumulative: Vec<u64>,
    /// How many weighted probes to attempt per round.
    attempts: usize,
}

impl StealSet {
    fn new(index: usize, node: &TopologyNode, contexts: &[Arc<WorkerContext>]) -> StealSet {
        let tiers: Vec<Vec<Arc<WorkerContext>>> = node
            .neighbors
            .iter()
            .map(|tier| {
                tier.iter()
                    .filter(|&&peer| peer != index)
                    .map(|&peer| Arc::clone(&contexts[peer]))
                    .collect::<Vec<_>>()
            })
            .filter(|tier: &Vec<_>| !tier.is_empty())
            .collect();

        let close = tiers.first().cloned().unwrap_or_default();
        let order = (0..close.len()).collect();
        let mut cumulative = Vec::with_capacity(tiers.len());
        let mut total = 0;
        for (distance, _) in tiers.iter().enumerate() {
            total += WEIGHT_SCALE / (distance as u64 + 1);
            cumulative.push(total);
        }
        let attempts = tiers.iter().map(Vec::len).sum();

        StealSet {
            close,
            order,
            tiers,
            cumulative,
            attempts,
        }
    }

    /// Runs one probe round. `Empty` and `Lost` both move on to the next
    /// target; a round gives up after the close pass plus a bounded number
    /// of weighted attempts.
    fn probe(&mut self, rng: &XorShift64Star) -> Option<TaskHandle> {
        rng.shuffle(&mut self.order);
        for &index in self.order.iter() {
            if let Steal::Success(task) = self.close[index].try_steal() {
                return Some(task);
            }
        }

        let Some(&total) = self.cumulative.last() else {
            return None;
        };
        for _ in 0..self.attempts {
            let roll = rng.next_usize(total as usize) as u64;
            let tier = self.cumulative.partition_point(|&weight| weight <= roll);
            let tier = &self.tiers[tier];
            let victim = &tier[rng.next_usize(tier.len())];
            if let Steal::Success(task) = victim.try_steal() {
                return Some(task);
            }
        }
        None
    }
}
