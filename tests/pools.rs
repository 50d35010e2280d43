//! Scheduler behavior: migration, drain on shutdown, stress, and the
//! external handle API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use weft::prelude::*;
use weft::{Discard, Distribution, Error};

// -----------------------------------------------------------------------------
// Migration between pools

#[test]
fn resume_on_migrates_to_the_target_pool() {
    let pool_a: &'static BusyPool = Box::leak(Box::new(BusyPool::new(2)));
    let pool_b: &'static LazyPool = Box::leak(Box::new(LazyPool::new(2)));

    let (started_on_a, finished_on_b) = weft::sync_wait(pool_a, async {
        let started_on_a = pool_a.is_worker_thread() && !pool_b.is_worker_thread();
        resume_on(pool_b).await;
        let finished_on_b = pool_b.is_worker_thread() && !pool_a.is_worker_thread();
        (started_on_a, finished_on_b)
    })
    .unwrap();

    assert!(started_on_a);
    assert!(finished_on_b);
}

#[test]
fn a_task_can_migrate_back_and_forth() {
    let pool_a: &'static LazyPool = Box::leak(Box::new(LazyPool::new(2)));
    let pool_b: &'static LazyPool = Box::leak(Box::new(LazyPool::new(2)));

    let hops = weft::sync_wait(pool_a, async {
        let mut hops = 0;
        for _ in 0..8 {
            resume_on(pool_b).await;
            if pool_b.is_worker_thread() {
                hops += 1;
            }
            resume_on(pool_a).await;
            if pool_a.is_worker_thread() {
                hops += 1;
            }
        }
        hops
    })
    .unwrap();
    assert_eq!(hops, 16);
}

#[test]
fn forked_work_survives_a_migration() {
    let pool_a: &'static BusyPool = Box::leak(Box::new(BusyPool::new(2)));
    let pool_b: &'static BusyPool = Box::leak(Box::new(BusyPool::new(2)));

    let value = weft::sync_wait(pool_a, async {
        let mut slot = Slot::new();
        // SAFETY: Joined below, after the migration.
        unsafe {
            fork(&slot, async { 21u64 }).await;
        }
        resume_on(pool_b).await;
        join().await;
        slot.take().unwrap() * 2
    })
    .unwrap();
    assert_eq!(value, 42);
}

// -----------------------------------------------------------------------------
// Shutdown

#[test]
fn a_lazy_pool_drains_detached_tasks_before_stopping() {
    const TASKS: usize = 10_000;

    let completions = Arc::new(AtomicUsize::new(0));
    {
        let pool = LazyPool::new(8);
        for _ in 0..TASKS {
            let completions = Arc::clone(&completions);
            weft::detach(&pool, async move {
                completions.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        // Dropping the pool joins every worker, and workers drain their
        // submissions before exiting.
    }
    assert_eq!(completions.load(Ordering::Relaxed), TASKS);
}

#[test]
fn a_busy_pool_drains_detached_tasks_before_stopping() {
    const TASKS: usize = 1000;

    let completions = Arc::new(AtomicUsize::new(0));
    {
        let pool = BusyPool::new(4);
        for _ in 0..TASKS {
            let completions = Arc::clone(&completions);
            weft::detach(&pool, async move {
                completions.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
    }
    assert_eq!(completions.load(Ordering::Relaxed), TASKS);
}

// -----------------------------------------------------------------------------
// Stress

fn fib(n: u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = u64> + Send>> {
    Box::pin(async move {
        if n < 2 {
            return n;
        }
        let mut a = Slot::new();
        let mut b = Slot::new();
        // SAFETY: Joined below; the slots outlive the join.
        unsafe {
            fork(&a, fib(n - 1)).await;
            call(&b, fib(n - 2)).await;
        }
        join().await;
        a.take().unwrap() + b.take().unwrap()
    })
}

#[test]
fn busy_pool_stress_steal() {
    let pool = BusyPool::new(4);
    assert_eq!(weft::sync_wait(&pool, fib(30)).unwrap(), 832040);
}

#[test]
fn lazy_pool_grouped_topologies_compute_correctly() {
    for strategy in [Distribution::Fan, Distribution::Seq] {
        let pool = LazyPool::with_distribution(8, 2, strategy);
        assert_eq!(weft::sync_wait(&pool, fib(25)).unwrap(), 75025);
    }
}

#[test]
fn many_concurrent_roots() {
    let pool = Arc::new(LazyPool::new(4));
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for n in 0..18 {
                    assert_eq!(
                        weft::sync_wait(&*pool, fib(n)).unwrap(),
                        weft::sync_wait(&*pool, fib(n)).unwrap()
                    );
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
}

// -----------------------------------------------------------------------------
// External handle API

#[test]
fn scheduling_from_a_worker_is_rejected() {
    let pool: &'static BusyPool = Box::leak(Box::new(BusyPool::new(2)));

    let error = weft::sync_wait(pool, async {
        weft::schedule(pool, async { 1 }).err()
    })
    .unwrap();
    assert_eq!(error, Some(Error::ScheduleInWorker));
}

#[test]
fn get_consumes_the_result_exactly_once() {
    let pool = BusyPool::new(2);
    let mut handle = weft::schedule(&pool, async { 7 }).unwrap();
    assert!(handle.is_valid());
    assert_eq!(handle.get().unwrap(), 7);
    assert!(!handle.is_valid());
    assert_eq!(handle.get(), Err(Error::EmptyFuture));
    assert_eq!(handle.wait(), Err(Error::EmptyFuture));
}

#[test]
fn a_detached_handle_is_broken() {
    let pool = BusyPool::new(2);
    let mut handle = weft::schedule(&pool, async { 7 }).unwrap();
    handle.detach();
    assert!(!handle.is_valid());
    assert_eq!(handle.get(), Err(Error::BrokenFuture));
    assert_eq!(handle.wait(), Err(Error::BrokenFuture));
}

#[test]
fn wait_then_get_returns_the_value() {
    let pool = LazyPool::new(2);
    let mut handle = weft::schedule(&pool, async { "done" }).unwrap();
    handle.wait().unwrap();
    assert!(handle.is_finished());
    assert_eq!(handle.get().unwrap(), "done");
}

#[test]
fn dropping_a_live_handle_blocks_until_completion() {
    let completions = Arc::new(AtomicUsize::new(0));
    let pool = BusyPool::new(2);

    let task_completions = Arc::clone(&completions);
    let handle = weft::schedule(&pool, async move {
        task_completions.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();
    drop(handle);

    // The drop returned, so the task must have completed.
    assert_eq!(completions.load(Ordering::Relaxed), 1);
}

// -----------------------------------------------------------------------------
// Eager panic modifiers

#[test]
fn call_eager_raises_without_waiting_for_a_join() {
    let pool = BusyPool::new(2);
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        weft::sync_wait(&pool, async {
            // SAFETY: The called child completes inline.
            unsafe {
                weft::call_eager(Discard, async {
                    panic!("eager");
                })
                .await;
            }
            unreachable!("the awaiter must re-raise the panic");
        })
    }));
    let payload = outcome.expect_err("the panic must reach the caller");
    assert_eq!(*payload.downcast::<&str>().unwrap(), "eager");
}

#[test]
fn fork_sync_reports_synchronous_completion() {
    let pool = BusyPool::new(1);
    let synchronous = weft::sync_wait(&pool, async {
        let mut slot = Slot::new();
        // SAFETY: Joined below.
        let synchronous = unsafe { weft::fork_sync(&slot, async { 9 }).await };
        join().await;
        assert_eq!(slot.take(), Some(9));
        synchronous
    })
    .unwrap();
    // With a single worker there is nobody to steal the parent.
    assert!(synchronous);
}
