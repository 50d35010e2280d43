//! Fork-join semantics: recursion, wide fan-out, and panic propagation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use weft::prelude::*;
use weft::Discard;

// -----------------------------------------------------------------------------
// Recursive fibonacci

fn fib(n: u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = u64> + Send>> {
    Box::pin(async move {
        if n < 2 {
            return n;
        }
        let mut a = Slot::new();
        let mut b = Slot::new();
        // SAFETY: Both children complete before this scope ends: the fork is
        // joined below and the call completes inline.
        unsafe {
            fork(&a, fib(n - 1)).await;
            call(&b, fib(n - 2)).await;
        }
        join().await;
        a.take().unwrap() + b.take().unwrap()
    })
}

fn fib_reference(n: u64) -> u64 {
    match n {
        0 | 1 => n,
        _ => fib_reference(n - 1) + fib_reference(n - 2),
    }
}

#[test]
fn fib_on_busy_pools_of_every_size() {
    for workers in [1, 2, 4, 8] {
        let pool = BusyPool::new(workers);
        assert_eq!(weft::sync_wait(&pool, fib(20)).unwrap(), 6765);
        assert_eq!(weft::sync_wait(&pool, fib(25)).unwrap(), 75025);
    }
}

#[test]
fn fib_on_lazy_pools_of_every_size() {
    for workers in [1, 2, 4, 8] {
        let pool = LazyPool::new(workers);
        assert_eq!(weft::sync_wait(&pool, fib(20)).unwrap(), 6765);
        assert_eq!(weft::sync_wait(&pool, fib(25)).unwrap(), 75025);
    }
}

#[test]
fn sync_wait_agrees_with_direct_evaluation() {
    let pool = BusyPool::new(4);
    for n in 0..20 {
        assert_eq!(weft::sync_wait(&pool, fib(n)).unwrap(), fib_reference(n));
    }
}

// -----------------------------------------------------------------------------
// Wide fan-out

#[test]
fn a_thousand_forked_children() {
    const TASKS: usize = 1000;

    let pool = BusyPool::new(4);
    let (squares, completions) = weft::sync_wait(&pool, async {
        let squares: Vec<AtomicUsize> = (0..TASKS).map(|_| AtomicUsize::new(0)).collect();
        let completions = AtomicUsize::new(0);
        for i in 0..TASKS {
            let squares = &squares;
            let completions = &completions;
            // SAFETY: Every child is joined below, before the borrowed
            // locals go out of scope.
            unsafe {
                fork(Discard, async move {
                    squares[i].store(i * i, Ordering::Relaxed);
                    completions.fetch_add(1, Ordering::Relaxed);
                })
                .await;
            }
        }
        join().await;
        (squares, completions.into_inner())
    })
    .unwrap();

    assert_eq!(completions, TASKS);
    for (i, square) in squares.iter().enumerate() {
        assert_eq!(square.load(Ordering::Relaxed), i * i);
    }
}

#[test]
fn forked_results_come_back_through_slots() {
    let pool = LazyPool::new(4);
    let total = weft::sync_wait(&pool, async {
        let mut slots: Vec<Slot<u64>> = (0..64).map(|_| Slot::new()).collect();
        for (i, slot) in slots.iter().enumerate() {
            // SAFETY: Joined below; the slots outlive the join.
            unsafe {
                fork(slot, async move { (i as u64) * 3 }).await;
            }
        }
        join().await;
        slots.iter_mut().map(|slot| slot.take().unwrap()).sum::<u64>()
    })
    .unwrap();
    assert_eq!(total, 3 * (0..64).sum::<u64>());
}

// -----------------------------------------------------------------------------
// Panic propagation

#[test]
fn a_panicking_child_surfaces_at_the_join() {
    let pool = BusyPool::new(4);
    let completions = Arc::new(AtomicUsize::new(0));

    let task_completions = Arc::clone(&completions);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        weft::sync_wait(&pool, async move {
            for i in 0..4 {
                let completions = Arc::clone(&task_completions);
                // SAFETY: Joined below.
                unsafe {
                    fork(Discard, async move {
                        if i == 2 {
                            panic!("third child fails");
                        }
                        completions.fetch_add(1, Ordering::Relaxed);
                    })
                    .await;
                }
            }
            join().await;
        })
    }));

    let payload = outcome.expect_err("the panic must reach the caller");
    let message = payload.downcast::<&str>().expect("the original payload");
    assert_eq!(*message, "third child fails");
    assert_eq!(completions.load(Ordering::Relaxed), 3);
}

#[test]
fn only_one_of_many_panics_surfaces() {
    let pool = LazyPool::new(4);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        weft::sync_wait(&pool, async {
            for i in 0..16 {
                // SAFETY: Joined below.
                unsafe {
                    fork(Discard, async move {
                        panic!("child {i}");
                    })
                    .await;
                }
            }
            join().await;
        })
    }));

    // All sixteen children panic, but exactly one payload wins the cell and
    // reaches the caller.
    let payload = outcome.expect_err("a panic must reach the caller");
    let message = payload.downcast::<String>().expect("a child's payload");
    assert!(message.starts_with("child "));
}

#[test]
fn a_panicking_root_resurfaces_in_get() {
    let pool = BusyPool::new(2);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        weft::sync_wait(&pool, async {
            panic!("root fails");
        })
    }));
    let payload = outcome.expect_err("the panic must reach the caller");
    assert_eq!(*payload.downcast::<&str>().unwrap(), "root fails");
}

#[test]
fn panics_propagate_through_nested_joins() {
    fn faulty_depth(depth: u32) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            if depth == 0 {
                panic!("leaf fails");
            }
            // SAFETY: Joined immediately below.
            unsafe {
                fork(Discard, faulty_depth(depth - 1)).await;
            }
            join().await;
        })
    }

    let pool = BusyPool::new(4);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        weft::sync_wait(&pool, faulty_depth(8))
    }));
    let payload = outcome.expect_err("the panic must reach the caller");
    assert_eq!(*payload.downcast::<&str>().unwrap(), "leaf fails");
}

// -----------------------------------------------------------------------------
// Randomized forks with scattered panics

#[test]
fn random_workloads_return_the_right_value_or_panic() {
    fn sum_tree(
        values: &'static [u64],
        poison: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = u64> + Send>> {
        Box::pin(async move {
            if values.len() <= 2 {
                let total: u64 = values.iter().sum();
                assert!(total != poison, "poisoned leaf");
                return total;
            }
            let mid = values.len() / 2;
            let mut left = Slot::new();
            let mut right = Slot::new();
            // SAFETY: Joined below; the slots outlive the join.
            unsafe {
                fork(&left, sum_tree(&values[..mid], poison)).await;
                call(&right, sum_tree(&values[mid..], poison)).await;
            }
            join().await;
            left.take().unwrap() + right.take().unwrap()
        })
    }

    let values: &'static [u64] = Box::leak((1..=256u64).collect::<Vec<_>>().into_boxed_slice());
    let expected: u64 = values.iter().sum();
    let pool = BusyPool::new(4);

    // A poison value that no subtree sums to: every run must succeed.
    for _ in 0..50 {
        assert_eq!(weft::sync_wait(&pool, sum_tree(values, u64::MAX)).unwrap(), expected);
    }

    // Poison a value two leaves hit: every run must panic with that payload.
    for _ in 0..50 {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            weft::sync_wait(&pool, sum_tree(values, 3))
        }));
        let payload = outcome.expect_err("the poisoned leaf must panic");
        assert_eq!(*payload.downcast::<&str>().unwrap(), "poisoned leaf");
    }
}
