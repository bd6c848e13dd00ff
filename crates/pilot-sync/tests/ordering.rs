//! Cross-thread ordering scenarios for the ticket locks.

use pilot_context::{with_mode, ExecutionMode, PilotId};
use pilot_sync::{AbortHandle, ReentrantTicketLock, SpinPolicy, TicketLock, TicketLockable};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn dry_run() -> ExecutionMode {
    ExecutionMode::dry_run(PilotId(5), "ordering-host")
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Queue `waiters` shadow threads behind a held lock, one ticket at a time,
/// then release and record the order they enter in.
fn entry_order<L>(lock: L, waiters: usize) -> Vec<usize>
where
    L: TicketLockable + Clone + Send + 'static,
{
    let entered = Arc::new(Mutex::new(Vec::new()));
    let inside = Arc::new(AtomicUsize::new(0));

    let _scope = with_mode(dry_run());
    lock.lock().unwrap();

    let mut handles = Vec::new();
    for i in 0..waiters {
        let (waiter, entered, inside) = (lock.clone(), entered.clone(), inside.clone());
        handles.push(thread::spawn(move || {
            let _scope = with_mode(dry_run());
            waiter.lock().unwrap();
            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "critical sections overlap");
            entered.lock().unwrap().push(i);
            thread::yield_now();
            inside.fetch_sub(1, Ordering::SeqCst);
            waiter.unlock().unwrap();
        }));
        // The holder owns ticket 0, waiter i owns ticket i + 1.
        wait_for(|| lock.ticket_dispenser() == i as u64 + 2);
    }

    lock.unlock().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
    let order = entered.lock().unwrap().clone();
    order
}

#[test]
fn test_shadow_entry_follows_ticket_order() {
    let lock = TicketLock::new("fair", AbortHandle::disabled());
    let order = entry_order(lock.clone(), 8);
    assert_eq!(order, (0..8).collect::<Vec<_>>());
    assert_eq!(lock.ticket_dispenser(), 9);
    assert_eq!(lock.next_serve_id(), 9);
}

#[test]
fn test_reentrant_entry_follows_ticket_order() {
    let lock = ReentrantTicketLock::with_policy(
        "fair-reentrant",
        AbortHandle::disabled(),
        SpinPolicy::yielding(),
    );
    let order = entry_order(lock.clone(), 6);
    assert_eq!(order, (0..6).collect::<Vec<_>>());
    assert_eq!(lock.ticket_dispenser(), lock.next_serve_id());
}

#[test]
fn test_live_and_shadow_phases_interleave_without_violation() {
    let (abort, rx) = AbortHandle::channel();
    let lock = TicketLock::new("phases", abort);
    let log = Arc::new(Mutex::new(Vec::new()));

    for round in 0..5 {
        lock.lock().unwrap();
        log.lock().unwrap().push(format!("live-{round}"));
        lock.unlock().unwrap();

        let (shadow, log) = (lock.clone(), log.clone());
        thread::spawn(move || {
            let _scope = with_mode(dry_run());
            shadow.lock().unwrap();
            log.lock().unwrap().push(format!("shadow-{round}"));
            shadow.unlock().unwrap();
        })
        .join()
        .unwrap();
    }

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 10);
    for (i, entry) in log.iter().enumerate() {
        let expected = if i % 2 == 0 { "live" } else { "shadow" };
        assert!(entry.starts_with(expected), "unexpected entry {entry} at {i}");
    }
    assert!(rx.try_recv().is_err());
    assert_eq!(lock.ticket_dispenser(), 5);
    assert_eq!(lock.next_serve_id(), 5);
}

#[test]
fn test_contended_live_threads_exclude_each_other() {
    let lock = TicketLock::new("contended", AbortHandle::disabled());
    let inside = Arc::new(AtomicBool::new(false));
    let total = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let (lock, inside, total) = (lock.clone(), inside.clone(), total.clone());
            thread::spawn(move || {
                for _ in 0..200 {
                    lock.lock().unwrap();
                    assert!(!inside.swap(true, Ordering::SeqCst));
                    total.fetch_add(1, Ordering::SeqCst);
                    inside.store(false, Ordering::SeqCst);
                    lock.unlock().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 800);
    assert_eq!(lock.ticket_dispenser(), 0);
    assert!(!lock.is_delegate_locked());
}

#[test]
fn test_reentrant_release_only_after_matching_unlocks() {
    let lock = ReentrantTicketLock::new("reentrant", AbortHandle::disabled());
    let depth = 4;
    for _ in 0..depth {
        lock.lock().unwrap();
    }
    assert_eq!(lock.hold_count(), depth);

    let acquired = Arc::new(AtomicBool::new(false));
    let (other, flag) = (lock.clone(), acquired.clone());
    let contender = thread::spawn(move || {
        other.lock().unwrap();
        flag.store(true, Ordering::SeqCst);
        other.unlock().unwrap();
    });

    for remaining in (1..depth).rev() {
        lock.unlock().unwrap();
        assert_eq!(lock.hold_count(), remaining);
        thread::sleep(Duration::from_millis(10));
        assert!(!acquired.load(Ordering::SeqCst));
    }
    lock.unlock().unwrap();
    contender.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
}

#[test]
fn test_mixed_contention_keeps_counters_consistent() {
    let (abort, rx) = AbortHandle::channel();
    let lock = TicketLock::with_policy("mixed", abort, SpinPolicy::yielding());
    let live_inside = Arc::new(AtomicBool::new(false));
    let shadow_inside = Arc::new(AtomicBool::new(false));
    let served = Arc::new(Mutex::new(Vec::new()));
    let rounds = 100;

    let mut handles = Vec::new();
    for _ in 0..3 {
        let (lock, inside) = (lock.clone(), live_inside.clone());
        handles.push(thread::spawn(move || {
            for _ in 0..rounds {
                lock.lock().unwrap();
                assert!(!inside.swap(true, Ordering::SeqCst), "live holders overlap");
                thread::yield_now();
                inside.store(false, Ordering::SeqCst);
                lock.unlock().unwrap();
            }
        }));
    }
    for _ in 0..3 {
        let (lock, inside, served) = (lock.clone(), shadow_inside.clone(), served.clone());
        handles.push(thread::spawn(move || {
            let _scope = with_mode(dry_run());
            for _ in 0..rounds {
                lock.lock().unwrap();
                assert!(!inside.swap(true, Ordering::SeqCst), "shadow holders overlap");
                served.lock().unwrap().push(lock.next_serve_id());
                inside.store(false, Ordering::SeqCst);
                lock.unlock().unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Shadow holders are served strictly in ticket order.
    let served = served.lock().unwrap();
    let expected: Vec<u64> = (0..(3 * rounds) as u64).collect();
    assert_eq!(*served, expected);

    assert_eq!(lock.ticket_dispenser(), lock.next_serve_id());
    assert_eq!(lock.next_serve_id(), (3 * rounds) as u64);
    assert!(!lock.is_delegate_locked());

    // Overtaking is allowed to happen under contention, but every report
    // must name the dry-run pilot.
    let reports: Vec<_> = rx.try_iter().collect();
    assert!(reports.len() <= 3 * rounds);
    for report in reports {
        assert_eq!(report.pilot, Some(PilotId(5)));
        assert!(matches!(
            report.reason,
            pilot_sync::AbortReason::OrderingViolation { ref lock } if lock == "mixed"
        ));
    }
}

#[test]
fn test_concurrent_shadow_bursts_between_live_sections_never_abort() {
    let (abort, rx) = AbortHandle::channel();
    let lock = TicketLock::with_policy("bursts", abort, SpinPolicy::yielding());
    let order = Arc::new(Mutex::new(Vec::new()));

    for round in 0..10 {
        let live: Vec<_> = (0..2)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    lock.lock().unwrap();
                    lock.unlock().unwrap();
                })
            })
            .collect();
        for handle in live {
            handle.join().unwrap();
        }

        let shadows: Vec<_> = (0..4)
            .map(|i| {
                let (lock, order) = (lock.clone(), order.clone());
                thread::spawn(move || {
                    let _scope = with_mode(dry_run());
                    lock.lock().unwrap();
                    order.lock().unwrap().push((round, i, lock.next_serve_id()));
                    lock.unlock().unwrap();
                })
            })
            .collect();
        for handle in shadows {
            handle.join().unwrap();
        }
    }

    assert!(rx.try_recv().is_err());
    let order = order.lock().unwrap();
    assert_eq!(order.len(), 40);
    for (position, (_, _, ticket)) in order.iter().enumerate() {
        assert_eq!(*ticket, position as u64);
    }
    assert_eq!(lock.ticket_dispenser(), 40);
    assert_eq!(lock.next_serve_id(), 40);
}
