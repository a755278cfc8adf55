// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution lock hand-off across threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use sojourn_core::execution_lock::{ExecutionLock, ExitOutcome};

const TIMEOUT: Duration = Duration::from_secs(5);

fn wait_for(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_blocking_owner_hands_off_to_async_waiter() {
    let lock = Arc::new(ExecutionLock::new());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    // A: blocking acquisition on this thread.
    let waiter = lock.setup_waiter(false);
    lock.enter(&waiter, TIMEOUT).unwrap();
    assert!(lock.is_locked());

    // C: races try_enter for the whole test.
    let stop = Arc::new(AtomicBool::new(false));
    let steals = Arc::new(AtomicUsize::new(0));
    let racer = {
        let lock = lock.clone();
        let stop = stop.clone();
        let steals = steals.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                if lock.try_enter() {
                    steals.fetch_add(1, Ordering::SeqCst);
                    lock.exit(false);
                }
                std::hint::spin_loop();
            }
        })
    };

    // B: async acquisition on the runtime.
    let a_released = Arc::new(AtomicBool::new(false));
    let b_entered = Arc::new(AtomicBool::new(false));
    let b_release = Arc::new(AtomicBool::new(false));
    let b = {
        let lock = lock.clone();
        let a_released = a_released.clone();
        let b_entered = b_entered.clone();
        let b_release = b_release.clone();
        runtime.spawn(async move {
            let waiter = lock.setup_waiter(false);
            lock.enter_async(&waiter, TIMEOUT).await.unwrap();
            assert!(a_released.load(Ordering::SeqCst), "entered before the owner left");
            b_entered.store(true, Ordering::SeqCst);
            while !b_release.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            lock.exit(false)
        })
    };

    wait_for(|| lock.waiter_count() == 1);
    thread::sleep(Duration::from_millis(20));
    assert!(!b_entered.load(Ordering::SeqCst));

    a_released.store(true, Ordering::SeqCst);
    assert_eq!(lock.exit(false), ExitOutcome::HandedOff);

    wait_for(|| b_entered.load(Ordering::SeqCst));
    thread::sleep(Duration::from_millis(20));
    assert!(lock.is_locked());

    stop.store(true, Ordering::SeqCst);
    racer.join().unwrap();
    assert_eq!(steals.load(Ordering::SeqCst), 0);

    b_release.store(true, Ordering::SeqCst);
    let outcome = runtime.block_on(b).unwrap();
    assert_eq!(outcome, ExitOutcome::Released);
    assert!(!lock.is_locked());
}

#[test]
fn test_blocking_waiter_is_woken_from_another_thread() {
    let lock = Arc::new(ExecutionLock::new());
    assert!(lock.try_enter());

    let waiter = {
        let lock = lock.clone();
        thread::spawn(move || {
            let waiter = lock.setup_waiter(false);
            lock.enter(&waiter, TIMEOUT).unwrap();
            lock.exit(false)
        })
    };

    wait_for(|| lock.waiter_count() == 1);
    assert_eq!(lock.exit(false), ExitOutcome::HandedOff);
    assert_eq!(waiter.join().unwrap(), ExitOutcome::Released);
    assert!(!lock.is_locked());
}
