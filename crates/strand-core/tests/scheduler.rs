//! Integration tests for the task scheduler

use strand_core::{
    after, channel, sleep, spawn, yield_now, BlockReason, Builder, JoinError, Runtime, Select,
    TaskState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Poll `cond` until it holds or two seconds pass
fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn test_many_tasks_across_workers() {
    let rt = Runtime::with_workers(4).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..1000)
        .map(|i| {
            let counter = counter.clone();
            rt.spawn(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                i * 2
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join(), Ok(i * 2));
    }

    rt.wait_idle();
    assert_eq!(counter.load(Ordering::SeqCst), 1000);
    let stats = rt.stats();
    assert_eq!(stats.workers, 4);
    assert_eq!(stats.spawned, 1000);
    assert_eq!(stats.completed, 1000);
    assert_eq!(stats.live, 0);
    assert_eq!(stats.blocked, 0);
}

#[test]
fn test_nested_spawn_from_task() {
    let rt = Runtime::with_workers(2).unwrap();
    let total = rt
        .block_on(async {
            let children: Vec<_> = (1..=10u64).map(|i| spawn(async move { i * i })).collect();
            let mut sum = 0;
            for child in children {
                sum += child.await.unwrap();
            }
            sum
        })
        .unwrap();
    assert_eq!(total, 385);
}

#[test]
fn test_local_work_is_stolen_by_idle_workers() {
    let rt = Runtime::with_workers(4).unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    let counter = done.clone();
    rt.block_on(async move {
        let children: Vec<_> = (0..64)
            .map(|_| {
                let counter = counter.clone();
                spawn(async move {
                    // Keep the worker busy so peers have something to steal
                    let start = Instant::now();
                    while start.elapsed() < Duration::from_millis(2) {
                        std::hint::spin_loop();
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for child in children {
            child.await.unwrap();
        }
    })
    .unwrap();

    assert_eq!(done.load(Ordering::SeqCst), 64);
}

#[test]
fn test_panicking_task_does_not_stop_runtime() {
    let rt = Runtime::with_workers(2).unwrap();

    let failing = rt.spawn(async {
        let v: Vec<u8> = Vec::new();
        v[3]
    });
    assert!(matches!(failing.join(), Err(JoinError::Panicked(_))));

    assert_eq!(rt.block_on(async { "still running" }), Ok("still running"));
    rt.wait_idle();
    assert_eq!(rt.stats().panicked, 1);
}

#[test]
fn test_blocked_task_reports_reason() {
    let rt = Runtime::with_workers(2).unwrap();
    let ch = channel::<u32>(0);

    let rx = ch.clone();
    let handle = rt.spawn(async move { rx.recv().await });
    let id = handle.id();

    assert!(wait_until(|| rt.handle().task_state(id) == Some(TaskState::Blocked)));
    assert_eq!(rt.handle().block_reason(id), Some(BlockReason::Recv(ch.id())));
    assert_eq!(rt.stats().blocked, 1);

    ch.send_blocking(5).unwrap();
    assert_eq!(handle.join(), Ok(Ok(5)));
    rt.wait_idle();
    assert_eq!(rt.stats().blocked, 0);
}

#[test]
fn test_shutdown_abandons_blocked_tasks() {
    let rt = Runtime::with_workers(2).unwrap();
    let ch = channel::<()>(0);

    let rx = ch.clone();
    let blocked = rt.spawn(async move { rx.recv().await });
    let id = blocked.id();
    assert!(wait_until(|| rt.handle().task_state(id) == Some(TaskState::Blocked)));

    rt.shutdown();
    assert_eq!(blocked.join(), Err(JoinError::Abandoned));
    assert_eq!(rt.stats().live, 0);

    // The abandoned receiver left no registration behind
    assert_eq!(ch.try_send(()), Err(strand_core::TrySendError::Full(())));
}

#[test]
fn test_shutdown_on_idle_waits_for_tasks() {
    let rt = Runtime::with_workers(2).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let finished = finished.clone();
        rt.spawn(async move {
            sleep(Duration::from_millis(10)).await;
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    rt.shutdown_on_idle();
    assert_eq!(finished.load(Ordering::SeqCst), 8);
    assert!(rt.is_shutdown());
}

#[test]
fn test_wait_idle_timeout_on_stuck_task() {
    let rt = Runtime::with_workers(1).unwrap();
    let ch = channel::<()>(0);
    let rx = ch.clone();
    rt.spawn(async move {
        let _ = rx.recv().await;
    });

    assert!(!rt.wait_idle_timeout(Duration::from_millis(50)));
    ch.close().unwrap();
    assert!(rt.wait_idle_timeout(Duration::from_secs(2)));
}

#[test]
fn test_yield_lets_other_tasks_run() {
    let rt = Runtime::with_workers(1).unwrap();
    let flag = Arc::new(AtomicUsize::new(0));

    let seen = flag.clone();
    let result = rt.block_on(async move {
        let setter = {
            let flag = seen.clone();
            spawn(async move { flag.store(1, Ordering::SeqCst) })
        };
        // A single worker only runs the setter if we give way
        while seen.load(Ordering::SeqCst) == 0 {
            yield_now().await;
        }
        setter.await
    });
    assert_eq!(result, Ok(Ok(())));
}

#[test]
fn test_sleep_waits_at_least_delay() {
    let rt = Runtime::with_workers(2).unwrap();
    let elapsed = rt
        .block_on(async {
            let start = Instant::now();
            sleep(Duration::from_millis(30)).await;
            start.elapsed()
        })
        .unwrap();
    assert!(elapsed >= Duration::from_millis(30));
}

#[test]
fn test_select_with_timeout() {
    let rt = Runtime::with_workers(2).unwrap();
    let never = channel::<u32>(0);

    let timed_out = rt
        .block_on(async move {
            let timeout = after(Duration::from_millis(20));
            Select::new()
                .recv(&never, |_| false)
                .recv(&timeout, |_| true)
                .wait()
                .await
        })
        .unwrap();
    assert!(timed_out);
}

#[test]
fn test_seeded_runtime_is_reproducible() {
    fn choices(seed: u64) -> Vec<usize> {
        let rt = Builder::new().worker_threads(1).seed(seed).build().unwrap();
        rt.block_on(async {
            let chans: Vec<_> = (0..3).map(|_| channel::<()>(1)).collect();
            let mut picks = Vec::new();
            for _ in 0..50 {
                for ch in &chans {
                    let _ = ch.try_send(());
                }
                let pick = Select::new()
                    .recv(&chans[0], |_| 0)
                    .recv(&chans[1], |_| 1)
                    .recv(&chans[2], |_| 2)
                    .wait()
                    .await;
                picks.push(pick);
            }
            picks
        })
        .unwrap()
    }

    assert_eq!(choices(7), choices(7));
}

#[test]
#[should_panic(expected = "outside of a strand runtime")]
fn test_spawn_outside_runtime_panics() {
    let _ = spawn(async {});
}
