//! Integration tests for select

use strand_core::{
    after, channel, sleep, BlockReason, JoinError, Runtime, Select, TaskState, TryRecvError,
    TrySendError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

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
fn test_select_fairness_among_ready_cases() {
    const CASES: usize = 4;
    const RUNS: usize = 8000;

    let rt = Runtime::with_workers(2).unwrap();
    let counts = rt
        .block_on(async {
            let chans: Vec<_> = (0..CASES).map(|_| channel::<usize>(1)).collect();
            for (i, ch) in chans.iter().enumerate() {
                ch.try_send(i).unwrap();
            }

            let mut counts = [0usize; CASES];
            for _ in 0..RUNS {
                let mut select = Select::new();
                for ch in &chans {
                    select = select.recv(ch, |r| r.unwrap());
                }
                let picked = select.wait().await;
                counts[picked] += 1;
                // Refill so every case stays ready
                chans[picked].try_send(picked).unwrap();
            }
            counts
        })
        .unwrap();

    let expected = RUNS / CASES;
    for (case, &count) in counts.iter().enumerate() {
        assert!(
            count > expected * 8 / 10 && count < expected * 12 / 10,
            "case {} chosen {} times, expected about {}",
            case,
            count,
            expected
        );
    }
}

#[test]
fn test_blocked_select_completes_exactly_once() {
    let rt = Runtime::with_workers(4).unwrap();

    for _ in 0..50 {
        let a = channel::<u32>(0);
        let b = channel::<u32>(0);

        let (sa, sb) = (a.clone(), b.clone());
        let selector = rt.spawn(async move {
            Select::new()
                .recv(&sa, |r| ("a", r.unwrap()))
                .recv(&sb, |r| ("b", r.unwrap()))
                .wait()
                .await
        });

        // Two peers race to complete different cases
        let (ta, tb) = (a.clone(), b.clone());
        let peer_a = rt.spawn(async move {
            let timeout = after(Duration::from_millis(50));
            Select::new()
                .send(&ta, 1, |r| r.is_ok())
                .recv(&timeout, |_| false)
                .wait()
                .await
        });
        let peer_b = rt.spawn(async move {
            let timeout = after(Duration::from_millis(50));
            Select::new()
                .send(&tb, 2, |r| r.is_ok())
                .recv(&timeout, |_| false)
                .wait()
                .await
        });

        let (which, value) = selector.join().unwrap();
        let delivered_a = peer_a.join().unwrap();
        let delivered_b = peer_b.join().unwrap();

        // Exactly one peer delivered, and it is the one the selector saw
        assert!(delivered_a ^ delivered_b);
        match which {
            "a" => assert!(delivered_a && value == 1),
            _ => assert!(delivered_b && value == 2),
        }
    }
}

#[test]
fn test_send_and_recv_cases_mixed() {
    let rt = Runtime::with_workers(2).unwrap();
    let out = channel::<u32>(0);
    let inbox = channel::<u32>(0);

    let rx = out.clone();
    let consumer = rt.spawn(async move { rx.recv().await.unwrap() });

    let (o, i) = (out.clone(), inbox.clone());
    let picked = rt
        .block_on(async move {
            Select::new()
                .send(&o, 11, |r| {
                    r.unwrap();
                    "sent"
                })
                .recv(&i, |_| "received")
                .wait()
                .await
        })
        .unwrap();

    assert_eq!(picked, "sent");
    assert_eq!(consumer.join(), Ok(11));
    // The losing recv case left nothing queued
    assert_eq!(inbox.try_send(1), Err(TrySendError::Full(1)));
}

#[test]
fn test_losing_send_case_withdraws_its_value() {
    let rt = Runtime::with_workers(2).unwrap();
    let blocked = channel::<String>(0);
    let ready = channel::<()>(0);

    let tx = ready.clone();
    rt.spawn(async move {
        sleep(Duration::from_millis(20)).await;
        tx.send(()).await.unwrap();
    });

    let (b, r) = (blocked.clone(), ready.clone());
    let won_recv = rt
        .block_on(async move {
            Select::new()
                .send(&b, "payload".to_string(), |_| false)
                .recv(&r, |_| true)
                .wait()
                .await
        })
        .unwrap();
    assert!(won_recv);

    // No sender is left queued on the losing channel
    assert_eq!(blocked.try_recv(), Err(TryRecvError::Empty));
}

#[test]
fn test_selects_on_both_ends_of_a_channel() {
    let rt = Runtime::with_workers(4).unwrap();
    let ch = channel::<u64>(0);
    let received = Arc::new(AtomicUsize::new(0));

    let tx = ch.clone();
    let producer = rt.spawn(async move {
        let stop = after(Duration::from_secs(5));
        for v in 0..200 {
            let sent = Select::new()
                .send(&tx, v, |r| r.is_ok())
                .recv(&stop, |_| false)
                .wait()
                .await;
            assert!(sent);
        }
        tx.close().unwrap();
    });

    let (rx, count) = (ch.clone(), received.clone());
    let consumer = rt.spawn(async move {
        let mut expected = 0;
        loop {
            let next = Select::new().recv(&rx, |r| r.ok()).wait().await;
            match next {
                Some(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                    count.fetch_add(1, Ordering::SeqCst);
                }
                None => break,
            }
        }
    });

    producer.join().unwrap();
    consumer.join().unwrap();
    assert_eq!(received.load(Ordering::SeqCst), 200);
}

#[test]
fn test_abandoned_select_unregisters() {
    let rt = Runtime::with_workers(2).unwrap();
    let a = channel::<u8>(0);
    let b = channel::<u8>(0);

    let (ra, rb) = (a.clone(), b.clone());
    let selector = rt.spawn(async move {
        Select::new()
            .recv(&ra, |r| r.ok())
            .recv(&rb, |r| r.ok())
            .wait()
            .await
    });
    let id = selector.id();
    assert!(wait_until(|| rt.handle().task_state(id) == Some(TaskState::Blocked)));
    assert_eq!(
        rt.handle().block_reason(id),
        Some(BlockReason::Select(vec![a.id(), b.id()]))
    );

    rt.shutdown();
    assert_eq!(selector.join(), Err(JoinError::Abandoned));

    // Neither channel still has a receiver queued
    assert_eq!(a.try_send(1), Err(TrySendError::Full(1)));
    assert_eq!(b.try_send(2), Err(TrySendError::Full(2)));
}

#[test]
fn test_default_case_runs_without_blocking() {
    let rt = Runtime::with_workers(1).unwrap();
    let ch = channel::<u32>(0);
    let rx = ch.clone();
    let got = rt
        .block_on(async move {
            Select::new()
                .recv(&rx, |r| r.ok())
                .default_case(|| None)
                .wait()
                .await
        })
        .unwrap();
    assert_eq!(got, None);
    assert_eq!(rt.stats().blocked, 0);
}
