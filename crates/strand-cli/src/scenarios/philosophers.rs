//! `strand philosophers`
//!
//! Forks are always taken lowest index first, so the table cannot deadlock.

use anyhow::{bail, ensure};
use strand_core::{yield_now, Mutex, Runtime};
use std::sync::Arc;

pub fn execute(rt: &Runtime, count: usize, meals: u32) -> anyhow::Result<String> {
    if count < 2 {
        bail!("need at least two philosophers, got {}", count);
    }

    let forks: Vec<Arc<Mutex<u64>>> = (0..count).map(|_| Arc::new(Mutex::new(0))).collect();

    let diners: Vec<_> = (0..count)
        .map(|seat| {
            let (left, right) = (seat, (seat + 1) % count);
            let first = forks[left.min(right)].clone();
            let second = forks[left.max(right)].clone();
            rt.spawn(async move {
                for _ in 0..meals {
                    let mut a = first.lock().await;
                    let mut b = second.lock().await;
                    *a += 1;
                    *b += 1;
                    drop(b);
                    drop(a);
                    tracing::trace!(seat, "ate");
                    yield_now().await;
                }
            })
        })
        .collect();

    for diner in diners {
        diner.join()?;
    }

    // Every meal used two forks
    let uses: u64 = forks.iter().map(|f| *f.lock_blocking()).sum();
    ensure!(
        uses == 2 * count as u64 * meals as u64,
        "fork use count {} is inconsistent",
        uses
    );
    Ok(format!("philosophers: {} diners ate {} meals each", count, meals))
}
