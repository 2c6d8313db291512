//! `strand pipeline`
//!
//! A source, `stages` incrementing stages and a sink, each its own task.

use anyhow::{bail, ensure};
use strand_core::{channel, Channel, Runtime};

pub fn execute(rt: &Runtime, stages: usize, items: u64, capacity: usize) -> anyhow::Result<String> {
    if stages == 0 {
        bail!("pipeline needs at least one stage");
    }

    let links: Vec<Channel<u64>> = (0..=stages).map(|_| channel(capacity)).collect();

    let source = links[0].clone();
    rt.spawn(async move {
        for v in 0..items {
            if source.send(v).await.is_err() {
                return;
            }
        }
        let _ = source.close();
    });

    for pair in links.windows(2) {
        let (input, output) = (pair[0].clone(), pair[1].clone());
        rt.spawn(async move {
            while let Ok(v) = input.recv().await {
                if output.send(v + 1).await.is_err() {
                    break;
                }
            }
            let _ = output.close();
        });
    }

    let sink = links[stages].clone();
    let (count, sum) = rt.block_on(async move {
        let (mut count, mut sum) = (0u64, 0u64);
        while let Ok(v) = sink.recv().await {
            count += 1;
            sum += v;
        }
        (count, sum)
    })?;

    let expected = items * items.saturating_sub(1) / 2 + items * stages as u64;
    ensure!(count == items, "sink saw {} of {} items", count, items);
    ensure!(sum == expected, "sink sum {} does not match {}", sum, expected);
    Ok(format!(
        "pipeline: {} items through {} stages (capacity {})",
        items, stages, capacity
    ))
}
