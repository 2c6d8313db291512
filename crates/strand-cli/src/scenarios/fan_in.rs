//! `strand fan-in`
//!
//! One consumer selects over every producer's channel, with an idle
//! timeout as an extra case.

use anyhow::{bail, ensure};
use strand_core::{after, channel, Channel, Runtime, Select};
use std::time::Duration;

enum Event {
    Item(u64),
    Closed(usize),
    Idle,
}

pub fn execute(
    rt: &Runtime,
    producers: usize,
    items: u64,
    idle_timeout_ms: u64,
) -> anyhow::Result<String> {
    if producers == 0 {
        bail!("fan-in needs at least one producer");
    }

    let inputs: Vec<Channel<u64>> = (0..producers).map(|_| channel(0)).collect();
    for (p, input) in inputs.iter().enumerate() {
        let tx = input.clone();
        rt.spawn(async move {
            for i in 0..items {
                if tx.send(p as u64 * items + i).await.is_err() {
                    return;
                }
            }
            let _ = tx.close();
        });
    }

    let idle = Duration::from_millis(idle_timeout_ms);
    let (received, sum, timed_out) = rt.block_on(async move {
        let mut open = inputs;
        let (mut received, mut sum) = (0u64, 0u64);
        while !open.is_empty() {
            let timeout = after(idle);
            let mut select = Select::new().recv(&timeout, |_| Event::Idle);
            for (index, input) in open.iter().enumerate() {
                select = select.recv(input, move |r| match r {
                    Ok(v) => Event::Item(v),
                    Err(_) => Event::Closed(index),
                });
            }
            let event = select.wait().await;
            match event {
                Event::Item(v) => {
                    received += 1;
                    sum += v;
                }
                Event::Closed(index) => {
                    open.swap_remove(index);
                }
                Event::Idle => return (received, sum, true),
            }
        }
        (received, sum, false)
    })?;

    if timed_out {
        bail!("no input for {:?} after {} items", idle, received);
    }
    let total = producers as u64 * items;
    ensure!(received == total, "received {} of {} items", received, total);
    ensure!(
        sum == total * total.saturating_sub(1) / 2,
        "item sum {} is wrong",
        sum
    );
    Ok(format!(
        "fan-in: {} items from {} producers",
        received, producers
    ))
}
