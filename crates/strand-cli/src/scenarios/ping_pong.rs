//! `strand ping-pong`

use anyhow::ensure;
use strand_core::{channel, Runtime};

pub fn execute(rt: &Runtime, rounds: u64) -> anyhow::Result<String> {
    let ping = channel::<u64>(0);
    let pong = channel::<u64>(0);

    let (rx, tx) = (ping.clone(), pong.clone());
    let ponger = rt.spawn(async move {
        while let Ok(v) = rx.recv().await {
            if tx.send(v + 1).await.is_err() {
                break;
            }
        }
    });

    let last = rt.block_on(async move {
        let mut value = 0;
        for _ in 0..rounds {
            ping.send(value).await?;
            value = pong.recv().await?;
        }
        ping.close()?;
        Ok::<_, anyhow::Error>(value)
    })??;
    ponger.join()?;

    ensure!(last == rounds, "expected {} after {} rounds, got {}", rounds, rounds, last);
    Ok(format!("ping-pong: {} round trips", rounds))
}
