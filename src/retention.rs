use crate::bus::{Bus, decode_id};
use crate::config::Config;
use std::time::{Duration, Instant};
use tokio::time::interval;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub groups: usize,
    pub floor: Option<u64>,
    pub deleted: usize,
}

/// Sweeps forever on `retention_every_secs`. Callers decide whether to run
/// it at all from `retention_enabled`.
pub async fn run(bus: Bus, config: Config) {
    let budget = Duration::from_millis(config.retention_max_ms);
    let mut tick = interval(Duration::from_secs(config.retention_every_secs.max(1)));

    loop {
        tick.tick().await;
        match sweep_once(&bus, &config.bus_topic, config.retention_batch, budget).await {
            Ok(sweep) => tracing::debug!(
                topic = %config.bus_topic,
                groups = sweep.groups,
                floor = ?sweep.floor,
                deleted = sweep.deleted,
                budget_ms = config.retention_max_ms,
                "bus: retention sweep"
            ),
            Err(err) => tracing::warn!(%err, "bus: retention sweep failed"),
        }
    }
}

/// Deletes entries every consumer group has already received, oldest first,
/// stopping after `batch` deletions or once `budget` is spent. A topic with
/// no groups keeps everything.
pub async fn sweep_once(bus: &Bus, topic: &str, batch: usize, budget: Duration) -> anyhow::Result<Sweep> {
    let mut sweep = Sweep::default();
    for item in bus.offsets(topic)?.iter() {
        let (_, offset) = item?;
        let Some(id) = decode_id(&offset) else {
            continue;
        };
        sweep.groups += 1;
        sweep.floor = Some(sweep.floor.map_or(id, |floor: u64| floor.min(id)));
    }
    let Some(floor) = sweep.floor else {
        return Ok(sweep);
    };

    let log = bus.log(topic)?;
    let start = Instant::now();
    let mut scanned: usize = 0;

    for item in log.range(..=floor.to_be_bytes()).take(batch) {
        let (key, _) = item?;
        log.remove(&key)?;
        scanned += 1;
        sweep.deleted += 1;

        if scanned % 50 == 0 {
            tokio::task::yield_now().await;
        }
        if start.elapsed() >= budget {
            break;
        }
    }

    Ok(sweep)
}
