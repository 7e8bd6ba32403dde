use crate::bus::Consumer;
use crate::error::CrawlError;
use crate::resolver::MetadataResolver;
use crate::storage;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{Duration, timeout};

const BUS_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Resolves harvested info hashes with at most `max_concurrent` attempts in
/// flight. Waiting for a free slot stalls the dequeue loop, which is what
/// keeps the pool from draining the bus faster than it can resolve.
pub struct WorkerPool<R> {
    resolver: Arc<R>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    deadline: Duration,
    db: sled::Db,
}

impl<R: MetadataResolver> WorkerPool<R> {
    pub fn new(resolver: R, max_concurrent: usize, deadline: Duration, db: sled::Db) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            resolver: Arc::new(resolver),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            deadline,
            db,
        }
    }

    #[cfg(test)]
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub async fn run(&self, consumer: Consumer) {
        tracing::info!(
            max_concurrent = self.max_concurrent,
            deadline_secs = self.deadline.as_secs(),
            "worker: started"
        );

        loop {
            let payload = match consumer.next().await {
                Ok((_, payload)) => payload,
                Err(err) => {
                    tracing::warn!(%err, "worker: bus read failed");
                    tokio::time::sleep(BUS_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let Some(info_hash) = parse_info_hash_hex(&payload) else {
                tracing::debug!(len = payload.len(), "worker: dropping malformed info hash");
                continue;
            };
            let hash_hex = hex::encode(info_hash);

            match storage::contains(&self.db, &hash_hex) {
                Ok(true) => {
                    tracing::trace!(hash = %hash_hex, "worker: already resolved");
                    continue;
                }
                Ok(false) => {}
                Err(err) => tracing::warn!(%err, "worker: storage lookup failed"),
            }

            let permit = match self.slots.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };

            let resolver = self.resolver.clone();
            let db = self.db.clone();
            let deadline = self.deadline;
            tokio::spawn(async move {
                let _permit = permit;
                match resolve_one(resolver.as_ref(), &db, info_hash, deadline).await {
                    Ok(record) => tracing::info!(
                        hash = %record.info_hash_hex,
                        name = record.name.as_deref().unwrap_or(""),
                        size = record.total_size.unwrap_or(0),
                        "worker: resolved"
                    ),
                    Err(err) => tracing::debug!(hash = %hash_hex, %err, "worker: dropped"),
                }
            });
        }
    }
}

async fn resolve_one<R: MetadataResolver>(
    resolver: &R,
    db: &sled::Db,
    info_hash: [u8; 20],
    deadline: Duration,
) -> anyhow::Result<storage::TorrentRecord> {
    let info = timeout(deadline, resolver.resolve(info_hash))
        .await
        .map_err(|_| CrawlError::MetadataTimeout(deadline))??;
    storage::save_metadata(db, &hex::encode(info_hash), &info)
}

fn parse_info_hash_hex(payload: &[u8]) -> Option<[u8; 20]> {
    let mut out = [0u8; 20];
    hex::decode_to_slice(payload.trim_ascii(), &mut out).ok()?;
    Some(out)
}
