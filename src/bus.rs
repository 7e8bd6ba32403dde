//! Durable topic log on sled.
//!
//! Each topic is a tree `bus:log:<topic>` keyed by big-endian ids from
//! `Db::generate_id`, so iteration order is publish order. Consumer groups keep
//! their last delivered id in `bus:offsets:<topic>`; the offset is advanced
//! with compare-and-swap, which makes delivery at-most-once per group even
//! with several consumers in the same group.

use anyhow::Context;
use std::ops::Bound;
use std::time::Duration;

/// Where harvested info hashes go.
pub trait InfoHashSink: Send + Sync {
    /// Returns the id the sink assigned once it has accepted the message; an
    /// error means it was not delivered.
    fn publish(&self, topic: &str, info_hash_hex: &str) -> anyhow::Result<u64>;
}

#[derive(Clone)]
pub struct Bus {
    db: sled::Db,
}

impl Bus {
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    pub fn log(&self, topic: &str) -> anyhow::Result<sled::Tree> {
        self.db
            .open_tree(format!("bus:log:{topic}"))
            .with_context(|| format!("open log for topic {topic}"))
    }

    pub fn offsets(&self, topic: &str) -> anyhow::Result<sled::Tree> {
        self.db
            .open_tree(format!("bus:offsets:{topic}"))
            .with_context(|| format!("open offsets for topic {topic}"))
    }

    /// Appends a message and returns its id.
    pub fn append(&self, topic: &str, payload: &[u8]) -> anyhow::Result<u64> {
        let id = self.db.generate_id()?;
        self.log(topic)?.insert(id.to_be_bytes(), payload)?;
        Ok(id)
    }

    pub fn subscribe(&self, topic: &str, group: &str, poll_every: Duration) -> anyhow::Result<Consumer> {
        Ok(Consumer {
            log: self.log(topic)?,
            offsets: self.offsets(topic)?,
            group: group.as_bytes().to_vec(),
            poll_every,
        })
    }
}

impl InfoHashSink for Bus {
    fn publish(&self, topic: &str, info_hash_hex: &str) -> anyhow::Result<u64> {
        self.append(topic, info_hash_hex.as_bytes())
    }
}

pub struct Consumer {
    log: sled::Tree,
    offsets: sled::Tree,
    group: Vec<u8>,
    poll_every: Duration,
}

impl Consumer {
    #[cfg(test)]
    pub fn committed(&self) -> anyhow::Result<Option<u64>> {
        Ok(self.offsets.get(&self.group)?.as_deref().and_then(decode_id))
    }

    /// Claims the next undelivered entry for this group, if any.
    pub fn try_next(&self) -> anyhow::Result<Option<(u64, Vec<u8>)>> {
        loop {
            let current = self.offsets.get(&self.group)?;
            let start = match current.as_deref().and_then(decode_id) {
                Some(id) => Bound::Excluded(id.to_be_bytes()),
                None => Bound::Unbounded,
            };
            let Some(item) = self.log.range((start, Bound::Unbounded)).next() else {
                return Ok(None);
            };
            let (key, value) = item?;
            let Some(id) = decode_id(&key) else {
                anyhow::bail!("bus: corrupt log key of {} bytes", key.len());
            };

            let claimed = self
                .offsets
                .compare_and_swap(&self.group, current, Some(&id.to_be_bytes()[..]))?;
            if claimed.is_ok() {
                return Ok(Some((id, value.to_vec())));
            }
            // Another consumer of the group advanced the offset first.
        }
    }

    /// Waits for the next entry, polling while the log is drained.
    pub async fn next(&self) -> anyhow::Result<(u64, Vec<u8>)> {
        loop {
            if let Some(entry) = self.try_next()? {
                return Ok(entry);
            }
            tokio::time::sleep(self.poll_every).await;
        }
    }
}

pub fn decode_id(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

#[cfg(test)]
pub fn temporary_db() -> sled::Db {
    sled::Config::new()
        .temporary(true)
        .open()
        .expect("open temporary sled db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn delivers_in_publish_order() {
        let bus = Bus::new(temporary_db());
        let first = bus.publish("t", "aa").unwrap();
        let second = bus.publish("t", "bb").unwrap();
        assert!(second > first);
        bus.publish("other", "zz").unwrap();

        let c = bus.subscribe("t", "g", Duration::from_millis(5)).unwrap();
        assert_eq!(c.try_next().unwrap().unwrap(), (first, b"aa".to_vec()));
        assert_eq!(c.try_next().unwrap().unwrap(), (second, b"bb".to_vec()));
        assert!(c.try_next().unwrap().is_none());
    }

    #[test]
    fn groups_track_offsets_independently_and_durably() {
        let bus = Bus::new(temporary_db());
        let first = bus.append("t", b"one").unwrap();
        bus.append("t", b"two").unwrap();

        let a = bus.subscribe("t", "a", Duration::from_millis(5)).unwrap();
        assert_eq!(a.try_next().unwrap().unwrap().0, first);
        assert_eq!(a.committed().unwrap(), Some(first));

        // A fresh handle for the same group resumes after the committed offset.
        let a2 = bus.subscribe("t", "a", Duration::from_millis(5)).unwrap();
        assert_eq!(a2.try_next().unwrap().unwrap().1, b"two");

        let b = bus.subscribe("t", "b", Duration::from_millis(5)).unwrap();
        assert_eq!(b.try_next().unwrap().unwrap().1, b"one");
    }

    #[tokio::test]
    async fn next_waits_for_publish() {
        let bus = Bus::new(temporary_db());
        let c = bus.subscribe("t", "g", Duration::from_millis(5)).unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            publisher.publish("t", "late").unwrap();
        });

        let (_, payload) = tokio::time::timeout(Duration::from_secs(2), c.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"late");
    }

    #[test]
    fn consumers_in_one_group_never_share_an_entry() {
        let bus = Bus::new(temporary_db());
        for i in 0..200 {
            bus.publish("t", &format!("{i:040x}")).unwrap();
        }

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let c = bus.subscribe("t", "g", Duration::from_millis(5)).unwrap();
                let seen = seen.clone();
                std::thread::spawn(move || {
                    while let Some((id, _)) = c.try_next().unwrap() {
                        seen.lock().unwrap().push(id);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 200);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 200);
    }
}
