use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BOOTSTRAP: &[&str] = &[
    "router.utorrent.com:6881",
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "dht.aelitis.com:6881",
    "router.silotis.us:6881",
    "dht.libtorrent.org:25401",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Crawl,
    Worker,
    All,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crawl" | "dht" => Ok(Mode::Crawl),
            "worker" | "client" => Ok(Mode::Worker),
            "all" => Ok(Mode::All),
            other => anyhow::bail!("unknown mode {other:?} (expected crawl, worker or all)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mode: Mode,
    pub data_dir: PathBuf,

    // Crawl
    pub crawl_bind: String,
    pub crawl_bootstrap: Vec<String>,
    pub crawl_frontier_capacity: usize,
    pub crawl_send_delay_ms: u64,
    pub crawl_empty_backoff_ms: u64,
    pub crawl_rebootstrap_every_secs: u64,
    pub crawl_public_only: bool,

    // Bus
    pub bus_topic: String,
    pub bus_group: String,
    pub bus_poll_ms: u64,

    // Worker
    pub worker_max_concurrent: usize,
    pub worker_deadline_secs: u64,

    // Resolver
    pub resolver_query_timeout_ms: u64,
    pub resolver_max_queries_per_hash: usize,
    pub resolver_peers_per_hash: usize,
    pub resolver_inflight: usize,
    pub resolver_recv_timeout_ms: u64,
    pub resolver_metadata_inflight: usize,
    pub resolver_peer_timeout_secs: u64,

    // Retention
    pub retention_enabled: bool,
    pub retention_every_secs: u64,
    pub retention_batch: usize,
    pub retention_max_ms: u64,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    fn from_env() -> anyhow::Result<Self> {
        let mode = env_string("HASHCRAWL_MODE", "all").parse()?;

        Ok(Self {
            mode,
            data_dir: PathBuf::from(env_string("HASHCRAWL_DATA_DIR", "data")),

            crawl_bind: env_string("HASHCRAWL_CRAWL_BIND", "0.0.0.0:11115"),
            crawl_bootstrap: env_csv_strings("HASHCRAWL_CRAWL_BOOTSTRAP", DEFAULT_BOOTSTRAP),
            crawl_frontier_capacity: env_usize("HASHCRAWL_CRAWL_FRONTIER_CAPACITY", 10_000).max(1),
            crawl_send_delay_ms: env_u64("HASHCRAWL_CRAWL_SEND_DELAY_MS", 50),
            crawl_empty_backoff_ms: env_u64("HASHCRAWL_CRAWL_EMPTY_BACKOFF_MS", 1_000),
            crawl_rebootstrap_every_secs: env_u64("HASHCRAWL_CRAWL_REBOOTSTRAP_EVERY_SECS", 10).max(1),
            crawl_public_only: env_enabled("HASHCRAWL_CRAWL_PUBLIC_ONLY", true),

            bus_topic: env_string("HASHCRAWL_BUS_TOPIC", "info-hash"),
            bus_group: env_string("HASHCRAWL_BUS_GROUP", "info-hash"),
            bus_poll_ms: env_u64("HASHCRAWL_BUS_POLL_MS", 500).max(1),

            worker_max_concurrent: env_usize("HASHCRAWL_WORKER_MAX_CONCURRENT", 10).max(1),
            worker_deadline_secs: env_u64("HASHCRAWL_WORKER_DEADLINE_SECS", 4 * 60),

            resolver_query_timeout_ms: env_u64("HASHCRAWL_RESOLVER_QUERY_TIMEOUT_MS", 900),
            resolver_max_queries_per_hash: env_usize("HASHCRAWL_RESOLVER_MAX_QUERIES_PER_HASH", 64),
            resolver_peers_per_hash: env_usize("HASHCRAWL_RESOLVER_PEERS_PER_HASH", 64),
            resolver_inflight: env_usize("HASHCRAWL_RESOLVER_INFLIGHT", 8).max(1),
            resolver_recv_timeout_ms: env_u64("HASHCRAWL_RESOLVER_RECV_TIMEOUT_MS", 250),
            resolver_metadata_inflight: env_usize("HASHCRAWL_RESOLVER_METADATA_INFLIGHT", 8).max(1),
            resolver_peer_timeout_secs: env_u64("HASHCRAWL_RESOLVER_PEER_TIMEOUT_SECS", 16),

            retention_enabled: env_enabled("HASHCRAWL_RETENTION", true),
            retention_every_secs: env_u64("HASHCRAWL_RETENTION_EVERY_SECS", 60).max(1),
            retention_batch: env_usize("HASHCRAWL_RETENTION_BATCH", 5_000),
            retention_max_ms: env_u64("HASHCRAWL_RETENTION_MAX_MS", 25),
        })
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.crawl_send_delay_ms)
    }

    pub fn empty_backoff(&self) -> Duration {
        Duration::from_millis(self.crawl_empty_backoff_ms)
    }

    pub fn rebootstrap_every(&self) -> Duration {
        Duration::from_secs(self.crawl_rebootstrap_every_secs)
    }

    pub fn bus_poll(&self) -> Duration {
        Duration::from_millis(self.bus_poll_ms)
    }

    pub fn worker_deadline(&self) -> Duration {
        Duration::from_secs(self.worker_deadline_secs)
    }
}

#[cfg(test)]
impl Config {
    /// Defaults without consulting the environment, for loopback tests.
    pub fn for_tests() -> Self {
        Self {
            mode: Mode::All,
            data_dir: PathBuf::from("data"),
            crawl_bind: "127.0.0.1:0".to_string(),
            crawl_bootstrap: Vec::new(),
            crawl_frontier_capacity: 64,
            crawl_send_delay_ms: 5,
            crawl_empty_backoff_ms: 50,
            crawl_rebootstrap_every_secs: 3_600,
            crawl_public_only: false,
            bus_topic: "info-hash".to_string(),
            bus_group: "info-hash".to_string(),
            bus_poll_ms: 10,
            worker_max_concurrent: 10,
            worker_deadline_secs: 240,
            resolver_query_timeout_ms: 900,
            resolver_max_queries_per_hash: 64,
            resolver_peers_per_hash: 64,
            resolver_inflight: 8,
            resolver_recv_timeout_ms: 250,
            resolver_metadata_inflight: 8,
            resolver_peer_timeout_secs: 16,
            retention_enabled: true,
            retention_every_secs: 60,
            retention_batch: 5_000,
            retention_max_ms: 25,
        }
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_opt_string(name).unwrap_or_else(|| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_csv_strings(name: &str, defaults: &[&str]) -> Vec<String> {
    if let Some(s) = env_opt_string(name) {
        let v: Vec<String> = s
            .split(',')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect();
        if !v.is_empty() {
            return v;
        }
    }
    defaults.iter().map(|s| s.to_string()).collect()
}

fn env_enabled(name: &str, default: bool) -> bool {
    match env_opt_string(name) {
        None => default,
        Some(v) => {
            let v = v.to_ascii_lowercase();
            if matches!(v.as_str(), "0" | "false" | "off" | "no") {
                return false;
            }
            if matches!(v.as_str(), "1" | "true" | "on" | "yes") {
                return true;
            }
            default
        }
    }
}
