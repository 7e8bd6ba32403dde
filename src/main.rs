mod bus;
mod config;
mod crawler;
mod error;
mod frontier;
mod handler;
mod krpc;
mod node;
mod resolver;
mod retention;
mod scheduler;
mod storage;
mod transport;
mod worker;

use anyhow::Context;
use bus::Bus;
use config::{Config, Mode};
use crawler::Crawler;
use resolver::{PeerWireResolver, ResolverSettings};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use worker::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = Config::load()?;
    if let Some(arg) = std::env::args().nth(1) {
        config.mode = arg.parse()?;
    }

    std::fs::create_dir_all(&config.data_dir).context("create data dir")?;
    let db = sled::open(config.data_dir.join("sled")).context("open sled db")?;

    let mut services = Services::start(&config, db.clone()).await?;
    tracing::info!(
        mode = ?config.mode,
        crawl = ?services.crawl_addr,
        data_dir = %config.data_dir.display(),
        "hashcrawl: started"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("hashcrawl: shutting down");
        }
        result = services.supervise() => result?,
    }

    services.tasks.abort_all();
    db.flush_async().await.context("flush sled db")?;
    Ok(())
}

/// The long-running tasks selected by `config.mode`.
struct Services {
    tasks: JoinSet<anyhow::Result<()>>,
    crawl_addr: Option<SocketAddr>,
}

impl Services {
    async fn start(config: &Config, db: sled::Db) -> anyhow::Result<Self> {
        let bus = Bus::new(db.clone());
        let mut tasks = JoinSet::new();
        let mut crawl_addr = None;

        if matches!(config.mode, Mode::Crawl | Mode::All) {
            // Without the socket there is nothing to do.
            let crawler = Crawler::bind(config, Arc::new(bus.clone())).await?;
            crawl_addr = crawler.local_addr().ok();
            tasks.spawn(crawler.run());
        }

        if matches!(config.mode, Mode::Worker | Mode::All) {
            let consumer = bus
                .subscribe(&config.bus_topic, &config.bus_group, config.bus_poll())
                .context("subscribe to info-hash topic")?;
            let pool = WorkerPool::new(
                PeerWireResolver::new(ResolverSettings::from_config(config)),
                config.worker_max_concurrent,
                config.worker_deadline(),
                db,
            );
            tasks.spawn(async move {
                pool.run(consumer).await;
                Ok(())
            });

            if config.retention_enabled {
                let (bus, config) = (bus.clone(), config.clone());
                tasks.spawn(async move {
                    retention::run(bus, config).await;
                    Ok(())
                });
            } else {
                tracing::info!("bus: retention disabled via HASHCRAWL_RETENTION");
            }
        }

        Ok(Self { tasks, crawl_addr })
    }

    /// Waits until every task has finished. A task that ends cleanly leaves
    /// the others running; the first failure or panic is returned.
    async fn supervise(&mut self) -> anyhow::Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            joined.context("task panicked")??;
        }
        Ok(())
    }
}
