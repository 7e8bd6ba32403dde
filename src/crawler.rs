use crate::bus::InfoHashSink;
use crate::config::Config;
use crate::frontier::{FrontierReceiver, frontier};
use crate::handler::Handler;
use crate::node::NodeId;
use crate::scheduler::{Bootstrap, Scheduler};
use crate::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;

/// A bound but not yet running crawler.
pub struct Crawler {
    config: Config,
    transport: Transport,
    handler: Arc<Handler>,
    frontier: FrontierReceiver,
}

impl Crawler {
    /// Binds the UDP socket. Failing here is fatal for the process.
    pub async fn bind(config: &Config, sink: Arc<dyn InfoHashSink>) -> anyhow::Result<Self> {
        let transport = Transport::bind(&config.crawl_bind).await?;
        let (tx, rx) = frontier(config.crawl_frontier_capacity, config.crawl_public_only);
        let handler = Arc::new(Handler::new(
            transport.clone(),
            tx,
            sink,
            config.bus_topic.clone(),
        ));
        Ok(Self {
            config: config.clone(),
            transport,
            handler,
            frontier: rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        if let Ok(addr) = self.local_addr() {
            tracing::info!(bind = %addr, "crawl: listening");
        }

        let bootstrap = Bootstrap::new(
            self.transport.clone(),
            self.config.crawl_bootstrap.clone(),
            NodeId::random(),
        );
        let scheduler = Scheduler::new(
            self.transport.clone(),
            self.frontier,
            bootstrap.clone(),
            self.config.send_delay(),
            self.config.empty_backoff(),
        );

        let expansion = tokio::spawn(scheduler.run());
        let rebootstrap = tokio::spawn(bootstrap.run_every(self.config.rebootstrap_every()));

        let result = self.transport.run(self.handler).await;
        expansion.abort();
        rebootstrap.abort();
        result
    }
}
