use crate::error::CrawlError;
use crate::frontier::FrontierReceiver;
use crate::krpc::Message;
use crate::node::{NodeId, neighbor_identifier};
use crate::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior, interval, sleep};

/// Seed hosts plus the id this process presents to them.
#[derive(Clone)]
pub struct Bootstrap {
    transport: Transport,
    seeds: Arc<[String]>,
    node_id: NodeId,
}

impl Bootstrap {
    pub fn new(transport: Transport, seeds: Vec<String>, node_id: NodeId) -> Self {
        Self {
            transport,
            seeds: seeds.into(),
            node_id,
        }
    }

    /// Resolves every seed and sends each address a `find_node`. Returns the
    /// number of queries sent.
    pub async fn run(&self) -> usize {
        let mut sent = 0;
        for host in self.seeds.iter() {
            let addrs = match resolve(host).await {
                Ok(addrs) => addrs,
                Err(err) => {
                    tracing::warn!(%err, "crawl: skipping bootstrap seed");
                    continue;
                }
            };
            for addr in addrs {
                let msg = Message::find_node(self.node_id, NodeId::random());
                self.transport.send(&msg, addr).await;
                sent += 1;
            }
        }
        tracing::debug!(seeds = self.seeds.len(), sent, "crawl: bootstrap");
        sent
    }

    /// Bootstraps again on a fixed period so a drained frontier recovers even
    /// while the expansion loop is busy.
    pub async fn run_every(self, period: Duration) {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the expansion loop already covers startup.
        tick.tick().await;
        loop {
            tick.tick().await;
            self.run().await;
        }
    }
}

async fn resolve(host: &str) -> Result<Vec<SocketAddr>, CrawlError> {
    let addrs = tokio::net::lookup_host(host)
        .await
        .map_err(|source| CrawlError::ResolutionFailure {
            host: host.to_string(),
            source,
        })?;
    // The compact node format is IPv4 only, and so is everything we learn.
    Ok(addrs.filter(SocketAddr::is_ipv4).collect())
}

/// Drains the frontier one node at a time, asking each for nodes near a
/// random target while posing as a neighbor of that node.
pub struct Scheduler {
    transport: Transport,
    frontier: FrontierReceiver,
    bootstrap: Bootstrap,
    send_delay: Duration,
    empty_backoff: Duration,
}

impl Scheduler {
    pub fn new(
        transport: Transport,
        frontier: FrontierReceiver,
        bootstrap: Bootstrap,
        send_delay: Duration,
        empty_backoff: Duration,
    ) -> Self {
        Self {
            transport,
            frontier,
            bootstrap,
            send_delay,
            empty_backoff,
        }
    }

    pub async fn run(mut self) {
        loop {
            match self.frontier.try_pop() {
                Some(node) => {
                    let msg = Message::find_node(neighbor_identifier(&node.id), NodeId::random());
                    self.transport.send(&msg, node.addr).await;
                    // Throttle: bounds packet rate and CPU, nothing depends on it.
                    sleep(self.send_delay).await;
                }
                None => {
                    self.bootstrap.run().await;
                    sleep(self.empty_backoff).await;
                }
            }
        }
    }
}
