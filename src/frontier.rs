use crate::node::{Node, is_publicly_routable_ip};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Discovered-but-unqueried nodes. Producers never wait: when the queue is
/// full the node is dropped.
pub fn frontier(capacity: usize, public_only: bool) -> (FrontierSender, FrontierReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FrontierSender { tx, public_only }, FrontierReceiver { rx })
}

#[derive(Clone)]
pub struct FrontierSender {
    tx: mpsc::Sender<Node>,
    public_only: bool,
}

impl FrontierSender {
    /// Returns whether the node was queued.
    pub fn push(&self, node: Node) -> bool {
        if node.addr.port() == 0 {
            return false;
        }
        if self.public_only && !is_publicly_routable_ip(node.addr.ip()) {
            return false;
        }
        match self.tx.try_send(node) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!(addr = %node.addr, "crawl: frontier full; dropping node");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn extend(&self, nodes: impl IntoIterator<Item = Node>) -> usize {
        nodes.into_iter().filter(|n| self.push(*n)).count()
    }
}

pub struct FrontierReceiver {
    rx: mpsc::Receiver<Node>,
}

impl FrontierReceiver {
    pub fn try_pop(&mut self) -> Option<Node> {
        self.rx.try_recv().ok()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn node(i: u32, port: u16) -> Node {
        let ip = Ipv4Addr::from(0x0808_0000 + i);
        Node::new(NodeId([i as u8; 20]), SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }

    #[test]
    fn overflow_is_dropped_without_blocking() {
        let (tx, mut rx) = frontier(8, true);
        let accepted = tx.extend((0..100).map(|i| node(i, 6881)));
        assert_eq!(accepted, 8);
        assert_eq!(rx.len(), 8);

        let mut drained = Vec::new();
        while let Some(n) = rx.try_pop() {
            drained.push(n);
        }
        assert_eq!(drained, (0..8).map(|i| node(i, 6881)).collect::<Vec<_>>());
        assert!(rx.is_empty());
        assert!(tx.push(node(200, 6881)));
    }

    #[tokio::test]
    async fn concurrent_producers_never_exceed_capacity() {
        let (tx, rx) = frontier(50, true);
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                tx.extend((0..100).map(|i| node(t * 1000 + i, 6881)))
            }));
        }
        let mut accepted = 0;
        for h in handles {
            accepted += h.await.unwrap();
        }
        assert_eq!(accepted, 50);
        assert_eq!(rx.len(), 50);
    }

    #[test]
    fn filters_unusable_addresses() {
        let (tx, rx) = frontier(8, true);
        assert!(!tx.push(node(1, 0)));
        let local = Node::new(NodeId([1; 20]), "192.168.0.10:6881".parse().unwrap());
        assert!(!tx.push(local));
        assert_eq!(rx.len(), 0);

        let (tx, rx) = frontier(8, false);
        assert!(tx.push(local));
        assert_eq!(rx.len(), 1);
    }
}
