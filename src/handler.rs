use crate::bus::InfoHashSink;
use crate::error::{PROTOCOL_ERROR_CODE, PROTOCOL_ERROR_MESSAGE};
use crate::frontier::FrontierSender;
use crate::krpc::{Body, Message, Query, Response};
use crate::node::{NodeId, TOKEN_LEN, parse_compact_nodes, random_identifier};
use crate::transport::Transport;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// Reacts to one decoded datagram. Every reply carries a throwaway random
/// id and an empty node list: this node keeps no routing table to share.
pub struct Handler {
    transport: Transport,
    frontier: FrontierSender,
    sink: Arc<dyn InfoHashSink>,
    topic: String,
}

impl Handler {
    pub fn new(
        transport: Transport,
        frontier: FrontierSender,
        sink: Arc<dyn InfoHashSink>,
        topic: String,
    ) -> Self {
        Self {
            transport,
            frontier,
            sink,
            topic,
        }
    }

    pub async fn handle(&self, msg: Message, from: SocketAddr) {
        let Message {
            transaction_id: tx,
            body,
        } = msg;
        match body {
            Body::Response(response) => self.on_response(response, from),
            Body::Query(query) => self.on_query(tx, query, from).await,
            Body::Error { code, message } => {
                tracing::trace!(from = %from, code, message = %message, "crawl: peer error");
            }
        }
    }

    fn on_response(&self, response: Response, from: SocketAddr) {
        let Some(nodes) = response.nodes else {
            return;
        };
        let parsed = parse_compact_nodes(&nodes);
        let found = parsed.len();
        let queued = self.frontier.extend(parsed);
        tracing::trace!(from = %from, found, queued, "crawl: nodes");
    }

    async fn on_query(&self, tx: Bytes, query: Query, from: SocketAddr) {
        let reply = match query {
            Query::Ping { .. } => Message::response(tx, Response {
                id: Some(NodeId::random()),
                ..Response::default()
            }),
            Query::FindNode { .. } => Message::response(tx, Response {
                id: Some(NodeId::random()),
                nodes: Some(Bytes::new()),
                ..Response::default()
            }),
            Query::GetPeers { info_hash, .. } => match info_hash {
                Some(info_hash) => {
                    self.harvest(info_hash, "get_peers", from);
                    Message::response(tx, Response {
                        id: Some(NodeId::random()),
                        token: Some(Bytes::from(random_identifier(TOKEN_LEN))),
                        nodes: Some(Bytes::new()),
                        values: None,
                    })
                }
                None => Message::error(tx, PROTOCOL_ERROR_CODE, PROTOCOL_ERROR_MESSAGE),
            },
            // The token is not checked: only the info hash is of interest.
            Query::AnnouncePeer { info_hash, .. } => match info_hash {
                Some(info_hash) => {
                    self.harvest(info_hash, "announce_peer", from);
                    Message::response(tx, Response {
                        id: Some(NodeId::random()),
                        ..Response::default()
                    })
                }
                None => Message::error(tx, PROTOCOL_ERROR_CODE, PROTOCOL_ERROR_MESSAGE),
            },
            Query::Other { name } => {
                tracing::trace!(from = %from, query = %name, "crawl: ignoring query");
                return;
            }
        };

        self.transport.send(&reply, from).await;
    }

    fn harvest(&self, info_hash: [u8; 20], via: &str, from: SocketAddr) {
        let info_hex = hex::encode(info_hash);
        match self.sink.publish(&self.topic, &info_hex) {
            Ok(id) => tracing::info!(hash = %info_hex, id, via, from = %from, "crawl: harvested"),
            Err(err) => tracing::warn!(%err, hash = %info_hex, "crawl: publish failed"),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::frontier::{FrontierReceiver, frontier};
    use crate::node::{Node, encode_compact_nodes};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    #[derive(Default)]
    pub struct RecordingSink {
        pub published: Mutex<Vec<(String, String)>>,
    }

    impl InfoHashSink for RecordingSink {
        fn publish(&self, topic: &str, info_hash_hex: &str) -> anyhow::Result<u64> {
            let mut published = self.published.lock().unwrap();
            published.push((topic.to_string(), info_hash_hex.to_string()));
            Ok(published.len() as u64 - 1)
        }
    }

    struct FailingSink;

    impl InfoHashSink for FailingSink {
        fn publish(&self, _: &str, _: &str) -> anyhow::Result<u64> {
            anyhow::bail!("broker down")
        }
    }

    struct Fixture {
        handler: Handler,
        frontier: FrontierReceiver,
        sink: Arc<RecordingSink>,
        peer: UdpSocket,
    }

    async fn fixture() -> Fixture {
        let transport = Transport::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = frontier(16, false);
        let sink = Arc::new(RecordingSink::default());
        let handler = Handler::new(transport, tx, sink.clone(), "info-hash".into());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Fixture {
            handler,
            frontier: rx,
            sink,
            peer,
        }
    }

    async fn recv(peer: &UdpSocket) -> Message {
        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .expect("reply expected")
            .unwrap();
        Message::decode(&buf[..n]).unwrap()
    }

    async fn assert_silent(peer: &UdpSocket) {
        let mut buf = [0u8; 2048];
        let got = tokio::time::timeout(Duration::from_millis(150), peer.recv_from(&mut buf)).await;
        assert!(got.is_err(), "unexpected reply");
    }

    fn query(tx: &'static [u8], q: Query) -> Message {
        Message {
            transaction_id: Bytes::from_static(tx),
            body: Body::Query(q),
        }
    }

    #[tokio::test]
    async fn answers_ping_once_with_an_id() {
        let f = fixture().await;
        let from = f.peer.local_addr().unwrap();
        f.handler
            .handle(query(b"pp", Query::Ping { id: Some(NodeId([1; 20])) }), from)
            .await;

        let reply = recv(&f.peer).await;
        assert_eq!(reply.transaction_id.as_ref(), b"pp");
        let r = reply.as_response().unwrap();
        assert!(r.id.is_some());
        assert!(r.nodes.is_none());
        assert_silent(&f.peer).await;
    }

    #[tokio::test]
    async fn answers_find_node_with_empty_nodes() {
        let f = fixture().await;
        let from = f.peer.local_addr().unwrap();
        let q = Query::FindNode {
            id: Some(NodeId([1; 20])),
            target: Some(NodeId([2; 20])),
        };
        f.handler.handle(query(b"fn", q), from).await;

        let reply = recv(&f.peer).await;
        assert_eq!(reply.transaction_id.as_ref(), b"fn");
        let r = reply.as_response().unwrap();
        assert!(r.id.is_some());
        assert_eq!(r.nodes.as_deref(), Some(&b""[..]));
        assert_silent(&f.peer).await;
        assert!(f.sink.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_peers_publishes_hash_and_returns_token() {
        let f = fixture().await;
        let from = f.peer.local_addr().unwrap();
        let info_hash = [0xabu8; 20];
        let q = Query::GetPeers {
            id: Some(NodeId([1; 20])),
            info_hash: Some(info_hash),
        };
        f.handler.handle(query(b"gp", q), from).await;

        let reply = recv(&f.peer).await;
        let r = reply.as_response().unwrap();
        assert_eq!(r.token.as_ref().map(|t| t.len()), Some(TOKEN_LEN));
        assert_eq!(r.nodes.as_deref(), Some(&b""[..]));
        assert_eq!(
            *f.sink.published.lock().unwrap(),
            vec![("info-hash".to_string(), hex::encode(info_hash))]
        );
    }

    #[tokio::test]
    async fn announce_peer_publishes_without_checking_token() {
        let f = fixture().await;
        let from = f.peer.local_addr().unwrap();
        let q = Query::AnnouncePeer {
            id: Some(NodeId([1; 20])),
            info_hash: Some([0x11; 20]),
            port: Some(6881),
            token: Some(Bytes::from_static(b"forged")),
            implied_port: false,
        };
        f.handler.handle(query(b"ap", q), from).await;

        let reply = recv(&f.peer).await;
        let r = reply.as_response().unwrap();
        assert!(r.id.is_some());
        assert!(r.token.is_none());
        assert_eq!(f.sink.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_info_hash_gets_protocol_error() {
        let f = fixture().await;
        let from = f.peer.local_addr().unwrap();
        for q in [
            Query::GetPeers { id: None, info_hash: None },
            Query::AnnouncePeer {
                id: None,
                info_hash: None,
                port: None,
                token: None,
                implied_port: true,
            },
        ] {
            f.handler.handle(query(b"ee", q), from).await;
            let reply = recv(&f.peer).await;
            assert_eq!(
                reply.body,
                Body::Error {
                    code: PROTOCOL_ERROR_CODE,
                    message: PROTOCOL_ERROR_MESSAGE.to_string()
                }
            );
        }
        assert!(f.sink.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_queries_and_errors_get_no_reply() {
        let f = fixture().await;
        let from = f.peer.local_addr().unwrap();
        f.handler
            .handle(query(b"uq", Query::Other { name: "vote".into() }), from)
            .await;
        f.handler
            .handle(Message::error(Bytes::from_static(b"er"), 201, "Generic Error"), from)
            .await;
        assert_silent(&f.peer).await;
    }

    #[tokio::test]
    async fn response_nodes_feed_the_frontier() {
        let mut f = fixture().await;
        let nodes = vec![
            Node::new(NodeId([3; 20]), "10.0.0.3:6881".parse().unwrap()),
            Node::new(NodeId([4; 20]), "10.0.0.4:6882".parse().unwrap()),
        ];
        let resp = Message::response(
            Bytes::from_static(b"zz"),
            Response {
                id: Some(NodeId([9; 20])),
                nodes: Some(Bytes::from(encode_compact_nodes(&nodes))),
                ..Response::default()
            },
        );
        f.handler.handle(resp, f.peer.local_addr().unwrap()).await;

        assert_eq!(f.frontier.try_pop(), Some(nodes[0]));
        assert_eq!(f.frontier.try_pop(), Some(nodes[1]));
        assert_eq!(f.frontier.try_pop(), None);

        // A truncated list contributes nothing.
        let mut bad = encode_compact_nodes(&nodes);
        bad.pop();
        let resp = Message::response(
            Bytes::from_static(b"zz"),
            Response {
                nodes: Some(Bytes::from(bad)),
                ..Response::default()
            },
        );
        f.handler.handle(resp, f.peer.local_addr().unwrap()).await;
        assert!(f.frontier.is_empty());
    }

    #[tokio::test]
    async fn sink_failure_still_replies() {
        let transport = Transport::bind("127.0.0.1:0").await.unwrap();
        let (tx, _rx) = frontier(4, false);
        let handler = Handler::new(transport, tx, Arc::new(FailingSink), "info-hash".into());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let q = Query::GetPeers {
            id: None,
            info_hash: Some([7; 20]),
        };
        handler.handle(query(b"gp", q), peer.local_addr().unwrap()).await;
        assert!(recv(&peer).await.as_response().is_some());
    }
}
