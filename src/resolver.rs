//! Info-hash to info-dictionary resolution: a bounded DHT `get_peers` lookup
//! followed by a BEP-9 `ut_metadata` fetch from the peers it finds.

use crate::config::Config;
use crate::krpc::Message;
use crate::node::{Node, NodeId, is_publicly_routable_ip, parse_compact_nodes, parse_compact_peer};
use anyhow::Context;
use bytes::Bytes;
use rbit::peer::{
    ExtensionHandshake, ExtensionMessage, METADATA_PIECE_SIZE, Message as PeerMessage,
    MetadataMessage, MetadataMessageType, PeerConnection, PeerId, metadata_piece_size,
};
use sha1::{Digest, Sha1};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, timeout};

const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(6);
const PEER_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(6);
const PIECES_TIMEOUT: Duration = Duration::from_secs(12);
const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

/// Turns an info hash into its bencoded info dictionary. Callers bound each
/// call with their own deadline.
pub trait MetadataResolver: Send + Sync + 'static {
    fn resolve(&self, info_hash: [u8; 20]) -> impl Future<Output = anyhow::Result<Vec<u8>>> + Send;
}

#[derive(Clone, Debug)]
pub struct ResolverSettings {
    pub bootstrap: Vec<String>,
    pub public_only: bool,
    pub query_timeout: Duration,
    pub max_queries: usize,
    pub peers_per_hash: usize,
    pub inflight: usize,
    pub recv_timeout: Duration,
    pub metadata_inflight: usize,
    pub peer_timeout: Duration,
}

impl ResolverSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            bootstrap: cfg.crawl_bootstrap.clone(),
            public_only: cfg.crawl_public_only,
            query_timeout: Duration::from_millis(cfg.resolver_query_timeout_ms),
            max_queries: cfg.resolver_max_queries_per_hash,
            peers_per_hash: cfg.resolver_peers_per_hash,
            inflight: cfg.resolver_inflight,
            recv_timeout: Duration::from_millis(cfg.resolver_recv_timeout_ms),
            metadata_inflight: cfg.resolver_metadata_inflight,
            peer_timeout: Duration::from_secs(cfg.resolver_peer_timeout_secs),
        }
    }
}

pub struct PeerWireResolver {
    settings: ResolverSettings,
}

impl PeerWireResolver {
    pub fn new(settings: ResolverSettings) -> Self {
        Self { settings }
    }
}

impl MetadataResolver for PeerWireResolver {
    async fn resolve(&self, info_hash: [u8; 20]) -> anyhow::Result<Vec<u8>> {
        let hash_hex = hex::encode(info_hash);
        let peers = find_peers(&self.settings, info_hash).await?;
        tracing::debug!(hash = %hash_hex, peers = peers.len(), "worker: dht peers");
        if peers.is_empty() {
            anyhow::bail!("no peers found");
        }

        // Many peers refuse connections or lack ut_metadata; try several at once.
        let peer_timeout = self.settings.peer_timeout;
        let mut join_set = JoinSet::new();
        let mut pending = peers.into_iter();
        for peer in pending.by_ref().take(self.settings.metadata_inflight) {
            spawn_fetch(&mut join_set, peer, info_hash, peer_timeout);
        }

        let mut tried = 0usize;
        let mut last_err: Option<anyhow::Error> = None;
        while let Some(joined) = join_set.join_next().await {
            tried += 1;
            match joined {
                Ok((peer, Ok(Ok(info)))) => {
                    if sha1_matches(&info, &info_hash) {
                        tracing::debug!(hash = %hash_hex, peer = %peer, bytes = info.len(), "worker: got metadata");
                        join_set.abort_all();
                        return Ok(info);
                    }
                    tracing::debug!(hash = %hash_hex, peer = %peer, "worker: metadata hash mismatch");
                    last_err = Some(anyhow::anyhow!("metadata from {peer} does not match info hash"));
                }
                Ok((peer, Ok(Err(err)))) => {
                    tracing::trace!(hash = %hash_hex, peer = %peer, %err, "worker: peer failed");
                    last_err = Some(err);
                }
                Ok((peer, Err(_elapsed))) => {
                    tracing::trace!(hash = %hash_hex, peer = %peer, "worker: peer timed out");
                    last_err = Some(anyhow::anyhow!("metadata fetch from {peer} timed out"));
                }
                Err(err) => last_err = Some(anyhow::anyhow!("metadata task join error: {err}")),
            }

            if let Some(peer) = pending.next() {
                spawn_fetch(&mut join_set, peer, info_hash, peer_timeout);
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("no peer served metadata"))
            .context(format!("metadata unavailable after {tried} peers")))
    }
}

type FetchOutcome = (SocketAddr, Result<anyhow::Result<Vec<u8>>, tokio::time::error::Elapsed>);

fn spawn_fetch(
    join_set: &mut JoinSet<FetchOutcome>,
    peer: SocketAddr,
    info_hash: [u8; 20],
    peer_timeout: Duration,
) {
    join_set.spawn(async move {
        let r = timeout(peer_timeout, fetch_ut_metadata(peer, info_hash)).await;
        (peer, r)
    });
}

pub fn sha1_matches(info: &[u8], info_hash: &[u8; 20]) -> bool {
    Sha1::digest(info).as_slice() == info_hash
}

/// Iterative `get_peers` lookup ordered by XOR distance to the info hash.
/// Only responses to transaction ids still in flight are accepted.
pub async fn find_peers(settings: &ResolverSettings, info_hash: [u8; 20]) -> anyhow::Result<Vec<SocketAddr>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.context("bind lookup socket")?;
    let node_id = NodeId::random();

    let mut queue: BinaryHeap<(Reverse<[u8; 20]>, SocketAddr)> = BinaryHeap::new();
    let mut seen_nodes: HashSet<SocketAddr> = HashSet::new();
    for host in &settings.bootstrap {
        match tokio::net::lookup_host(host.as_str()).await {
            Ok(addrs) => {
                // Seeds carry no id; give them top priority.
                for addr in addrs.filter(SocketAddr::is_ipv4) {
                    if seen_nodes.insert(addr) {
                        queue.push((Reverse([0u8; 20]), addr));
                    }
                }
            }
            Err(err) => tracing::debug!(%err, host = %host, "worker: bootstrap resolve failed"),
        }
    }
    if queue.is_empty() {
        anyhow::bail!("no DHT bootstrap nodes resolved");
    }

    let mut peers: Vec<SocketAddr> = Vec::new();
    let mut seen_peers: HashSet<SocketAddr> = HashSet::new();
    let mut inflight: HashMap<Bytes, Instant> = HashMap::new();
    let mut queries = 0usize;
    let mut buf = vec![0u8; 65_535];

    while peers.len() < settings.peers_per_hash {
        let now = Instant::now();
        inflight.retain(|_, sent_at| now.saturating_duration_since(*sent_at) <= settings.query_timeout);

        while inflight.len() < settings.inflight && queries < settings.max_queries {
            let Some((_, addr)) = queue.pop() else { break };
            let msg = Message::get_peers(node_id, info_hash);
            match msg.encode() {
                Ok(raw) => {
                    if let Err(err) = socket.send_to(&raw, addr).await {
                        tracing::trace!(%err, addr = %addr, "worker: get_peers send failed");
                        continue;
                    }
                }
                Err(err) => {
                    tracing::debug!(%err, "worker: encode get_peers");
                    continue;
                }
            }
            inflight.insert(msg.transaction_id.clone(), Instant::now());
            queries += 1;
        }

        if inflight.is_empty() {
            break;
        }

        let Ok(recv) = timeout(settings.recv_timeout, socket.recv_from(&mut buf)).await else {
            continue;
        };
        let Ok((n, _from)) = recv else {
            continue;
        };
        let Ok(msg) = Message::decode(&buf[..n]) else {
            continue;
        };
        if inflight.remove(&msg.transaction_id).is_none() {
            continue;
        }
        let Some(resp) = msg.as_response() else {
            continue;
        };

        if let Some(nodes) = &resp.nodes {
            for node in parse_compact_nodes(nodes) {
                if usable(settings, node.addr) && seen_nodes.insert(node.addr) {
                    queue.push((Reverse(distance(&node, &info_hash)), node.addr));
                }
            }
        }
        for value in resp.values.iter().flatten() {
            let Some(peer) = parse_compact_peer(value) else {
                continue;
            };
            if usable(settings, peer) && seen_peers.insert(peer) {
                peers.push(peer);
                if peers.len() >= settings.peers_per_hash {
                    break;
                }
            }
        }
    }

    Ok(peers)
}

fn distance(node: &Node, info_hash: &[u8; 20]) -> [u8; 20] {
    node.id.distance(info_hash)
}

fn usable(settings: &ResolverSettings, addr: SocketAddr) -> bool {
    addr.port() != 0 && (!settings.public_only || is_publicly_routable_ip(addr.ip()))
}

async fn fetch_ut_metadata(addr: SocketAddr, info_hash: [u8; 20]) -> anyhow::Result<Vec<u8>> {
    let peer_id = *PeerId::generate().as_bytes();
    let mut conn = timeout(
        PEER_CONNECT_TIMEOUT,
        PeerConnection::connect(addr, info_hash, peer_id),
    )
    .await
    .context("peer connect timed out")??;

    if !conn.supports_extension {
        anyhow::bail!("peer does not support BEP-10");
    }

    let mut hs = ExtensionHandshake::with_extensions(&[("ut_metadata", 1)]);
    hs.client = Some("hashcrawl".to_string());
    let payload = hs.encode()?;
    conn.send(PeerMessage::Extended { id: 0, payload }).await?;

    let (ut_metadata_id, mut total_size) = wait_for_peer_handshake(&mut conn).await?;

    // Without an advertised metadata_size, piece 0 tells us the total.
    if total_size.is_none() {
        request_piece(&mut conn, ut_metadata_id, 0).await?;
        let msg = recv_metadata_msg(&mut conn, ut_metadata_id, PEER_HANDSHAKE_TIMEOUT).await?;
        if msg.msg_type != MetadataMessageType::Data {
            anyhow::bail!("peer did not send metadata data for piece 0");
        }
        total_size = msg.total_size;
    }

    let total_size = total_size.context("missing metadata total_size")? as usize;
    if total_size == 0 || total_size > MAX_METADATA_SIZE {
        anyhow::bail!("implausible metadata size {total_size}");
    }
    let piece_count = total_size.div_ceil(METADATA_PIECE_SIZE);

    for piece in 0..piece_count {
        request_piece(&mut conn, ut_metadata_id, piece as u32).await?;
    }

    let mut pieces: Vec<Option<Bytes>> = vec![None; piece_count];
    let deadline = Instant::now() + PIECES_TIMEOUT;
    while pieces.iter().any(Option::is_none) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            anyhow::bail!("timed out waiting for metadata pieces");
        }
        let msg = recv_metadata_msg(&mut conn, ut_metadata_id, remaining).await?;
        if msg.msg_type == MetadataMessageType::Reject {
            anyhow::bail!("peer rejected metadata piece {}", msg.piece);
        }
        if msg.msg_type != MetadataMessageType::Data {
            continue;
        }
        let Some(data) = msg.data else {
            continue;
        };
        if let Some(slot) = pieces.get_mut(msg.piece as usize) {
            *slot = Some(data);
        }
    }

    let mut out = vec![0u8; total_size];
    for (piece, maybe_data) in pieces.into_iter().enumerate() {
        let data = maybe_data.context("missing piece data")?;
        let expected = metadata_piece_size(piece as u32, total_size);
        let offset = piece * METADATA_PIECE_SIZE;
        let to_copy = expected
            .min(data.len())
            .min(out.len().saturating_sub(offset));
        out[offset..offset + to_copy].copy_from_slice(&data[..to_copy]);
    }

    Ok(out)
}

async fn wait_for_peer_handshake(conn: &mut PeerConnection) -> anyhow::Result<(u8, Option<u32>)> {
    let deadline = Instant::now() + PEER_HANDSHAKE_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            anyhow::bail!("timed out waiting for extension handshake");
        }
        let msg = timeout(remaining, conn.receive()).await??;
        let PeerMessage::Extended { id, payload } = msg else {
            continue;
        };
        let ExtensionMessage::Handshake(peer_hs) = ExtensionMessage::decode(id, payload.as_ref())? else {
            continue;
        };

        let Some(ut_id) = peer_hs.get_extension_id("ut_metadata") else {
            anyhow::bail!("peer did not advertise ut_metadata");
        };
        let total = peer_hs.metadata_size.and_then(|v| u32::try_from(v).ok());
        return Ok((ut_id, total));
    }
}

async fn request_piece(conn: &mut PeerConnection, ut_metadata_id: u8, piece: u32) -> anyhow::Result<()> {
    let payload = MetadataMessage::request(piece).encode()?;
    conn.send(PeerMessage::Extended {
        id: ut_metadata_id,
        payload,
    })
    .await?;
    Ok(())
}

async fn recv_metadata_msg(
    conn: &mut PeerConnection,
    ut_metadata_id: u8,
    timeout_dur: Duration,
) -> anyhow::Result<MetadataMessage> {
    // Peers interleave bitfield/have/choke traffic with ut_metadata replies.
    let deadline = Instant::now() + timeout_dur;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            anyhow::bail!("timed out waiting for ut_metadata message");
        }
        let msg = timeout(remaining, conn.receive()).await??;
        let PeerMessage::Extended { id, payload } = msg else {
            continue;
        };
        if id != ut_metadata_id {
            continue;
        }
        return Ok(MetadataMessage::decode(payload.as_ref())?);
    }
}
