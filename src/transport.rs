use crate::error::CrawlError;
use crate::handler::Handler;
use crate::krpc::Message;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

// Largest datagram UDP can carry; nothing bigger is ever accepted.
const RECV_BUFFER_SIZE: usize = 65_535;

/// The crawler's single UDP socket, shared by the receive loop, the
/// scheduler and every handling task.
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
}

impl Transport {
    pub async fn bind(addr: &str) -> Result<Self, CrawlError> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| CrawlError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Encodes and writes one datagram. Failures are logged and swallowed.
    pub async fn send(&self, msg: &Message, to: SocketAddr) {
        if let Err(err) = self.try_send(msg, to).await {
            tracing::debug!(%err, "crawl: send failed");
        }
    }

    pub async fn try_send(&self, msg: &Message, to: SocketAddr) -> Result<(), CrawlError> {
        let raw = msg.encode()?;
        self.socket
            .send_to(&raw, to)
            .await
            .map_err(|source| CrawlError::UnreachablePeer { addr: to, source })?;
        Ok(())
    }

    /// Receives forever, spawning one handling task per decoded datagram.
    /// Returns only on a socket error that cannot be retried.
    pub async fn run(&self, handler: Arc<Handler>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(err) if is_transient(&err) => {
                    tracing::trace!(%err, "crawl: recv error");
                    continue;
                }
                Err(err) => return Err(anyhow::Error::new(err).context("udp recv")),
            };
            if n == 0 {
                continue;
            }

            let msg = match Message::decode(&buf[..n]) {
                Ok(m) => m,
                Err(err) => {
                    tracing::debug!(%err, from = %from, len = n, "crawl: dropping datagram");
                    continue;
                }
            };

            let handler = handler.clone();
            tokio::spawn(async move {
                handler.handle(msg, from).await;
            });
        }
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    // ICMP port-unreachable from an earlier send surfaces as a reset on some
    // platforms; a single dead peer must not end the loop.
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
    ) || err.raw_os_error().is_some_and(|code| code == 90 || code == 10040)
}
