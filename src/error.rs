use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// KRPC error code for a query with missing or invalid arguments.
pub const PROTOCOL_ERROR_CODE: i64 = 203;
pub const PROTOCOL_ERROR_MESSAGE: &str = "Protocol Error";

/// Failure conditions of the crawler. Everything except `Bind` is local to a
/// single datagram, seed or resolution and is logged rather than propagated.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("send to {addr} failed: {source}")]
    UnreachablePeer {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("resolve {host} failed: {source}")]
    ResolutionFailure {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata not resolved within {0:?}")]
    MetadataTimeout(Duration),

    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<rbit::bencode::BencodeError> for CrawlError {
    fn from(err: rbit::bencode::BencodeError) -> Self {
        CrawlError::MalformedMessage(err.to_string())
    }
}
