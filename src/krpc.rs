//! KRPC envelope (BEP-5) on top of rbit's bencode codec.
//!
//! Inbound bytes are decoded into a typed [`Message`] at this boundary; the
//! rest of the crawler never looks at raw dictionaries. Decoding is lenient:
//! only the `y` discriminant is mandatory, every other field may be missing
//! or carry an unexpected type and is then treated as absent.

use crate::error::CrawlError;
use crate::node::NodeId;
use bytes::Bytes;
use rbit::bencode::{self, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};

pub const PING: &str = "ping";
pub const FIND_NODE: &str = "find_node";
pub const GET_PEERS: &str = "get_peers";
pub const ANNOUNCE_PEER: &str = "announce_peer";

type Dict = BTreeMap<Bytes, Value>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub transaction_id: Bytes,
    pub body: Body,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    Query(Query),
    Response(Response),
    Error { code: i64, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Query {
    Ping {
        id: Option<NodeId>,
    },
    FindNode {
        id: Option<NodeId>,
        target: Option<NodeId>,
    },
    GetPeers {
        id: Option<NodeId>,
        info_hash: Option<[u8; 20]>,
    },
    AnnouncePeer {
        id: Option<NodeId>,
        info_hash: Option<[u8; 20]>,
        port: Option<u16>,
        token: Option<Bytes>,
        implied_port: bool,
    },
    /// Query names this crawler does not serve; kept so they can be ignored.
    Other { name: String },
}

impl Query {
    pub fn name(&self) -> &str {
        match self {
            Query::Ping { .. } => PING,
            Query::FindNode { .. } => FIND_NODE,
            Query::GetPeers { .. } => GET_PEERS,
            Query::AnnouncePeer { .. } => ANNOUNCE_PEER,
            Query::Other { name } => name,
        }
    }
}

/// Response values. Responses do not name the query they answer, so every
/// field a supported query can return is optional here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    pub id: Option<NodeId>,
    pub nodes: Option<Bytes>,
    pub token: Option<Bytes>,
    pub values: Option<Vec<Bytes>>,
}

/// Two-byte transaction id from a process-wide wrapping counter.
pub fn next_transaction_id() -> Bytes {
    static TX: AtomicU16 = AtomicU16::new(0);
    let v = TX.fetch_add(1, Ordering::Relaxed);
    Bytes::copy_from_slice(&v.to_be_bytes())
}

impl Message {
    pub fn query(query: Query) -> Self {
        Self {
            transaction_id: next_transaction_id(),
            body: Body::Query(query),
        }
    }

    pub fn find_node(id: NodeId, target: NodeId) -> Self {
        Self::query(Query::FindNode {
            id: Some(id),
            target: Some(target),
        })
    }

    pub fn get_peers(id: NodeId, info_hash: [u8; 20]) -> Self {
        Self::query(Query::GetPeers {
            id: Some(id),
            info_hash: Some(info_hash),
        })
    }

    pub fn response(transaction_id: Bytes, response: Response) -> Self {
        Self {
            transaction_id,
            body: Body::Response(response),
        }
    }

    pub fn error(transaction_id: Bytes, code: i64, message: &str) -> Self {
        Self {
            transaction_id,
            body: Body::Error {
                code,
                message: message.to_string(),
            },
        }
    }

    #[cfg(test)]
    pub fn as_query(&self) -> Option<&Query> {
        match &self.body {
            Body::Query(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match &self.body {
            Body::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CrawlError> {
        let mut dict = Dict::new();
        insert_bytes(&mut dict, b"t", self.transaction_id.clone());

        match &self.body {
            Body::Query(query) => {
                insert_str(&mut dict, b"y", "q");
                insert_str(&mut dict, b"q", query.name());
                dict.insert(key(b"a"), Value::Dict(encode_arguments(query)));
            }
            Body::Response(response) => {
                insert_str(&mut dict, b"y", "r");
                dict.insert(key(b"r"), Value::Dict(encode_return_values(response)));
            }
            Body::Error { code, message } => {
                insert_str(&mut dict, b"y", "e");
                dict.insert(
                    key(b"e"),
                    Value::List(vec![Value::Integer(*code), Value::string(message)]),
                );
            }
        }

        Ok(bencode::encode(&Value::Dict(dict))?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CrawlError> {
        let value = bencode::decode(raw)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| malformed("top level is not a dictionary"))?;

        let transaction_id = dict
            .get(b"t".as_slice())
            .and_then(Value::as_bytes)
            .cloned()
            .unwrap_or_default();

        let kind = dict
            .get(b"y".as_slice())
            .and_then(Value::as_bytes)
            .ok_or_else(|| malformed("missing message type"))?;

        let body = match kind.as_ref() {
            b"q" => Body::Query(decode_query(dict)?),
            b"r" => Body::Response(decode_response(dict)),
            b"e" => decode_error(dict),
            other => {
                return Err(malformed(&format!(
                    "unknown message type {:?}",
                    String::from_utf8_lossy(other)
                )));
            }
        };

        Ok(Self {
            transaction_id,
            body,
        })
    }
}

fn encode_arguments(query: &Query) -> Dict {
    let mut a = Dict::new();
    match query {
        Query::Ping { id } => insert_id(&mut a, b"id", id),
        Query::FindNode { id, target } => {
            insert_id(&mut a, b"id", id);
            insert_id(&mut a, b"target", target);
        }
        Query::GetPeers { id, info_hash } => {
            insert_id(&mut a, b"id", id);
            if let Some(h) = info_hash {
                insert_bytes(&mut a, b"info_hash", Bytes::copy_from_slice(h));
            }
        }
        Query::AnnouncePeer {
            id,
            info_hash,
            port,
            token,
            implied_port,
        } => {
            insert_id(&mut a, b"id", id);
            if let Some(h) = info_hash {
                insert_bytes(&mut a, b"info_hash", Bytes::copy_from_slice(h));
            }
            if let Some(port) = port {
                a.insert(key(b"port"), Value::Integer(i64::from(*port)));
            }
            if let Some(token) = token {
                insert_bytes(&mut a, b"token", token.clone());
            }
            if *implied_port {
                a.insert(key(b"implied_port"), Value::Integer(1));
            }
        }
        Query::Other { .. } => {}
    }
    a
}

fn encode_return_values(response: &Response) -> Dict {
    let mut r = Dict::new();
    insert_id(&mut r, b"id", &response.id);
    if let Some(nodes) = &response.nodes {
        insert_bytes(&mut r, b"nodes", nodes.clone());
    }
    if let Some(token) = &response.token {
        insert_bytes(&mut r, b"token", token.clone());
    }
    if let Some(values) = &response.values {
        r.insert(
            key(b"values"),
            Value::List(values.iter().cloned().map(Value::Bytes).collect()),
        );
    }
    r
}

fn decode_query(dict: &Dict) -> Result<Query, CrawlError> {
    let name = dict
        .get(b"q".as_slice())
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("query without name"))?;

    let empty = Dict::new();
    let a = dict
        .get(b"a".as_slice())
        .and_then(Value::as_dict)
        .unwrap_or(&empty);
    let id = get_id(a, b"id");

    Ok(match name {
        PING => Query::Ping { id },
        FIND_NODE => Query::FindNode {
            id,
            target: get_id(a, b"target"),
        },
        GET_PEERS => Query::GetPeers {
            id,
            info_hash: get_hash(a, b"info_hash"),
        },
        ANNOUNCE_PEER => Query::AnnouncePeer {
            id,
            info_hash: get_hash(a, b"info_hash"),
            port: a
                .get(b"port".as_slice())
                .and_then(Value::as_integer)
                .and_then(|p| u16::try_from(p).ok()),
            token: get_bytes(a, b"token"),
            implied_port: a
                .get(b"implied_port".as_slice())
                .and_then(Value::as_integer)
                .is_some_and(|v| v != 0),
        },
        other => Query::Other {
            name: other.to_string(),
        },
    })
}

fn decode_response(dict: &Dict) -> Response {
    let Some(r) = dict.get(b"r".as_slice()).and_then(Value::as_dict) else {
        return Response::default();
    };
    Response {
        id: get_id(r, b"id"),
        nodes: get_bytes(r, b"nodes"),
        token: get_bytes(r, b"token"),
        values: r.get(b"values".as_slice()).and_then(Value::as_list).map(|list| {
            list.iter().filter_map(Value::as_bytes).cloned().collect()
        }),
    }
}

fn decode_error(dict: &Dict) -> Body {
    let list = dict.get(b"e".as_slice()).and_then(Value::as_list);
    let code = list
        .and_then(|l| l.first())
        .and_then(Value::as_integer)
        .unwrap_or_default();
    let message = list
        .and_then(|l| l.get(1))
        .and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    Body::Error { code, message }
}

fn malformed(reason: &str) -> CrawlError {
    CrawlError::MalformedMessage(reason.to_string())
}

fn key(k: &'static [u8]) -> Bytes {
    Bytes::from_static(k)
}

fn insert_bytes(dict: &mut Dict, k: &'static [u8], v: Bytes) {
    dict.insert(key(k), Value::Bytes(v));
}

fn insert_str(dict: &mut Dict, k: &'static [u8], v: &str) {
    dict.insert(key(k), Value::string(v));
}

fn insert_id(dict: &mut Dict, k: &'static [u8], id: &Option<NodeId>) {
    if let Some(id) = id {
        insert_bytes(dict, k, Bytes::copy_from_slice(id.as_bytes()));
    }
}

fn get_bytes(dict: &Dict, k: &[u8]) -> Option<Bytes> {
    dict.get(k).and_then(Value::as_bytes).cloned()
}

fn get_id(dict: &Dict, k: &[u8]) -> Option<NodeId> {
    dict.get(k)
        .and_then(Value::as_bytes)
        .and_then(|b| NodeId::from_bytes(b))
}

fn get_hash(dict: &Dict, k: &[u8]) -> Option<[u8; 20]> {
    get_id(dict, k).map(|id| id.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &Message) -> Message {
        Message::decode(&msg.encode().unwrap()).unwrap()
    }

    #[test]
    fn queries_survive_encoding() {
        let id = NodeId([1u8; 20]);
        let queries = [
            Query::Ping { id: Some(id) },
            Query::FindNode {
                id: Some(id),
                target: Some(NodeId([2u8; 20])),
            },
            Query::GetPeers {
                id: Some(id),
                info_hash: Some([3u8; 20]),
            },
            Query::AnnouncePeer {
                id: Some(id),
                info_hash: Some([4u8; 20]),
                port: Some(6881),
                token: Some(Bytes::from_static(b"aoeusnth")),
                implied_port: true,
            },
        ];
        for q in queries {
            let msg = Message::query(q);
            assert_eq!(round_trip(&msg), msg);
        }
    }

    #[test]
    fn response_and_error_survive_encoding() {
        let resp = Message::response(
            Bytes::from_static(b"aa"),
            Response {
                id: Some(NodeId([9u8; 20])),
                nodes: Some(Bytes::new()),
                token: Some(Bytes::from_static(b"tok")),
                values: Some(vec![Bytes::from_static(&[1, 2, 3, 4, 0x1a, 0xe1])]),
            },
        );
        assert_eq!(round_trip(&resp), resp);

        let err = Message::error(Bytes::from_static(b"bb"), 203, "Protocol Error");
        assert_eq!(round_trip(&err), err);
    }

    #[test]
    fn encodes_canonical_ping() {
        let msg = Message {
            transaction_id: Bytes::from_static(b"aa"),
            body: Body::Query(Query::Ping {
                id: NodeId::from_bytes(b"abcdefghij0123456789"),
            }),
        };
        assert_eq!(
            msg.encode().unwrap(),
            b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe".to_vec()
        );
    }

    #[test]
    fn decodes_wire_get_peers() {
        let raw = b"d1:ad2:id20:abcdefghij01234567899:info_hash20:mnopqrstuvwxyz123456e1:q9:get_peers1:t2:aa1:y1:qe";
        let msg = Message::decode(raw).unwrap();
        assert_eq!(msg.transaction_id.as_ref(), b"aa");
        assert_eq!(
            msg.as_query(),
            Some(&Query::GetPeers {
                id: NodeId::from_bytes(b"abcdefghij0123456789"),
                info_hash: Some(*b"mnopqrstuvwxyz123456"),
            })
        );
    }

    #[test]
    fn tolerates_missing_and_odd_fields() {
        // No transaction id, no arguments, an extra top-level key.
        let msg = Message::decode(b"d1:q9:find_node1:v4:LT011:y1:qe").unwrap();
        assert!(msg.transaction_id.is_empty());
        assert_eq!(
            msg.as_query(),
            Some(&Query::FindNode {
                id: None,
                target: None
            })
        );

        // info_hash of the wrong length is treated as absent.
        let msg = Message::decode(b"d1:ad9:info_hash3:abce1:q9:get_peers1:t1:x1:y1:qe").unwrap();
        assert_eq!(
            msg.as_query(),
            Some(&Query::GetPeers {
                id: None,
                info_hash: None
            })
        );

        // A response without "r" still decodes.
        let msg = Message::decode(b"d1:t2:xx1:y1:re").unwrap();
        assert_eq!(msg.as_response(), Some(&Response::default()));
    }

    #[test]
    fn unknown_query_names_are_kept() {
        let msg = Message::decode(b"d1:ad2:id20:abcdefghij0123456789e1:q17:sample_infohashes1:t2:aa1:y1:qe").unwrap();
        assert_eq!(
            msg.as_query(),
            Some(&Query::Other {
                name: "sample_infohashes".into()
            })
        );
    }

    #[test]
    fn rejects_structurally_invalid_input() {
        for raw in [
            &b""[..],
            b"garbage",
            b"i42e",
            b"d1:t2:aae",
            b"d1:t2:aa1:y1:ze",
            b"d1:t2:aa1:y1:q",
            b"d1:y1:qe",
        ] {
            assert!(
                matches!(Message::decode(raw), Err(CrawlError::MalformedMessage(_))),
                "{:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn transaction_ids_are_two_bytes_and_distinct() {
        let a = next_transaction_id();
        let b = next_transaction_id();
        assert_eq!(a.len(), 2);
        assert_ne!(a, b);
    }
}
