use base64::Engine as _;
use bincode::Options;
use rbit::bencode::{self, Value};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

const TORRENT_RECORD_MAGIC: [u8; 4] = *b"HCR1";

fn bincode_opts() -> impl bincode::Options {
    // Limit prevents huge allocations on corrupted data.
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_limit(16 * 1024 * 1024)
}

fn encode_torrent_record(record: &TorrentRecord) -> anyhow::Result<Vec<u8>> {
    let payload = bincode_opts().serialize(record)?;
    let mut out = Vec::with_capacity(TORRENT_RECORD_MAGIC.len() + payload.len());
    out.extend_from_slice(&TORRENT_RECORD_MAGIC);
    out.extend_from_slice(&payload);
    Ok(out)
}

#[cfg(test)]
fn decode_torrent_record(bytes: &[u8]) -> anyhow::Result<TorrentRecord> {
    let payload = bytes
        .strip_prefix(&TORRENT_RECORD_MAGIC)
        .ok_or_else(|| anyhow::anyhow!("torrent record without magic"))?;
    Ok(bincode_opts().deserialize(payload)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentRecord {
    pub info_hash_hex: String,
    pub name: Option<String>,
    pub total_size: Option<u64>,
    pub info_bencode_base64: String,
    pub resolved_unix_ms: i64,
}

#[cfg(test)]
impl TorrentRecord {
    pub fn info_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(base64::engine::general_purpose::STANDARD.decode(&self.info_bencode_base64)?)
    }
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn key_for_hash(info_hash_hex: &str) -> Vec<u8> {
    let mut key = b"torrent:".to_vec();
    key.extend_from_slice(info_hash_hex.as_bytes());
    key
}

/// Persists a resolved info dictionary, replacing any earlier record.
pub fn save_metadata(
    db: &sled::Db,
    info_hash_hex: &str,
    info_bencode: &[u8],
) -> anyhow::Result<TorrentRecord> {
    let summary = summarize_info(info_bencode);
    let record = TorrentRecord {
        info_hash_hex: info_hash_hex.to_string(),
        name: summary.as_ref().and_then(|s| s.name.clone()),
        total_size: summary.and_then(|s| s.total_size),
        info_bencode_base64: base64::engine::general_purpose::STANDARD.encode(info_bencode),
        resolved_unix_ms: now_unix_ms(),
    };
    db.insert(key_for_hash(info_hash_hex), encode_torrent_record(&record)?)?;
    Ok(record)
}

#[cfg(test)]
pub fn get(db: &sled::Db, info_hash_hex: &str) -> anyhow::Result<Option<TorrentRecord>> {
    let Some(bytes) = db.get(key_for_hash(info_hash_hex))? else {
        return Ok(None);
    };
    Ok(Some(decode_torrent_record(&bytes)?))
}

pub fn contains(db: &sled::Db, info_hash_hex: &str) -> anyhow::Result<bool> {
    Ok(db.contains_key(key_for_hash(info_hash_hex))?)
}

struct InfoSummary {
    name: Option<String>,
    total_size: Option<u64>,
}

fn summarize_info(info_bencode: &[u8]) -> Option<InfoSummary> {
    let v = bencode::decode(info_bencode).ok()?;
    let name = v
        .get(b"name.utf-8")
        .and_then(Value::as_str)
        .or_else(|| v.get(b"name").and_then(Value::as_str))
        .map(str::to_string);

    let total_size = match v.get(b"length").and_then(Value::as_integer) {
        Some(len) => u64::try_from(len).ok(),
        None => v.get(b"files").and_then(Value::as_list).map(|files| {
            files
                .iter()
                .filter_map(|f| f.get(b"length").and_then(Value::as_integer))
                .filter_map(|len| u64::try_from(len).ok())
                .sum()
        }),
    };

    Some(InfoSummary { name, total_size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::temporary_db;

    #[test]
    fn stores_single_file_metadata() {
        let db = temporary_db();
        let info = b"d6:lengthi1024e4:name8:file.iso12:piece lengthi16384e6:pieces0:e";
        let hex = "0123456789abcdef0123456789abcdef01234567";

        assert!(!contains(&db, hex).unwrap());
        let saved = save_metadata(&db, hex, info).unwrap();
        assert_eq!(saved.name.as_deref(), Some("file.iso"));
        assert_eq!(saved.total_size, Some(1024));

        let loaded = get(&db, hex).unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.info_bytes().unwrap(), info.to_vec());
        assert!(contains(&db, hex).unwrap());
    }

    #[test]
    fn sums_multi_file_lengths_and_prefers_utf8_name() {
        let db = temporary_db();
        let info = b"d5:filesld6:lengthi10e4:pathl1:aeed6:lengthi32e4:pathl1:beee4:name3:raw10:name.utf-84:nicee";
        let saved = save_metadata(&db, "ab", info).unwrap();
        assert_eq!(saved.name.as_deref(), Some("nice"));
        assert_eq!(saved.total_size, Some(42));
    }

    #[test]
    fn keeps_undecodable_info_verbatim() {
        let db = temporary_db();
        let saved = save_metadata(&db, "cd", b"not bencode").unwrap();
        assert_eq!(saved.name, None);
        assert_eq!(saved.info_bytes().unwrap(), b"not bencode".to_vec());
        assert!(get(&db, "ef").unwrap().is_none());
    }
}
