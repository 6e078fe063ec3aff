use crate::sncl::StreamEpoch;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

/// Content-addressed cache key: a fingerprint of the service id, the
/// normalized query parameters, and the normalized stream epochs. Two
/// requests selecting the same data hash to the same key regardless of
/// parameter or epoch ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(service: &str, params: &[(String, String)], epochs: &[StreamEpoch]) -> Self {
        let mut normalized_params: Vec<&(String, String)> = params.iter().collect();
        normalized_params.sort();
        let mut normalized_epochs: Vec<&StreamEpoch> = epochs.iter().collect();
        normalized_epochs.sort();

        let mut hasher = Sha256::new();
        hasher.update(service.as_bytes());
        hasher.update([0u8]);
        for (k, v) in normalized_params {
            hasher.update(k.as_bytes());
            hasher.update([b'=']);
            hasher.update(v.as_bytes());
            hasher.update([0u8]);
        }
        for se in normalized_epochs {
            hasher.update(se.to_post_line().as_bytes());
            hasher.update([0u8]);
        }
        CacheKey(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Response cache contract: at-most-one entry per key, atomic writes — a
/// partially assembled response never becomes visible to readers.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Bytes>;
    fn set(&self, key: CacheKey, body: Bytes);
}

/// In-process TTL cache. Expired entries are purged lazily on reads and
/// before inserts; when the store is full after purging, the insert is
/// dropped (the cache is best-effort).
pub struct MemoryCache {
    entries: DashMap<String, (Bytes, Instant)>,
    ttl: Duration,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (_, stored)| stored.elapsed() < ttl);
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let entry = self.entries.get(key.as_str())?;
        let (body, stored) = entry.value();
        if stored.elapsed() >= self.ttl {
            drop(entry);
            self.entries.remove(key.as_str());
            return None;
        }
        Some(body.clone())
    }

    fn set(&self, key: CacheKey, body: Bytes) {
        if self.entries.len() >= self.max_entries {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                return;
            }
        }
        self.entries
            .insert(key.as_str().to_string(), (body, Instant::now()));
    }
}

/// Buffer-and-commit adapter between the drain and the cache store.
///
/// Every byte written to the drain is mirrored here; nothing reaches the
/// store until `commit`, so a cancelled or failed request leaves no trace.
pub struct CacheBuffer {
    key: CacheKey,
    buf: BytesMut,
}

impl CacheBuffer {
    pub fn new(key: CacheKey) -> Self {
        Self {
            key,
            buf: BytesMut::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Atomically publish the buffered response.
    pub fn commit(self, store: &dyn CacheStore) {
        store.set(self.key, self.buf.freeze());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sncl::{parse_time, Stream};

    fn epoch(sta: &str) -> StreamEpoch {
        StreamEpoch::new(
            Stream::new("CH", sta, "", "HHZ"),
            Some(parse_time("2019-01-01").unwrap()),
            Some(parse_time("2019-01-05").unwrap()),
        )
        .unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_ignores_parameter_and_epoch_order() {
        let a = CacheKey::new(
            "station",
            &params(&[("level", "station"), ("format", "xml")]),
            &[epoch("HASLI"), epoch("DAVOX")],
        );
        let b = CacheKey::new(
            "station",
            &params(&[("format", "xml"), ("level", "station")]),
            &[epoch("DAVOX"), epoch("HASLI")],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_distinguishes_selection() {
        let a = CacheKey::new("station", &[], &[epoch("HASLI")]);
        let b = CacheKey::new("station", &[], &[epoch("DAVOX")]);
        let c = CacheKey::new("dataselect", &[], &[epoch("HASLI")]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_store_roundtrip() {
        let store = MemoryCache::new(Duration::from_secs(60), 16);
        let key = CacheKey::new("station", &[], &[epoch("HASLI")]);
        assert!(store.get(&key).is_none());

        store.set(key.clone(), Bytes::from_static(b"<FDSNStationXML/>"));
        assert_eq!(
            store.get(&key).unwrap(),
            Bytes::from_static(b"<FDSNStationXML/>")
        );
    }

    #[test]
    fn test_store_expiry() {
        let store = MemoryCache::new(Duration::from_millis(20), 16);
        let key = CacheKey::new("station", &[], &[epoch("HASLI")]);
        store.set(key.clone(), Bytes::from_static(b"body"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn test_buffer_commit_publishes_all_or_nothing() {
        let store = MemoryCache::new(Duration::from_secs(60), 16);
        let key = CacheKey::new("wfcatalog", &[], &[epoch("HASLI")]);

        let mut buf = CacheBuffer::new(key.clone());
        buf.push(b"[{\"a\":1}");
        // Dropped without commit — nothing visible.
        drop(buf);
        assert!(store.get(&key).is_none());

        let mut buf = CacheBuffer::new(key.clone());
        buf.push(b"[{\"a\":1}");
        buf.push(b"]");
        buf.commit(&store);
        assert_eq!(store.get(&key).unwrap(), Bytes::from_static(b"[{\"a\":1}]"));
    }
}
