//! Persistence boundary: a key-value store trait and the typed key layout.
//!
//! The chain and address manager speak to disk only through [`KvStore`].
//! Writes are retried a bounded number of times; a store that keeps
//! failing surfaces [`StoreError::RetriesExhausted`], which the node
//! orchestrator treats as fatal.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::StoreError;
use crate::serialize::{decode_exact, encode_to_vec, Decodable, Encodable};
use crate::types::{Hash, OutPoint};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Attempts made before a failing write is considered fatal.
const WRITE_RETRIES: u32 = 3;

/// Minimal key-value persistence interface.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// All `(key, value)` pairs whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    /// Push buffered writes to durable storage.
    fn flush(&self) -> Result<()>;
}

/// Typed keys of the persisted layout.
pub mod keys {
    use super::*;

    fn tagged(tag: &str, suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(tag.len() + 1 + suffix.len());
        key.extend_from_slice(tag.as_bytes());
        key.push(b'/');
        key.extend_from_slice(suffix);
        key
    }

    pub fn block(hash: &Hash) -> Vec<u8> {
        tagged("block", hash)
    }

    pub fn block_index(hash: &Hash) -> Vec<u8> {
        tagged("block_index", hash)
    }

    pub fn tx_index(hash: &Hash) -> Vec<u8> {
        tagged("tx_index", hash)
    }

    pub fn utxo(outpoint: &OutPoint) -> Vec<u8> {
        tagged("utxo", &encode_to_vec(outpoint))
    }

    pub fn best_hash() -> Vec<u8> {
        b"best_hash".to_vec()
    }

    pub fn participant(pubkey: &[u8]) -> Vec<u8> {
        tagged("participant", pubkey)
    }

    pub fn peer_addr(key: &str) -> Vec<u8> {
        tagged("peer_addr", key.as_bytes())
    }
}

/// Write an encodable value under `key`, retrying transient failures.
pub fn put_record<T: Encodable>(store: &dyn KvStore, key: &[u8], value: &T) -> Result<()> {
    let bytes = encode_to_vec(value);
    let mut last = None;
    for _ in 0..WRITE_RETRIES {
        match store.put(key, &bytes) {
            Ok(()) => return Ok(()),
            Err(err) => last = Some(err),
        }
    }
    tracing::error!("store write failed permanently: {:?}", last);
    Err(StoreError::RetriesExhausted(WRITE_RETRIES))
}

/// Read and decode a value, if present.
pub fn get_record<T: Decodable>(store: &dyn KvStore, key: &[u8]) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(decode_exact(&bytes)?)),
        None => Ok(None),
    }
}

/// In-memory store for tests and throwaway nodes.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("store mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().expect("store mutex").get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.lock().expect("store mutex").insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.lock().expect("store mutex").remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .map
            .lock()
            .expect("store mutex")
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Single-file snapshot store: a hash map flushed to `store.dat` in the
/// data directory. The production deployment swaps in a real key-value
/// database behind the same trait; this keeps a lone node durable.
pub struct FileStore {
    path: std::path::PathBuf,
    map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl FileStore {
    pub fn open(data_dir: &std::path::Path) -> Result<Self> {
        let path = data_dir.join("store.dat");
        let mut map = HashMap::new();
        if let Ok(bytes) = std::fs::read(&path) {
            let mut r = crate::serialize::Reader::new(&bytes);
            while !r.is_empty() {
                let key: Vec<u8> = Decodable::decode(&mut r)?;
                let value: Vec<u8> = Decodable::decode(&mut r)?;
                map.insert(key, value);
            }
        }
        Ok(FileStore { path, map: Mutex::new(map) })
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().expect("store mutex").get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.lock().expect("store mutex").insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.lock().expect("store mutex").remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .map
            .lock()
            .expect("store mutex")
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<()> {
        let mut out = Vec::new();
        for (key, value) in self.map.lock().expect("store mutex").iter() {
            key.encode(&mut out);
            value.encode(&mut out);
        }
        let tmp = self.path.with_extension("dat.tmp");
        std::fs::write(&tmp, &out)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| StoreError::WriteFailed(e.to_string()))
    }
}
