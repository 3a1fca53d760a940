//! Bounded pool of known peer addresses.
//!
//! Addresses are deduplicated by `ip:port`, refreshed on every sighting,
//! and sampled uniformly when the dialer wants an outbound candidate.
//! Only routable addresses enter the pool.

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::seq::IteratorRandom;

use crate::constants::MAX_ADDR_POOL;
use crate::net::message::NetAddress;
use crate::serialize::{Decodable, Encodable};

#[derive(Debug, Clone)]
pub struct KnownAddress {
    pub address: NetAddress,
    pub last_seen: u64,
    /// Consecutive failed dial attempts.
    pub failures: u32,
}

#[derive(Debug, Default)]
pub struct AddrManager {
    known: HashMap<String, KnownAddress>,
}

impl AddrManager {
    pub fn new() -> Self {
        AddrManager::default()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Insert or refresh a gossiped address. Unroutable addresses are
    /// ignored; when the pool is full the stalest entry makes room.
    pub fn add(&mut self, address: NetAddress, seen: u64) -> bool {
        if !address.is_routable() {
            return false;
        }
        let key = address.key();
        if let Some(existing) = self.known.get_mut(&key) {
            existing.last_seen = existing.last_seen.max(seen);
            return false;
        }
        if self.known.len() >= MAX_ADDR_POOL {
            if let Some(stalest) = self
                .known
                .iter()
                .min_by_key(|(_, a)| a.last_seen)
                .map(|(k, _)| k.clone())
            {
                self.known.remove(&stalest);
            }
        }
        self.known.insert(key, KnownAddress { address, last_seen: seen, failures: 0 });
        true
    }

    /// Uniformly sample an address to dial, excluding those already
    /// connected.
    pub fn sample<F>(&self, mut exclude: F) -> Option<SocketAddr>
    where
        F: FnMut(&SocketAddr) -> bool,
    {
        let mut rng = rand::thread_rng();
        self.known
            .values()
            .map(|a| a.address.socket_addr())
            .filter(|addr| !exclude(addr))
            .choose(&mut rng)
    }

    pub fn record_failure(&mut self, addr: &SocketAddr) {
        if let Some(known) = self.known.get_mut(&format!("{addr}")) {
            known.failures += 1;
            // Repeated failures age the entry out of sampling priority.
            if known.failures >= 5 {
                self.known.remove(&format!("{addr}"));
            }
        }
    }

    pub fn record_success(&mut self, addr: &SocketAddr, seen: u64) {
        if let Some(known) = self.known.get_mut(&format!("{addr}")) {
            known.failures = 0;
            known.last_seen = seen;
        }
    }

    /// A snapshot for `addr` gossip, newest first, capped at `limit`.
    pub fn snapshot(&self, limit: usize) -> Vec<KnownAddress> {
        let mut addrs: Vec<KnownAddress> = self.known.values().cloned().collect();
        addrs.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        addrs.truncate(limit);
        addrs
    }

    /// Restore the pool from the store's `peer_addr` namespace.
    pub fn load(store: &dyn crate::store::KvStore) -> Self {
        let mut manager = AddrManager::new();
        let Ok(records) = store.scan_prefix(b"peer_addr/") else {
            return manager;
        };
        for (_, value) in records {
            let mut r = crate::serialize::Reader::new(&value);
            let Ok(address) = NetAddress::decode(&mut r) else { continue };
            let Ok(last_seen) = u64::decode(&mut r) else { continue };
            manager.add(address, last_seen);
        }
        manager
    }

    /// Persist the pool under the `peer_addr` namespace.
    pub fn persist(&self, store: &dyn crate::store::KvStore) {
        for known in self.known.values() {
            let mut value = Vec::new();
            known.address.encode(&mut value);
            known.last_seen.encode(&mut value);
            let key = crate::store::keys::peer_addr(&known.address.key());
            if let Err(err) = store.put(&key, &value) {
                tracing::warn!("failed to persist peer address: {err}");
                break;
            }
        }
    }
}
