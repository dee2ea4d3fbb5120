//! Concurrency-safe map from account address to the next nonce to use

use dashmap::DashMap;
use ethers::types::Address;
use tracing::trace;

/// Next-nonce cache shared by every submission task and the synchronizer
///
/// Each entry lives in a sharded map; [`NonceCache::allocate`] holds the shard
/// write lock for the whole read-modify-write, so concurrent callers for the
/// same address never observe the same value.
#[derive(Debug, Default)]
pub struct NonceCache {
    nonces: DashMap<Address, u64>,
    /// Value handed out for addresses that were never initialized
    default_nonce: u64,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an address with its placeholder nonce
    pub fn insert(&self, address: Address, nonce: u64) {
        self.nonces.insert(address, nonce);
    }

    /// Return the next nonce for `address` and advance the stored value
    pub fn allocate(&self, address: Address) -> u64 {
        let mut entry = self.nonces.entry(address).or_insert(self.default_nonce);
        let nonce = *entry;
        *entry = nonce + 1;
        trace!("Allocated nonce {} for {:?}", nonce, address);
        nonce
    }

    /// Replace the stored value unconditionally
    pub fn overwrite(&self, address: Address, nonce: u64) {
        self.nonces.insert(address, nonce);
    }

    /// Current stored value without allocating
    pub fn get(&self, address: &Address) -> Option<u64> {
        self.nonces.get(address).map(|n| *n)
    }

    /// Snapshot of the known addresses
    pub fn keys(&self) -> Vec<Address> {
        self.nonces.iter().map(|entry| *entry.key()).collect()
    }
}
