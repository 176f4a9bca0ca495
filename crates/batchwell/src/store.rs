//! Durable chunk storage for buffered write requests.
//!
//! This module provides the `ChunkStore` abstraction, two implementations
//! (`FjallChunkStore` on-disk and `MemoryChunkStore` in-memory), and the
//! key codec that lays request chunks out so that a forward scan yields
//! them in sequence order.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions};

/// Reserved key prefix for buffered request chunks. No other subsystem may
/// write keys under it.
pub const REQ_LOG_PREFIX: &[u8] = b"$RL_";

/// Fjall partition holding the buffered request log.
const REQ_LOG_PARTITION: &str = "req_log";

/// Ordered iterator over `(key, value)` pairs starting at a lower bound.
pub type ChunkIter<'a> = Box<dyn Iterator<Item = anyhow::Result<(Vec<u8>, Vec<u8>)>> + 'a>;

/// Sorted key/value storage used to buffer request chunks.
///
/// Implementations must yield keys in lexicographic order from `scan_from`;
/// the chunk key codec below relies on that to recover sequence order.
pub trait ChunkStore: Send + Sync {
    /// Durably persist one chunk.
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    /// Ordered scan beginning at `lower_bound`. The caller stops once the
    /// key no longer carries the per-request prefix.
    fn scan_from(&self, lower_bound: &[u8]) -> anyhow::Result<ChunkIter<'_>>;
    /// Remove every key in `[lo, hi_inclusive]`.
    fn delete_range(&self, lo: &[u8], hi_inclusive: &[u8]) -> anyhow::Result<()>;
}

/// Key prefix shared by every chunk of one request:
/// `REQ_LOG_PREFIX || be64(req_id) || "_"`.
///
/// Big-endian encoding makes the lexicographic key order match numeric
/// request-id order.
pub fn req_prefix_key(req_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(REQ_LOG_PREFIX.len() + 8 + 1);
    key.extend_from_slice(REQ_LOG_PREFIX);
    key.extend_from_slice(&req_id.to_be_bytes());
    key.push(b'_');
    key
}

/// Full key of one chunk: request prefix followed by `be32(chunk_sequence)`.
pub fn chunk_key(req_id: u64, chunk_sequence: u32) -> Vec<u8> {
    let mut key = req_prefix_key(req_id);
    key.extend_from_slice(&chunk_sequence.to_be_bytes());
    key
}

/// Inclusive upper bound covering every possible chunk of `req_id`.
pub fn chunk_key_upper_bound(req_id: u64) -> Vec<u8> {
    chunk_key(req_id, u32::MAX)
}

/// Fjall-backed chunk store over a dedicated partition.
pub struct FjallChunkStore {
    partition: fjall::PartitionHandle,
}

impl FjallChunkStore {
    /// Open the request-log partition inside an existing keyspace.
    pub fn open(keyspace: &Keyspace) -> anyhow::Result<Self> {
        let partition = keyspace
            .open_partition(REQ_LOG_PARTITION, PartitionCreateOptions::default())
            .context("open req log partition")?;
        Ok(Self { partition })
    }
}

impl ChunkStore for FjallChunkStore {
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.partition
            .insert(key, value)
            .context("fjall chunk write failed")
    }

    fn scan_from(&self, lower_bound: &[u8]) -> anyhow::Result<ChunkIter<'_>> {
        let iter = self.partition.range(lower_bound.to_vec()..);
        Ok(Box::new(iter.map(|item| {
            item.map(|(key, value)| (key.to_vec(), value.to_vec()))
                .map_err(|err| anyhow::anyhow!(err).context("fjall chunk scan failed"))
        })))
    }

    fn delete_range(&self, lo: &[u8], hi_inclusive: &[u8]) -> anyhow::Result<()> {
        // fjall has no native range delete; collect the keys first so the
        // removal does not race the iterator.
        let mut keys = Vec::new();
        for item in self.partition.range(lo.to_vec()..=hi_inclusive.to_vec()) {
            let (key, _) = item.context("fjall chunk scan failed")?;
            keys.push(key);
        }
        for key in keys {
            self.partition
                .remove(key)
                .context("fjall chunk delete failed")?;
        }
        Ok(())
    }
}

/// In-memory chunk store used by tests and embedded tooling.
pub struct MemoryChunkStore {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    /// Copy of the full contents, ordered by key.
    pub fn dump(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.inner
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Replace the contents wholesale (restoring a captured `dump`).
    pub fn restore(&self, contents: BTreeMap<Vec<u8>, Vec<u8>>) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = contents;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map(|guard| guard.is_empty()).unwrap_or(true)
    }
}

impl Default for MemoryChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("chunk store lock poisoned"))?;
        guard.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn scan_from(&self, lower_bound: &[u8]) -> anyhow::Result<ChunkIter<'_>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| anyhow::anyhow!("chunk store lock poisoned"))?;
        let items: Vec<(Vec<u8>, Vec<u8>)> = guard
            .range((Bound::Included(lower_bound.to_vec()), Bound::Unbounded))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(Box::new(items.into_iter().map(Ok)))
    }

    fn delete_range(&self, lo: &[u8], hi_inclusive: &[u8]) -> anyhow::Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("chunk store lock poisoned"))?;
        let keys: Vec<Vec<u8>> = guard
            .range((
                Bound::Included(lo.to_vec()),
                Bound::Included(hi_inclusive.to_vec()),
            ))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            guard.remove(&key);
        }
        Ok(())
    }
}
