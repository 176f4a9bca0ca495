//! Snapshot document for in-flight indexer state.
//!
//! The shard queues are deliberately absent: they are a pure function of
//! the completed entries and get rebuilt on restore.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Serialized indexer state embedded in a node snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotState {
    /// Outstanding-chunk counter at snapshot time.
    pub queued_writes: i64,
    /// In-flight requests keyed by decimal request id.
    pub req_res_map: BTreeMap<String, SnapshotEntry>,
}

/// One in-flight request inside a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub batch_begin_ts: u64,
    pub num_chunks: u32,
    pub next_chunk_index: u32,
    pub is_complete: bool,
    /// The request's own serialized form.
    pub req: String,
    pub prev_req_body: String,
}
