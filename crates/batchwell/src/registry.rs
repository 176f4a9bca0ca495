//! In-memory table of in-flight requests.
//!
//! Every streamed request gets one record on its first chunk. The record is
//! shared between the enqueue path (which appends chunks and marks
//! completion) and, once complete, the worker that drains it. Records ride
//! the shard queues as `Arc` handles, so a worker never has to look a
//! completed entry up again; whatever happens to the table afterwards (GC
//! included), the handle it popped stays valid.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::request::{RequestHandle, ResponseHandle};

/// Bookkeeping for one in-flight request.
pub struct RequestRecord {
    pub req: RequestHandle,
    pub res: ResponseHandle,
    /// Unix seconds when the first chunk arrived; consulted only by GC.
    pub batch_begin_ts: u64,
    /// Chunks enqueued so far.
    pub num_chunks: u32,
    /// Smallest chunk sequence not yet applied; advances under the owning
    /// worker and survives snapshots so a restart can resume mid-request.
    pub next_chunk_index: u32,
    /// Set once the terminal chunk has been enqueued.
    pub is_complete: bool,
    /// Unconsumed body suffix left by the previous chunk's handler call.
    pub prev_req_body: String,
}

/// Shared handle to one record.
pub type RecordHandle = Arc<Mutex<RequestRecord>>;

/// Table of in-flight requests keyed by request id.
pub struct RequestRegistry {
    inner: Mutex<HashMap<u64, RecordHandle>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the record for `req_id`, creating it on the first chunk.
    /// Returns the record and the sequence number assigned to this chunk.
    pub fn get_or_create(
        &self,
        req_id: u64,
        req: &RequestHandle,
        res: &ResponseHandle,
        now_secs: u64,
    ) -> anyhow::Result<(RecordHandle, u32)> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("request registry lock poisoned"))?;
        if let Some(record) = guard.get(&req_id) {
            let mut rec = record
                .lock()
                .map_err(|_| anyhow::anyhow!("request record lock poisoned"))?;
            let sequence = rec.num_chunks;
            rec.num_chunks += 1;
            drop(rec);
            return Ok((Arc::clone(record), sequence));
        }

        let record = Arc::new(Mutex::new(RequestRecord {
            req: Arc::clone(req),
            res: Arc::clone(res),
            batch_begin_ts: now_secs,
            num_chunks: 1,
            next_chunk_index: 0,
            is_complete: false,
            prev_req_body: String::new(),
        }));
        guard.insert(req_id, Arc::clone(&record));
        Ok((record, 0))
    }

    pub fn get(&self, req_id: u64) -> Option<RecordHandle> {
        let guard = self.inner.lock().ok()?;
        guard.get(&req_id).cloned()
    }

    /// Insert a record rebuilt from a snapshot.
    pub fn insert_restored(&self, req_id: u64, record: RecordHandle) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.insert(req_id, record);
        }
    }

    pub fn erase(&self, req_id: u64) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.remove(&req_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map(|guard| guard.is_empty()).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    /// Run `f` over every entry while holding the table lock, giving the
    /// caller one consistent view for snapshot serialization.
    pub fn for_each_locked(&self, mut f: impl FnMut(u64, &RequestRecord)) {
        let Ok(guard) = self.inner.lock() else {
            return;
        };
        for (req_id, record) in guard.iter() {
            if let Ok(rec) = record.lock() {
                f(*req_id, &rec);
            }
        }
    }

    /// Remove every record whose batch started more than `horizon_secs`
    /// before `now_secs`, invoking `on_prune` (still under the table lock)
    /// before each removal so the caller can drop persisted chunks first.
    pub fn prune_expired(
        &self,
        now_secs: u64,
        horizon_secs: u64,
        mut on_prune: impl FnMut(u64),
    ) -> usize {
        let Ok(mut guard) = self.inner.lock() else {
            return 0;
        };
        let expired: Vec<u64> = guard
            .iter()
            .filter_map(|(req_id, record)| {
                let rec = record.lock().ok()?;
                (now_secs.saturating_sub(rec.batch_begin_ts) > horizon_secs).then_some(*req_id)
            })
            .collect();
        for req_id in &expired {
            on_prune(*req_id);
            guard.remove(req_id);
        }
        expired.len()
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}
