//! Collection-sharded application of buffered write requests.
//!
//! The indexer sits between the replicated-log write thread and the
//! collection-mutating route handlers:
//! - `enqueue` persists each incoming chunk and, on the terminal chunk,
//!   hands the request to the shard owning its collection.
//! - One worker thread per shard drains its queue in FIFO order, feeding
//!   buffered chunks through the route handler and deleting them once the
//!   request is fully applied.
//! - A GC sweep prunes uploads whose producers went away.
//! - `serialize_state`/`load_state` carry the in-flight table across
//!   snapshots so a restarted node resumes mid-request.
//!
//! Writes to one collection always apply in submission order on one
//! worker; writes to different collections apply in parallel.

use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::IndexerConfig;
use crate::dispatch::{MessageDispatcher, ServerMessage};
use crate::registry::{RecordHandle, RequestRecord, RequestRegistry};
use crate::request::{
    request_handle, response_handle, RequestHandle, ResponseHandle, WriteRequest, WriteResponse,
};
use crate::routes::RouteTable;
use crate::snapshot::{SnapshotEntry, SnapshotState};
use crate::store::{chunk_key, chunk_key_upper_bound, req_prefix_key, ChunkStore};

/// Cadence of the GC thread's quit/interval check.
const GC_TICK: Duration = Duration::from_secs(1);

thread_local! {
    static WRITE_LOG_INDEX: Cell<u64> = const { Cell::new(0) };
}

/// Replicated-log index of the write currently being applied on this
/// thread, published for crash diagnostics.
pub fn current_write_log_index() -> u64 {
    WRITE_LOG_INDEX.with(Cell::get)
}

fn publish_write_log_index(log_index: u64) {
    WRITE_LOG_INDEX.with(|slot| slot.set(log_index));
}

/// A completed request waiting on a shard queue. Carrying the record handle
/// here means the worker never looks the entry up again after hand-off.
struct QueuedRequest {
    req_id: u64,
    record: RecordHandle,
}

/// Durable, collection-sharded write indexer.
pub struct BatchedIndexer {
    store: Arc<dyn ChunkStore>,
    routes: Arc<RouteTable>,
    dispatcher: Arc<dyn MessageDispatcher>,
    config: IndexerConfig,
    registry: RequestRegistry,
    queues: Vec<Mutex<VecDeque<QueuedRequest>>>,
    queued_writes: AtomicI64,
    pause_lock: RwLock<()>,
    quit: AtomicBool,
}

impl BatchedIndexer {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        routes: Arc<RouteTable>,
        dispatcher: Arc<dyn MessageDispatcher>,
        mut config: IndexerConfig,
    ) -> Self {
        config.worker_threads = config.worker_threads.max(1);
        let queues = (0..config.worker_threads)
            .map(|_| Mutex::new(VecDeque::new()))
            .collect();
        Self {
            store,
            routes,
            dispatcher,
            config,
            registry: RequestRegistry::new(),
            queues,
            queued_writes: AtomicI64::new(0),
            pause_lock: RwLock::new(()),
            quit: AtomicBool::new(false),
        }
    }

    /// Persist one chunk of a streamed request and, on the terminal chunk,
    /// queue the request for application on its collection's shard.
    ///
    /// Called by the upstream log thread: at most once per chunk, serially
    /// per request id. The goal is to persist quickly and move on; the
    /// heavy lifting happens on the worker.
    pub fn enqueue(&self, req: RequestHandle, res: ResponseHandle) -> anyhow::Result<()> {
        let (req_id, chunk_value, last_chunk, proceed, collection) = {
            let mut r = req
                .lock()
                .map_err(|_| anyhow::anyhow!("request lock poisoned"))?;
            let chunk_value = r.to_chunk()?;
            // Shard resolution may need the body (collection creation), so
            // resolve before releasing the chunk's memory.
            let collection = r.last_chunk.then(|| self.collection_name(&r));
            let out = (r.start_ts, chunk_value, r.last_chunk, r.live, collection);
            // The durable chunk is the source of truth from here on.
            r.body.clear();
            out
        };

        let (record, chunk_sequence) =
            self.registry
                .get_or_create(req_id, &req, &res, unix_now_secs())?;
        self.store
            .put(&chunk_key(req_id, chunk_sequence), &chunk_value)
            .context("persist request chunk")?;

        if last_chunk {
            self.queued_writes
                .fetch_add(i64::from(chunk_sequence) + 1, Ordering::Relaxed);
            let shard = self.shard_for(collection.as_deref().unwrap_or(""));
            {
                let mut queue = self.queues[shard]
                    .lock()
                    .map_err(|_| anyhow::anyhow!("shard queue lock poisoned"))?;
                queue.push_back(QueuedRequest {
                    req_id,
                    record: Arc::clone(&record),
                });
                // Completion must be visible to whoever pops the entry, so
                // it is set before the shard lock is released.
                let mut rec = record
                    .lock()
                    .map_err(|_| anyhow::anyhow!("request record lock poisoned"))?;
                rec.is_complete = true;
            }

            if req_id == 0 {
                // Chunks from pre-batching producers cannot be grouped
                // reliably; serialize them against every in-flight write.
                while !self.registry.is_empty() && !self.quit.load(Ordering::Relaxed) {
                    thread::sleep(self.config.poll_interval);
                }
            }
        }

        if proceed {
            self.dispatcher
                .send(ServerMessage::RequestProceed { req, res });
        }
        Ok(())
    }

    /// Spawn the worker pool and run the GC loop on the calling thread
    /// until `stop` is called. Joins the workers before returning.
    pub fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        tracing::info!(
            worker_threads = self.config.worker_threads,
            "starting batched indexer"
        );
        let mut workers = Vec::with_capacity(self.config.worker_threads);
        for shard in 0..self.config.worker_threads {
            let indexer = Arc::clone(self);
            let worker = thread::Builder::new()
                .name(format!("indexer-{shard}"))
                .spawn(move || indexer.worker_loop(shard))
                .context("spawn indexer worker thread")?;
            workers.push(worker);
        }

        let mut last_gc_run = Instant::now();
        while !self.quit.load(Ordering::Relaxed) {
            thread::sleep(GC_TICK);
            if last_gc_run.elapsed() > self.config.gc_interval {
                self.run_gc();
                last_gc_run = Instant::now();
            }
        }

        tracing::info!("batched indexer shutting down");
        for worker in workers {
            let _ = worker.join();
        }
        Ok(())
    }

    /// Ask the worker pool and GC loop to exit. In-flight handler calls
    /// complete; progress is preserved in `next_chunk_index`.
    pub fn stop(&self) {
        self.quit.store(true, Ordering::Relaxed);
    }

    /// Outstanding-chunk counter, exposed as an informational backpressure
    /// signal. Not consistent with any single view of the in-flight table.
    pub fn queued_writes(&self) -> i64 {
        self.queued_writes.load(Ordering::Relaxed)
    }

    /// Number of in-flight requests (buffering or awaiting application).
    pub fn in_flight_requests(&self) -> usize {
        self.registry.len()
    }

    /// Coordination point for the snapshot driver: held exclusively while
    /// reading storage and serialized state, shared by workers around each
    /// handler call, so a snapshot sees a moment with no handler running
    /// and counters consistent with persisted chunks.
    pub fn pause_lock(&self) -> &RwLock<()> {
        &self.pause_lock
    }

    /// Serialize the in-flight table and counters for a snapshot. The
    /// caller must hold the pause lock exclusively for the duration.
    pub fn serialize_state(&self) -> anyhow::Result<SnapshotState> {
        let mut req_res_map = BTreeMap::new();
        let mut failure: Option<anyhow::Error> = None;
        self.registry.for_each_locked(|req_id, rec| {
            if failure.is_some() {
                return;
            }
            let serialized = match rec.req.lock() {
                Ok(req) => serde_json::to_string(&*req),
                Err(_) => {
                    failure = Some(anyhow::anyhow!("request lock poisoned"));
                    return;
                }
            };
            match serialized {
                Ok(req) => {
                    req_res_map.insert(
                        req_id.to_string(),
                        SnapshotEntry {
                            batch_begin_ts: rec.batch_begin_ts,
                            num_chunks: rec.num_chunks,
                            next_chunk_index: rec.next_chunk_index,
                            is_complete: rec.is_complete,
                            req,
                            prev_req_body: rec.prev_req_body.clone(),
                        },
                    );
                }
                Err(err) => {
                    failure =
                        Some(anyhow::Error::from(err).context("serialize in-flight request"));
                }
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }
        tracing::info!(
            in_flight = req_res_map.len(),
            "serialized in-flight requests for snapshot"
        );
        Ok(SnapshotState {
            queued_writes: self.queued_writes.load(Ordering::Relaxed),
            req_res_map,
        })
    }

    /// Rebuild the in-flight table from a snapshot. Must run before the
    /// worker pool starts. Completed entries go straight back onto their
    /// shard queues; incomplete ones stay dormant until log replay delivers
    /// their remaining chunks through `enqueue`.
    pub fn load_state(&self, state: &SnapshotState) -> anyhow::Result<()> {
        self.queued_writes
            .store(state.queued_writes, Ordering::Relaxed);

        let mut touched_shards = Vec::new();
        for (key, entry) in &state.req_res_map {
            let req_id: u64 = key
                .parse()
                .with_context(|| format!("bad request id key {key:?} in snapshot"))?;
            let mut req = WriteRequest::default();
            req.load_from_chunk(entry.req.as_bytes())
                .context("restore serialized request")?;
            let collection = entry.is_complete.then(|| self.collection_name(&req));

            let record = Arc::new(Mutex::new(RequestRecord {
                req: request_handle(req),
                res: response_handle(WriteResponse::default()),
                batch_begin_ts: entry.batch_begin_ts,
                num_chunks: entry.num_chunks,
                next_chunk_index: entry.next_chunk_index,
                is_complete: entry.is_complete,
                prev_req_body: entry.prev_req_body.clone(),
            }));
            self.registry.insert_restored(req_id, Arc::clone(&record));

            if let Some(collection) = collection {
                let shard = self.shard_for(&collection);
                if let Ok(mut queue) = self.queues[shard].lock() {
                    queue.push_back(QueuedRequest { req_id, record });
                }
                touched_shards.push(shard);
            }
        }

        // Snapshot iteration order is not submission order; request ids
        // are, so restore each queue to ascending id order.
        for shard in touched_shards {
            if let Ok(mut queue) = self.queues[shard].lock() {
                queue
                    .make_contiguous()
                    .sort_unstable_by_key(|item| item.req_id);
            }
        }

        tracing::info!(
            restored = state.req_res_map.len(),
            "restored in-flight requests from snapshot"
        );
        Ok(())
    }

    /// Resolve the collection a request targets. Collection creation must
    /// land on the same shard as later writes to the new collection, so the
    /// creation route falls back to the `name` field of its body. Requests
    /// with no resolvable collection collapse to one shard.
    fn collection_name(&self, req: &WriteRequest) -> String {
        if let Some(name) = req.param("collection") {
            if !name.is_empty() {
                return name.to_string();
            }
        }
        if let Some(route) = self.routes.get(req.route_hash) {
            if route.creates_collection {
                if let Ok(doc) = serde_json::from_str::<serde_json::Value>(&req.body) {
                    if let Some(name) = doc.get("name").and_then(serde_json::Value::as_str) {
                        return name.to_string();
                    }
                }
            }
        }
        String::new()
    }

    fn shard_for(&self, collection: &str) -> usize {
        (xxh3_64(collection.as_bytes()) % self.queues.len() as u64) as usize
    }

    fn worker_loop(&self, shard: usize) {
        while !self.quit.load(Ordering::Relaxed) {
            let next = match self.queues[shard].lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => None,
            };
            let Some(item) = next else {
                thread::sleep(self.config.poll_interval);
                continue;
            };
            self.apply_request(shard, item);
        }
    }

    /// Drain every persisted chunk of one completed request through its
    /// route handler, then drop the chunks and the in-flight entry.
    fn apply_request(&self, shard: usize, item: QueuedRequest) {
        let QueuedRequest { req_id, record } = item;
        let (req, res, next_chunk_index) = {
            let Ok(rec) = record.lock() else { return };
            (
                Arc::clone(&rec.req),
                Arc::clone(&rec.res),
                rec.next_chunk_index,
            )
        };
        let route_hash = {
            let Ok(r) = req.lock() else { return };
            r.route_hash
        };
        let route = self.routes.get(route_hash);
        let async_res = route.as_ref().map(|rp| rp.async_res).unwrap_or(false);
        let is_live = res.lock().map(|guard| guard.is_alive).unwrap_or(false);

        let prefix = req_prefix_key(req_id);
        let start_key = chunk_key(req_id, next_chunk_index);
        let iter = match self.store.scan_from(&start_key) {
            Ok(iter) => iter,
            Err(err) => {
                // Leave the entry in place; GC clears it if the store
                // never recovers.
                tracing::warn!(error = ?err, req_id, "chunk scan failed");
                return;
            }
        };

        for entry in iter {
            let (key, value) = match entry {
                Ok(kv) => kv,
                Err(err) => {
                    tracing::warn!(error = ?err, req_id, "chunk scan failed mid-request");
                    return;
                }
            };
            if !key.starts_with(&prefix) {
                break;
            }

            // Shared acquisition per chunk: a pending snapshot gets in
            // between chunks without stalling other shards.
            let Ok(_pause) = self.pause_lock.read() else {
                break;
            };

            let mut parsed = true;
            {
                let Ok(mut r) = req.lock() else { break };
                {
                    let Ok(mut rec) = record.lock() else { break };
                    r.body = std::mem::take(&mut rec.prev_req_body);
                }
                if let Err(err) = r.load_from_chunk(&value) {
                    tracing::warn!(error = ?err, req_id, "skipping malformed request chunk");
                    parsed = false;
                }
                publish_write_log_index(r.log_index);

                if parsed {
                    let Ok(mut response) = res.lock() else { break };
                    match &route {
                        Some(rp) => {
                            if let Err(err) = (rp.handler)(&mut r, &mut response) {
                                tracing::warn!(
                                    error = ?err,
                                    req_id,
                                    route = %rp.path,
                                    "write handler failed"
                                );
                            }
                        }
                        None => response.set_404(),
                    }
                }

                // Whatever the handler left unconsumed carries over to the
                // next chunk.
                let Ok(mut rec) = record.lock() else { break };
                rec.prev_req_body = std::mem::take(&mut r.body);
            }

            if parsed && is_live && (route.is_none() || !async_res) {
                // Synchronous requests get a response per applied chunk.
                self.dispatcher.send(ServerMessage::StreamResponse {
                    req: Arc::clone(&req),
                    res: Arc::clone(&res),
                });
            }

            if route.is_none() {
                break;
            }

            self.queued_writes.fetch_sub(1, Ordering::Relaxed);
            if let Ok(mut rec) = record.lock() {
                rec.next_chunk_index += 1;
            }

            if self.quit.load(Ordering::Relaxed) {
                break;
            }
        }

        // The buffered chunks are no longer needed; the in-flight entry
        // goes away only after its chunks do.
        if let Err(err) = self
            .store
            .delete_range(&prefix, &chunk_key_upper_bound(req_id))
        {
            tracing::warn!(error = ?err, req_id, "failed to delete applied chunks");
        }
        self.registry.erase(req_id);
        tracing::debug!(req_id, shard, "drained buffered request");
    }

    fn run_gc(&self) {
        tracing::info!(
            in_flight = self.registry.len(),
            "running gc for abandoned requests"
        );
        let now = unix_now_secs();
        let horizon = self.config.gc_prune_max.as_secs();
        self.registry.prune_expired(now, horizon, |req_id| {
            tracing::info!(req_id, "deleting partial upload");
            let prefix = req_prefix_key(req_id);
            if let Err(err) = self
                .store
                .delete_range(&prefix, &chunk_key_upper_bound(req_id))
            {
                tracing::warn!(error = ?err, req_id, "failed to delete chunks for pruned request");
            }
        });
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
