//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use batchwell::store::req_prefix_key;
use batchwell::{
    request_handle, response_handle, BatchedIndexer, IndexerConfig, MemoryChunkStore,
    MessageDispatcher, RequestHandle, ResponseHandle, RouteHandler, RouteTable, ServerMessage,
    WriteRequest, WriteResponse,
};

/// Upper bound for any wait in these tests.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Indexer configuration tuned for tests: tight polling, GC effectively off
/// unless a test opts in.
pub fn test_config(worker_threads: usize) -> IndexerConfig {
    IndexerConfig {
        worker_threads,
        gc_interval: Duration::from_secs(3600),
        gc_prune_max: Duration::from_secs(3600),
        poll_interval: Duration::from_millis(1),
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Flattened view of a dispatched server message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recorded {
    Proceed { req_id: u64 },
    Stream { req_id: u64, status_code: u16 },
}

/// Dispatcher that records what the indexer sent to the server.
pub struct RecordingDispatcher {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn stream_events(&self) -> Vec<Recorded> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Recorded::Stream { .. }))
            .collect()
    }
}

impl MessageDispatcher for RecordingDispatcher {
    fn send(&self, message: ServerMessage) {
        let recorded = match message {
            ServerMessage::RequestProceed { req, .. } => Recorded::Proceed {
                req_id: req.lock().unwrap().start_ts,
            },
            ServerMessage::StreamResponse { req, res } => Recorded::Stream {
                req_id: req.lock().unwrap().start_ts,
                status_code: res.lock().unwrap().status_code,
            },
        };
        self.events.lock().unwrap().push(recorded);
    }
}

/// Per-invocation record of the complete documents a handler consumed.
#[derive(Default)]
pub struct DocLog {
    pub invocations: Mutex<Vec<Vec<serde_json::Value>>>,
}

impl DocLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn invocation_docs(&self) -> Vec<Vec<serde_json::Value>> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn total_docs(&self) -> usize {
        self.invocation_docs().iter().map(Vec::len).sum()
    }
}

/// Handler that imports newline-delimited JSON documents, leaving any
/// trailing partial document in the request body for the next chunk.
pub fn import_handler(log: Arc<DocLog>) -> RouteHandler {
    Arc::new(move |req, res| {
        let body = std::mem::take(&mut req.body);
        let mut docs = Vec::new();
        let mut rest = body.as_str();
        while let Some(pos) = rest.find('\n') {
            let line = &rest[..pos];
            rest = &rest[pos + 1..];
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(doc) = serde_json::from_str::<serde_json::Value>(line) {
                docs.push(doc);
            }
        }
        req.body = rest.to_string();
        res.body = format!(r#"{{"imported": {}}}"#, docs.len());
        log.invocations.lock().unwrap().push(docs);
        Ok(())
    })
}

/// Running indexer with an in-memory store and a recording dispatcher.
pub struct TestIndexer {
    pub store: Arc<MemoryChunkStore>,
    pub routes: Arc<RouteTable>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub indexer: Arc<BatchedIndexer>,
    runner: Option<JoinHandle<()>>,
}

impl TestIndexer {
    pub fn start(worker_threads: usize, routes: Arc<RouteTable>) -> Self {
        Self::start_with_config(test_config(worker_threads), routes)
    }

    pub fn start_with_config(config: IndexerConfig, routes: Arc<RouteTable>) -> Self {
        let mut built = Self::build(config, routes);
        built.spawn_runner();
        built
    }

    /// Build without starting workers; `spawn_runner` starts them later.
    pub fn build(config: IndexerConfig, routes: Arc<RouteTable>) -> Self {
        init_tracing();
        let store = Arc::new(MemoryChunkStore::new());
        let dispatcher = RecordingDispatcher::new();
        let indexer = Arc::new(BatchedIndexer::new(
            store.clone(),
            routes.clone(),
            dispatcher.clone(),
            config,
        ));
        Self {
            store,
            routes,
            dispatcher,
            indexer,
            runner: None,
        }
    }

    pub fn spawn_runner(&mut self) {
        assert!(self.runner.is_none(), "indexer already running");
        let indexer = Arc::clone(&self.indexer);
        self.runner = Some(std::thread::spawn(move || {
            indexer.run().expect("indexer run failed");
        }));
    }

    /// Wait until every enqueued request has been fully drained.
    pub fn wait_idle(&self) {
        assert!(
            wait_until(WAIT_TIMEOUT, || self.indexer.in_flight_requests() == 0),
            "indexer did not drain in time"
        );
    }

    pub fn chunks_remaining(&self, req_id: u64) -> usize {
        let prefix = req_prefix_key(req_id);
        self.store
            .dump()
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .count()
    }

    pub fn shutdown(mut self) {
        self.stop_runner();
    }

    fn stop_runner(&mut self) {
        self.indexer.stop();
        if let Some(runner) = self.runner.take() {
            runner.join().expect("indexer thread panicked");
        }
    }
}

impl Drop for TestIndexer {
    fn drop(&mut self) {
        self.indexer.stop();
        if let Some(runner) = self.runner.take() {
            let _ = runner.join();
        }
    }
}

/// Build the shared request/response pair a streaming client would hold
/// across all chunks of one request.
pub fn make_request(
    req_id: u64,
    route: u64,
    collection: Option<&str>,
    live: bool,
) -> (RequestHandle, ResponseHandle) {
    let mut params = HashMap::new();
    if let Some(collection) = collection {
        params.insert("collection".to_string(), collection.to_string());
    }
    let req = WriteRequest {
        start_ts: req_id,
        route_hash: route,
        log_index: req_id,
        params,
        body: String::new(),
        last_chunk: false,
        live,
    };
    let res = WriteResponse {
        is_alive: live,
        ..WriteResponse::default()
    };
    (request_handle(req), response_handle(res))
}

/// Deliver one chunk the way the upstream log thread does: set the body
/// fragment on the shared handle and enqueue.
pub fn push_chunk(
    indexer: &BatchedIndexer,
    req: &RequestHandle,
    res: &ResponseHandle,
    body: &str,
    last: bool,
) {
    {
        let mut r = req.lock().unwrap();
        r.body = body.to_string();
        r.last_chunk = last;
    }
    indexer
        .enqueue(Arc::clone(req), Arc::clone(res))
        .expect("enqueue failed");
}

/// Two collection names that land on different shards for `n_shards`.
pub fn distinct_shard_collections(n_shards: usize) -> (String, String) {
    assert!(n_shards > 1);
    let shard =
        |name: &str| (xxhash_rust::xxh3::xxh3_64(name.as_bytes()) % n_shards as u64) as usize;
    let first = "books".to_string();
    for i in 0..1000 {
        let candidate = format!("coll{i}");
        if shard(&candidate) != shard(&first) {
            return (first, candidate);
        }
    }
    panic!("no candidate collection landed on a different shard");
}
