//! Workload generator for exercising the batchwell indexer.
//!
//! This binary builds a fjall-backed indexer with synthetic collection
//! routes, replays a stream of chunked write batches the way the
//! replicated log would deliver them, and reports applied-document
//! throughput once the worker pool has drained.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use batchwell::{
    request_handle, response_handle, BatchedIndexer, ChannelDispatcher, FjallChunkStore,
    IndexerConfig, RequestHandle, ResponseHandle, RouteHandler, RoutePath, RouteTable,
    WriteRequest, WriteResponse,
};
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "batchwell-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Data directory for the fjall keyspace.
    #[arg(long, default_value = ".tmp/batchwell-workload")]
    data_dir: PathBuf,

    /// Worker threads (also the shard count).
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Number of batched write requests to replay.
    #[arg(long, default_value_t = 1000)]
    requests: u64,

    /// Chunks per request.
    #[arg(long, default_value_t = 4)]
    chunks: u32,

    /// Documents per chunk.
    #[arg(long, default_value_t = 8)]
    docs_per_chunk: usize,

    /// Number of distinct collections the stream writes to.
    #[arg(long, default_value_t = 8)]
    collections: usize,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// How long to wait for the worker pool to drain after replay.
    #[arg(long, default_value = "60s")]
    settle_timeout: humantime::Duration,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(run) => run_workload(run),
    }
}

fn run_workload(args: RunArgs) -> anyhow::Result<()> {
    let seed = if args.seed == 0 {
        rand::random()
    } else {
        args.seed
    };
    tracing::info!(
        seed,
        requests = args.requests,
        chunks = args.chunks,
        collections = args.collections,
        "replaying synthetic write stream"
    );

    std::fs::create_dir_all(&args.data_dir).context("create data dir")?;
    let keyspace = fjall::Config::new(&args.data_dir)
        .open()
        .context("open keyspace")?;
    let store = Arc::new(FjallChunkStore::open(&keyspace)?);

    let applied_docs = Arc::new(AtomicU64::new(0));
    let routes = Arc::new(RouteTable::new());
    let import = routes.register(
        "POST",
        RoutePath::new(
            "/collections/:collection/documents/import",
            import_handler(Arc::clone(&applied_docs)),
        ),
    );
    let create = routes.register(
        "POST",
        RoutePath::new("/collections", create_handler()).with_creates_collection(),
    );

    let (dispatcher, messages) = ChannelDispatcher::new();
    // Drain proceed/stream messages the way the http server would.
    let message_drain = std::thread::spawn(move || {
        let mut count = 0u64;
        while messages.recv().is_ok() {
            count += 1;
        }
        count
    });

    let config = IndexerConfig {
        worker_threads: args.threads,
        ..IndexerConfig::from_env()
    };
    let indexer = Arc::new(BatchedIndexer::new(
        store,
        routes,
        Arc::new(dispatcher),
        config,
    ));
    let runner = {
        let indexer = Arc::clone(&indexer);
        std::thread::spawn(move || indexer.run())
    };

    let mut rng = SmallRng::seed_from_u64(seed);
    let started = Instant::now();
    let mut next_req_id = 1u64;

    // A fresh deployment creates its collections before writing to them.
    for coll in 0..args.collections {
        let (req, res) = request_pair(next_req_id, create, None);
        deliver_chunk(
            &indexer,
            &req,
            &res,
            format!("{{\"name\":\"coll{coll}\"}}"),
            true,
        )?;
        next_req_id += 1;
    }

    let mut enqueued_docs = 0u64;
    for _ in 0..args.requests {
        let coll = rng.gen_range(0..args.collections);
        let (req, res) = request_pair(next_req_id, import, Some(&format!("coll{coll}")));
        for chunk in 0..args.chunks {
            let mut body = String::with_capacity(args.docs_per_chunk * 32);
            for position in 0..args.docs_per_chunk {
                body.push_str(&format!(
                    "{{\"id\":{},\"position\":{position}}}\n",
                    rng.gen::<u32>()
                ));
                enqueued_docs += 1;
            }
            deliver_chunk(&indexer, &req, &res, body, chunk + 1 == args.chunks)?;
        }
        next_req_id += 1;
    }
    let enqueue_elapsed = started.elapsed();

    let settle: Duration = args.settle_timeout.into();
    let deadline = Instant::now() + settle;
    while indexer.in_flight_requests() > 0 {
        anyhow::ensure!(
            Instant::now() < deadline,
            "indexer did not drain within {}",
            args.settle_timeout
        );
        std::thread::sleep(Duration::from_millis(10));
    }
    let total_elapsed = started.elapsed();

    indexer.stop();
    match runner.join() {
        Ok(res) => res?,
        Err(_) => anyhow::bail!("indexer thread panicked"),
    }
    drop(indexer);
    let messages_seen = message_drain
        .join()
        .map_err(|_| anyhow::anyhow!("message drain thread panicked"))?;

    let docs = applied_docs.load(Ordering::Relaxed);
    let docs_per_sec = docs as f64 / total_elapsed.as_secs_f64().max(f64::EPSILON);
    tracing::info!(
        requests = args.requests,
        enqueued_docs,
        applied_docs = docs,
        messages_seen,
        enqueue_ms = enqueue_elapsed.as_millis() as u64,
        total_ms = total_elapsed.as_millis() as u64,
        docs_per_sec = docs_per_sec as u64,
        "workload complete"
    );
    anyhow::ensure!(
        docs == enqueued_docs,
        "applied {docs} documents but enqueued {enqueued_docs}"
    );
    Ok(())
}

/// Handler that counts newline-delimited documents and keeps any partial
/// trailing document for the next chunk.
fn import_handler(applied: Arc<AtomicU64>) -> RouteHandler {
    Arc::new(move |req, res| {
        let body = std::mem::take(&mut req.body);
        let mut rest = body.as_str();
        let mut docs = 0u64;
        while let Some(pos) = rest.find('\n') {
            let line = &rest[..pos];
            rest = &rest[pos + 1..];
            if !line.trim().is_empty() {
                docs += 1;
            }
        }
        req.body = rest.to_string();
        applied.fetch_add(docs, Ordering::Relaxed);
        res.body = format!("{{\"imported\": {docs}}}");
        Ok(())
    })
}

fn create_handler() -> RouteHandler {
    Arc::new(move |req, res| {
        tracing::debug!(body = %req.body, "collection created");
        req.body.clear();
        res.body = r#"{"ok": true}"#.to_string();
        Ok(())
    })
}

/// The shared request/response pair a streaming producer holds across all
/// chunks of one request.
fn request_pair(
    req_id: u64,
    route: u64,
    collection: Option<&str>,
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
        live: false,
    };
    (request_handle(req), response_handle(WriteResponse::default()))
}

/// Deliver one chunk the way the upstream log thread does.
fn deliver_chunk(
    indexer: &BatchedIndexer,
    req: &RequestHandle,
    res: &ResponseHandle,
    body: String,
    last: bool,
) -> anyhow::Result<()> {
    {
        let mut r = req
            .lock()
            .map_err(|_| anyhow::anyhow!("request lock poisoned"))?;
        r.body = body;
        r.last_chunk = last;
    }
    indexer.enqueue(Arc::clone(req), Arc::clone(res))
}
