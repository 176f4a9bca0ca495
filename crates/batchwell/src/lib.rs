//! Durable, collection-sharded application of streamed write requests.
//!
//! batchwell sits between a replicated-log write path and the route
//! handlers that mutate collections. Incoming requests may be chunked
//! across many log entries; every chunk is persisted to a sorted key/value
//! store before anything is applied, so a crash never loses an accepted
//! write. Completed requests are handed to a worker pool sharded by
//! collection name: one collection always applies serially on one worker,
//! while distinct collections apply in parallel. Abandoned partial uploads
//! are garbage collected, and the in-flight table rides along with node
//! snapshots so an instance can restart mid-request and resume where it
//! stopped.
//!
//! The crate deliberately stops at the indexer boundary: the HTTP server,
//! the replicated log, and the handlers themselves are external, reached
//! through the interfaces in [`routes`] and [`dispatch`].

pub mod config;
pub mod dispatch;
pub mod indexer;
mod registry;
pub mod request;
pub mod routes;
pub mod snapshot;
pub mod store;

pub use config::IndexerConfig;
pub use dispatch::{ChannelDispatcher, MessageDispatcher, ServerMessage};
pub use indexer::{current_write_log_index, BatchedIndexer};
pub use request::{
    request_handle, response_handle, RequestHandle, ResponseHandle, WriteRequest, WriteResponse,
};
pub use routes::{route_hash, RouteHandler, RoutePath, RouteTable};
pub use snapshot::{SnapshotEntry, SnapshotState};
pub use store::{ChunkStore, FjallChunkStore, MemoryChunkStore};
