//! Request/response model carried through the indexer.
//!
//! A streamed write arrives as a sequence of chunks that all share one
//! `WriteRequest`. Each chunk is persisted as the serialized request
//! (metadata plus the body fragment delivered with that chunk); the
//! symmetric `load_from_chunk` appends the stored fragment to whatever body
//! the caller left in place, which is how partial-document carry-over
//! between chunks works.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Shared handle to the logical request, passed from the write path to the
/// owning worker and the transport.
pub type RequestHandle = Arc<Mutex<WriteRequest>>;

/// Shared handle to the logical response.
pub type ResponseHandle = Arc<Mutex<WriteResponse>>;

/// One logical write request, possibly streamed across many chunks.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Monotonically increasing request id assigned by the upstream log;
    /// doubles as the logical start timestamp of the batch. Zero marks a
    /// legacy producer that did not batch its chunks.
    pub start_ts: u64,
    /// Hash identifying the route this request targets.
    pub route_hash: u64,
    /// Replicated-log index the request was read from.
    pub log_index: u64,
    /// URL-bound parameters; `collection` selects the target collection.
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Body fragment carried by the current chunk, or the assembled buffer
    /// while a worker is draining.
    #[serde(default)]
    pub body: String,
    /// True when this chunk completes the logical request.
    #[serde(default)]
    pub last_chunk: bool,
    /// True while a client connection is attached and the transport expects
    /// proceed signals. Never persisted; restored requests are not live.
    #[serde(skip)]
    pub live: bool,
}

impl WriteRequest {
    /// Serialize the request (metadata + current body fragment) into the
    /// value stored for one chunk.
    pub fn to_chunk(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize request chunk")
    }

    /// Restore metadata from a stored chunk and append its body fragment to
    /// the current body.
    pub fn load_from_chunk(&mut self, value: &[u8]) -> anyhow::Result<()> {
        let chunk: WriteRequest =
            serde_json::from_slice(value).context("parse request chunk")?;
        self.start_ts = chunk.start_ts;
        self.route_hash = chunk.route_hash;
        self.log_index = chunk.log_index;
        self.params = chunk.params;
        self.last_chunk = chunk.last_chunk;
        self.body.push_str(&chunk.body);
        Ok(())
    }

    /// Look up a URL-bound parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Response under construction for one request.
#[derive(Clone, Debug)]
pub struct WriteResponse {
    pub status_code: u16,
    pub content_type: String,
    pub body: String,
    /// True once the response carries its final payload.
    pub final_chunk: bool,
    /// True while a client is still connected and can receive the response.
    pub is_alive: bool,
}

impl Default for WriteResponse {
    fn default() -> Self {
        Self {
            status_code: 200,
            content_type: "application/json".to_string(),
            body: String::new(),
            final_chunk: true,
            is_alive: false,
        }
    }
}

impl WriteResponse {
    pub fn set_404(&mut self) {
        self.status_code = 404;
        self.body = r#"{"message": "Not Found"}"#.to_string();
        self.final_chunk = true;
    }
}

/// Wrap a request in its shared handle.
pub fn request_handle(req: WriteRequest) -> RequestHandle {
    Arc::new(Mutex::new(req))
}

/// Wrap a response in its shared handle.
pub fn response_handle(res: WriteResponse) -> ResponseHandle {
    Arc::new(Mutex::new(res))
}
