//! Route table consumed by the worker pool.
//!
//! Routes are registered by the surrounding server and looked up by hash
//! while draining buffered chunks. The `creates_collection` flag marks the
//! collection-creation route so that creating a collection lands on the
//! same shard as subsequent writes to it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use xxhash_rust::xxh3::xxh3_64;

use crate::request::{WriteRequest, WriteResponse};

/// Handler invoked once per buffered chunk of a request. Handlers consume
/// as many complete documents as the body contains and leave the unconsumed
/// suffix in `req.body`.
pub type RouteHandler =
    Arc<dyn Fn(&mut WriteRequest, &mut WriteResponse) -> anyhow::Result<()> + Send + Sync>;

/// One registered route.
#[derive(Clone)]
pub struct RoutePath {
    pub path: String,
    pub handler: RouteHandler,
    /// Handler takes over the response lifecycle; the worker must not
    /// stream a response for it.
    pub async_res: bool,
    /// Marks the collection-creation route for shard resolution.
    pub creates_collection: bool,
}

impl RoutePath {
    pub fn new(path: impl Into<String>, handler: RouteHandler) -> Self {
        Self {
            path: path.into(),
            handler,
            async_res: false,
            creates_collection: false,
        }
    }

    pub fn with_async_res(mut self) -> Self {
        self.async_res = true;
        self
    }

    pub fn with_creates_collection(mut self) -> Self {
        self.creates_collection = true;
        self
    }
}

impl std::fmt::Debug for RoutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutePath")
            .field("path", &self.path)
            .field("async_res", &self.async_res)
            .field("creates_collection", &self.creates_collection)
            .finish()
    }
}

/// Stable hash identifying a route by method and path template.
pub fn route_hash(method: &str, path: &str) -> u64 {
    xxh3_64(format!("{method} {path}").as_bytes())
}

/// Mapping from route hash to route, shared between the server and the
/// worker pool.
pub struct RouteTable {
    routes: RwLock<HashMap<u64, Arc<RoutePath>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a route and return its hash.
    pub fn register(&self, method: &str, route: RoutePath) -> u64 {
        let hash = route_hash(method, &route.path);
        if let Ok(mut guard) = self.routes.write() {
            guard.insert(hash, Arc::new(route));
        }
        hash
    }

    pub fn get(&self, route_hash: u64) -> Option<Arc<RoutePath>> {
        let guard = self.routes.read().ok()?;
        guard.get(&route_hash).cloned()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
