//! # OffKit Service Worker
//!
//! Offline cache worker for the OffKit engine: install-time precaching and
//! cache-first fetch interception.
//!
//! ## Features
//!
//! - **Lifecycle**: install, activate, redundant-on-failure
//! - **Precache**: all-or-nothing install of a fixed asset list
//! - **Cache API**: named caches keyed by method and URL
//! - **Fetch Interception**: cache-first with network fallback
//!
//! ## Architecture
//!
//! ```text
//! OfflineCacheWorker
//!     ├── PrecacheConfig (scope, cache name, asset list)
//!     ├── AssetLoader (shared; install fetches and cache misses)
//!     └── CacheStorage (host-owned, shared)
//!             └── Cache "pwa-cache-v1"
//!                     └── (method, URL) → CacheEntry
//! ```
//!
//! The storage handle outlives any single worker, so entries written by one
//! worker instance are visible to its successors.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use futures::future::try_join_all;
use offkit_common::now_millis;
use offkit_net::{AssetLoader, NetError, NetResponse, Request};

// ==================== Errors ====================

/// Errors that can occur in offline cache worker operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Invalid asset path: {0}")]
    InvalidAsset(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),
}

// ==================== Types ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Initial state, install not yet run.
    Parsed,
    /// Install in progress (precache underway).
    Installing,
    /// Precache committed, waiting for activation.
    Installed,
    /// Activation in progress.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed or worker replaced.
    Redundant,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::Parsed
    }
}

impl WorkerState {
    /// Check if active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Activated)
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        matches!(self, Self::Redundant)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }
}

// ==================== Precache Config ====================

/// Name of the cache the asset list is installed into.
///
/// Changing the name addresses a brand-new empty store; old stores are not
/// migrated or cleaned up.
pub const CACHE_NAME: &str = "pwa-cache-v1";

/// Asset paths fetched at install time.
pub fn default_asset_paths() -> Vec<String> {
    vec![
        "/".to_string(),
        "/statics/style.css".to_string(),
        "/statics/icons/icon-192.png".to_string(),
        "/statics/icons/icon-512.png".to_string(),
    ]
}

/// Precache configuration for an offline cache worker.
///
/// Immutable once the worker is constructed.
#[derive(Debug, Clone)]
pub struct PrecacheConfig {
    /// Origin the asset paths resolve against.
    pub scope: Url,
    /// Name of the cache the assets land in.
    pub cache_name: String,
    /// Asset paths to fetch at install time.
    pub assets: Vec<String>,
}

impl PrecacheConfig {
    /// Create a configuration with the default cache name and asset list.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            cache_name: CACHE_NAME.to_string(),
            assets: default_asset_paths(),
        }
    }

    /// Override the cache name.
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    /// Override the asset list.
    pub fn with_assets(mut self, assets: Vec<String>) -> Self {
        self.assets = assets;
        self
    }
}

// ==================== Cache ====================

/// Key a cached response is stored under.
///
/// Matching is method plus URL with the fragment cleared. Query strings are
/// significant; headers are not consulted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    method: String,
    url: String,
}

impl CacheKey {
    /// Derive the key for a method and URL.
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Stored-at timestamp (ms since epoch). Metadata only, never consulted
    /// for freshness.
    pub stored_at: u64,
}

impl CacheEntry {
    /// Build an entry for a request URL from its network response.
    pub fn from_response(method: &str, url: &Url, response: &NetResponse) -> Self {
        Self {
            url: url.to_string(),
            method: method.to_string(),
            status: response.status.as_u16(),
            headers: response_headers(response),
            body: response.body.to_vec(),
            stored_at: now_millis(),
        }
    }
}

/// A named cache instance.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request by key.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert an entry.
    pub fn put(&mut self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// Insert a staged batch of entries.
    ///
    /// Called with the storage lock held, so observers see none or all of
    /// the batch.
    pub fn put_all(&mut self, staged: Vec<(CacheKey, CacheEntry)>) {
        for (key, entry) in staged {
            self.entries.insert(key, entry);
        }
    }

    /// Delete an entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<&CacheKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// Cache storage: named caches owned by the host.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache, creating it if absent. Reopening the same name returns
    /// the same logical store.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Look up a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if a cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all cache names.
    pub fn keys(&self) -> Vec<&str> {
        self.caches.keys().map(|s| s.as_str()).collect()
    }

    /// Match a request across all caches.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.caches.values().find_map(|cache| cache.match_request(key))
    }
}

// ==================== Fetch Types ====================

/// A request intercepted on behalf of a controlled page.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Request URL.
    pub url: Url,

    /// Request method.
    pub method: String,

    /// Request headers.
    pub headers: HashMap<String, String>,
}

impl FetchRequest {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            headers: HashMap::new(),
        }
    }

    /// Key this request matches under in a cache.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.method, &self.url)
    }
}

/// The single response handed back for an intercepted request.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Status code.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Whether served from cache.
    pub from_cache: bool,
}

impl FetchResponse {
    /// Build a response from a cache entry.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers.clone(),
            body: entry.body.clone(),
            from_cache: true,
        }
    }

    /// Pass a network response through unmodified.
    pub fn from_network(response: &NetResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: response_headers(response),
            body: response.body.to_vec(),
            from_cache: false,
        }
    }
}

// ==================== Worker Events ====================

/// Notifications emitted by an offline cache worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Worker state changed.
    StateChange {
        worker_id: WorkerId,
        state: WorkerState,
    },
    /// Install succeeded and the precache is fully populated.
    InstallCompleted { worker_id: WorkerId, assets: usize },
    /// Install failed and none of the assets were cached.
    InstallFailed { worker_id: WorkerId, reason: String },
}

// ==================== Offline Cache Worker ====================

/// An offline cache worker: precaches a fixed asset list at install time and
/// answers intercepted fetches cache-first.
pub struct OfflineCacheWorker {
    /// Unique ID.
    pub id: WorkerId,

    /// Precache configuration.
    config: PrecacheConfig,

    /// Host-owned cache storage.
    caches: Arc<RwLock<CacheStorage>>,

    /// Loader for install fetches and cache misses.
    loader: Arc<AssetLoader>,

    /// Current state.
    state: RwLock<WorkerState>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl OfflineCacheWorker {
    /// Create a worker in the `Parsed` state.
    pub fn new(
        config: PrecacheConfig,
        caches: Arc<RwLock<CacheStorage>>,
        loader: Arc<AssetLoader>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                id: WorkerId::new(),
                config,
                caches,
                loader,
                state: RwLock::new(WorkerState::Parsed),
                event_tx,
            },
            event_rx,
        )
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Precache configuration.
    pub fn config(&self) -> &PrecacheConfig {
        &self.config
    }

    async fn set_state(&self, state: WorkerState) {
        *self.state.write().await = state;
        self.announce_state(state);
    }

    /// Advance from an expected state, failing from any other. The check and
    /// the write hold the state lock together, so racing callers cannot both
    /// claim the same transition.
    async fn transition(&self, from: WorkerState, to: WorkerState) -> Result<(), WorkerError> {
        {
            let mut state = self.state.write().await;
            if *state != from {
                return Err(WorkerError::StateError(format!(
                    "cannot enter {} from {}",
                    to.as_str(),
                    state.as_str()
                )));
            }
            *state = to;
        }
        self.announce_state(to);
        Ok(())
    }

    fn announce_state(&self, state: WorkerState) {
        debug!(worker = self.id.raw(), state = state.as_str(), "State changed");
        let _ = self.event_tx.send(WorkerEvent::StateChange {
            worker_id: self.id,
            state,
        });
    }

    /// Run the install step: fetch every configured asset and commit the
    /// batch to the named cache.
    ///
    /// All-or-nothing: responses are staged until every fetch has succeeded
    /// with a 2xx status, then committed in one step. On any failure the
    /// cache keeps none of the assets and the worker becomes `Redundant`.
    /// The worker does not retry; a retry is a fresh worker over the same
    /// storage handle.
    pub async fn install(&self) -> Result<(), WorkerError> {
        self.transition(WorkerState::Parsed, WorkerState::Installing)
            .await?;

        info!(
            worker = self.id.raw(),
            cache = %self.config.cache_name,
            assets = self.config.assets.len(),
            "Installing offline cache worker"
        );

        // Opening the store is a side effect of install even when the
        // asset fetches later fail
        {
            let mut caches = self.caches.write().await;
            caches.open(&self.config.cache_name);
        }

        match self.precache().await {
            Ok(staged) => {
                let count = staged.len();
                {
                    let mut caches = self.caches.write().await;
                    caches.open(&self.config.cache_name).put_all(staged);
                }

                self.set_state(WorkerState::Installed).await;
                let _ = self.event_tx.send(WorkerEvent::InstallCompleted {
                    worker_id: self.id,
                    assets: count,
                });
                info!(worker = self.id.raw(), assets = count, "Install complete");

                self.activate().await
            }
            Err(err) => {
                warn!(worker = self.id.raw(), error = %err, "Install failed, nothing cached");
                self.set_state(WorkerState::Redundant).await;
                let _ = self.event_tx.send(WorkerEvent::InstallFailed {
                    worker_id: self.id,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Fetch every configured asset, succeeding only if all of them do.
    async fn precache(&self) -> Result<Vec<(CacheKey, CacheEntry)>, WorkerError> {
        try_join_all(self.config.assets.iter().map(|path| self.fetch_asset(path))).await
    }

    async fn fetch_asset(&self, path: &str) -> Result<(CacheKey, CacheEntry), WorkerError> {
        let url = self
            .config
            .scope
            .join(path)
            .map_err(|e| WorkerError::InvalidAsset(format!("{path}: {e}")))?;

        trace!(worker = self.id.raw(), url = %url, "Precaching asset");

        let response = self
            .loader
            .fetch(Request::get(url.clone()))
            .await
            .map_err(|e| WorkerError::InstallFailed(format!("{url}: {e}")))?;

        if !response.ok() {
            return Err(WorkerError::InstallFailed(format!(
                "{url}: status {}",
                response.status
            )));
        }

        Ok((
            CacheKey::new("GET", &url),
            CacheEntry::from_response("GET", &url, &response),
        ))
    }

    /// Activate an installed worker.
    ///
    /// No activate-time work is configured, so this is the default
    /// transition through `Activating` to `Activated`. `install` runs it
    /// automatically on success.
    pub async fn activate(&self) -> Result<(), WorkerError> {
        self.transition(WorkerState::Installed, WorkerState::Activating)
            .await?;
        self.set_state(WorkerState::Activated).await;
        info!(worker = self.id.raw(), "Worker activated");
        Ok(())
    }

    /// Intercept a fetch on behalf of a controlled page.
    ///
    /// Cache hits are answered as stored, with no network traffic. Misses
    /// go to the network exactly once and the response passes through
    /// without being written back, so caches hold install-time content
    /// only. A transport failure on a miss propagates to the caller.
    pub async fn handle_fetch(&self, request: FetchRequest) -> Result<FetchResponse, WorkerError> {
        {
            let state = self.state.read().await;
            if state.is_redundant() {
                return Err(WorkerError::StateError(
                    "cannot intercept fetch on a redundant worker".to_string(),
                ));
            }
        }

        let key = request.cache_key();

        {
            let caches = self.caches.read().await;
            if let Some(entry) = caches.match_request(&key) {
                debug!(worker = self.id.raw(), url = %request.url, "Cache hit");
                return Ok(FetchResponse::from_entry(entry));
            }
        }

        debug!(worker = self.id.raw(), url = %request.url, "Cache miss, forwarding to network");

        let net_request = self.to_net_request(request)?;
        let response = self.loader.fetch(net_request).await?;

        Ok(FetchResponse::from_network(&response))
    }

    fn to_net_request(&self, request: FetchRequest) -> Result<Request, WorkerError> {
        let mut net_request = Request::from_method(&request.method, request.url)?;
        for (name, value) in &request.headers {
            net_request = net_request.header_str(name, value);
        }
        Ok(net_request)
    }
}

// ==================== Helpers ====================

/// Flatten response headers to string pairs. Non-UTF8 values are dropped.
fn response_headers(response: &NetResponse) -> HashMap<String, String> {
    response
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
