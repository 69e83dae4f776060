//! # Route Cache Store
//!
//! Durable persistence of the [`CachedDocument`] (routes + last viewport).
//!
//! ## Layers
//!
//! 1. **[`DurableStore`]**: raw key/bytes storage with atomic writes.
//!    [`FileStore`] (temp-then-rename), [`MemoryStore`], and with the
//!    `persistence` feature, `SqliteStore`.
//! 2. **[`RouteCacheStore`]**: typed `load`/`save` of the cached document on
//!    top of one durable store. Loading never fails observably and saving is
//!    best-effort: the in-memory state stays authoritative for the session.
//!
//! Writes run on the blocking pool and are sequenced by ticket: a save that was
//! requested earlier never overwrites one requested later, even if its write
//! lands last.

use std::collections::HashMap;
use std::fs::{self, File};
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::{CachedDocument, Route, StoreError};

/// Default key of the cached document.
pub const DEFAULT_CACHE_KEY: &str = "routes";

// ============================================================================
// Durable Store
// ============================================================================

/// Raw byte storage addressed by key.
///
/// `write_bytes_atomic` must leave either the old or the new value visible to a
/// later `read_bytes`, never a partial write.
pub trait DurableStore: Send + Sync {
    fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn write_bytes_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// One file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl DurableStore for FileStore {
    fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_bytes_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir)?;

        let temp_path = self.dir.join(format!(".{}.json.tmp", key));
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }

        // Atomic on POSIX when source and target share a filesystem
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

/// In-process store, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed `write_bytes_atomic` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Seed raw bytes without counting a write.
    pub fn insert_raw(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes.into());
    }

    /// Raw bytes currently stored under `key`.
    pub fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl DurableStore for MemoryStore {
    fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.get_raw(key))
    }

    fn write_bytes_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Route Cache Store
// ============================================================================

/// Typed load/save of the cached route document.
///
/// Cheap to clone; all clones share one durable store and one write sequence.
/// Construct one per process and hand it to every consumer.
#[derive(Clone)]
pub struct RouteCacheStore {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    backend: Arc<dyn DurableStore>,
    key: String,
    next_ticket: AtomicU64,
    /// Held while a document is built and its ticket taken.
    issue: Mutex<()>,
    /// Ticket of the last document written; also serializes writes.
    last_written: Mutex<u64>,
}

impl RouteCacheStore {
    /// Cache stored under the default key.
    pub fn new(backend: Arc<dyn DurableStore>) -> Self {
        Self::with_key(backend, DEFAULT_CACHE_KEY)
    }

    pub fn with_key(backend: Arc<dyn DurableStore>, key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                key: key.into(),
                next_ticket: AtomicU64::new(1),
                issue: Mutex::new(()),
                last_written: Mutex::new(0),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Load the cached document.
    ///
    /// Missing, unreadable or mismatched data yields an empty document. The
    /// legacy bare-list-of-routes shape is accepted with no viewport.
    pub fn load(&self) -> CachedDocument {
        let bytes = match self.inner.backend.read_bytes(&self.inner.key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("[RouteCacheStore] No cached document under '{}'", self.inner.key);
                return CachedDocument::default();
            }
            Err(e) => {
                warn!("[RouteCacheStore] Failed to read cache: {}", e);
                return CachedDocument::default();
            }
        };

        match decode_document(&bytes) {
            Some(doc) => {
                info!(
                    "[RouteCacheStore] Loaded {} routes (viewport: {})",
                    doc.routes.len(),
                    doc.viewport.is_some()
                );
                doc
            }
            None => {
                warn!(
                    "[RouteCacheStore] Cached document ({} bytes) is unreadable, starting empty",
                    bytes.len()
                );
                CachedDocument::default()
            }
        }
    }

    /// [`load`](Self::load) on the blocking pool.
    pub async fn load_async(&self) -> CachedDocument {
        let store = self.clone();
        match tokio::task::spawn_blocking(move || store.load()).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("[RouteCacheStore] Load task failed: {}", e);
                CachedDocument::default()
            }
        }
    }

    /// Persist `document` in the background.
    ///
    /// Failures are logged and absorbed. The returned handle resolves after
    /// the write attempt to `true` on success (or when a newer save already
    /// superseded this one) and `false` on failure. Dropping the handle does not
    /// cancel the write. Outside a Tokio runtime the write happens inline.
    pub fn save(&self, document: CachedDocument) -> SaveHandle {
        self.save_with(move || document)
    }

    /// Like [`save`](Self::save), but builds the document under the same lock
    /// that assigns its ticket.
    ///
    /// Writers that snapshot shared state inside `build` are therefore
    /// persisted in snapshot order: a document built from older state can
    /// never land after one built from newer state.
    pub fn save_with<F>(&self, build: F) -> SaveHandle
    where
        F: FnOnce() -> CachedDocument,
    {
        let (ticket, document) = {
            let _issue = self
                .inner
                .issue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let document = build();
            (self.inner.next_ticket.fetch_add(1, Ordering::SeqCst), document)
        };
        let store = self.clone();
        let write = move || match store.write_sequenced(ticket, &document) {
            Ok(_) => true,
            Err(e) => {
                warn!("[RouteCacheStore] Cache write failed (ignored): {}", e);
                false
            }
        };

        match Handle::try_current() {
            Ok(handle) => SaveHandle {
                state: SaveState::Pending(handle.spawn_blocking(write)),
            },
            Err(_) => SaveHandle {
                state: SaveState::Done(write()),
            },
        }
    }

    /// Persist `document` and call `on_complete` with the outcome once the
    /// write attempt finished. The callback runs on the async runtime, not on
    /// the blocking I/O thread.
    pub fn save_then<F>(&self, document: CachedDocument, on_complete: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let pending = self.save(document);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    on_complete(pending.await);
                });
            }
            Err(_) => on_complete(pending.ready_value().unwrap_or(false)),
        }
    }

    /// Serialize and write synchronously, surfacing errors.
    pub fn write_now(&self, document: &CachedDocument) -> Result<(), StoreError> {
        let ticket = {
            let _issue = self
                .inner
                .issue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner.next_ticket.fetch_add(1, Ordering::SeqCst)
        };
        self.write_sequenced(ticket, document).map(|_| ())
    }

    /// Write unless a newer ticket has already been written.
    /// Returns whether bytes were written.
    fn write_sequenced(&self, ticket: u64, document: &CachedDocument) -> Result<bool, StoreError> {
        let bytes = serde_json::to_vec(document)?;

        let mut last_written = self
            .inner
            .last_written
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if ticket < *last_written {
            debug!(
                "[RouteCacheStore] Skipping stale write #{} (latest #{})",
                ticket, *last_written
            );
            return Ok(false);
        }

        self.inner
            .backend
            .write_bytes_atomic(&self.inner.key, &bytes)?;
        *last_written = ticket;
        debug!(
            "[RouteCacheStore] Wrote #{}: {} routes, {} bytes",
            ticket,
            document.routes.len(),
            bytes.len()
        );
        Ok(true)
    }
}

/// Decode either the current document shape or the legacy bare route list.
pub fn decode_document(bytes: &[u8]) -> Option<CachedDocument> {
    match serde_json::from_slice::<CachedDocument>(bytes) {
        Ok(doc) => Some(doc),
        Err(doc_err) => match serde_json::from_slice::<Vec<Route>>(bytes) {
            Ok(routes) => {
                info!(
                    "[RouteCacheStore] Migrating legacy route list ({} routes)",
                    routes.len()
                );
                Some(CachedDocument::new(routes, None))
            }
            Err(_) => {
                debug!("[RouteCacheStore] Decode failed: {}", doc_err);
                None
            }
        },
    }
}

// ============================================================================
// Save Handle
// ============================================================================

/// Completion of a background [`RouteCacheStore::save`].
///
/// Awaiting it delivers the outcome on the awaiting task's context.
pub struct SaveHandle {
    state: SaveState,
}

enum SaveState {
    Pending(JoinHandle<bool>),
    Done(bool),
}

impl SaveHandle {
    fn ready_value(&self) -> Option<bool> {
        match self.state {
            SaveState::Done(ok) => Some(ok),
            SaveState::Pending(_) => None,
        }
    }
}

impl Future for SaveHandle {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match &mut self.state {
            SaveState::Pending(handle) => Pin::new(handle).poll(cx).map(|joined| match joined {
                Ok(ok) => ok,
                Err(e) => {
                    warn!("[RouteCacheStore] Save task failed: {}", e);
                    false
                }
            }),
            SaveState::Done(ok) => Poll::Ready(*ok),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
