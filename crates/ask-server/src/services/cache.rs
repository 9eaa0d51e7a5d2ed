use std::{
    fs,
    io::ErrorKind,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use common::{AskResult, CacheBackend, CacheSettings};
use lru::LruCache;
use parking_lot::Mutex;
use search_core::{AttributeFilter, RetrievalParams};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bumped whenever the cached bundle layout changes, so stale entries stop matching.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode cache record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Trims and collapses whitespace runs. Case is preserved.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Content address of an ask request.
///
/// `filter` is already lower-cased, sorted and deduplicated, so an absent list and an empty
/// list hash the same. `params` must be the resolved sizes, not the raw request values.
/// `index_id` names the index build, so answers from a replaced index never match.
pub fn cache_key(
    normalized_query: &str,
    filter: &AttributeFilter,
    params: RetrievalParams,
    index_id: &str,
) -> String {
    // serde_json::Value objects serialize with sorted keys, which makes this canonical.
    let canonical = serde_json::json!({
        "schema_version": CACHE_SCHEMA_VERSION,
        "index": index_id,
        "q": normalized_query,
        "components": filter.components(),
        "tags": filter.tags(),
        "top_k": params.top_k,
        "fetch_k": params.fetch_k,
    })
    .to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as u64,
            Err(_) => 0,
        }
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub const fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Raw byte storage behind the query cache.
pub trait CacheStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError>;

    fn remove(&self, key: &str) -> Result<(), CacheError>;
}

pub struct MemoryCacheStore {
    entries: Mutex<LruCache<String, Vec<u8>>>,
}

impl MemoryCacheStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCacheStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError> {
        self.entries.lock().put(key.to_string(), bytes);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().pop(key);
        Ok(())
    }
}

/// One JSON file per key. Writes go through a uniquely named temp file and a rename, so a
/// reader never sees a half-written entry.
///
/// At most `capacity` entries are kept; a write that goes over culls the least recently
/// written files.
pub struct DiskCacheStore {
    dir: PathBuf,
    capacity: usize,
}

impl DiskCacheStore {
    pub fn open(dir: impl Into<PathBuf>, capacity: usize) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            capacity: capacity.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn entries(&self) -> Result<Vec<(SystemTime, PathBuf)>, CacheError> {
        let io = |source| CacheError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io)? {
            let entry = entry.map_err(io)?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            // Another writer may have culled the file since the listing.
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            entries.push((modified, path));
        }
        Ok(entries)
    }

    fn cull(&self) -> Result<(), CacheError> {
        let mut entries = self.entries()?;
        if entries.len() <= self.capacity {
            return Ok(());
        }
        entries.sort();
        let excess = entries.len() - self.capacity;
        for (_, path) in entries.into_iter().take(excess) {
            remove_file(&path)?;
        }
        debug!(dir = %self.dir.display(), removed = excess, "culled disk cache");
        Ok(())
    }
}

fn remove_file(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

impl CacheStore for DiskCacheStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let tmp = self.dir.join(format!("{key}.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, bytes).map_err(|source| CacheError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| CacheError::Io { path, source })?;
        self.cull()
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        remove_file(&self.entry_path(key))
    }
}

#[derive(Serialize, Deserialize)]
struct CacheRecord {
    created_at_ms: u64,
    ttl_ms: u64,
    payload: AskResult,
}

/// TTL-bound memoization of full ask bundles.
///
/// Expiry is checked on read, and an expired entry is deleted when it is found; nothing is
/// evicted in the background. Store failures are logged and otherwise ignored, a broken cache
/// only costs recomputation.
#[derive(Clone)]
pub struct QueryCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
}

impl QueryCache {
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            store,
            clock,
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Result<Self, CacheError> {
        let store: Arc<dyn CacheStore> = match settings.backend {
            CacheBackend::Disk => Arc::new(DiskCacheStore::open(&settings.dir, settings.capacity)?),
            CacheBackend::Memory => Arc::new(MemoryCacheStore::new(settings.capacity)),
        };
        Ok(Self::new(
            store,
            Arc::new(SystemClock),
            Duration::from_secs(settings.ttl_seconds),
        ))
    }

    pub const fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn get(&self, key: &str) -> Option<AskResult> {
        let bytes = match self.store.load(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(key, error = %err, "cache read failed");
                return None;
            }
        };
        let record = match serde_json::from_slice::<CacheRecord>(&bytes) {
            Ok(record) => record,
            Err(err) => {
                warn!(key, error = %err, "ignoring undecodable cache entry");
                return None;
            }
        };
        let age = self.clock.now_ms().saturating_sub(record.created_at_ms);
        if age >= record.ttl_ms {
            debug!(key, age_ms = age, "cache entry expired");
            if let Err(err) = self.store.remove(key) {
                warn!(key, error = %err, "failed to drop expired cache entry");
            }
            return None;
        }
        Some(record.payload)
    }

    pub fn put(&self, key: &str, payload: &AskResult) {
        let record = CacheRecord {
            created_at_ms: self.clock.now_ms(),
            ttl_ms: self.ttl_ms,
            payload: payload.clone(),
        };
        let outcome = serde_json::to_vec(&record)
            .map_err(CacheError::from)
            .and_then(|bytes| self.store.store(key, bytes));
        if let Err(err) = outcome {
            warn!(key, error = %err, "cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use common::{AskResult, SopAnswer};
    use proptest::prelude::*;
    use search_core::{AttributeFilter, RetrievalParams};

    use super::{
        CacheStore, DiskCacheStore, ManualClock, MemoryCacheStore, QueryCache, cache_key,
        normalize_query,
    };

    fn bundle(summary: &str) -> AskResult {
        AskResult {
            answer_md: format!("### Summary\n{summary}\n"),
            sop: SopAnswer {
                summary: summary.to_string(),
                ..SopAnswer::default()
            },
            sources: Vec::new(),
            debug: None,
        }
    }

    fn params(top_k: usize, fetch_k: usize) -> RetrievalParams {
        RetrievalParams { top_k, fetch_k }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn normalization_collapses_whitespace_and_keeps_case() {
        assert_eq!(normalize_query("  Spark \t OOM\n\nexecutor  "), "Spark OOM executor");
        assert_eq!(normalize_query("   "), "");
    }

    #[test]
    fn absent_and_empty_filters_share_a_key() {
        let empty: Vec<String> = Vec::new();
        let a = cache_key("q", &AttributeFilter::new(None, None), params(8, 40), "idx");
        let b = cache_key("q", &AttributeFilter::new(Some(&empty), Some(&empty)), params(8, 40), "idx");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn key_ignores_filter_order_but_not_sizes() {
        let ab = strings(&["spark", "kafka"]);
        let ba = strings(&["kafka", "spark"]);
        let a = cache_key("q", &AttributeFilter::new(Some(&ab), None), params(8, 40), "idx");
        let b = cache_key("q", &AttributeFilter::new(Some(&ba), None), params(8, 40), "idx");
        let c = cache_key("q", &AttributeFilter::new(Some(&ab), None), params(8, 41), "idx");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn key_changes_with_index_build() {
        let filter = AttributeFilter::default();
        let a = cache_key("q", &filter, params(8, 40), "build-a");
        let b = cache_key("q", &filter, params(8, 40), "build-b");
        assert_ne!(a, b);
    }

    #[test]
    fn components_and_tags_do_not_collide() {
        let v = strings(&["oom"]);
        let as_component = cache_key("q", &AttributeFilter::new(Some(&v), None), params(8, 40), "idx");
        let as_tag = cache_key("q", &AttributeFilter::new(None, Some(&v)), params(8, 40), "idx");
        assert_ne!(as_component, as_tag);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = QueryCache::new(
            Arc::new(MemoryCacheStore::new(4)),
            clock.clone(),
            Duration::from_secs(10),
        );
        cache.put("k", &bundle("cached"));
        clock.advance(Duration::from_millis(9_999));
        assert_eq!(cache.get("k"), Some(bundle("cached")));
        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn corrupt_entry_is_a_miss_and_can_be_overwritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(DiskCacheStore::open(dir.path().join("cache"), 16).expect("open"));
        store.store("k", b"{not json".to_vec()).expect("raw write");

        let cache = QueryCache::new(store.clone(), Arc::new(ManualClock::new(0)), Duration::from_secs(60));
        assert_eq!(cache.get("k"), None);

        cache.put("k", &bundle("fresh"));
        assert_eq!(cache.get("k"), Some(bundle("fresh")));
        let leftovers = std::fs::read_dir(store.dir())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn disk_entries_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(5));
        let first = QueryCache::new(
            Arc::new(DiskCacheStore::open(dir.path(), 16).expect("open")),
            clock.clone(),
            Duration::from_secs(60),
        );
        first.put("k", &bundle("persisted"));

        let second = QueryCache::new(
            Arc::new(DiskCacheStore::open(dir.path(), 16).expect("reopen")),
            clock,
            Duration::from_secs(60),
        );
        assert_eq!(second.get("k"), Some(bundle("persisted")));
    }

    #[test]
    fn expired_disk_entries_are_deleted_on_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(DiskCacheStore::open(dir.path(), 16).expect("open"));
        let clock = Arc::new(ManualClock::new(0));
        let cache = QueryCache::new(store.clone(), clock.clone(), Duration::from_secs(1));
        cache.put("old", &bundle("stale"));
        cache.put("other", &bundle("stale too"));
        assert_eq!(store.len().expect("len"), 2);

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("old"), None);
        assert_eq!(store.load("old").expect("load"), None);
        assert_eq!(store.len().expect("len"), 1);
    }

    #[test]
    fn disk_store_culls_oldest_entries_past_capacity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskCacheStore::open(dir.path(), 2).expect("open");
        store.store("a", b"1".to_vec()).expect("store a");
        std::thread::sleep(Duration::from_millis(20));
        store.store("b", b"2".to_vec()).expect("store b");
        std::thread::sleep(Duration::from_millis(20));
        store.store("c", b"3".to_vec()).expect("store c");

        assert_eq!(store.len().expect("len"), 2);
        assert_eq!(store.load("a").expect("load"), None);
        assert_eq!(store.load("c").expect("load"), Some(b"3".to_vec()));
    }

    #[test]
    fn memory_store_is_bounded() {
        let store = MemoryCacheStore::new(2);
        for key in ["a", "b", "c"] {
            store.store(key, vec![1]).expect("store");
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.load("a").expect("load"), None);
    }

    proptest! {
        #[test]
        fn key_is_stable_under_whitespace_noise(words in prop::collection::vec("[A-Za-z]{1,8}", 1..6), pad in "[ \t\n]{0,3}") {
            let sep = format!(" {pad}");
            let spaced = words.join(sep.as_str());
            let noisy = format!("{pad}{spaced}{pad}");
            let filter = AttributeFilter::default();
            prop_assert_eq!(
                cache_key(&normalize_query(&noisy), &filter, params(8, 40), "idx"),
                cache_key(&words.join(" "), &filter, params(8, 40), "idx")
            );
        }
    }
}
