//! Reference-counted resource cache.
//!
//! Roots and hidden suspense subtrees retain the cache their content was
//! rendered with. Releasing the last reference does not dispose the cache
//! right away; the engine schedules a [`crate::Task::DisposeCache`] callback
//! so disposal never runs inside a commit.

use std::{
    any::{Any, TypeId},
    fmt,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

type Entry = Arc<dyn Any + Send + Sync>;

struct CacheInner {
    id: u64,
    ref_count: AtomicUsize,
    disposed: AtomicBool,
    entries: Mutex<HashMap<(TypeId, u64), Entry>>,
}

/// A shared side table with an explicit reference count.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// A cache with a reference count of zero.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
                ref_count: AtomicUsize::new(0),
                disposed: AtomicBool::new(false),
                entries: Mutex::new(HashMap::default()),
            }),
        }
    }

    /// Stable identity.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.inner.ref_count.load(Ordering::Acquire)
    }

    /// Whether [`Cache::dispose`] has run.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Adds a reference.
    pub fn retain(&self) {
        self.inner.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference. Returns `true` when this was the last one and the
    /// cache should be scheduled for disposal.
    pub fn release(&self) -> bool {
        let previous = self
            .inner
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or_default();
        previous == 1
    }

    /// Clears all entries. Only disposes when no reference was taken again in
    /// the meantime.
    pub fn dispose(&self) {
        if self.ref_count() > 0 {
            return;
        }
        self.inner.disposed.store(true, Ordering::Release);
        self.inner.entries.lock().clear();
    }

    /// Returns the entry for `key`, creating it with `init` when missing.
    pub fn get_or_insert_with<K, T>(&self, key: &K, init: impl FnOnce() -> T) -> Arc<T>
    where
        K: Hash + 'static,
        T: Send + Sync + 'static,
    {
        let slot = (TypeId::of::<T>(), hash_key(key));
        let mut entries = self.inner.entries.lock();
        if let Some(existing) = entries.get(&slot).cloned()
            && let Ok(value) = existing.downcast::<T>()
        {
            return value;
        }
        let value = Arc::new(init());
        entries.insert(slot, value.clone());
        value
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both handles share the same cache.
    pub fn ptr_eq(&self, other: &Cache) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("id", &self.inner.id)
            .field("ref_count", &self.ref_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn hash_key<K: Hash>(key: &K) -> u64 {
    use std::hash::{BuildHasher, Hasher};
    let mut hasher = rustc_hash::FxBuildHasher.build_hasher();
    key.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_reports_last_reference() {
        let cache = Cache::new();
        cache.retain();
        cache.retain();
        assert!(!cache.release());
        assert!(cache.release());
        assert_eq!(cache.ref_count(), 0);
        assert!(!cache.release());
    }

    #[test]
    fn dispose_skips_retained_cache() {
        let cache = Cache::new();
        cache.get_or_insert_with(&"user", || 1u32);
        cache.retain();
        cache.dispose();
        assert!(!cache.is_disposed());
        assert!(cache.release());
        cache.dispose();
        assert!(cache.is_disposed());
        assert!(cache.is_empty());
    }

    #[test]
    fn entries_are_shared() {
        let cache = Cache::new();
        let first = cache.get_or_insert_with(&42u64, || String::from("a"));
        let second = cache.get_or_insert_with(&42u64, || String::from("b"));
        assert!(Arc::ptr_eq(&first, &second));
        let other_type = cache.get_or_insert_with(&42u64, || 5u8);
        assert_eq!(*other_type, 5);
    }
}
