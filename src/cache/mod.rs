//! Short-lived in-memory caches in front of the upstream catalog

mod directory;

pub use directory::{Directory, DirectoryEntry};

use std::hash::Hash;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use moka::sync::Cache;

use crate::clock::SharedClock;
use crate::upstream::{ApiEpisode, ApiPodcast, Page};

/// Default lifetime of a cached listing or detail
pub const DEFAULT_TTL_SECS: i64 = 15 * 60;

/// Default bound on entries held by each cache
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    fetched_at: DateTime<Utc>,
}

/// Read-through cache whose entries expire `ttl` after they were stored.
///
/// Expiry is decided against the injected clock; the underlying moka cache
/// bounds the entry count and drops anything older than `ttl` in wall time.
/// Values are replaced whole on every `put`; nothing is updated partially.
pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: SharedClock,
    entries: Cache<K, Entry<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_ENTRIES, clock)
    }

    pub fn with_capacity(ttl: Duration, max_entries: u64, clock: SharedClock) -> Self {
        let wall_ttl = ttl
            .to_std()
            .unwrap_or_default()
            .max(std::time::Duration::from_secs(1));
        let entries = Cache::builder()
            .time_to_live(wall_ttl)
            .max_capacity(max_entries.max(1))
            .build();

        Self {
            ttl,
            clock,
            entries,
        }
    }

    /// The cached value, or `None` once it is `ttl` old
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        if self.clock.now() - entry.fetched_at < self.ttl {
            Some(entry.value)
        } else {
            self.entries.invalidate(key);
            None
        }
    }

    pub fn put(&self, key: K, value: V) {
        let fetched_at = self.clock.now();
        self.entries.insert(key, Entry { value, fetched_at });
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.invalidate(key);
    }

    /// Drop every entry whose key matches `predicate`
    pub fn invalidate_where(&self, predicate: impl Fn(&K) -> bool) {
        let doomed: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key)
            .collect();
        for key in doomed {
            self.entries.invalidate(key.as_ref());
        }
    }

    /// Number of stored entries once pending evictions have run
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key of one page of the podcast list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub page: usize,
    pub hits: usize,
}

/// Key of one page of a podcast's episode list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EpisodePageKey {
    pub podcast_id: String,
    pub page: usize,
    pub hits: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DetailKey {
    pub podcast_id: String,
    pub episode_id: String,
}

/// All process-wide caches, built once and handed to the sync engine
pub struct CacheLayer {
    ttl: Duration,
    clock: SharedClock,
    pub podcasts: TtlCache<PageKey, Page<ApiPodcast>>,
    pub episodes: TtlCache<EpisodePageKey, Page<ApiEpisode>>,
    pub details: TtlCache<DetailKey, ApiEpisode>,
    directory: Mutex<Option<Directory>>,
}

impl CacheLayer {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_ENTRIES, clock)
    }

    /// Caches holding at most `max_entries` each
    pub fn with_capacity(ttl: Duration, max_entries: u64, clock: SharedClock) -> Self {
        Self {
            ttl,
            podcasts: TtlCache::with_capacity(ttl, max_entries, clock.clone()),
            episodes: TtlCache::with_capacity(ttl, max_entries, clock.clone()),
            details: TtlCache::with_capacity(ttl, max_entries, clock.clone()),
            directory: Mutex::new(None),
            clock,
        }
    }

    pub fn with_default_ttl(clock: SharedClock) -> Self {
        Self::new(Duration::seconds(DEFAULT_TTL_SECS), clock)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Copy of the cached directory, current or not
    pub fn directory(&self) -> Option<Directory> {
        self.directory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn store_directory(&self, directory: Directory) {
        *self.directory.lock().unwrap_or_else(|e| e.into_inner()) = Some(directory);
    }

    /// Drop every cached page of a podcast's episode list
    pub fn forget_episode_pages(&self, podcast_id: &str) {
        self.episodes
            .invalidate_where(|key| key.podcast_id == podcast_id);
    }
}
