//! Read cache for forge responses
//!
//! Segmented by object kind so each segment carries its own TTL:
//! issues age out quickly, team membership and repository lists are
//! close to static. Every segment is LRU-bounded so a long-running
//! coordinator cannot grow without limit. Writes to the forge must
//! invalidate the touched issue explicitly.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::types::{Issue, Repository, TeamMember};

/// Maximum entries per cache segment
const SEGMENT_CAPACITY: usize = 512;

/// Per-segment time-to-live settings
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    /// Issue reads
    pub issues: Duration,
    /// Team membership reads
    pub teams: Duration,
    /// Repository list reads
    pub repositories: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            issues: Duration::from_secs(5 * 60),
            teams: Duration::from_secs(15 * 60),
            repositories: Duration::from_secs(30 * 60),
        }
    }
}

struct Entry<V> {
    inserted: Instant,
    value: V,
}

struct Segment<K: std::hash::Hash + Eq, V> {
    entries: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K: std::hash::Hash + Eq, V: Clone> Segment<K, V> {
    fn new(ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(SEGMENT_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: K, value: V) {
        self.entries.lock().put(
            key,
            Entry {
                inserted: Instant::now(),
                value,
            },
        );
    }

    fn invalidate(&self, key: &K) {
        self.entries.lock().pop(key);
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Reads served from cache
    pub hits: u64,
    /// Reads that went to the forge
    pub misses: u64,
    /// Entries currently cached across all segments
    pub entries: usize,
}

/// Segmented forge read cache
pub struct ForgeCache {
    issues: Segment<u64, Issue>,
    teams: Segment<String, Vec<TeamMember>>,
    repositories: Segment<String, Vec<Repository>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ForgeCache {
    /// Create a cache with the default TTLs
    pub fn new() -> Self {
        Self::with_ttls(CacheTtls::default())
    }

    /// Create a cache with explicit TTLs
    pub fn with_ttls(ttls: CacheTtls) -> Self {
        Self {
            issues: Segment::new(ttls.issues),
            teams: Segment::new(ttls.teams),
            repositories: Segment::new(ttls.repositories),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached issue, if fresh
    pub fn get_issue(&self, number: u64) -> Option<Issue> {
        self.count(self.issues.get(&number))
    }

    /// Cache an issue read
    pub fn put_issue(&self, issue: Issue) {
        self.issues.put(issue.number, issue);
    }

    /// Drop a cached issue after a write touched it
    pub fn invalidate_issue(&self, number: u64) {
        self.issues.invalidate(&number);
    }

    /// Cached team membership, if fresh
    pub fn get_team_members(&self, team: &str) -> Option<Vec<TeamMember>> {
        self.count(self.teams.get(&team.to_string()))
    }

    /// Cache a team membership read
    pub fn put_team_members(&self, team: &str, members: Vec<TeamMember>) {
        self.teams.put(team.to_string(), members);
    }

    /// Cached team repositories, if fresh
    pub fn get_team_repositories(&self, team: &str) -> Option<Vec<Repository>> {
        self.count(self.repositories.get(&team.to_string()))
    }

    /// Cache a team repository read
    pub fn put_team_repositories(&self, team: &str, repos: Vec<Repository>) {
        self.repositories.put(team.to_string(), repos);
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.issues.len() + self.teams.len() + self.repositories.len(),
        }
    }

    fn count<V>(&self, hit: Option<V>) -> Option<V> {
        match hit {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

impl Default for ForgeCache {
    fn default() -> Self {
        Self::new()
    }
}
