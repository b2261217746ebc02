use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. A pre-epoch clock reads as 0.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One request in a key's sliding-window ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub timestamp_ms: u64,
    /// Whether the request was admitted
    pub success: bool,
}

/// Per-key window state. Created lazily on a key's first request.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    /// Sliding-window ledger, oldest first, pruned on every update
    pub requests: Vec<RequestRecord>,
    /// Once `now` passes this, the entry is eligible for expiry
    pub reset_time_ms: u64,
    /// Last touch, drives LRU eviction
    pub last_seen_ms: u64,
}

impl WindowEntry {
    pub fn new(now_ms: u64, window_ms: u64) -> Self {
        Self {
            requests: Vec::new(),
            reset_time_ms: now_ms + window_ms,
            last_seen_ms: now_ms,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.reset_time_ms
    }

    /// Drop ledger entries older than the window start. Stale entries are
    /// removed, not merely ignored, to bound memory.
    pub fn prune(&mut self, window_start_ms: u64) {
        self.requests.retain(|r| r.timestamp_ms >= window_start_ms);
    }
}

/// Internal store fault. Callers of `get`/`set` never see it; `apply`
/// surfaces it so the middleware's fail-open path stays honest.
#[derive(Debug)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window store fault: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// In-memory window store, shared by every request handler.
///
/// Backed by a sharded concurrent map; `apply` holds the shard lock for the
/// duration of a per-key read-modify-write, which is what makes concurrent
/// decisions for the same key linearizable. Distinct keys never contend
/// beyond shard granularity.
pub struct WindowStore {
    entries: DashMap<String, WindowEntry>,
    /// LRU cap on distinct keys; protects against random-key floods that
    /// time-based expiry alone cannot bound
    max_keys: usize,
    #[cfg(test)]
    faulty: std::sync::atomic::AtomicBool,
}

impl WindowStore {
    pub fn new(max_keys: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_keys,
            #[cfg(test)]
            faulty: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Look up a key, expiring it lazily if its reset time has passed.
    /// Internal faults degrade to a miss.
    pub fn get(&self, key: &str, now_ms: u64) -> Option<WindowEntry> {
        if self.is_faulty() {
            tracing::warn!(key = %key, "Store fault on get, treating as miss");
            return None;
        }

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now_ms) {
                return Some(entry.clone());
            }
        }

        // Expiry is re-checked under the shard write lock: a concurrent
        // `apply` may have reinstalled a fresh entry, which must survive.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now_ms));
        None
    }

    /// Insert or replace an entry. Internal faults drop the write.
    pub fn set(&self, key: &str, entry: WindowEntry) {
        if self.is_faulty() {
            tracing::warn!(key = %key, "Store fault on set, dropping write");
            return;
        }
        self.entries.insert(key.to_string(), entry);
        self.enforce_key_cap();
    }

    /// Run a read-modify-write against one key's entry under its shard
    /// lock. An expired entry is replaced with a fresh one before `f` runs.
    pub fn apply<T>(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        f: impl FnOnce(&mut WindowEntry) -> T,
    ) -> Result<T, StoreError> {
        if self.is_faulty() {
            return Err(StoreError("injected fault".to_string()));
        }

        let result = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| WindowEntry::new(now_ms, window_ms));
            if entry.is_expired(now_ms) {
                *entry = WindowEntry::new(now_ms, window_ms);
            }
            entry.last_seen_ms = now_ms;
            f(&mut entry)
        };

        self.enforce_key_cap();
        Ok(result)
    }

    /// Remove every expired entry. Run on an interval by the background
    /// sweeper; lazy expiry on read remains the authoritative check.
    pub fn sweep(&self, now_ms: u64) -> usize {
        // Counted inside the retain closure: a before/after length diff is
        // wrong (and can underflow) when writers insert keys mid-sweep.
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_expired(now_ms) {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            tracing::debug!(
                removed = removed,
                live = self.entries.len(),
                "Swept expired window entries"
            );
        }

        removed
    }

    /// Number of live keys
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Drop one key's history entirely
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Evict least-recently-seen entries once the key cap is exceeded
    fn enforce_key_cap(&self) {
        let excess = self.entries.len().saturating_sub(self.max_keys);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().last_seen_ms))
            .collect();
        by_age.sort_by_key(|(_, last_seen)| *last_seen);

        for (key, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }

        tracing::warn!(
            evicted = excess,
            max_keys = self.max_keys,
            "Key cap exceeded, evicted least-recently-used entries"
        );
    }

    #[cfg(test)]
    pub(crate) fn set_faulty(&self, faulty: bool) {
        self.faulty
            .store(faulty, std::sync::atomic::Ordering::SeqCst);
    }

    fn is_faulty(&self) -> bool {
        #[cfg(test)]
        {
            self.faulty.load(std::sync::atomic::Ordering::SeqCst)
        }
        #[cfg(not(test))]
        {
            false
        }
    }
}

/// Spawn the background sweep task. Idle keys would otherwise hold memory
/// until their next read; correctness never depends on this task, so it is
/// safe to abort at shutdown.
pub fn spawn_sweeper(
    store: Arc<WindowStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            store.sweep(now_millis());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_miss_for_unknown_key() {
        let store = WindowStore::new(100);
        assert!(store.get("nobody", 1_000).is_none());
    }

    #[test]
    fn test_set_then_get() {
        let store = WindowStore::new(100);
        store.set("k", WindowEntry::new(1_000, 60_000));

        let entry = store.get("k", 2_000).unwrap();
        assert_eq!(entry.reset_time_ms, 61_000);
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_lazy_expiry_on_read() {
        let store = WindowStore::new(100);
        store.set("k", WindowEntry::new(1_000, 60_000));

        // Past the reset time the entry reads as absent and is dropped.
        assert!(store.get("k", 61_001).is_none());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_apply_creates_entry_lazily() {
        let store = WindowStore::new(100);
        let len = store
            .apply("k", 1_000, 60_000, |entry| {
                entry.requests.push(RequestRecord {
                    timestamp_ms: 1_000,
                    success: true,
                });
                entry.requests.len()
            })
            .unwrap();

        assert_eq!(len, 1);
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_apply_resets_expired_entry() {
        let store = WindowStore::new(100);
        store
            .apply("k", 1_000, 60_000, |entry| {
                entry.requests.push(RequestRecord {
                    timestamp_ms: 1_000,
                    success: true,
                });
            })
            .unwrap();

        // Well past reset: history must not survive into the new window.
        let len = store
            .apply("k", 200_000, 60_000, |entry| entry.requests.len())
            .unwrap();
        assert_eq!(len, 0);
    }

    #[test]
    fn test_sweep_removes_expired_entries() {
        let store = WindowStore::new(100);
        store.set("old", WindowEntry::new(1_000, 10_000));
        store.set("fresh", WindowEntry::new(1_000, 600_000));
        assert_eq!(store.size(), 2);

        let removed = store.sweep(50_000);
        assert_eq!(removed, 1);
        assert_eq!(store.size(), 1);
        assert!(store.get("fresh", 50_000).is_some());
    }

    #[test]
    fn test_sweep_tolerates_concurrent_inserts() {
        let store = Arc::new(WindowStore::new(10_000));
        for i in 0..500 {
            store.set(
                &format!("stale-{}", i),
                WindowEntry {
                    requests: Vec::new(),
                    reset_time_ms: 1,
                    last_seen_ms: 1,
                },
            );
        }

        // Writers may grow the map faster than a sweep shrinks it; the
        // removal count must stay well-defined throughout.
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    store.set(
                        &format!("fresh-{}", i),
                        WindowEntry::new(now_millis(), 600_000),
                    );
                }
            })
        };

        let mut removed = 0;
        for _ in 0..50 {
            removed += store.sweep(now_millis());
        }
        writer.join().unwrap();
        removed += store.sweep(now_millis());

        assert_eq!(removed, 500);
        assert!(store.get("stale-0", now_millis()).is_none());
    }

    #[test]
    fn test_get_keeps_live_entry_when_expiry_not_due() {
        let store = WindowStore::new(100);
        store.set("k", WindowEntry::new(1_000, 9_000));

        // Before the reset time the entry must be returned, not removed.
        assert!(store.get("k", 5_000).is_some());
        assert_eq!(store.size(), 1);

        // Past the reset time the same lookup removes it.
        assert!(store.get("k", 20_000).is_none());
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_key_reusable_after_sweep() {
        let store = WindowStore::new(100);
        store.set("k", WindowEntry::new(1_000, 10_000));
        store.sweep(20_000);

        // The key behaves as brand new afterwards.
        let len = store
            .apply("k", 21_000, 10_000, |entry| entry.requests.len())
            .unwrap();
        assert_eq!(len, 0);
    }

    #[test]
    fn test_lru_eviction_over_cap() {
        let store = WindowStore::new(2);

        store.apply("a", 1_000, 600_000, |_| ()).unwrap();
        store.apply("b", 2_000, 600_000, |_| ()).unwrap();
        store.apply("c", 3_000, 600_000, |_| ()).unwrap();

        assert_eq!(store.size(), 2);
        // "a" was seen least recently and must be the one evicted.
        assert!(store.get("a", 4_000).is_none());
        assert!(store.get("b", 4_000).is_some());
        assert!(store.get("c", 4_000).is_some());
    }

    #[test]
    fn test_lru_tracks_recent_touch() {
        let store = WindowStore::new(2);

        store.apply("a", 1_000, 600_000, |_| ()).unwrap();
        store.apply("b", 2_000, 600_000, |_| ()).unwrap();
        // Touch "a" so "b" becomes the eviction candidate.
        store.apply("a", 3_000, 600_000, |_| ()).unwrap();
        store.apply("c", 4_000, 600_000, |_| ()).unwrap();

        assert!(store.get("a", 5_000).is_some());
        assert!(store.get("b", 5_000).is_none());
        assert!(store.get("c", 5_000).is_some());
    }

    #[test]
    fn test_remove() {
        let store = WindowStore::new(100);
        store.set("k", WindowEntry::new(1_000, 60_000));

        assert!(store.remove("k"));
        assert!(!store.remove("k"));
        assert_eq!(store.size(), 0);
    }

    #[test]
    fn test_faulty_store_degrades_to_miss() {
        let store = WindowStore::new(100);
        store.set("k", WindowEntry::new(1_000, 60_000));
        store.set_faulty(true);

        assert!(store.get("k", 2_000).is_none());
        assert!(store.apply("k", 2_000, 60_000, |_| ()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_evicts_expired_entries() {
        let store = Arc::new(WindowStore::new(100));
        // Entry whose reset time is already in the (wall clock) past.
        store.set(
            "stale",
            WindowEntry {
                requests: Vec::new(),
                reset_time_ms: 1,
                last_seen_ms: 1,
            },
        );

        let sweeper = spawn_sweeper(store.clone(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(store.size(), 0);
        sweeper.abort();
    }

    #[test]
    fn test_entry_prune() {
        let mut entry = WindowEntry::new(0, 60_000);
        for t in [1_000, 30_000, 59_000] {
            entry.requests.push(RequestRecord {
                timestamp_ms: t,
                success: true,
            });
        }

        entry.prune(30_000);
        assert_eq!(entry.requests.len(), 2);
        assert_eq!(entry.requests[0].timestamp_ms, 30_000);
    }
}
