//! Resource manager: lazy loading, caching and pooling of animation resources.
//!
//! - Loads run on `Workers`; callers race the result against a timeout
//! - Concurrent loads of one id share a single loader call
//! - Cache bounded by entry count, evicting the lowest `CacheEntry::eviction_score`
//!   (CRITICAL entries excluded, ties go to the least recently used)
//! - Memory pressure (periodic, or after the page stays hidden) triggers
//!   aggressive cleanup of every non-CRITICAL entry and every free pooled instance
//!
//! Teardown hooks run after the cache lock is released.

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use log::{debug, info, trace, warn};
use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::core::event_bus::EventBus;
use crate::core::events::MemoryPressure;
use crate::core::instance_pool::{InstanceFactory, InstancePool, PoolConfig, PoolStats, PooledInstance};
use crate::core::perf_monitor::PerformanceMonitor;
use crate::core::workers::Workers;
use crate::entities::{CacheEntry, Priority, ResourceError, ResourceKind, ResourcePayload, Teardown};
use crate::utils::format_mb;

pub type LoadResult = Result<Arc<ResourcePayload>, ResourceError>;

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub priority: Priority,
    /// Store the result on success.
    pub cache: bool,
    /// `None` uses the manager's default.
    pub timeout: Option<Duration>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            cache: true,
            timeout: None,
        }
    }
}

impl LoadOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub max_entries: usize,
    pub load_timeout: Duration,
    pub pool: PoolConfig,
    /// Usage fraction above which aggressive cleanup runs.
    pub memory_pressure_ratio: f64,
    pub memory_check_interval: Duration,
    pub hidden_cleanup_after: Duration,
    /// 0 = derive from core count.
    pub loader_threads: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_entries: 50,
            load_timeout: Duration::from_secs(10),
            pool: PoolConfig::default(),
            memory_pressure_ratio: 0.8,
            memory_check_interval: Duration::from_secs(30),
            hidden_cleanup_after: Duration::from_secs(5),
            loader_threads: 0,
        }
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    load_failures: AtomicU64,
    timeouts: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub load_failures: u64,
    pub timeouts: u64,
    pub inflight: usize,
    pub pool: PoolStats,
}

/// One running loader and the callers waiting on it.
struct InFlight {
    generation: u64,
    waiters: Vec<Sender<LoadResult>>,
}

/// Outcome of `start_load`.
enum LoadStart {
    Hit(Arc<ResourcePayload>),
    Pending(u64),
}

struct CacheState {
    /// Most recently used first.
    entries: LruCache<String, CacheEntry>,
    /// Current load per id.
    inflight: HashMap<String, InFlight>,
    /// Waiters of timed-out loads, by generation. Served if the loader ever returns.
    abandoned: HashMap<u64, Vec<Sender<LoadResult>>>,
    bytes: usize,
    hidden_since: Option<Instant>,
    hidden_checked: bool,
    last_memory_check: Instant,
}

struct CacheCore {
    state: Mutex<CacheState>,
    stats: CacheStats,
    next_generation: AtomicU64,
    max_entries: usize,
}

impl CacheCore {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lowest-scoring evictable entry; iterating oldest first keeps the LRU one on ties.
    fn pick_victim(state: &CacheState, now: Instant) -> Option<String> {
        let mut best: Option<(&String, f64)> = None;
        for (id, entry) in state.entries.iter().rev() {
            if !entry.is_evictable() {
                continue;
            }
            let score = entry.eviction_score(now);
            if best.is_none_or(|(_, s)| score < s) {
                best = Some((id, score));
            }
        }
        best.map(|(id, _)| id.clone())
    }

    /// Insert, evicting until there is room. Returns payloads to tear down.
    fn insert(&self, state: &mut CacheState, entry: CacheEntry) -> Vec<Arc<ResourcePayload>> {
        let mut doomed = Vec::new();
        if let Some(old) = state.entries.pop(&entry.id) {
            state.bytes = state.bytes.saturating_sub(old.size);
            if !Arc::ptr_eq(&old.data, &entry.data) {
                doomed.push(old.data);
            }
        }

        let now = Instant::now();
        while state.entries.len() >= self.max_entries {
            let Some(victim) = Self::pick_victim(state, now) else {
                warn!(
                    "Cache full with {} critical entries, growing past {}",
                    state.entries.len(),
                    self.max_entries
                );
                break;
            };
            if let Some(evicted) = state.entries.pop(&victim) {
                debug!("Evict '{}' ({}, score {:.2})", victim, evicted.kind, evicted.eviction_score(now));
                state.bytes = state.bytes.saturating_sub(evicted.size);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                doomed.push(evicted.data);
            }
        }

        state.bytes += entry.size;
        state.entries.put(entry.id.clone(), entry);
        doomed
    }

    /// Detach a timed-out load so the next caller starts a fresh loader.
    fn abandon(&self, id: &str, generation: u64) {
        let mut state = self.lock();
        if state.inflight.get(id).is_some_and(|f| f.generation == generation) {
            if let Some(flight) = state.inflight.remove(id) {
                state.abandoned.insert(generation, flight.waiters);
            }
            debug!("Abandoned load '{}' (generation {})", id, generation);
        }
    }

    /// Deliver a finished load to every waiter, caching it if asked.
    ///
    /// A late result from an abandoned load is still cached, unless a newer
    /// load of the same id is running or already cached.
    fn finish(&self, id: &str, generation: u64, result: LoadResult, cache: bool, priority: Priority) {
        let (waiters, doomed) = {
            let mut state = self.lock();
            let current = state.inflight.get(id).is_some_and(|f| f.generation == generation);
            let (waiters, store) = if current {
                let waiters = state.inflight.remove(id).map(|f| f.waiters).unwrap_or_default();
                (waiters, cache)
            } else {
                let waiters = state.abandoned.remove(&generation).unwrap_or_default();
                let superseded = state.inflight.contains_key(id) || state.entries.contains(id);
                if superseded {
                    trace!("Dropping late result for '{}' (generation {})", id, generation);
                }
                (waiters, cache && !superseded)
            };
            let doomed = match &result {
                Ok(data) if store => self.insert(&mut state, CacheEntry::new(id.to_string(), Arc::clone(data), priority)),
                _ => Vec::new(),
            };
            (waiters, doomed)
        };

        for payload in doomed {
            payload.teardown();
        }
        if let Err(e) = &result {
            self.stats.load_failures.fetch_add(1, Ordering::Relaxed);
            warn!("{}", e);
        }
        trace!("Load '{}' finished, {} waiter(s)", id, waiters.len());
        for tx in waiters {
            // Waiters that timed out have dropped their receiver
            let _ = tx.send(result.clone());
        }
    }
}

pub struct ResourceManager {
    core: Arc<CacheCore>,
    workers: Workers,
    pool: InstancePool,
    monitor: Arc<PerformanceMonitor>,
    bus: Option<EventBus>,
    config: ResourceConfig,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig, monitor: Arc<PerformanceMonitor>, bus: Option<EventBus>) -> Self {
        let threads = if config.loader_threads == 0 {
            num_cpus::get().clamp(2, 4)
        } else {
            config.loader_threads
        };
        info!(
            "ResourceManager init: max_entries={}, pool_max={}, loaders={}",
            config.max_entries, config.pool.max_instances, threads
        );

        Self {
            core: Arc::new(CacheCore {
                state: Mutex::new(CacheState {
                    entries: LruCache::unbounded(),
                    inflight: HashMap::new(),
                    abandoned: HashMap::new(),
                    bytes: 0,
                    hidden_since: None,
                    hidden_checked: false,
                    last_memory_check: Instant::now(),
                }),
                stats: CacheStats::default(),
                next_generation: AtomicU64::new(0),
                max_entries: config.max_entries.max(1),
            }),
            workers: Workers::new(threads, "choreo-loader"),
            pool: InstancePool::new(config.pool.clone()),
            monitor,
            bus,
            config,
        }
    }

    /// Load `id`, returning the cached payload on a hit.
    ///
    /// Blocks until the loader settles or the timeout passes. A timed-out load
    /// is abandoned: it keeps running in the background, but the next call for
    /// `id` starts its own loader instead of joining it.
    pub fn load_resource<F>(
        &self,
        id: &str,
        kind: ResourceKind,
        loader: F,
        options: LoadOptions,
    ) -> Result<Arc<ResourcePayload>, ResourceError>
    where
        F: FnOnce() -> anyhow::Result<ResourcePayload> + Send + 'static,
    {
        let timeout = options.timeout.unwrap_or(self.config.load_timeout);
        let (tx, rx) = bounded(1);
        let generation = match self.start_load(id, kind, loader, &options, Some(tx)) {
            LoadStart::Hit(hit) => return Ok(hit),
            LoadStart::Pending(generation) => generation,
        };

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.core.abandon(id, generation);
                self.core.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("Loading '{}' timed out after {} ms", id, timeout.as_millis());
                Err(ResourceError::Timeout {
                    id: id.to_string(),
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(ResourceError::Shutdown),
        }
    }

    /// Fire-and-forget load into the cache. Failures are only logged.
    pub fn preload<F>(&self, id: &str, kind: ResourceKind, loader: F, priority: Priority)
    where
        F: FnOnce() -> anyhow::Result<ResourcePayload> + Send + 'static,
    {
        let options = LoadOptions::with_priority(priority);
        if let LoadStart::Pending(generation) = self.start_load(id, kind, loader, &options, None) {
            trace!("Preload '{}' queued (generation {})", id, generation);
        }
    }

    /// Hit: return the payload. Miss: join or start the in-flight load.
    fn start_load<F>(
        &self,
        id: &str,
        kind: ResourceKind,
        loader: F,
        options: &LoadOptions,
        waiter: Option<Sender<LoadResult>>,
    ) -> LoadStart
    where
        F: FnOnce() -> anyhow::Result<ResourcePayload> + Send + 'static,
    {
        let generation;
        {
            let mut state = self.core.lock();
            if let Some(entry) = state.entries.get_mut(id) {
                entry.touch(Instant::now());
                self.core.stats.record_hit();
                return LoadStart::Hit(Arc::clone(&entry.data));
            }
            self.core.stats.record_miss();

            if let Some(flight) = state.inflight.get_mut(id) {
                trace!("Joining in-flight load '{}'", id);
                flight.waiters.extend(waiter);
                return LoadStart::Pending(flight.generation);
            }
            generation = self.core.next_generation.fetch_add(1, Ordering::Relaxed);
            state.inflight.insert(
                id.to_string(),
                InFlight {
                    generation,
                    waiters: waiter.into_iter().collect(),
                },
            );
        }

        let core = Arc::clone(&self.core);
        let id = id.to_string();
        let cache = options.cache;
        let priority = options.priority;
        debug!("Loading '{}' ({})", id, kind);

        self.workers.execute(move || {
            let result = match catch_unwind(AssertUnwindSafe(loader)) {
                Ok(Ok(payload)) if payload.kind() == kind => Ok(Arc::new(payload)),
                Ok(Ok(payload)) => Err(ResourceError::Load {
                    id: id.clone(),
                    reason: format!("expected {}, loader produced {}", kind, payload.kind()),
                }),
                Ok(Err(e)) => Err(ResourceError::Load {
                    id: id.clone(),
                    reason: format!("{:#}", e),
                }),
                Err(_) => Err(ResourceError::Load {
                    id: id.clone(),
                    reason: "loader panicked".into(),
                }),
            };
            core.finish(&id, generation, result, cache, priority);
        });
        LoadStart::Pending(generation)
    }

    /// Cached payload, counted as a use.
    pub fn get_cached(&self, id: &str) -> Option<Arc<ResourcePayload>> {
        let mut state = self.core.lock();
        let entry = state.entries.get_mut(id)?;
        entry.touch(Instant::now());
        self.core.stats.record_hit();
        Some(Arc::clone(&entry.data))
    }

    /// Presence check without touching usage stats.
    pub fn contains(&self, id: &str) -> bool {
        self.core.lock().entries.contains(id)
    }

    pub fn is_loading(&self, id: &str) -> bool {
        self.core.lock().inflight.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.core.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove one entry regardless of priority.
    pub fn evict(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.core.lock();
            let removed = state.entries.pop(id);
            if let Some(entry) = &removed {
                state.bytes = state.bytes.saturating_sub(entry.size);
            }
            removed
        };
        match removed {
            Some(entry) => {
                entry.data.teardown();
                true
            }
            None => false,
        }
    }

    /// Remove every entry, CRITICAL included.
    pub fn clear(&self) {
        let doomed: Vec<CacheEntry> = {
            let mut state = self.core.lock();
            state.bytes = 0;
            let mut doomed = Vec::with_capacity(state.entries.len());
            while let Some((_, entry)) = state.entries.pop_lru() {
                doomed.push(entry);
            }
            doomed
        };
        for entry in &doomed {
            entry.data.teardown();
        }
        debug!("Cache cleared ({} entries)", doomed.len());
    }

    /// Evict every non-CRITICAL entry, tear down free pooled instances and
    /// flush the deferred-teardown list. Returns how many items were destroyed.
    pub fn aggressive_cleanup(&self) -> usize {
        let doomed: Vec<CacheEntry> = {
            let mut state = self.core.lock();
            let ids: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.is_evictable())
                .map(|(id, _)| id.clone())
                .collect();
            let doomed: Vec<CacheEntry> = ids.iter().filter_map(|id| state.entries.pop(id)).collect();
            let freed: usize = doomed.iter().map(|e| e.size).sum();
            state.bytes = state.bytes.saturating_sub(freed);
            doomed
        };
        self.core
            .stats
            .evictions
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        for entry in &doomed {
            entry.data.teardown();
        }
        let pooled = self.pool.aggressive_cleanup();
        info!(
            "Aggressive cleanup: {} cache entries, {} pooled instances",
            doomed.len(),
            pooled
        );
        doomed.len() + pooled
    }

    /// Sample memory; above the pressure ratio, run aggressive cleanup.
    pub fn check_memory_pressure(&self) -> bool {
        self.core.lock().last_memory_check = Instant::now();
        let Some(info) = self.monitor.sample_memory() else {
            return false;
        };
        let usage = info.usage_fraction();
        if usage <= self.config.memory_pressure_ratio {
            trace!("Memory {:.0}% of {}", usage * 100.0, format_mb(info.limit));
            return false;
        }

        warn!(
            "Memory pressure: {} of {} ({:.0}%)",
            format_mb(info.used),
            format_mb(info.limit),
            usage * 100.0
        );
        if let Some(bus) = &self.bus {
            bus.emit(MemoryPressure { usage_fraction: usage });
        }
        self.aggressive_cleanup();
        true
    }

    pub fn set_page_visible(&self, visible: bool) {
        let mut state = self.core.lock();
        if visible {
            state.hidden_since = None;
        } else if state.hidden_since.is_none() {
            state.hidden_since = Some(Instant::now());
            state.hidden_checked = false;
        }
    }

    /// Maintenance: deferred pool teardown, periodic memory check, hidden-page check.
    pub fn tick(&self, now: Instant) {
        self.pool.sweep(now);

        let (periodic, hidden) = {
            let mut state = self.core.lock();
            let periodic = now.saturating_duration_since(state.last_memory_check) >= self.config.memory_check_interval;
            let hidden = match state.hidden_since {
                Some(since)
                    if !state.hidden_checked
                        && now.saturating_duration_since(since) >= self.config.hidden_cleanup_after =>
                {
                    state.hidden_checked = true;
                    true
                }
                _ => false,
            };
            (periodic, hidden)
        };

        if hidden {
            debug!("Page hidden for {:?}, checking memory", self.config.hidden_cleanup_after);
        }
        if periodic || hidden {
            self.check_memory_pressure();
        }
    }

    // --- Instance pool ---

    pub fn register_instance_factory(&self, kind: ResourceKind, factory: InstanceFactory) {
        self.pool.register_factory(kind, factory);
    }

    pub fn get_animation_instance(&self, kind: ResourceKind, config: &Value) -> Result<PooledInstance, ResourceError> {
        self.pool.get(kind, config)
    }

    pub fn release_animation_instance(&self, instance: &PooledInstance) -> bool {
        self.pool.release(instance)
    }

    pub fn stats(&self) -> ResourceStats {
        let (entries, bytes, inflight) = {
            let state = self.core.lock();
            (state.entries.len(), state.bytes, state.inflight.len())
        };
        let stats = &self.core.stats;
        ResourceStats {
            entries,
            bytes,
            hits: stats.hits(),
            misses: stats.misses(),
            hit_rate: stats.hit_rate(),
            evictions: stats.evictions.load(Ordering::Relaxed),
            load_failures: stats.load_failures.load(Ordering::Relaxed),
            timeouts: stats.timeouts.load(Ordering::Relaxed),
            inflight,
            pool: self.pool.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_bus::downcast_event;
    use crate::core::perf_monitor::MonitorConfig;
    use crate::entities::{AssetData, DeviceInfo, PresetData};
    use crate::headless::FixedMemory;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    fn manager_with(config: ResourceConfig, memory: Arc<FixedMemory>, bus: Option<EventBus>) -> ResourceManager {
        let device = DeviceInfo {
            cores: 4,
            memory_bytes: 8 << 30,
        };
        let monitor = Arc::new(PerformanceMonitor::new(memory, device, MonitorConfig::default(), None));
        ResourceManager::new(config, monitor, bus)
    }

    fn manager(max_entries: usize) -> ResourceManager {
        manager_with(
            ResourceConfig {
                max_entries,
                ..Default::default()
            },
            Arc::new(FixedMemory::new(10, 100)),
            None,
        )
    }

    fn preset(name: &str) -> anyhow::Result<ResourcePayload> {
        Ok(ResourcePayload::Preset(PresetData {
            name: name.to_string(),
            config: json!({ "data": name }),
        }))
    }

    fn load(m: &ResourceManager, id: &str, priority: Priority) -> Arc<ResourcePayload> {
        let name = id.to_string();
        m.load_resource(id, ResourceKind::Preset, move || preset(&name), LoadOptions::with_priority(priority))
            .unwrap()
    }

    #[test]
    fn test_hit_returns_cached() {
        let m = manager(10);
        let a = load(&m, "a", Priority::Normal);
        let b = m
            .load_resource("a", ResourceKind::Preset, || panic!("must not reload"), LoadOptions::default())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let stats = m.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_concurrent_loads_share_one_loader() {
        let m = Arc::new(manager(10));
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let m = Arc::clone(&m);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    m.load_resource(
                        "shared",
                        ResourceKind::Preset,
                        move || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            preset("x")
                        },
                        LoadOptions::default(),
                    )
                    .unwrap()
                })
            })
            .collect();

        let results: Vec<Arc<ResourcePayload>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(Arc::ptr_eq(&results[0], &results[1]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results[0].preset_config(), Some(&json!({ "data": "x" })));
    }

    #[test]
    fn test_full_cache_evicts_lowest_score() {
        let m = manager(3);
        load(&m, "a", Priority::High);
        load(&m, "b", Priority::Normal);
        load(&m, "c", Priority::Normal);
        // b: 1 + 1/2 = 1.5, c: 1 + 1/1 = 2.0, a: 2 + 1 = 3.0
        m.get_cached("b");

        load(&m, "d", Priority::Normal);
        assert_eq!(m.len(), 3);
        assert!(!m.contains("b"));
        assert!(m.contains("a") && m.contains("c") && m.contains("d"));
        assert_eq!(m.stats().evictions, 1);
    }

    #[test]
    fn test_critical_never_evicted() {
        let m = manager(2);
        load(&m, "keep", Priority::Critical);
        load(&m, "low", Priority::Low);
        load(&m, "next", Priority::Normal);
        assert!(m.contains("keep"));
        assert!(!m.contains("low"));

        // Only critical entries left to choose from: grow instead
        let m = manager(1);
        load(&m, "c1", Priority::Critical);
        load(&m, "c2", Priority::Critical);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn test_timeout() {
        let m = manager(10);
        let result = m.load_resource(
            "slow",
            ResourceKind::Preset,
            || {
                thread::sleep(Duration::from_millis(200));
                preset("slow")
            },
            LoadOptions {
                timeout: Some(Duration::from_millis(30)),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ResourceError::Timeout { .. })));
        assert_eq!(m.stats().timeouts, 1);
    }

    #[test]
    fn test_load_after_timeout_runs_own_loader() {
        let m = manager(10);
        let slow = m.load_resource(
            "x",
            ResourceKind::Preset,
            || {
                thread::sleep(Duration::from_millis(300));
                preset("stale")
            },
            LoadOptions {
                timeout: Some(Duration::from_millis(30)),
                ..Default::default()
            },
        );
        assert!(matches!(slow, Err(ResourceError::Timeout { .. })));
        assert!(!m.is_loading("x"));

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let fresh = m
            .load_resource(
                "x",
                ResourceKind::Preset,
                move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    preset("fresh")
                },
                LoadOptions {
                    timeout: Some(Duration::from_millis(200)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fresh.preset_config(), Some(&json!({ "data": "fresh" })));

        // The abandoned loader's late result must not replace the fresh entry
        thread::sleep(Duration::from_millis(400));
        let cached = m.get_cached("x").unwrap();
        assert_eq!(cached.preset_config(), Some(&json!({ "data": "fresh" })));
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let m = manager(10);
        let err = m
            .load_resource(
                "bad",
                ResourceKind::Preset,
                || Err(anyhow::anyhow!("network down")),
                LoadOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(&err, ResourceError::Load { reason, .. } if reason.contains("network down")));
        assert!(!m.contains("bad"));
        assert!(!m.is_loading("bad"));
        assert!(m.load_resource("bad", ResourceKind::Preset, || preset("bad"), LoadOptions::default()).is_ok());
    }

    #[test]
    fn test_panicking_loader_reports_error() {
        let m = manager(10);
        let err = m
            .load_resource("boom", ResourceKind::Preset, || panic!("loader bug"), LoadOptions::default())
            .unwrap_err();
        assert!(matches!(err, ResourceError::Load { .. }));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let m = manager(10);
        let err = m
            .load_resource("p", ResourceKind::Asset, || preset("p"), LoadOptions::default())
            .unwrap_err();
        assert!(matches!(&err, ResourceError::Load { reason, .. } if reason.contains("asset")));
    }

    #[test]
    fn test_uncached_load() {
        let m = manager(10);
        let options = LoadOptions {
            cache: false,
            ..Default::default()
        };
        assert!(m.load_resource("once", ResourceKind::Preset, || preset("once"), options).is_ok());
        assert!(!m.contains("once"));
    }

    #[test]
    fn test_preload_fills_cache() {
        let m = manager(10);
        m.preload("warm", ResourceKind::Preset, || preset("warm"), Priority::Low);
        let deadline = Instant::now() + Duration::from_secs(1);
        while !m.contains("warm") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(m.contains("warm"));
    }

    #[test]
    fn test_evict_runs_teardown() {
        let m = manager(10);
        let disposed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disposed);
        m.load_resource(
            "sprite",
            ResourceKind::Asset,
            move || {
                Ok(ResourcePayload::Asset(AssetData {
                    name: "sprite".into(),
                    bytes: Arc::from(vec![0u8; 16]),
                    dispose: Some(Arc::new(move || flag.store(true, Ordering::SeqCst))),
                }))
            },
            LoadOptions::default(),
        )
        .unwrap();
        assert!(m.evict("sprite"));
        assert!(disposed.load(Ordering::SeqCst));
        assert_eq!(m.stats().bytes, 0);
    }

    #[test]
    fn test_memory_pressure_cleans_non_critical() {
        let memory = Arc::new(FixedMemory::new(90, 100));
        let bus = EventBus::new();
        let m = manager_with(ResourceConfig::default(), memory, Some(bus.clone()));
        load(&m, "core", Priority::Critical);
        load(&m, "extra", Priority::Normal);

        assert!(m.check_memory_pressure());
        assert!(m.contains("core"));
        assert!(!m.contains("extra"));

        let events = bus.poll();
        assert!(events.iter().any(|e| downcast_event::<MemoryPressure>(e).is_some()));
    }

    #[test]
    fn test_hidden_page_triggers_check() {
        let memory = Arc::new(FixedMemory::new(90, 100));
        let m = manager_with(ResourceConfig::default(), memory, None);
        load(&m, "extra", Priority::Normal);

        m.set_page_visible(false);
        m.tick(Instant::now() + Duration::from_secs(1));
        assert!(m.contains("extra"));

        m.tick(Instant::now() + Duration::from_secs(6));
        assert!(!m.contains("extra"));
    }

    #[test]
    fn test_pool_through_manager() {
        let m = manager(10);
        m.register_instance_factory(
            ResourceKind::Preset,
            Arc::new(|config| {
                Ok(ResourcePayload::Preset(PresetData {
                    name: "pooled".into(),
                    config: config.clone(),
                }))
            }),
        );
        let cfg = json!({ "stagger": 0.1 });
        let a = m.get_animation_instance(ResourceKind::Preset, &cfg).unwrap();
        assert!(m.release_animation_instance(&a));
        let b = m.get_animation_instance(ResourceKind::Preset, &cfg).unwrap();
        assert_eq!(a.id, b.id);

        m.release_animation_instance(&b);
        assert_eq!(m.aggressive_cleanup(), 1);
        assert_eq!(m.stats().pool.total, 0);
    }
}
