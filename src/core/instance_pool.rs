//! Object pool of reusable animation instances keyed by `kind:config`.
//!
//! Released instances stay pooled for a grace window and are torn down by
//! `sweep()` once their deadline passes without reuse. When a signature's pool
//! is full, `get` hands out an unpooled instance that is torn down on release
//! (or fails with `PoolExhausted` when overflow is disabled).

use log::{debug, trace, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::entities::{ResourceError, ResourceKind, ResourcePayload, Teardown};

/// Builds a fresh instance for a config.
pub type InstanceFactory = Arc<dyn Fn(&Value) -> anyhow::Result<ResourcePayload> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Per-signature ceiling.
    pub max_instances: usize,
    pub grace: Duration,
    /// Create unpooled instances when a signature is full.
    pub overflow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 20,
            grace: Duration::from_secs(300),
            overflow: true,
        }
    }
}

/// Instance handed to a caller. Give it back with `release`.
#[derive(Debug, Clone)]
pub struct PooledInstance {
    pub id: u64,
    pub key: String,
    pub payload: Arc<ResourcePayload>,
    pooled: bool,
}

impl PooledInstance {
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }
}

struct Slot {
    id: u64,
    payload: Arc<ResourcePayload>,
    in_use: bool,
}

/// Teardown deadline for a released slot.
struct Deferred {
    due: Instant,
    key: String,
    id: u64,
}

#[derive(Default)]
struct PoolState {
    pools: HashMap<String, Vec<Slot>>,
    deferred: Vec<Deferred>,
    factories: HashMap<ResourceKind, InstanceFactory>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub signatures: usize,
    pub total: usize,
    pub in_use: usize,
    pub deferred: usize,
}

pub fn pool_key(kind: ResourceKind, config: &Value) -> String {
    format!("{}:{}", kind, serde_json::to_string(config).unwrap_or_default())
}

pub struct InstancePool {
    state: Mutex<PoolState>,
    config: PoolConfig,
    next_id: AtomicU64,
}

impl InstancePool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_factory(&self, kind: ResourceKind, factory: InstanceFactory) {
        self.lock().factories.insert(kind, factory);
    }

    /// Reuse a free instance for this signature or build a new one.
    pub fn get(&self, kind: ResourceKind, config: &Value) -> Result<PooledInstance, ResourceError> {
        let key = pool_key(kind, config);

        let factory = {
            let mut state = self.lock();
            let reused = state.pools.get_mut(&key).and_then(|slots| {
                slots.iter_mut().find(|s| !s.in_use).map(|slot| {
                    slot.in_use = true;
                    (slot.id, Arc::clone(&slot.payload))
                })
            });
            if let Some((id, payload)) = reused {
                state.deferred.retain(|d| d.id != id);
                trace!("Pool hit '{}' (#{})", key, id);
                return Ok(PooledInstance {
                    id,
                    key,
                    payload,
                    pooled: true,
                });
            }
            state
                .factories
                .get(&kind)
                .cloned()
                .ok_or(ResourceError::NoFactory(kind))?
        };

        // Build outside the lock; factories may call into the engine
        let payload = Arc::new(factory(config).map_err(|e| ResourceError::Load {
            id: key.clone(),
            reason: format!("{:#}", e),
        })?);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        let slots = state.pools.entry(key.clone()).or_default();
        if slots.len() < self.config.max_instances {
            slots.push(Slot {
                id,
                payload: Arc::clone(&payload),
                in_use: true,
            });
            debug!("Pool '{}' grew to {}", key, slots.len());
            return Ok(PooledInstance {
                id,
                key,
                payload,
                pooled: true,
            });
        }
        drop(state);

        if !self.config.overflow {
            payload.teardown();
            return Err(ResourceError::PoolExhausted { key });
        }
        warn!("Pool '{}' full ({}), handing out unpooled instance", key, self.config.max_instances);
        Ok(PooledInstance {
            id,
            key,
            payload,
            pooled: false,
        })
    }

    /// Return an instance. Pooled ones wait out the grace window; unpooled
    /// ones are torn down now. Returns false for unknown or already-free instances.
    pub fn release(&self, instance: &PooledInstance) -> bool {
        if !instance.pooled {
            instance.payload.teardown();
            return true;
        }

        let mut state = self.lock();
        let Some(slot) = state
            .pools
            .get_mut(&instance.key)
            .and_then(|slots| slots.iter_mut().find(|s| s.id == instance.id))
        else {
            return false;
        };
        if !slot.in_use {
            return false;
        }
        slot.in_use = false;
        state.deferred.push(Deferred {
            due: Instant::now() + self.config.grace,
            key: instance.key.clone(),
            id: instance.id,
        });
        trace!("Pool release '{}' (#{})", instance.key, instance.id);
        true
    }

    /// Tear down released instances whose grace window ended by `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<Arc<ResourcePayload>> = {
            let mut state = self.lock();
            let (due, keep): (Vec<Deferred>, Vec<Deferred>) =
                std::mem::take(&mut state.deferred).into_iter().partition(|d| d.due <= now);
            state.deferred = keep;

            let mut expired = Vec::new();
            for d in due {
                if let Some(slots) = state.pools.get_mut(&d.key) {
                    if let Some(pos) = slots.iter().position(|s| s.id == d.id && !s.in_use) {
                        expired.push(slots.remove(pos).payload);
                    }
                    if slots.is_empty() {
                        state.pools.remove(&d.key);
                    }
                }
            }
            expired
        };

        for payload in &expired {
            payload.teardown();
        }
        if !expired.is_empty() {
            debug!("Pool sweep tore down {} instance(s)", expired.len());
        }
        expired.len()
    }

    /// Tear down every free instance now and flush the deferred list.
    pub fn aggressive_cleanup(&self) -> usize {
        let freed: Vec<Arc<ResourcePayload>> = {
            let mut state = self.lock();
            state.deferred.clear();
            let mut freed = Vec::new();
            for slots in state.pools.values_mut() {
                let (free, busy): (Vec<Slot>, Vec<Slot>) = std::mem::take(slots).into_iter().partition(|s| !s.in_use);
                *slots = busy;
                freed.extend(free.into_iter().map(|s| s.payload));
            }
            state.pools.retain(|_, slots| !slots.is_empty());
            freed
        };
        for payload in &freed {
            payload.teardown();
        }
        freed.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let slots = state.pools.values().flatten();
        let (total, in_use) = slots.fold((0, 0), |(t, u), s| (t + 1, u + s.in_use as usize));
        PoolStats {
            signatures: state.pools.len(),
            total,
            in_use,
            deferred: state.deferred.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::PresetData;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn pool(max: usize, overflow: bool) -> (InstancePool, Arc<AtomicUsize>) {
        let pool = InstancePool::new(PoolConfig {
            max_instances: max,
            grace: Duration::from_secs(300),
            overflow,
        });
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        pool.register_factory(
            ResourceKind::Preset,
            Arc::new(move |config| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ResourcePayload::Preset(PresetData {
                    name: "pooled".into(),
                    config: config.clone(),
                }))
            }),
        );
        (pool, built)
    }

    #[test]
    fn test_key_includes_config() {
        assert_eq!(pool_key(ResourceKind::Tween, &json!({"d": 1})), "tween:{\"d\":1}");
        assert_ne!(
            pool_key(ResourceKind::Tween, &json!({"d": 1})),
            pool_key(ResourceKind::Tween, &json!({"d": 2}))
        );
    }

    #[test]
    fn test_release_then_reuse() {
        let (pool, built) = pool(4, true);
        let cfg = json!({ "ease": "sine" });
        let a = pool.get(ResourceKind::Preset, &cfg).unwrap();
        assert!(pool.release(&a));
        assert!(!pool.release(&a));
        assert_eq!(pool.stats().deferred, 1);

        let b = pool.get(ResourceKind::Preset, &cfg).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(built.load(Ordering::SeqCst), 1);
        // Reuse cancels the pending teardown
        assert_eq!(pool.stats().deferred, 0);
    }

    #[test]
    fn test_sweep_after_grace() {
        let (pool, _) = pool(4, true);
        let a = pool.get(ResourceKind::Preset, &Value::Null).unwrap();
        pool.release(&a);

        assert_eq!(pool.sweep(Instant::now()), 0);
        assert_eq!(pool.sweep(Instant::now() + Duration::from_secs(301)), 1);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn test_full_pool_overflow() {
        let (pool, _) = pool(1, true);
        let a = pool.get(ResourceKind::Preset, &Value::Null).unwrap();
        let b = pool.get(ResourceKind::Preset, &Value::Null).unwrap();
        assert!(a.is_pooled());
        assert!(!b.is_pooled());
        assert!(pool.release(&b));
        assert_eq!(pool.stats().total, 1);
    }

    #[test]
    fn test_full_pool_without_overflow() {
        let (pool, _) = pool(1, false);
        let _a = pool.get(ResourceKind::Preset, &Value::Null).unwrap();
        assert!(matches!(
            pool.get(ResourceKind::Preset, &Value::Null),
            Err(ResourceError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_missing_factory() {
        let (pool, _) = pool(1, true);
        assert_eq!(
            pool.get(ResourceKind::Asset, &Value::Null).unwrap_err(),
            ResourceError::NoFactory(ResourceKind::Asset)
        );
    }

    #[test]
    fn test_aggressive_keeps_in_use() {
        let (pool, _) = pool(4, true);
        let a = pool.get(ResourceKind::Preset, &Value::Null).unwrap();
        let _b = pool.get(ResourceKind::Preset, &Value::Null).unwrap();
        pool.release(&a);

        assert_eq!(pool.aggressive_cleanup(), 1);
        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.deferred, 0);
    }
}
