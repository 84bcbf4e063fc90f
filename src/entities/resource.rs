//! Cached and pooled animation resources.
//!
//! Resource kinds form a closed set. Each payload variant carries its own
//! teardown, dispatched through `enum_dispatch` instead of string branching.

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::request::Priority;
use super::traits::EngineHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Preset,
    TimelineTemplate,
    Tween,
    Asset,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Preset => "preset",
            ResourceKind::TimelineTemplate => "timeline-template",
            ResourceKind::Tween => "tween",
            ResourceKind::Asset => "asset",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Release whatever engine or host state a payload holds.
///
/// Called once by the cache/pool right before the payload is dropped from its map.
#[enum_dispatch]
pub trait Teardown {
    fn teardown(&self);
    /// Rough byte size for memory accounting.
    fn estimated_size(&self) -> usize;
}

/// Named animation config (colors, easing tables, durations).
#[derive(Debug, Clone)]
pub struct PresetData {
    pub name: String,
    pub config: Value,
}

impl Teardown for PresetData {
    fn teardown(&self) {
        log::trace!("Preset '{}' released", self.name);
    }

    fn estimated_size(&self) -> usize {
        self.name.len() + serde_json::to_string(&self.config).map(|s| s.len()).unwrap_or(0)
    }
}

/// Reusable timeline skeleton, optionally backed by a live engine timeline.
#[derive(Debug, Clone)]
pub struct TimelineTemplate {
    pub name: String,
    pub steps: Vec<Value>,
    pub handle: Option<EngineHandle>,
}

impl Teardown for TimelineTemplate {
    fn teardown(&self) {
        if let Some(handle) = &self.handle {
            handle.kill();
        }
    }

    fn estimated_size(&self) -> usize {
        let steps: usize = self
            .steps
            .iter()
            .map(|s| serde_json::to_string(s).map(|s| s.len()).unwrap_or(0))
            .sum();
        self.name.len() + steps + 256
    }
}

/// A live engine tween kept around for reuse.
#[derive(Debug, Clone)]
pub struct TweenInstance {
    pub handle: EngineHandle,
}

impl Teardown for TweenInstance {
    fn teardown(&self) {
        self.handle.kill();
    }

    fn estimated_size(&self) -> usize {
        512
    }
}

/// Host-provided asset (sprite sheet, path data, ...) with an optional dispose hook.
#[derive(Clone)]
pub struct AssetData {
    pub name: String,
    pub bytes: Arc<[u8]>,
    pub dispose: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl fmt::Debug for AssetData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetData")
            .field("name", &self.name)
            .field("bytes", &self.bytes.len())
            .field("dispose", &self.dispose.is_some())
            .finish()
    }
}

impl Teardown for AssetData {
    fn teardown(&self) {
        if let Some(dispose) = &self.dispose {
            dispose();
        }
    }

    fn estimated_size(&self) -> usize {
        self.name.len() + self.bytes.len()
    }
}

#[enum_dispatch(Teardown)]
#[derive(Debug, Clone)]
pub enum ResourcePayload {
    Preset(PresetData),
    TimelineTemplate(TimelineTemplate),
    Tween(TweenInstance),
    Asset(AssetData),
}

impl ResourcePayload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourcePayload::Preset(_) => ResourceKind::Preset,
            ResourcePayload::TimelineTemplate(_) => ResourceKind::TimelineTemplate,
            ResourcePayload::Tween(_) => ResourceKind::Tween,
            ResourcePayload::Asset(_) => ResourceKind::Asset,
        }
    }

    /// Preset config, if this is a preset.
    pub fn preset_config(&self) -> Option<&Value> {
        match self {
            ResourcePayload::Preset(p) => Some(&p.config),
            _ => None,
        }
    }
}

/// One cached resource. The cache owns `data` and tears it down on removal.
#[derive(Debug)]
pub struct CacheEntry {
    pub id: String,
    pub kind: ResourceKind,
    pub data: Arc<ResourcePayload>,
    /// Critical entries are only removed by aggressive cleanup.
    pub priority: Priority,
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u64,
    pub size: usize,
}

impl CacheEntry {
    pub fn new(id: String, data: Arc<ResourcePayload>, priority: Priority) -> Self {
        let now = Instant::now();
        Self {
            id,
            kind: data.kind(),
            size: data.estimated_size(),
            data,
            priority,
            created_at: now,
            last_used: now,
            use_count: 1,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_used = now;
        self.use_count += 1;
    }

    /// Eviction score; the cache evicts the entry with the lowest value.
    ///
    /// `priority + 1/use_count + minutes_since_last_use * 0.1`
    pub fn eviction_score(&self, now: Instant) -> f64 {
        let idle_minutes = now.saturating_duration_since(self.last_used).as_secs_f64() / 60.0;
        self.priority.weight() + 1.0 / self.use_count.max(1) as f64 + idle_minutes * 0.1
    }

    pub fn is_evictable(&self) -> bool {
        self.priority != Priority::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn preset(name: &str) -> Arc<ResourcePayload> {
        Arc::new(ResourcePayload::Preset(PresetData {
            name: name.to_string(),
            config: json!({ "ease": "power1" }),
        }))
    }

    #[test]
    fn test_eviction_score() {
        let now = Instant::now();
        let mut entry = CacheEntry::new("a".into(), preset("a"), Priority::Normal);
        entry.last_used = now;
        // 1 (normal) + 1/1
        assert!((entry.eviction_score(now) - 2.0).abs() < 1e-9);

        entry.touch(now);
        assert!((entry.eviction_score(now) - 1.5).abs() < 1e-9);

        let later = now + Duration::from_secs(600);
        assert!((entry.eviction_score(later) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_asset_teardown_runs_dispose() {
        let disposed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disposed);
        let payload = ResourcePayload::Asset(AssetData {
            name: "sprite".into(),
            bytes: Arc::from(vec![0u8; 64]),
            dispose: Some(Arc::new(move || flag.store(true, Ordering::SeqCst))),
        });
        assert_eq!(payload.kind(), ResourceKind::Asset);
        assert_eq!(payload.estimated_size(), 6 + 64);
        payload.teardown();
        assert!(disposed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_critical_not_evictable() {
        let entry = CacheEntry::new("c".into(), preset("c"), Priority::Critical);
        assert!(!entry.is_evictable());
    }
}
