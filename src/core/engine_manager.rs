//! Engine manager: registry of named animation recipes, live playbacks and
//! timelines against the external tween engine.
//!
//! - Concurrency ceiling via `SlotGate`; callers beyond it wait in arrival order
//! - Global pause/resume, also driven by page visibility
//! - Time-scale follows the policy layer; under reduced motion new playbacks
//!   are snapped to their end state
//!
//! Engine callbacks may fire on whatever thread ticks the engine. Handles are
//! never killed while the registry lock is held, since a kill fires `Interrupt`
//! synchronously and the completion hook re-enters the registry.

use crossbeam_channel::{Receiver, bounded};
use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::core::policy::PolicyLayer;
use crate::core::slot_gate::SlotGate;
use crate::entities::{
    AnimationError, ElementId, EngineHandle, HandleEvent, PlaybackKey, Target, TargetResolver, TimelineOptions,
    TweenEngine, TweenProps,
};
use crate::utils::merge_config;

/// Builds an engine handle from a resolved target and the merged config.
/// Must be idempotent: calling it twice yields two equivalent handles.
pub type AnimationFactory =
    Arc<dyn Fn(&dyn TweenEngine, ElementId, &Value) -> Result<EngineHandle, AnimationError> + Send + Sync>;

/// Factory creating one plain tween from the config (`duration` in seconds).
pub fn tween_factory() -> AnimationFactory {
    Arc::new(|engine, target, config| engine.tween(target, &TweenProps::from_config(config)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlayOutcome {
    Completed,
    Interrupted,
}

/// A started playback. `wait()` blocks until the engine reports an outcome.
#[derive(Debug)]
pub struct Playback {
    pub key: PlaybackKey,
    pub handle: EngineHandle,
    done: Receiver<PlayOutcome>,
}

impl Playback {
    pub fn wait(&self, timeout: Duration) -> Option<PlayOutcome> {
        self.done.recv_timeout(timeout).ok()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent: usize,
    /// `None` waits for a slot indefinitely.
    pub slot_wait_timeout: Option<Duration>,
    /// Recipes unused this long are purged by `cleanup`.
    pub recipe_idle: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            slot_wait_timeout: None,
            recipe_idle: Duration::from_secs(300),
        }
    }
}

type FinishHook = Arc<dyn Fn(PlayOutcome) + Send + Sync>;

struct Recipe {
    factory: AnimationFactory,
    config: Value,
    last_used: Instant,
    uses: u64,
}

struct LivePlayback {
    animation_id: String,
    handle: EngineHandle,
    finish: FinishHook,
    started_at: Instant,
}

#[derive(Default)]
struct Registry {
    /// Registration order.
    recipes: IndexMap<String, Recipe>,
    timelines: HashMap<String, EngineHandle>,
    playbacks: HashMap<PlaybackKey, LivePlayback>,
}

/// What one `cleanup` pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub recipes_removed: usize,
    pub timelines_killed: usize,
    pub playbacks_pruned: usize,
}

#[derive(Debug, Default)]
struct EngineStats {
    started: AtomicU64,
    completed: AtomicU64,
    interrupted: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineStatsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub interrupted: u64,
    pub failed: u64,
    pub active: usize,
    pub waiting: usize,
    pub peak_active: usize,
    pub max_concurrent: usize,
}

pub struct EngineManager {
    engine: Arc<dyn TweenEngine>,
    resolver: Arc<dyn TargetResolver>,
    policy: Arc<PolicyLayer>,
    registry: Arc<Mutex<Registry>>,
    gate: Arc<SlotGate>,
    config: EngineConfig,
    next_key: AtomicU64,
    paused: AtomicBool,
    /// Paused because the page went hidden (resume on visible).
    hidden_paused: AtomicBool,
    stats: Arc<EngineStats>,
}

impl EngineManager {
    pub fn new(
        engine: Arc<dyn TweenEngine>,
        resolver: Arc<dyn TargetResolver>,
        policy: Arc<PolicyLayer>,
        config: EngineConfig,
    ) -> Self {
        let manager = Self {
            engine,
            resolver,
            policy,
            registry: Arc::new(Mutex::new(Registry::default())),
            gate: Arc::new(SlotGate::new(config.max_concurrent)),
            config,
            next_key: AtomicU64::new(1),
            paused: AtomicBool::new(false),
            hidden_paused: AtomicBool::new(false),
            stats: Arc::new(EngineStats::default()),
        };
        manager.sync_policy();
        info!("EngineManager initialized: max_concurrent={}", manager.config.max_concurrent);
        manager
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Recipes ---

    /// Store a named recipe. Re-registering replaces the previous one.
    pub fn register_animation(&self, id: impl Into<String>, factory: AnimationFactory, config: Value) {
        let id = id.into();
        debug!("Register animation '{}'", id);
        self.registry().recipes.insert(
            id,
            Recipe {
                factory,
                config,
                last_used: Instant::now(),
                uses: 0,
            },
        );
    }

    pub fn unregister_animation(&self, id: &str) -> bool {
        self.registry().recipes.shift_remove(id).is_some()
    }

    pub fn has_animation(&self, id: &str) -> bool {
        self.registry().recipes.contains_key(id)
    }

    /// Recipe ids in registration order.
    pub fn registered_animations(&self) -> Vec<String> {
        self.registry().recipes.keys().cloned().collect()
    }

    fn resolve(&self, target: &Target) -> Result<ElementId, AnimationError> {
        match target {
            Target::Element(id) => Ok(*id),
            Target::Selector(selector) => self
                .resolver
                .resolve(selector)
                .ok_or_else(|| AnimationError::TargetResolution(selector.clone())),
        }
    }

    // --- Playback ---

    /// Start recipe `animation_id` on `target`.
    ///
    /// Returns once the engine has been told to play (blocking first while the
    /// ceiling is reached). `on_done` fires exactly once when the playback
    /// completes or is interrupted.
    pub fn play_with<F>(
        &self,
        animation_id: &str,
        target: &Target,
        overrides: &Value,
        on_done: F,
    ) -> Result<(PlaybackKey, EngineHandle), AnimationError>
    where
        F: FnOnce(PlayOutcome) + Send + 'static,
    {
        let (factory, base) = {
            let mut registry = self.registry();
            let recipe = registry
                .recipes
                .get_mut(animation_id)
                .ok_or_else(|| AnimationError::UnknownAnimation(animation_id.to_string()))?;
            recipe.last_used = Instant::now();
            recipe.uses += 1;
            (Arc::clone(&recipe.factory), recipe.config.clone())
        };

        let element = self.resolve(target)?;

        self.gate
            .acquire(self.config.slot_wait_timeout)
            .map_err(|waited| AnimationError::CapacityExceeded { waited })?;

        let config = merge_config(&base, overrides);
        let built = catch_unwind(AssertUnwindSafe(|| factory(self.engine.as_ref(), element, &config)))
            .unwrap_or_else(|_| Err(AnimationError::EngineExecution(format!("factory for '{}' panicked", animation_id))));
        let handle = match built {
            Ok(handle) => handle,
            Err(e) => {
                self.gate.release();
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Animation '{}' on {} failed to build: {}", animation_id, target, e);
                return Err(e);
            }
        };

        let key = PlaybackKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        let finish = self.finish_hook(key, on_done);

        for (event, outcome) in [
            (HandleEvent::Complete, PlayOutcome::Completed),
            (HandleEvent::Interrupt, PlayOutcome::Interrupted),
        ] {
            let finish = Arc::clone(&finish);
            handle.on_event(event, Arc::new(move || finish(outcome)));
        }

        self.registry().playbacks.insert(
            key,
            LivePlayback {
                animation_id: animation_id.to_string(),
                handle: Arc::clone(&handle),
                finish,
                started_at: Instant::now(),
            },
        );

        if self.policy.should_reduce_motion() {
            // Land on the final state at the next tick instead of animating
            handle.set_progress(1.0);
        }
        handle.play();
        self.stats.started.fetch_add(1, Ordering::Relaxed);
        debug!("Play '{}' on {} as {:?} (active {})", animation_id, target, key, self.gate.active());

        Ok((key, handle))
    }

    /// Like `play_with`, returning a `Playback` to wait on.
    pub fn play(&self, animation_id: &str, target: &Target, overrides: &Value) -> Result<Playback, AnimationError> {
        let (tx, rx) = bounded(1);
        let (key, handle) = self.play_with(animation_id, target, overrides, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        Ok(Playback { key, handle, done: rx })
    }

    /// Completion hook shared by the Complete/Interrupt listeners: frees the
    /// slot, drops the registry entry and calls `on_done`, once.
    fn finish_hook<F>(&self, key: PlaybackKey, on_done: F) -> FinishHook
    where
        F: FnOnce(PlayOutcome) + Send + 'static,
    {
        let pending: Mutex<Option<Box<dyn FnOnce(PlayOutcome) + Send>>> = Mutex::new(Some(Box::new(on_done)));
        let gate = Arc::clone(&self.gate);
        let stats = Arc::clone(&self.stats);
        let registry: Weak<Mutex<Registry>> = Arc::downgrade(&self.registry);

        Arc::new(move |outcome| {
            let Some(on_done) = pending.lock().unwrap_or_else(|e| e.into_inner()).take() else {
                return;
            };
            gate.release();
            if let Some(registry) = registry.upgrade() {
                registry.lock().unwrap_or_else(|e| e.into_inner()).playbacks.remove(&key);
            }
            match outcome {
                PlayOutcome::Completed => stats.completed.fetch_add(1, Ordering::Relaxed),
                PlayOutcome::Interrupted => stats.interrupted.fetch_add(1, Ordering::Relaxed),
            };
            trace!("Playback {:?} finished: {:?}", key, outcome);
            on_done(outcome);
        })
    }

    /// Kill one playback. Its completion hook reports `Interrupted`.
    pub fn stop_playback(&self, key: PlaybackKey) -> bool {
        let handle = self.registry().playbacks.get(&key).map(|p| Arc::clone(&p.handle));
        match handle {
            Some(handle) => {
                handle.kill();
                true
            }
            None => false,
        }
    }

    // --- Timelines ---

    /// Create a timeline under `id`, killing any previous one first.
    ///
    /// The timeline counts toward the active bucket from its start until it
    /// completes or is interrupted.
    pub fn create_timeline(&self, id: impl Into<String>, options: &TimelineOptions) -> EngineHandle {
        let id = id.into();
        let old = self.registry().timelines.remove(&id);
        if let Some(old) = old {
            debug!("Replacing timeline '{}'", id);
            old.kill();
        }

        let handle = self.engine.create_timeline(options);
        let counted = Arc::new(AtomicBool::new(false));
        {
            let gate = Arc::clone(&self.gate);
            let counted = Arc::clone(&counted);
            handle.on_event(
                HandleEvent::Start,
                Arc::new(move || {
                    if !counted.swap(true, Ordering::AcqRel) {
                        gate.occupy();
                    }
                }),
            );
        }
        for event in [HandleEvent::Complete, HandleEvent::Interrupt] {
            let gate = Arc::clone(&self.gate);
            let counted = Arc::clone(&counted);
            handle.on_event(
                event,
                Arc::new(move || {
                    if counted.swap(false, Ordering::AcqRel) {
                        gate.release();
                    }
                }),
            );
        }

        self.registry().timelines.insert(id, Arc::clone(&handle));
        handle
    }

    pub fn timeline(&self, id: &str) -> Option<EngineHandle> {
        self.registry().timelines.get(id).cloned()
    }

    /// Kill the timeline named `id` and every live playback of recipe `id`.
    /// Returns how many handles were killed.
    pub fn stop(&self, id: &str) -> usize {
        let handles: Vec<EngineHandle> = {
            let mut registry = self.registry();
            let mut handles: Vec<EngineHandle> = registry.timelines.remove(id).into_iter().collect();
            handles.extend(
                registry
                    .playbacks
                    .values()
                    .filter(|p| p.animation_id == id)
                    .map(|p| Arc::clone(&p.handle)),
            );
            handles
        };
        for handle in &handles {
            handle.kill();
        }
        if !handles.is_empty() {
            debug!("Stopped '{}' ({} handle(s))", id, handles.len());
        }
        handles.len()
    }

    // --- Global control ---

    pub fn pause_all(&self) {
        self.paused.store(true, Ordering::Release);
        self.engine.pause_all();
        for handle in self.timeline_snapshot() {
            handle.pause();
        }
        debug!("EngineManager paused");
    }

    pub fn resume_all(&self) {
        self.paused.store(false, Ordering::Release);
        self.hidden_paused.store(false, Ordering::Release);
        for handle in self.timeline_snapshot() {
            handle.resume();
        }
        self.engine.resume_all();
        debug!("EngineManager resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Hidden pauses everything; visible resumes only what hiding paused.
    pub fn set_page_visible(&self, visible: bool) {
        if visible {
            if self.hidden_paused.swap(false, Ordering::AcqRel) {
                self.resume_all();
            }
        } else if !self.is_paused() {
            self.pause_all();
            self.hidden_paused.store(true, Ordering::Release);
        }
    }

    fn timeline_snapshot(&self) -> Vec<EngineHandle> {
        self.registry().timelines.values().cloned().collect()
    }

    /// Push the policy's effective time-scale to the engine.
    pub fn sync_policy(&self) {
        self.set_time_scale(self.policy.time_scale());
    }

    pub fn set_time_scale(&self, scale: f64) {
        self.engine.set_time_scale(scale);
        debug!("Engine time-scale set to {}", scale);
    }

    pub fn time_scale(&self) -> f64 {
        self.engine.time_scale()
    }

    pub fn set_frame_rate(&self, fps: u32) {
        if self.engine.frame_rate() != fps {
            info!("Engine frame rate: {} -> {}", self.engine.frame_rate(), fps);
            self.engine.set_frame_rate(fps);
        }
    }

    pub fn frame_rate(&self) -> u32 {
        self.engine.frame_rate()
    }

    pub fn set_max_concurrent(&self, max: usize) {
        if self.gate.max() != max.max(1) {
            info!("Max concurrent animations: {} -> {}", self.gate.max(), max.max(1));
        }
        self.gate.set_max(max);
    }

    pub fn max_concurrent(&self) -> usize {
        self.gate.max()
    }

    /// Ceiling given at construction, the upper bound for tier adjustments.
    pub fn configured_max_concurrent(&self) -> usize {
        self.config.max_concurrent.max(1)
    }

    pub fn active_count(&self) -> usize {
        self.gate.active()
    }

    pub fn waiting_count(&self) -> usize {
        self.gate.waiting()
    }

    pub fn peak_active(&self) -> usize {
        self.gate.peak()
    }

    pub fn playback_count(&self) -> usize {
        self.registry().playbacks.len()
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            started: self.stats.started.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            interrupted: self.stats.interrupted.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            active: self.gate.active(),
            waiting: self.gate.waiting(),
            peak_active: self.gate.peak(),
            max_concurrent: self.gate.max(),
        }
    }

    // --- Maintenance ---

    /// Purge idle recipes and kill finished timelines. `force` also kills
    /// inactive timelines and prunes playbacks whose handle stopped without
    /// reporting an outcome. Idempotent.
    pub fn cleanup(&self, force: bool) -> CleanupReport {
        let mut report = CleanupReport::default();
        let now = Instant::now();

        let (timelines, stale) = {
            let mut registry = self.registry();
            let idle = self.config.recipe_idle;
            let before = registry.recipes.len();
            registry
                .recipes
                .retain(|_, r| now.saturating_duration_since(r.last_used) < idle);
            report.recipes_removed = before - registry.recipes.len();

            let done: Vec<String> = registry
                .timelines
                .iter()
                .filter(|(_, h)| h.progress() >= 1.0 || (force && !h.is_active()))
                .map(|(id, _)| id.clone())
                .collect();
            let timelines: Vec<EngineHandle> =
                done.iter().filter_map(|id| registry.timelines.remove(id)).collect();

            let stale: Vec<(PlaybackKey, FinishHook, Duration)> = if force {
                registry
                    .playbacks
                    .iter()
                    .filter(|(_, p)| !p.handle.is_active() && p.handle.progress() >= 1.0)
                    .map(|(k, p)| (*k, Arc::clone(&p.finish), now.saturating_duration_since(p.started_at)))
                    .collect()
            } else {
                Vec::new()
            };
            (timelines, stale)
        };

        for handle in &timelines {
            handle.kill();
        }
        report.timelines_killed = timelines.len();

        for (key, finish, age) in &stale {
            trace!("Pruning stale playback {:?} (age {:?})", key, age);
            finish(PlayOutcome::Interrupted);
        }
        report.playbacks_pruned = stale.len();

        if report != CleanupReport::default() {
            debug!("Engine cleanup (force={}): {:?}", force, report);
        }
        report
    }

    /// Kill everything and forget every recipe.
    pub fn destroy(&self) {
        let handles: Vec<EngineHandle> = {
            let mut registry = self.registry();
            registry.recipes.clear();
            let mut handles: Vec<EngineHandle> = registry.timelines.drain().map(|(_, h)| h).collect();
            handles.extend(registry.playbacks.values().map(|p| Arc::clone(&p.handle)));
            handles
        };
        for handle in &handles {
            handle.kill();
        }
        info!("EngineManager destroyed ({} handle(s) killed)", handles.len());
    }
}
