//! Scheduler: the caller-facing entry point of the orchestration core.
//!
//! Accepts animation requests, queues them by priority and drains the queue
//! on one dedicated thread, strictly one request at a time. "Executing" a
//! request means the engine acknowledged play; visual completion arrives later
//! through the playback's completion hook, so many animations can be in flight
//! while draining stays sequential.
//!
//! ```text
//! Pending -> Running -> Completed
//!                    -> Failed (retryable, retries < max) -> Pending (after backoff)
//!                    -> Failed (terminal)
//! Pending | Running  -> Cancelled
//! ```
//!
//! Caller callbacks and bus events fire after the scheduler lock is released.

use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::core::engine_manager::{EngineManager, PlayOutcome};
use crate::core::event_bus::EventBus;
use crate::core::events::RequestFinished;
use crate::core::policy::PolicyLayer;
use crate::core::request_queue::RequestQueue;
use crate::core::resource_manager::ResourceManager;
use crate::entities::{
    AnimationError, AnimationRequest, Priority, RequestId, RequestRecord, RequestState, RequestStatus, Target,
};
use crate::entities::request::Callbacks;
use crate::utils::merge_config;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_retries: u32,
    /// Retry delay is `retry_backoff * retries`.
    pub retry_backoff: Duration,
    /// How long terminal records stay queryable.
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(1000),
            retention: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerStats {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    /// Completed without running because motion is reduced.
    pub skipped: u64,
    pub pending: usize,
    pub running: usize,
}

/// What the drain thread needs to run one request.
struct Job {
    id: RequestId,
    animation_id: String,
    target: Target,
    priority: Priority,
    options: serde_json::Value,
    preset: Option<String>,
}

#[derive(Default)]
struct SchedState {
    queue: RequestQueue,
    /// Pending (queued or waiting out a retry delay) and running records.
    active: HashMap<RequestId, RequestRecord>,
    /// Terminal records until swept.
    finished: HashMap<RequestId, RequestRecord>,
    /// Retry re-queue deadlines.
    delayed: Vec<(Instant, RequestId)>,
    draining: bool,
    shutdown: bool,
}

impl SchedState {
    /// Move due retries back into the queue, in deadline order.
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(due, _)| *due);
        let split = self.delayed.partition_point(|(due, _)| *due <= now);
        let due: Vec<(Instant, RequestId)> = self.delayed.drain(..split).collect();
        for (_, id) in due {
            if let Some(record) = self.active.get(&id) {
                let priority = record.priority;
                self.queue.push(id, priority);
                trace!("Retry {} re-queued", id);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }

    /// Terminal transition: move to `finished` and hand back the callbacks.
    /// Status of an active record: queue position, or remaining backoff.
    fn status_of(&self, record: &RequestRecord, now: Instant) -> RequestStatus {
        let mut status = record.status(self.queue.position(record.id));
        status.retry_in_ms = self
            .delayed
            .iter()
            .find(|(_, id)| *id == record.id)
            .map(|(due, _)| due.saturating_duration_since(now).as_millis() as u64);
        status
    }

    fn retire(&mut self, id: RequestId, state: RequestState, error: Option<AnimationError>) -> Option<Finished> {
        let mut record = self.active.remove(&id)?;
        record.state = state;
        record.end_time = Some(Instant::now());
        if error.is_some() {
            record.last_error = error;
        }
        let finished = Finished {
            id,
            state,
            retries: record.retries,
            // A completed retry keeps its earlier error on the record only
            error: if state == RequestState::Completed {
                None
            } else {
                record.last_error.clone()
            },
            callbacks: record.take_callbacks(),
        };
        self.finished.insert(id, record);
        Some(finished)
    }
}

/// Terminal outcome delivered outside the lock.
struct Finished {
    id: RequestId,
    state: RequestState,
    retries: u32,
    error: Option<AnimationError>,
    callbacks: Option<Callbacks>,
}

struct Inner {
    state: Mutex<SchedState>,
    wake: Condvar,
    stats: SchedulerStats,
    engine: Arc<EngineManager>,
    resources: Arc<ResourceManager>,
    policy: Arc<PolicyLayer>,
    config: SchedulerConfig,
    bus: Option<EventBus>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until a request is ready or shutdown. Marks the request Running.
    fn next_job(&self) -> Option<Job> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return None;
            }
            state.promote_due(Instant::now());

            while let Some(id) = state.queue.pop() {
                let Some(record) = state.active.get_mut(&id) else {
                    continue;
                };
                record.state = RequestState::Running;
                record.start_time = Some(Instant::now());
                record.end_time = None;
                return Some(Job {
                    id,
                    animation_id: record.animation_id.clone(),
                    target: record.target.clone(),
                    priority: record.priority,
                    options: record.options.clone(),
                    preset: record.preset.clone(),
                });
            }

            state = match state.next_deadline() {
                Some(due) => {
                    let wait = due.saturating_duration_since(Instant::now());
                    self.wake.wait_timeout(state, wait).unwrap_or_else(|e| e.into_inner()).0
                }
                None => self.wake.wait(state).unwrap_or_else(|e| e.into_inner()),
            };
        }
    }

    fn execute(self: &Arc<Self>, job: Job) {
        if job.priority < Priority::Critical && self.policy.should_reduce_motion() {
            debug!("Request {} skipped: reduced motion", job.id);
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            self.complete(job.id);
            return;
        }

        let options = match &job.preset {
            Some(name) => match self.resources.get_cached(name) {
                Some(payload) => match payload.preset_config() {
                    Some(base) => merge_config(base, &job.options),
                    None => {
                        warn!("Resource '{}' is not a preset, ignoring", name);
                        job.options.clone()
                    }
                },
                None => {
                    warn!("Preset '{}' not cached, running without it", name);
                    job.options.clone()
                }
            },
            None => job.options.clone(),
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let id = job.id;
        let played = self.engine.play_with(&job.animation_id, &job.target, &options, move |outcome| {
            if let Some(inner) = weak.upgrade() {
                match outcome {
                    PlayOutcome::Completed => inner.complete(id),
                    PlayOutcome::Interrupted => inner.fail(id, AnimationError::Interrupted),
                }
            }
        });

        match played {
            Ok((key, _)) => {
                let still_running = {
                    let mut guard = self.lock();
                    let state = &mut *guard;
                    match state.active.get_mut(&id) {
                        Some(record) if record.state == RequestState::Running => {
                            record.playback = Some(key);
                            true
                        }
                        _ => state.finished.get(&id).is_some_and(|r| r.state != RequestState::Cancelled),
                    }
                };
                if !still_running {
                    // Cancelled while the engine was starting it
                    self.engine.stop_playback(key);
                }
                trace!("Request {} acknowledged as {:?}", id, key);
            }
            Err(e) => self.fail(id, e),
        }
    }

    fn complete(&self, id: RequestId) {
        let finished = {
            let mut state = self.lock();
            match state.active.get(&id) {
                Some(record) if record.state == RequestState::Running => {}
                _ => return,
            }
            state.retire(id, RequestState::Completed, None)
        };
        if let Some(finished) = finished {
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
            debug!("Request {} completed", id);
            self.deliver(finished);
        }
    }

    fn fail(&self, id: RequestId, err: AnimationError) {
        let finished = {
            let mut state = self.lock();
            let Some(record) = state.active.get_mut(&id) else {
                return;
            };
            if record.state != RequestState::Running {
                return;
            }
            record.retries += 1;
            record.last_error = Some(err.clone());
            record.playback = None;

            if err.is_retryable() && record.retries < self.config.max_retries {
                let delay = self.config.retry_backoff * record.retries;
                record.state = RequestState::Pending;
                debug!(
                    "Request {} failed ({}), retry {}/{} in {} ms",
                    id,
                    err,
                    record.retries,
                    self.config.max_retries,
                    delay.as_millis()
                );
                state.delayed.push((Instant::now() + delay, id));
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                self.wake.notify_all();
                None
            } else {
                state.retire(id, RequestState::Failed, Some(err.clone()))
            }
        };

        if let Some(finished) = finished {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            error!("Request {} failed after {} attempt(s): {}", id, finished.retries, err);
            self.deliver(finished);
        }
    }

    fn deliver(&self, finished: Finished) {
        if let Some(bus) = &self.bus {
            bus.emit(RequestFinished {
                id: finished.id,
                state: finished.state,
                retries: finished.retries,
                error: finished.error.as_ref().map(|e| e.to_string()),
            });
        }
        let Some(callbacks) = finished.callbacks else {
            return;
        };
        match (finished.state, finished.error) {
            (RequestState::Completed, _) => callbacks.complete(finished.id),
            (_, Some(err)) => callbacks.error(finished.id, err),
            (_, None) => callbacks.error(finished.id, AnimationError::Cancelled),
        }
    }

    /// Cancel every pending request matching `filter` with `err`.
    fn drop_pending(&self, filter: Option<Priority>, err: AnimationError) -> usize {
        let finished: Vec<Finished> = {
            let mut state = self.lock();
            let mut ids = state.queue.drain_priority(filter);
            let delayed: Vec<RequestId> = state
                .delayed
                .iter()
                .map(|(_, id)| *id)
                .filter(|id| {
                    state
                        .active
                        .get(id)
                        .is_some_and(|r| filter.is_none_or(|p| r.priority == p))
                })
                .collect();
            state.delayed.retain(|(_, id)| !delayed.contains(id));
            ids.extend(delayed);
            ids.into_iter()
                .filter_map(|id| state.retire(id, RequestState::Cancelled, Some(err.clone())))
                .collect()
        };
        let count = finished.len();
        self.stats.cancelled.fetch_add(count as u64, Ordering::Relaxed);
        for f in finished {
            self.deliver(f);
        }
        count
    }
}

pub struct Scheduler {
    inner: Arc<Inner>,
    drain: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<EngineManager>,
        resources: Arc<ResourceManager>,
        policy: Arc<PolicyLayer>,
        config: SchedulerConfig,
        bus: Option<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedState::default()),
                wake: Condvar::new(),
                stats: SchedulerStats::default(),
                engine,
                resources,
                policy,
                config,
                bus,
            }),
            drain: Mutex::new(None),
        }
    }

    /// Start the drain thread. Requests enqueued before this stay queued. Idempotent.
    pub fn initialize(&self) -> std::io::Result<()> {
        let mut drain = self.drain.lock().unwrap_or_else(|e| e.into_inner());
        if drain.is_some() {
            return Ok(());
        }
        {
            let mut state = self.inner.lock();
            state.shutdown = false;
            state.draining = true;
        }
        let inner = Arc::clone(&self.inner);
        *drain = Some(thread::Builder::new().name("choreo-scheduler".into()).spawn(move || {
            while let Some(job) = inner.next_job() {
                inner.execute(job);
            }
            trace!("Scheduler drain loop exited");
        })?);
        info!("Scheduler initialized (max_retries={})", self.inner.config.max_retries);
        Ok(())
    }

    /// Refuse new requests and stop popping the queue. The drain thread may
    /// still be finishing one request; `destroy` joins it.
    pub fn close(&self) {
        {
            let mut state = self.inner.lock();
            state.shutdown = true;
            state.draining = false;
        }
        self.inner.wake.notify_all();
    }

    /// Stop draining and cancel pending requests with `Shutdown`. Idempotent.
    ///
    /// A drain blocked on a free engine slot only returns once a slot frees,
    /// so stop engine playbacks between `close` and `destroy` when the ceiling may be reached.
    pub fn destroy(&self) {
        self.close();
        let handle = self.drain.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Scheduler drain thread panicked");
            }
        }
        let dropped = self.inner.drop_pending(None, AnimationError::Shutdown);
        if dropped > 0 {
            info!("Scheduler destroyed, {} pending request(s) dropped", dropped);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().draining
    }

    /// Validate and queue a request. Validation errors are returned, never queued.
    pub fn enqueue(&self, request: AnimationRequest) -> Result<RequestId, AnimationError> {
        request.validate()?;
        let id = Uuid::new_v4();
        let priority = request.priority;
        {
            let mut state = self.inner.lock();
            if state.shutdown {
                return Err(AnimationError::Shutdown);
            }
            let pos = state.queue.push(id, priority);
            state.active.insert(id, RequestRecord::new(id, request));
            trace!("Enqueued {} ({}) at {}", id, priority, pos);
        }
        self.inner.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.inner.wake.notify_all();
        Ok(id)
    }

    /// Cancel a pending or running request. False if unknown or already terminal.
    pub fn cancel(&self, id: RequestId) -> bool {
        let (finished, playback) = {
            let mut state = self.inner.lock();
            let Some(record) = state.active.get(&id) else {
                return false;
            };
            let playback = record.playback;
            state.queue.remove(id);
            state.delayed.retain(|(_, d)| *d != id);
            (state.retire(id, RequestState::Cancelled, Some(AnimationError::Cancelled)), playback)
        };

        if let Some(key) = playback {
            self.inner.engine.stop_playback(key);
        }
        match finished {
            Some(finished) => {
                self.inner.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!("Request {} cancelled", id);
                self.inner.deliver(finished);
                true
            }
            None => false,
        }
    }

    pub fn get_status(&self, id: RequestId) -> Option<RequestStatus> {
        let state = self.inner.lock();
        if let Some(record) = state.active.get(&id) {
            return Some(state.status_of(record, Instant::now()));
        }
        state.finished.get(&id).map(|r| r.status(None))
    }

    /// Drop queued requests, optionally only one priority tier. Running ones are untouched.
    pub fn clear_queue(&self, priority: Option<Priority>) -> usize {
        let count = self.inner.drop_pending(priority, AnimationError::Cancelled);
        if count > 0 {
            debug!("Cleared {} queued request(s)", count);
        }
        count
    }

    pub fn pause_all(&self) {
        self.inner.engine.pause_all();
    }

    pub fn resume_all(&self) {
        self.inner.engine.resume_all();
    }

    /// Drop terminal records older than the retention window.
    pub fn sweep_completed(&self, now: Instant) -> usize {
        let retention = self.inner.config.retention;
        let mut state = self.inner.lock();
        let before = state.finished.len();
        state.finished.retain(|_, r| {
            r.end_time
                .is_none_or(|end| now.saturating_duration_since(end) < retention)
        });
        let removed = before - state.finished.len();
        if removed > 0 {
            trace!("Swept {} finished record(s)", removed);
        }
        removed
    }

    pub fn pending_len(&self) -> usize {
        let state = self.inner.lock();
        state.queue.len() + state.delayed.len()
    }

    pub fn running_len(&self) -> usize {
        self.inner
            .lock()
            .active
            .values()
            .filter(|r| r.state == RequestState::Running)
            .count()
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        let (pending, running) = (self.pending_len(), self.running_len());
        let s = &self.inner.stats;
        SchedulerStatsSnapshot {
            enqueued: s.enqueued.load(Ordering::Relaxed),
            completed: s.completed.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            cancelled: s.cancelled.load(Ordering::Relaxed),
            retried: s.retried.load(Ordering::Relaxed),
            skipped: s.skipped.load(Ordering::Relaxed),
            pending,
            running,
        }
    }

    /// Every known status: active first, then finished.
    pub fn statuses(&self) -> Vec<RequestStatus> {
        let state = self.inner.lock();
        let now = Instant::now();
        let mut out: Vec<RequestStatus> = state.active.values().map(|r| state.status_of(r, now)).collect();
        let mut finished: Vec<&RequestRecord> = state.finished.values().collect();
        finished.sort_by_key(|r| r.created_at);
        out.extend(finished.into_iter().map(|r| r.status(None)));
        out
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine_manager::{EngineConfig, tween_factory};
    use crate::core::perf_monitor::{MonitorConfig, PerformanceMonitor};
    use crate::core::policy::MemoryPreferenceStore;
    use crate::core::resource_manager::{LoadOptions, ResourceConfig};
    use crate::entities::{
        DeviceInfo, ElementId, PresetData, ResourceKind, ResourcePayload, SystemSignal, TweenEngine, TweenProps,
    };
    use crate::headless::{FixedMemory, HeadlessEngine, Stage};
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        scheduler: Scheduler,
        engine: Arc<HeadlessEngine>,
        manager: Arc<EngineManager>,
        resources: Arc<ResourceManager>,
        stage: Arc<Stage>,
        policy: Arc<PolicyLayer>,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        let engine = Arc::new(HeadlessEngine::new());
        let stage = Arc::new(Stage::new());
        let policy = Arc::new(PolicyLayer::new(Arc::new(MemoryPreferenceStore::new()), None));
        let manager = Arc::new(EngineManager::new(
            engine.clone(),
            stage.clone(),
            Arc::clone(&policy),
            EngineConfig::default(),
        ));
        let monitor = Arc::new(PerformanceMonitor::new(
            Arc::new(FixedMemory::new(10, 100)),
            DeviceInfo {
                cores: 4,
                memory_bytes: 8 << 30,
            },
            MonitorConfig::default(),
            None,
        ));
        let resources = Arc::new(ResourceManager::new(ResourceConfig::default(), monitor, None));
        manager.register_animation("fade", tween_factory(), json!({ "duration": 0.05 }));
        stage.add("#a");

        let scheduler = Scheduler::new(
            Arc::clone(&manager),
            Arc::clone(&resources),
            Arc::clone(&policy),
            config,
            None,
        );
        Fixture {
            scheduler,
            engine,
            manager,
            resources,
            stage,
            policy,
        }
    }

    fn fast_retries() -> SchedulerConfig {
        SchedulerConfig {
            retry_backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn state_of(f: &Fixture, id: RequestId) -> Option<RequestState> {
        f.scheduler.get_status(id).map(|s| s.state)
    }

    #[test]
    fn test_validation_rejects() {
        let f = fixture(SchedulerConfig::default());
        assert!(matches!(
            f.scheduler.enqueue(AnimationRequest::new("", "#a")),
            Err(AnimationError::Validation(_))
        ));
        assert!(matches!(
            f.scheduler.enqueue(AnimationRequest::new("fade", "")),
            Err(AnimationError::Validation(_))
        ));
        assert_eq!(f.scheduler.pending_len(), 0);
    }

    #[test]
    fn test_drain_order_by_priority() {
        let f = fixture(SchedulerConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        f.manager.register_animation(
            "record",
            Arc::new(move |engine: &dyn TweenEngine, target: ElementId, config: &Value| {
                seen.lock().unwrap().push(target);
                engine.tween(target, &TweenProps::from_config(config))
            }),
            json!({ "duration": 0.01 }),
        );
        let low = f.stage.add("#low");
        let crit = f.stage.add("#crit");
        let norm = f.stage.add("#norm");

        for (selector, priority) in [("#low", Priority::Low), ("#crit", Priority::Critical), ("#norm", Priority::Normal)] {
            f.scheduler
                .enqueue(AnimationRequest::new("record", selector).with_priority(priority))
                .unwrap();
        }
        assert_eq!(f.scheduler.pending_len(), 3);

        f.scheduler.initialize().unwrap();
        assert!(wait_for(|| order.lock().unwrap().len() == 3));
        assert_eq!(*order.lock().unwrap(), vec![crit, norm, low]);
    }

    #[test]
    fn test_completion_fires_callback_once() {
        let f = fixture(SchedulerConfig::default());
        f.scheduler.initialize().unwrap();
        let completed = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&completed);
        let e = Arc::clone(&errors);

        let id = f
            .scheduler
            .enqueue(
                AnimationRequest::new("fade", "#a")
                    .on_complete(move |_| {
                        c.fetch_add(1, Ordering::SeqCst);
                    })
                    .on_error(move |_, _| {
                        e.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();

        assert!(wait_for(|| f.manager.stats().started == 1));
        f.engine.run_for(Duration::from_millis(64), Duration::from_millis(16));
        assert!(wait_for(|| state_of(&f, id) == Some(RequestState::Completed)));
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        let status = f.scheduler.get_status(id).unwrap();
        assert!(status.elapsed_ms.is_some());
        assert_eq!(f.scheduler.stats().completed, 1);
    }

    #[test]
    fn test_unresolved_target_fails_after_max_retries() {
        let f = fixture(fast_retries());
        f.scheduler.initialize().unwrap();
        let error = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let slot = Arc::clone(&error);
        let n = Arc::clone(&calls);

        let id = f
            .scheduler
            .enqueue(AnimationRequest::new("fade", "#ghost").on_error(move |_, err| {
                n.fetch_add(1, Ordering::SeqCst);
                *slot.lock().unwrap() = Some(err);
            }))
            .unwrap();

        assert!(wait_for(|| state_of(&f, id) == Some(RequestState::Failed)));
        let status = f.scheduler.get_status(id).unwrap();
        assert_eq!(status.retries, 3);
        assert!(status.error.unwrap().contains("#ghost"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            error.lock().unwrap().clone(),
            Some(AnimationError::TargetResolution("#ghost".into()))
        );
        assert_eq!(f.scheduler.stats().retried, 2);
    }

    #[test]
    fn test_retry_succeeds_once_target_appears() {
        let f = fixture(SchedulerConfig {
            retry_backoff: Duration::from_millis(50),
            ..Default::default()
        });
        f.scheduler.initialize().unwrap();
        let id = f.scheduler.enqueue(AnimationRequest::new("fade", "#late")).unwrap();

        assert!(wait_for(|| f.scheduler.get_status(id).is_some_and(|s| s.retries == 1)));
        f.stage.add("#late");
        assert!(wait_for(|| state_of(&f, id) == Some(RequestState::Running)));
        let status = f.scheduler.get_status(id).unwrap();
        assert_eq!(status.priority, Priority::Normal);
        assert_eq!(status.id, id);
    }

    #[test]
    fn test_retry_requeues_behind_earlier_arrivals() {
        let f = fixture(SchedulerConfig {
            retry_backoff: Duration::from_millis(300),
            ..Default::default()
        });
        f.manager.set_max_concurrent(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        f.manager.register_animation(
            "record",
            Arc::new(move |engine: &dyn TweenEngine, target: ElementId, config: &Value| {
                seen.lock().unwrap().push(target);
                engine.tween(target, &TweenProps::from_config(config))
            }),
            json!({ "duration": 0.01 }),
        );
        let attempts = Arc::new(AtomicUsize::new(0));
        let tries = Arc::clone(&attempts);
        let seen = Arc::clone(&order);
        f.manager.register_animation(
            "flaky",
            Arc::new(move |engine: &dyn TweenEngine, target: ElementId, config: &Value| {
                if tries.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(AnimationError::EngineExecution("not ready".into()));
                }
                seen.lock().unwrap().push(target);
                engine.tween(target, &TweenProps::from_config(config))
            }),
            json!({ "duration": 0.01 }),
        );
        let retried = f.stage.add("#retried");
        let high = f.stage.add("#high");
        let normal = f.stage.add("#normal");
        let low = f.stage.add("#low");
        f.scheduler.initialize().unwrap();

        let flaky = f
            .scheduler
            .enqueue(AnimationRequest::new("flaky", "#retried"))
            .unwrap();
        assert!(wait_for(|| attempts.load(Ordering::SeqCst) == 1));
        let backing_off = f.scheduler.get_status(flaky).unwrap();
        assert_eq!(backing_off.state, RequestState::Pending);
        assert_eq!(backing_off.queue_position, None);
        assert!(backing_off.retry_in_ms.is_some_and(|ms| ms <= 300));

        // Hold the only slot so the rest queue up behind it
        f.scheduler.enqueue(AnimationRequest::new("fade", "#a")).unwrap();
        assert!(wait_for(|| f.manager.stats().started == 1));
        for (selector, priority) in [("#high", Priority::High), ("#normal", Priority::Normal), ("#low", Priority::Low)] {
            f.scheduler
                .enqueue(AnimationRequest::new("record", selector).with_priority(priority))
                .unwrap();
        }
        assert!(wait_for(|| f.scheduler.running_len() == 2));
        thread::sleep(Duration::from_millis(350));

        assert!(wait_for(|| {
            f.engine.run_for(Duration::from_millis(32), Duration::from_millis(16));
            order.lock().unwrap().len() == 4
        }));
        assert_eq!(*order.lock().unwrap(), vec![high, normal, retried, low]);

        let status = f.scheduler.get_status(flaky).unwrap();
        assert_eq!(status.id, flaky);
        assert_eq!(status.priority, Priority::Normal);
        assert_eq!(status.retries, 1);
        assert_eq!(status.retry_in_ms, None);
    }

    #[test]
    fn test_bad_options_do_not_stop_draining() {
        let f = fixture(fast_retries());
        f.manager.register_animation("explode", Arc::new(|_, _, _| panic!("factory bug")), Value::Null);
        f.scheduler.initialize().unwrap();

        let exploded = f.scheduler.enqueue(AnimationRequest::new("explode", "#a")).unwrap();
        let huge = f
            .scheduler
            .enqueue(AnimationRequest::new("fade", "#a").with_options(json!({ "duration": 1e300 })))
            .unwrap();
        let good = f.scheduler.enqueue(AnimationRequest::new("fade", "#a")).unwrap();

        assert!(wait_for(|| state_of(&f, exploded) == Some(RequestState::Failed)));
        let status = f.scheduler.get_status(exploded).unwrap();
        assert_eq!(status.retries, 3);
        assert!(status.error.unwrap().contains("panicked"));

        assert!(wait_for(|| f.manager.stats().started == 2));
        assert_eq!(state_of(&f, huge), Some(RequestState::Running));
        f.engine.run_for(Duration::from_millis(64), Duration::from_millis(16));
        assert!(wait_for(|| state_of(&f, good) == Some(RequestState::Completed)));
        assert_eq!(state_of(&f, huge), Some(RequestState::Running));
        assert_eq!(f.manager.active_count(), 1);
        assert!(f.scheduler.is_running());
    }

    #[test]
    fn test_unknown_animation_is_not_retried() {
        let f = fixture(fast_retries());
        f.scheduler.initialize().unwrap();
        let id = f.scheduler.enqueue(AnimationRequest::new("nope", "#a")).unwrap();
        assert!(wait_for(|| state_of(&f, id) == Some(RequestState::Failed)));
        assert_eq!(f.scheduler.get_status(id).unwrap().retries, 1);
    }

    #[test]
    fn test_cancel_pending_and_running() {
        let f = fixture(SchedulerConfig::default());
        let cancelled = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&cancelled);
        let pending = f
            .scheduler
            .enqueue(AnimationRequest::new("fade", "#a").on_error(move |_, err| {
                assert_eq!(err, AnimationError::Cancelled);
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert!(f.scheduler.cancel(pending));
        assert!(!f.scheduler.cancel(pending));
        assert_eq!(state_of(&f, pending), Some(RequestState::Cancelled));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        f.scheduler.initialize().unwrap();
        let running = f
            .scheduler
            .enqueue(AnimationRequest::new("fade", "#a").with_options(json!({ "duration": 5.0 })))
            .unwrap();
        assert!(wait_for(|| state_of(&f, running) == Some(RequestState::Running)));
        assert!(wait_for(|| f.manager.active_count() == 1));

        assert!(f.scheduler.cancel(running));
        assert_eq!(state_of(&f, running), Some(RequestState::Cancelled));
        assert!(wait_for(|| f.manager.active_count() == 0));

        // The engine's interrupt must not resurrect or retry it
        thread::sleep(Duration::from_millis(30));
        assert_eq!(state_of(&f, running), Some(RequestState::Cancelled));
        assert_eq!(f.scheduler.stats().retried, 0);
        assert!(!f.scheduler.cancel(Uuid::new_v4()));
    }

    #[test]
    fn test_clear_queue_by_priority() {
        let f = fixture(SchedulerConfig::default());
        let low = f
            .scheduler
            .enqueue(AnimationRequest::new("fade", "#a").with_priority(Priority::Low))
            .unwrap();
        let high = f
            .scheduler
            .enqueue(AnimationRequest::new("fade", "#a").with_priority(Priority::High))
            .unwrap();

        assert_eq!(f.scheduler.clear_queue(Some(Priority::Low)), 1);
        assert_eq!(state_of(&f, low), Some(RequestState::Cancelled));
        assert_eq!(f.scheduler.get_status(high).unwrap().queue_position, Some(0));

        assert_eq!(f.scheduler.clear_queue(None), 1);
        assert_eq!(f.scheduler.pending_len(), 0);
    }

    #[test]
    fn test_reduced_motion_skips_non_critical() {
        let f = fixture(SchedulerConfig::default());
        f.policy.set_system_signal(SystemSignal::ReducedMotion(true));
        f.scheduler.initialize().unwrap();

        let normal = f.scheduler.enqueue(AnimationRequest::new("fade", "#a")).unwrap();
        let critical = f
            .scheduler
            .enqueue(AnimationRequest::new("fade", "#a").with_priority(Priority::Critical))
            .unwrap();

        assert!(wait_for(|| state_of(&f, normal) == Some(RequestState::Completed)));
        assert!(wait_for(|| state_of(&f, critical) == Some(RequestState::Running)));
        assert!(wait_for(|| f.manager.stats().started == 1));
        assert_eq!(f.scheduler.stats().skipped, 1);
    }

    #[test]
    fn test_preset_merges_beneath_options() {
        let f = fixture(SchedulerConfig::default());
        f.resources
            .load_resource(
                "slow-fade",
                ResourceKind::Preset,
                || {
                    Ok(ResourcePayload::Preset(PresetData {
                        name: "slow-fade".into(),
                        config: json!({ "duration": 3.0, "ease": "sine" }),
                    }))
                },
                LoadOptions::default(),
            )
            .unwrap();
        f.scheduler.initialize().unwrap();

        let id = f
            .scheduler
            .enqueue(AnimationRequest::new("fade", "#a").with_preset("slow-fade"))
            .unwrap();
        assert!(wait_for(|| f.manager.stats().started == 1));
        // 3s preset duration: still running after 100ms of engine time
        f.engine.run_for(Duration::from_millis(100), Duration::from_millis(16));
        assert_eq!(state_of(&f, id), Some(RequestState::Running));
    }

    #[test]
    fn test_sweep_completed_after_retention() {
        let f = fixture(SchedulerConfig::default());
        let id = f.scheduler.enqueue(AnimationRequest::new("fade", "#a")).unwrap();
        f.scheduler.cancel(id);

        assert_eq!(f.scheduler.sweep_completed(Instant::now()), 0);
        assert_eq!(f.scheduler.sweep_completed(Instant::now() + Duration::from_secs(601)), 1);
        assert!(f.scheduler.get_status(id).is_none());
    }

    #[test]
    fn test_destroy_drops_pending_with_shutdown() {
        let f = fixture(SchedulerConfig::default());
        let got = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&got);
        f.scheduler
            .enqueue(AnimationRequest::new("fade", "#a").on_error(move |_, err| {
                *slot.lock().unwrap() = Some(err);
            }))
            .unwrap();

        f.scheduler.destroy();
        assert_eq!(got.lock().unwrap().clone(), Some(AnimationError::Shutdown));
        assert!(matches!(
            f.scheduler.enqueue(AnimationRequest::new("fade", "#a")),
            Err(AnimationError::Shutdown)
        ));
    }
}
