//! Deterministic in-process implementations of the external collaborators.
//!
//! - `HeadlessEngine`: tick-driven tween/timeline engine. Nothing moves until
//!   `advance(dt)` is called, which makes engine timing fully controllable.
//! - `Stage`: selector registry implementing `TargetResolver`.
//! - `FixedMemory`: settable `MemoryProbe`.
//!
//! Used by the `choreo` binary and throughout the tests.

use log::trace;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::entities::{
    AnimationError, ElementId, EngineHandle, HandleCallback, HandleEvent, MemoryInfo, MemoryProbe,
    TargetResolver, TimelineOptions, TweenEngine, TweenHandle, TweenProps,
};

pub type FrameObserver = Arc<dyn Fn(Duration) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Playing,
    Paused,
    Done,
    Killed,
}

struct TweenState {
    /// One pass.
    duration: Duration,
    repeat: u32,
    elapsed: Duration,
    phase: Phase,
    started: bool,
    listeners: Vec<(HandleEvent, HandleCallback)>,
    children: Vec<EngineHandle>,
}

impl TweenState {
    fn total(&self) -> Duration {
        self.duration * (self.repeat + 1)
    }

    fn callbacks_for(&self, event: HandleEvent) -> Vec<HandleCallback> {
        self.listeners
            .iter()
            .filter(|(e, _)| *e == event)
            .map(|(_, cb)| Arc::clone(cb))
            .collect()
    }
}

/// Handle created by `HeadlessEngine`.
pub struct HeadlessTween {
    id: u64,
    target: Option<ElementId>,
    is_timeline: bool,
    state: Mutex<TweenState>,
}

impl fmt::Debug for HeadlessTween {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("HeadlessTween")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("timeline", &self.is_timeline)
            .field("phase", &state.phase)
            .field("elapsed", &state.elapsed)
            .field("duration", &state.duration)
            .finish()
    }
}

impl HeadlessTween {
    fn new(id: u64, target: Option<ElementId>, is_timeline: bool, duration: Duration, repeat: u32) -> Self {
        Self {
            id,
            target,
            is_timeline,
            state: Mutex::new(TweenState {
                duration,
                repeat,
                elapsed: Duration::ZERO,
                phase: Phase::Idle,
                started: false,
                listeners: Vec::new(),
                children: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TweenState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn phase(&self) -> Phase {
        self.lock().phase
    }

    fn is_finished(&self) -> bool {
        matches!(self.phase(), Phase::Done | Phase::Killed)
    }

    /// Advance by `dt`; returns callbacks to fire once no lock is held.
    fn step(&self, dt: Duration) -> Vec<HandleCallback> {
        let mut state = self.lock();
        if state.phase != Phase::Playing {
            return Vec::new();
        }

        let mut fire = Vec::new();
        if !state.started {
            state.started = true;
            fire.extend(state.callbacks_for(HandleEvent::Start));
        }

        let total = state.total();
        state.elapsed = (state.elapsed + dt).min(total);
        if state.elapsed >= total {
            state.phase = Phase::Done;
            fire.extend(state.callbacks_for(HandleEvent::Complete));
        }
        fire
    }
}

impl TweenHandle for HeadlessTween {
    fn play(&self) {
        let mut state = self.lock();
        if matches!(state.phase, Phase::Idle | Phase::Paused) {
            state.phase = Phase::Playing;
        }
    }

    fn pause(&self) {
        let mut state = self.lock();
        if state.phase == Phase::Playing {
            state.phase = Phase::Paused;
        }
    }

    fn resume(&self) {
        let mut state = self.lock();
        if state.phase == Phase::Paused {
            state.phase = Phase::Playing;
        }
    }

    fn kill(&self) {
        let (fire, children) = {
            let mut state = self.lock();
            if matches!(state.phase, Phase::Done | Phase::Killed) {
                return;
            }
            state.phase = Phase::Killed;
            (state.callbacks_for(HandleEvent::Interrupt), std::mem::take(&mut state.children))
        };
        trace!("Headless tween {} killed", self.id);
        for child in children {
            child.kill();
        }
        for cb in fire {
            cb();
        }
    }

    fn progress(&self) -> f64 {
        let state = self.lock();
        let total = state.total();
        if total.is_zero() {
            return if state.phase == Phase::Done { 1.0 } else { 0.0 };
        }
        (state.elapsed.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0)
    }

    fn set_progress(&self, value: f64) {
        let mut state = self.lock();
        let total = state.total();
        state.elapsed = total.mul_f64(value.clamp(0.0, 1.0));
    }

    fn duration(&self) -> Duration {
        self.lock().total()
    }

    fn is_active(&self) -> bool {
        matches!(self.phase(), Phase::Playing | Phase::Paused)
    }

    fn on_event(&self, event: HandleEvent, callback: HandleCallback) {
        self.lock().listeners.push((event, callback));
    }

    fn append(&self, child: EngineHandle) {
        if !self.is_timeline {
            return;
        }
        let mut state = self.lock();
        state.duration += child.duration();
        state.children.push(child);
    }
}

struct EngineState {
    handles: Vec<Arc<HeadlessTween>>,
    paused: bool,
    time_scale: f64,
    frame_rate: u32,
    clock: Duration,
}

/// Tick-driven tween engine.
///
/// # Example
/// ```ignore
/// let engine = Arc::new(HeadlessEngine::new());
/// let tween = engine.tween(ElementId(1), &props)?;
/// tween.play();
/// engine.advance(Duration::from_millis(16));
/// ```
pub struct HeadlessEngine {
    state: Mutex<EngineState>,
    next_id: AtomicU64,
    frame_observer: RwLock<Option<FrameObserver>>,
}

impl Default for HeadlessEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState {
                handles: Vec::new(),
                paused: false,
                time_scale: 1.0,
                frame_rate: 60,
                clock: Duration::ZERO,
            }),
            next_id: AtomicU64::new(1),
            frame_observer: RwLock::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, tween: HeadlessTween) -> Arc<HeadlessTween> {
        let tween = Arc::new(tween);
        self.lock().handles.push(Arc::clone(&tween));
        tween
    }

    /// Called with the wall-clock `dt` after every `advance`.
    pub fn set_frame_observer(&self, observer: FrameObserver) {
        *self.frame_observer.write().unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    /// One engine tick. Progress is `dt * time_scale`; nothing moves while paused.
    pub fn advance(&self, dt: Duration) {
        let snapshot = {
            let mut state = self.lock();
            if state.paused {
                None
            } else {
                state.clock += dt;
                Some((state.handles.clone(), dt.mul_f64(state.time_scale.max(0.0))))
            }
        };

        if let Some((handles, scaled)) = snapshot {
            let fire: Vec<HandleCallback> = handles.iter().flat_map(|h| h.step(scaled)).collect();

            // Drop finished handles and idle ones nobody else references
            self.lock().handles.retain(|h| {
                !h.is_finished() && (Arc::strong_count(h) > 2 || h.phase() != Phase::Idle)
            });
            drop(handles);

            for cb in fire {
                cb();
            }
        }

        let observer = self.frame_observer.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(observer) = observer {
            observer(dt);
        }
    }

    /// Advance in fixed steps until `total` has elapsed.
    pub fn run_for(&self, total: Duration, step: Duration) {
        let step = step.max(Duration::from_millis(1));
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.advance(step);
            elapsed += step;
        }
    }

    pub fn playing_count(&self) -> usize {
        let handles = self.lock().handles.clone();
        handles.iter().filter(|h| h.phase() == Phase::Playing).count()
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Engine time elapsed while not paused.
    pub fn clock(&self) -> Duration {
        self.lock().clock
    }
}

impl TweenEngine for HeadlessEngine {
    fn create_timeline(&self, options: &TimelineOptions) -> EngineHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timeline = self.register(HeadlessTween::new(id, None, true, Duration::ZERO, options.repeat));
        if !options.paused {
            timeline.play();
        }
        timeline
    }

    fn tween(&self, target: ElementId, props: &TweenProps) -> Result<EngineHandle, AnimationError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let repeat = props
            .vars
            .get("repeat")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;
        Ok(self.register(HeadlessTween::new(id, Some(target), false, props.duration, repeat)))
    }

    fn pause_all(&self) {
        self.lock().paused = true;
    }

    fn resume_all(&self) {
        self.lock().paused = false;
    }

    fn set_time_scale(&self, scale: f64) {
        self.lock().time_scale = scale;
    }

    fn time_scale(&self) -> f64 {
        self.lock().time_scale
    }

    fn set_frame_rate(&self, fps: u32) {
        self.lock().frame_rate = fps.max(1);
    }

    fn frame_rate(&self) -> u32 {
        self.lock().frame_rate
    }
}

/// Selector registry standing in for the host page.
#[derive(Debug, Default)]
pub struct Stage {
    elements: RwLock<HashMap<String, ElementId>>,
    next_id: AtomicU64,
}

impl Stage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or look up) an element under `selector`.
    pub fn add(&self, selector: &str) -> ElementId {
        let mut elements = self.elements.write().unwrap_or_else(|e| e.into_inner());
        *elements
            .entry(selector.to_string())
            .or_insert_with(|| ElementId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1))
    }

    pub fn remove(&self, selector: &str) -> bool {
        self.elements
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(selector)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.elements.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TargetResolver for Stage {
    fn resolve(&self, selector: &str) -> Option<ElementId> {
        self.elements
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(selector)
            .copied()
    }
}

/// Memory probe returning whatever was last set.
#[derive(Debug, Default)]
pub struct FixedMemory {
    info: Mutex<Option<MemoryInfo>>,
}

impl FixedMemory {
    pub fn new(used: u64, limit: u64) -> Self {
        Self {
            info: Mutex::new(Some(MemoryInfo { used, limit })),
        }
    }

    pub fn set(&self, used: u64, limit: u64) {
        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = Some(MemoryInfo { used, limit });
    }
}

impl MemoryProbe for FixedMemory {
    fn sample(&self) -> Option<MemoryInfo> {
        *self.info.lock().unwrap_or_else(|e| e.into_inner())
    }
}
