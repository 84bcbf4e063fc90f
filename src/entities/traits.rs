//! Abstract traits for the collaborators this core drives but does not own.
//!
//! - `TweenEngine` / `TweenHandle`: the external tween/timeline engine
//! - `TargetResolver`: selector lookup against the host page
//! - `MemoryProbe`: heap/memory readings
//! - `PreferenceStore`: key-value persistence for user preferences
//!
//! `crate::headless` provides in-process implementations used by the CLI and tests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::error::AnimationError;
use super::preferences::UserPreferences;
use super::sample::MemoryInfo;
use super::target::ElementId;

/// Engine lifecycle events a handle can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleEvent {
    Start,
    Complete,
    /// Killed before completing.
    Interrupt,
}

pub type HandleCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Shared, opaque handle to a running tween or timeline.
pub type EngineHandle = Arc<dyn TweenHandle>;

/// One tween or timeline inside the engine.
///
/// Implementations must not invoke callbacks while holding their own locks;
/// callbacks are allowed to call back into the handle.
pub trait TweenHandle: Send + Sync + fmt::Debug {
    fn play(&self);
    fn pause(&self);
    fn resume(&self);
    /// Stop immediately. Fires `Interrupt` if the handle had not completed.
    fn kill(&self);
    /// Normalised progress in `0.0..=1.0`.
    fn progress(&self) -> f64;
    fn set_progress(&self, value: f64);
    fn duration(&self) -> Duration;
    /// True while playing or paused mid-way (not finished, not killed).
    fn is_active(&self) -> bool;
    fn on_event(&self, event: HandleEvent, callback: HandleCallback);
    /// Append a child to a timeline. Plain tweens ignore it.
    fn append(&self, _child: EngineHandle) {}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineOptions {
    /// Create without starting playback.
    pub paused: bool,
    /// Extra loops after the first pass.
    pub repeat: u32,
}

/// Properties for a single tween.
#[derive(Debug, Clone, PartialEq)]
pub struct TweenProps {
    pub duration: Duration,
    /// Engine-specific vars (easing, css props, ...).
    pub vars: Value,
}

/// Longest tween `from_config` accepts. Larger durations are clamped.
pub const MAX_TWEEN_DURATION: Duration = Duration::from_secs(3600);

impl TweenProps {
    /// Build props from a merged animation config. `duration` is read in seconds.
    pub fn from_config(config: &Value) -> Self {
        let duration = config
            .get("duration")
            .and_then(Value::as_f64)
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(|secs| Duration::try_from_secs_f64(secs).map_or(MAX_TWEEN_DURATION, |d| d.min(MAX_TWEEN_DURATION)))
            .unwrap_or(Duration::from_millis(300));
        Self {
            duration,
            vars: config.clone(),
        }
    }
}

/// The external tween/timeline engine.
pub trait TweenEngine: Send + Sync {
    fn create_timeline(&self, options: &TimelineOptions) -> EngineHandle;
    /// Create a tween on `target`. The returned handle is idle until `play()`.
    fn tween(&self, target: ElementId, props: &TweenProps) -> Result<EngineHandle, AnimationError>;
    fn pause_all(&self);
    fn resume_all(&self);
    fn set_time_scale(&self, scale: f64);
    fn time_scale(&self) -> f64;
    /// Cap on the engine's own tick rate.
    fn set_frame_rate(&self, fps: u32);
    fn frame_rate(&self) -> u32;
}

/// Host lookup of selector strings.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, selector: &str) -> Option<ElementId>;
}

/// Memory readings used for pressure detection.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> Option<MemoryInfo>;
}

/// Persistence for the user-settable preference subset.
pub trait PreferenceStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<UserPreferences>>;
    fn save(&self, prefs: &UserPreferences) -> anyhow::Result<()>;
}

impl<T: TargetResolver + ?Sized> TargetResolver for Arc<T> {
    fn resolve(&self, selector: &str) -> Option<ElementId> {
        (**self).resolve(selector)
    }
}

impl<T: MemoryProbe + ?Sized> MemoryProbe for Arc<T> {
    fn sample(&self) -> Option<MemoryInfo> {
        (**self).sample()
    }
}
