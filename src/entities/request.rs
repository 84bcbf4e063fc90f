//! Animation request model: priority tiers, lifecycle states and the
//! scheduler-owned record that carries a request from enqueue to its terminal state.
//!
//! State machine:
//! ```text
//! Pending -> Running -> Completed
//!                    -> Failed (retry) -> Pending
//!                    -> Failed (terminal)
//! Pending | Running  -> Cancelled
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::error::AnimationError;
use super::target::Target;

/// Request id, generated at enqueue time.
pub type RequestId = Uuid;

/// Engine-side playback key handed out by `EngineManager::play_with`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaybackKey(pub u64);

/// Scheduling priority. Ordering is `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::Low, Priority::Normal, Priority::High, Priority::Critical];

    /// Numeric weight used by cache eviction scoring (Low = 0 .. Critical = 3).
    pub fn weight(self) -> f64 {
        self as u8 as f64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for Priority {
    type Error = AnimationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| AnimationError::Validation(format!("priority {} out of range 0..=3", value)))
    }
}

impl FromStr for Priority {
    type Err = AnimationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(AnimationError::Validation(format!("unknown priority '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed | RequestState::Cancelled)
    }
}

pub type CompleteCallback = Box<dyn FnOnce(RequestId) + Send + 'static>;
pub type ErrorCallback = Box<dyn FnOnce(RequestId, AnimationError) + Send + 'static>;

/// Caller callbacks. Consumed as a pair so exactly one of them ever fires.
#[derive(Default)]
pub struct Callbacks {
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
}

impl Callbacks {
    pub fn complete(self, id: RequestId) {
        if let Some(cb) = self.on_complete {
            cb(id);
        }
    }

    pub fn error(self, id: RequestId, err: AnimationError) {
        if let Some(cb) = self.on_error {
            cb(id, err);
        }
    }
}

/// What a caller hands to `Scheduler::enqueue`.
///
/// # Example
/// ```ignore
/// let request = AnimationRequest::new("fade-in", "#hero")
///     .with_priority(Priority::High)
///     .with_options(json!({ "duration": 0.4 }))
///     .on_complete(|id| log::info!("{} done", id));
/// let id = scheduler.enqueue(request)?;
/// ```
pub struct AnimationRequest {
    pub animation_id: String,
    pub target: Target,
    pub priority: Priority,
    /// Per-request overrides merged over the recipe config.
    pub options: Value,
    /// Cached preset whose config sits beneath `options`.
    pub preset: Option<String>,
    callbacks: Callbacks,
}

impl AnimationRequest {
    pub fn new(animation_id: impl Into<String>, target: impl Into<Target>) -> Self {
        Self {
            animation_id: animation_id.into(),
            target: target.into(),
            priority: Priority::Normal,
            options: Value::Null,
            preset: None,
            callbacks: Callbacks::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(RequestId) + Send + 'static,
    {
        self.callbacks.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(RequestId, AnimationError) + Send + 'static,
    {
        self.callbacks.on_error = Some(Box::new(f));
        self
    }

    /// Reject requests that can never run.
    pub fn validate(&self) -> Result<(), AnimationError> {
        if self.animation_id.trim().is_empty() {
            return Err(AnimationError::Validation("missing animation reference".into()));
        }
        if self.target.is_empty() {
            return Err(AnimationError::Validation("missing target".into()));
        }
        if !(self.options.is_null() || self.options.is_object()) {
            return Err(AnimationError::Validation("options must be an object".into()));
        }
        Ok(())
    }
}

/// Scheduler-owned state of one request.
pub struct RequestRecord {
    pub id: RequestId,
    pub animation_id: String,
    pub target: Target,
    pub priority: Priority,
    pub options: Value,
    pub preset: Option<String>,
    pub state: RequestState,
    pub retries: u32,
    pub created_at: Instant,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub last_error: Option<AnimationError>,
    pub playback: Option<PlaybackKey>,
    callbacks: Option<Callbacks>,
}

impl RequestRecord {
    pub fn new(id: RequestId, request: AnimationRequest) -> Self {
        Self {
            id,
            animation_id: request.animation_id,
            target: request.target,
            priority: request.priority,
            options: request.options,
            preset: request.preset,
            state: RequestState::Pending,
            retries: 0,
            created_at: Instant::now(),
            start_time: None,
            end_time: None,
            last_error: None,
            playback: None,
            callbacks: Some(request.callbacks),
        }
    }

    /// Take the callback pair. Returns `None` once they have been taken.
    pub fn take_callbacks(&mut self) -> Option<Callbacks> {
        self.callbacks.take()
    }

    /// Running time so far, or total time once terminal.
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.start_time?;
        Some(self.end_time.unwrap_or_else(Instant::now).saturating_duration_since(start))
    }

    pub fn status(&self, queue_position: Option<usize>) -> RequestStatus {
        RequestStatus {
            id: self.id,
            animation_id: self.animation_id.clone(),
            target: self.target.to_string(),
            state: self.state,
            priority: self.priority,
            retries: self.retries,
            queue_position,
            retry_in_ms: None,
            elapsed_ms: if self.state.is_terminal() || self.state == RequestState::Running {
                self.elapsed().map(|d| d.as_millis() as u64)
            } else {
                None
            },
            error: self.last_error.as_ref().map(|e| e.to_string()),
        }
    }
}

impl fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRecord")
            .field("id", &self.id)
            .field("animation_id", &self.animation_id)
            .field("target", &self.target)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("retries", &self.retries)
            .finish()
    }
}

/// Plain status snapshot returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestStatus {
    pub id: RequestId,
    pub animation_id: String,
    pub target: String,
    pub state: RequestState,
    pub priority: Priority,
    pub retries: u32,
    /// Zero-based position while waiting in the queue. `None` for a Pending
    /// request sitting out a retry backoff; see `retry_in_ms`.
    pub queue_position: Option<usize>,
    /// Time left before a backed-off retry re-enters the queue.
    pub retry_in_ms: Option<u64>,
    pub elapsed_ms: Option<u64>,
    pub error: Option<String>,
}
