//! Error types shared by the orchestration core.
//!
//! Errors are plain enums so they can be cloned into request records and handed
//! to caller callbacks. The binary wraps them in `anyhow` at the edge.

use std::fmt;
use std::time::Duration;

use super::resource::ResourceKind;

/// Failures of a scheduled animation request.
#[derive(Debug, Clone, PartialEq)]
pub enum AnimationError {
    /// Malformed request, rejected before it is queued.
    Validation(String),
    /// No animation recipe is registered under this id.
    UnknownAnimation(String),
    /// Target selector matched nothing at execution time.
    TargetResolution(String),
    /// The animation factory or engine refused to build/run the animation.
    EngineExecution(String),
    /// Gave up waiting for a free engine slot.
    CapacityExceeded { waited: Duration },
    /// The engine killed the animation before it completed.
    Interrupted,
    /// Cancelled by the caller (or by a queue clear).
    Cancelled,
    /// The scheduler was destroyed while the request was still pending.
    Shutdown,
}

impl AnimationError {
    /// Whether the scheduler may re-queue a request that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AnimationError::TargetResolution(_)
                | AnimationError::EngineExecution(_)
                | AnimationError::CapacityExceeded { .. }
                | AnimationError::Interrupted
        )
    }
}

impl fmt::Display for AnimationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnimationError::Validation(msg) => write!(f, "Invalid request: {}", msg),
            AnimationError::UnknownAnimation(id) => write!(f, "Animation '{}' is not registered", id),
            AnimationError::TargetResolution(target) => {
                write!(f, "Target '{}' could not be resolved", target)
            }
            AnimationError::EngineExecution(msg) => write!(f, "Engine execution failed: {}", msg),
            AnimationError::CapacityExceeded { waited } => {
                write!(f, "No free animation slot after {} ms", waited.as_millis())
            }
            AnimationError::Interrupted => write!(f, "Animation was interrupted"),
            AnimationError::Cancelled => write!(f, "Animation was cancelled"),
            AnimationError::Shutdown => write!(f, "Scheduler shut down"),
        }
    }
}

impl std::error::Error for AnimationError {}

/// Failures of the resource cache and instance pool.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceError {
    /// Loader did not settle within the timeout. The load itself is abandoned, not aborted.
    Timeout { id: String, timeout: Duration },
    /// Loader returned an error (or panicked).
    Load { id: String, reason: String },
    /// Every pooled instance for this signature is in use and the pool is full.
    PoolExhausted { key: String },
    /// No instance factory registered for this kind.
    NoFactory(ResourceKind),
    /// Loader threads are gone.
    Shutdown,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::Timeout { id, timeout } => {
                write!(f, "Loading '{}' timed out after {} ms", id, timeout.as_millis())
            }
            ResourceError::Load { id, reason } => write!(f, "Loading '{}' failed: {}", id, reason),
            ResourceError::PoolExhausted { key } => write!(f, "Instance pool '{}' exhausted", key),
            ResourceError::NoFactory(kind) => write!(f, "No instance factory for {}", kind),
            ResourceError::Shutdown => write!(f, "Resource loader shut down"),
        }
    }
}

impl std::error::Error for ResourceError {}

/// Failures of the preference layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyError {
    /// Value has the wrong type or is out of range for the key.
    InvalidValue { key: String, reason: String },
    /// Persisting or reading user preferences failed.
    Store(String),
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyError::InvalidValue { key, reason } => {
                write!(f, "Invalid value for '{}': {}", key, reason)
            }
            PolicyError::Store(msg) => write!(f, "Preference store error: {}", msg),
        }
    }
}

impl std::error::Error for PolicyError {}
