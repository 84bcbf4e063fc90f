//! choreo - animation orchestration core
//!
//! Prioritized request scheduling over an external tween engine, with a
//! concurrency-gated engine manager, a resource cache/pool, adaptive
//! performance tiers and an accessibility policy layer.

// Core managers (scheduler, engine, resources, monitor, policy)
pub mod core;

pub mod cli;
pub mod config;
pub mod entities;
pub mod headless;
pub mod orchestrator;
pub mod utils;

// Re-export commonly used types from core
pub use core::event_bus::{BoxedEvent, EventBus, downcast_event};
pub use core::{EngineManager, PerformanceMonitor, PolicyLayer, ResourceManager, Scheduler};
pub use orchestrator::{Host, Orchestrator};

// Re-export entities
pub use entities::{AnimationError, AnimationRequest, Priority, RequestId, RequestState, RequestStatus, Target};
