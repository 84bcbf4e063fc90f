//! Core orchestration modules - scheduler, engine, resources, performance, policy
//!
//! Each manager is an explicit long-lived object; the orchestrator wires them.

pub mod announcer;
pub mod engine_manager;
pub mod event_bus;
pub mod events;
pub mod instance_pool;
pub mod perf_monitor;
pub mod policy;
pub mod request_queue;
pub mod resource_manager;
pub mod scheduler;
pub mod slot_gate;
pub mod ticker;
pub mod workers;

// Re-exports for convenience
pub use engine_manager::EngineManager;
pub use event_bus::EventBus;
pub use perf_monitor::PerformanceMonitor;
pub use policy::PolicyLayer;
pub use resource_manager::ResourceManager;
pub use scheduler::Scheduler;
pub use workers::Workers;
