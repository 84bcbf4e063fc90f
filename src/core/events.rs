//! Events published on the `EventBus` by the orchestration managers.

use crate::entities::{Accommodations, PerformanceTier, RequestId, RequestState};

/// Performance tier moved after an evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceTierChanged {
    pub old: PerformanceTier,
    pub new: PerformanceTier,
}

/// The policy layer recomputed and applied the effective policy.
#[derive(Debug, Clone, Copy)]
pub struct PreferencesApplied {
    pub time_scale: f64,
    pub reduce_motion: bool,
    pub data_saver: bool,
    pub accommodations: Accommodations,
}

/// Memory usage crossed the pressure threshold.
#[derive(Debug, Clone, Copy)]
pub struct MemoryPressure {
    pub usage_fraction: f64,
}

/// A request reached a terminal state.
#[derive(Debug, Clone)]
pub struct RequestFinished {
    pub id: RequestId,
    pub state: RequestState,
    pub retries: u32,
    pub error: Option<String>,
}
