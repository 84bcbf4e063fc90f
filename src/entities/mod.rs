//! Entities - plain data types and the traits at the boundary to external collaborators.

pub mod error;
pub mod preferences;
pub mod request;
pub mod resource;
pub mod sample;
pub mod target;
pub mod traits;

pub use error::{AnimationError, PolicyError, ResourceError};
pub use preferences::{
    Accommodations, ColorScheme, PreferenceKey, PreferenceValue, Preferences, SystemSignal, SystemSignals,
    UserPreferences,
};
pub use request::{AnimationRequest, PlaybackKey, Priority, RequestId, RequestRecord, RequestState, RequestStatus};
pub use resource::{
    AssetData, CacheEntry, PresetData, ResourceKind, ResourcePayload, Teardown, TimelineTemplate, TweenInstance,
};
pub use sample::{DeviceInfo, MemoryInfo, PerformanceSample, PerformanceTier};
pub use target::{ElementId, Target};
pub use traits::{
    EngineHandle, HandleCallback, HandleEvent, MAX_TWEEN_DURATION, MemoryProbe, PreferenceStore, TargetResolver,
    TimelineOptions, TweenEngine, TweenHandle, TweenProps,
};
