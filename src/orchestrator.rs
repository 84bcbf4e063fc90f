//! Composition root: builds the managers leaves-first, wires them through the
//! `EventBus` and runs the 1s maintenance ticker.
//!
//! Wiring:
//! - `PerformanceTierChanged` → engine concurrency ceiling (never above the configured one) + frame rate
//! - `PreferencesApplied`     → engine time-scale + monitor user constraints
//! - page visibility          → engine pause/resume + resource hidden tracking
//!
//! Subscribers hold `Weak` references so the bus never keeps a manager alive.

use anyhow::{Context, Result};
use log::{debug, info, trace};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::core::engine_manager::{EngineManager, EngineStatsSnapshot};
use crate::core::event_bus::{EventBus, downcast_event};
use crate::core::events::{MemoryPressure, PerformanceTierChanged, PreferencesApplied, RequestFinished};
use crate::core::perf_monitor::{PerformanceMonitor, PerformanceReport, SystemMemoryProbe};
use crate::core::policy::{AppliedPolicy, PolicyLayer};
use crate::core::resource_manager::{ResourceManager, ResourceStats};
use crate::core::scheduler::{Scheduler, SchedulerStatsSnapshot};
use crate::core::ticker::Ticker;
use crate::entities::{
    AnimationError, AnimationRequest, DeviceInfo, MemoryProbe, Preferences, PreferenceStore, RequestId, RequestStatus,
    SystemSignals, TargetResolver, TweenEngine,
};
use crate::headless::FrameObserver;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Everything the host needs to plug in besides the engine itself.
pub struct Host {
    pub resolver: Arc<dyn TargetResolver>,
    pub store: Arc<dyn PreferenceStore>,
    pub memory: Arc<dyn MemoryProbe>,
    pub device: DeviceInfo,
    pub signals: SystemSignals,
}

impl Host {
    /// Host backed by the real machine: sysinfo memory probe and detected device.
    pub fn system(resolver: Arc<dyn TargetResolver>, store: Arc<dyn PreferenceStore>) -> Self {
        Self {
            resolver,
            store,
            memory: Arc::new(SystemMemoryProbe::new()),
            device: DeviceInfo::detect(),
            signals: SystemSignals::default(),
        }
    }
}

/// Combined snapshot for diagnostics output.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorReport {
    pub scheduler: SchedulerStatsSnapshot,
    pub engine: EngineStatsSnapshot,
    pub resources: ResourceStats,
    pub performance: PerformanceReport,
    pub preferences: Preferences,
    pub policy: AppliedPolicy,
}

pub struct Orchestrator {
    bus: EventBus,
    policy: Arc<PolicyLayer>,
    monitor: Arc<PerformanceMonitor>,
    resources: Arc<ResourceManager>,
    engine: Arc<EngineManager>,
    scheduler: Arc<Scheduler>,
    maintenance: Mutex<Option<Ticker>>,
    destroyed: AtomicBool,
}

impl Orchestrator {
    pub fn initialize(settings: &Settings, engine: Arc<dyn TweenEngine>, host: Host) -> Result<Self> {
        let settings = settings.clone().sanitized();
        let bus = EventBus::new();

        let policy = Arc::new(PolicyLayer::with_signals(host.store, host.signals, Some(bus.clone())));
        let monitor = Arc::new(PerformanceMonitor::new(
            host.memory,
            host.device,
            settings.monitor(),
            Some(bus.clone()),
        ));
        let resources = Arc::new(ResourceManager::new(
            settings.resources(),
            Arc::clone(&monitor),
            Some(bus.clone()),
        ));
        let engine = Arc::new(EngineManager::new(
            engine,
            host.resolver,
            Arc::clone(&policy),
            settings.engine(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&engine),
            Arc::clone(&resources),
            Arc::clone(&policy),
            settings.scheduler(),
            Some(bus.clone()),
        ));

        let orchestrator = Self {
            bus,
            policy,
            monitor,
            resources,
            engine,
            scheduler,
            maintenance: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        };
        orchestrator.wire();

        // Push the loaded policy through the freshly wired subscribers
        orchestrator.policy.apply_preferences();

        orchestrator
            .monitor
            .start_monitoring()
            .context("Failed to start performance monitoring")?;
        orchestrator.scheduler.initialize().context("Failed to start scheduler")?;
        orchestrator.start_maintenance().context("Failed to start maintenance ticker")?;

        info!(
            "Orchestrator initialized: max_concurrent={}, max_retries={}, cache={}",
            settings.max_concurrent, settings.max_retries, settings.cache_max_entries
        );
        Ok(orchestrator)
    }

    fn wire(&self) {
        let engine = Arc::downgrade(&self.engine);
        self.bus.subscribe::<PerformanceTierChanged, _>(move |e| {
            if let Some(engine) = engine.upgrade() {
                let ceiling = e.new.suggested_concurrency().min(engine.configured_max_concurrent());
                engine.set_max_concurrent(ceiling);
                engine.set_frame_rate(e.new.target_frame_rate());
            }
        });

        let engine = Arc::downgrade(&self.engine);
        let monitor = Arc::downgrade(&self.monitor);
        self.bus.subscribe::<PreferencesApplied, _>(move |e| {
            if let Some(engine) = engine.upgrade() {
                engine.set_time_scale(e.time_scale);
            }
            if let Some(monitor) = monitor.upgrade() {
                monitor.set_user_constraints(e.reduce_motion, e.data_saver);
            }
        });
    }

    fn start_maintenance(&self) -> std::io::Result<()> {
        let resources = Arc::downgrade(&self.resources);
        let engine = Arc::downgrade(&self.engine);
        let scheduler = Arc::downgrade(&self.scheduler);
        let policy = Arc::downgrade(&self.policy);
        let bus = self.bus.clone();
        let mut last_gc = Instant::now();

        let ticker = Ticker::spawn("choreo-maintenance", MAINTENANCE_INTERVAL, move || {
            let now = Instant::now();
            if let Some(resources) = resources.upgrade() {
                resources.tick(now);
            }
            if let Some(policy) = policy.upgrade() {
                policy.announcer().sweep(now);
            }
            if now.saturating_duration_since(last_gc) >= GC_INTERVAL {
                last_gc = now;
                if let Some(engine) = engine.upgrade() {
                    let report = engine.cleanup(false);
                    debug!("Engine cleanup: {:?}", report);
                }
                if let Some(scheduler) = scheduler.upgrade() {
                    scheduler.sweep_completed(now);
                }
            }
            drain_events(&bus);
        })?;

        *self.maintenance.lock().unwrap_or_else(|e| e.into_inner()) = Some(ticker);
        Ok(())
    }

    /// Stop every loop and release engine handles. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut ticker) = self.maintenance.lock().unwrap_or_else(|e| e.into_inner()).take() {
            ticker.stop();
        }
        self.scheduler.close();
        // Frees every slot so a drain waiting on the ceiling can finish
        self.engine.destroy();
        self.scheduler.destroy();
        self.monitor.stop_monitoring();
        self.resources.clear();
        self.bus.clear();
        info!("Orchestrator destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Frame hook for the host's render loop; feeds the frame-rate sampler.
    pub fn frame_observer(&self) -> FrameObserver {
        let monitor = Arc::downgrade(&self.monitor);
        Arc::new(move |dt| {
            if let Some(monitor) = monitor.upgrade() {
                monitor.record_frame(dt);
            }
        })
    }

    pub fn set_page_visible(&self, visible: bool) {
        debug!("Page {}", if visible { "visible" } else { "hidden" });
        self.engine.set_page_visible(visible);
        self.resources.set_page_visible(visible);
    }

    // --- Caller API ---

    pub fn enqueue(&self, request: AnimationRequest) -> Result<RequestId, AnimationError> {
        self.scheduler.enqueue(request)
    }

    pub fn cancel(&self, id: RequestId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn get_status(&self, id: RequestId) -> Option<RequestStatus> {
        self.scheduler.get_status(id)
    }

    pub fn report(&self) -> OrchestratorReport {
        OrchestratorReport {
            scheduler: self.scheduler.stats(),
            engine: self.engine.stats(),
            resources: self.resources.stats(),
            performance: self.monitor.get_performance_report(),
            preferences: self.policy.get_preferences(),
            policy: self.policy.applied(),
        }
    }

    // --- Components ---

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn engine(&self) -> &Arc<EngineManager> {
        &self.engine
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn policy(&self) -> &Arc<PolicyLayer> {
        &self.policy
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Nobody polls the queue in headless use; drain it so it never fills up.
fn drain_events(bus: &EventBus) {
    for event in bus.poll() {
        if let Some(e) = downcast_event::<RequestFinished>(&event) {
            trace!("event: request {} {:?} (retries {})", e.id, e.state, e.retries);
        } else if let Some(e) = downcast_event::<PerformanceTierChanged>(&event) {
            trace!("event: tier {} -> {}", e.old, e.new);
        } else if let Some(e) = downcast_event::<MemoryPressure>(&event) {
            trace!("event: memory pressure {:.2}", e.usage_fraction);
        } else if downcast_event::<PreferencesApplied>(&event).is_some() {
            trace!("event: preferences applied");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine_manager::tween_factory;
    use crate::core::policy::{MemoryPreferenceStore, REDUCED_TIME_SCALE};
    use crate::entities::{PerformanceTier, Priority, RequestState, SystemSignal};
    use crate::headless::{FixedMemory, HeadlessEngine, Stage};
    use serde_json::json;
    use std::thread;

    struct Fixture {
        orchestrator: Orchestrator,
        engine: Arc<HeadlessEngine>,
        stage: Arc<Stage>,
    }

    fn fixture(settings: Settings) -> Fixture {
        let engine = Arc::new(HeadlessEngine::new());
        let stage = Arc::new(Stage::new());
        let host = Host {
            resolver: stage.clone(),
            store: Arc::new(MemoryPreferenceStore::new()),
            memory: Arc::new(FixedMemory::new(10, 100)),
            device: DeviceInfo {
                cores: 8,
                memory_bytes: 16 << 30,
            },
            signals: SystemSignals::default(),
        };
        let orchestrator = Orchestrator::initialize(&settings, engine.clone(), host).unwrap();
        orchestrator
            .engine()
            .register_animation("fade", tween_factory(), json!({ "duration": 0.05 }));
        engine.set_frame_observer(orchestrator.frame_observer());
        Fixture {
            orchestrator,
            engine,
            stage,
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

    #[test]
    fn test_reduced_motion_signal_drops_time_scale() {
        let f = fixture(Settings::default());
        let policy = f.orchestrator.policy();
        assert!(!policy.get_preferences().reduce_motion);
        assert_eq!(f.orchestrator.engine().time_scale(), 1.0);

        assert!(policy.set_system_signal(SystemSignal::ReducedMotion(true)));
        assert!(policy.get_preferences().reduce_motion);
        assert!(policy.should_reduce_motion());
        assert_eq!(f.orchestrator.engine().time_scale(), REDUCED_TIME_SCALE);
        assert_eq!(f.engine.time_scale(), REDUCED_TIME_SCALE);

        policy.set_system_signal(SystemSignal::ReducedMotion(false));
        assert_eq!(f.orchestrator.engine().time_scale(), 1.0);
    }

    #[test]
    fn test_tier_change_lowers_concurrency() {
        let f = fixture(Settings {
            max_concurrent: 8,
            ..Settings::default()
        });
        let engine = f.orchestrator.engine();
        assert_eq!(engine.max_concurrent(), 8);

        f.orchestrator.bus().emit(PerformanceTierChanged {
            old: PerformanceTier::High,
            new: PerformanceTier::Low,
        });
        assert_eq!(engine.max_concurrent(), 3);
        assert_eq!(engine.frame_rate(), 30);

        // Never raised above the configured ceiling
        f.orchestrator.bus().emit(PerformanceTierChanged {
            old: PerformanceTier::Low,
            new: PerformanceTier::High,
        });
        assert_eq!(engine.max_concurrent(), 8);
        assert_eq!(engine.frame_rate(), 60);
    }

    #[test]
    fn test_request_end_to_end() {
        let f = fixture(Settings::default());
        f.stage.add("#hero");
        let id = f
            .orchestrator
            .enqueue(AnimationRequest::new("fade", "#hero").with_priority(Priority::High))
            .unwrap();

        assert!(wait_for(|| f.orchestrator.engine().stats().started == 1));
        f.engine.run_for(Duration::from_millis(80), Duration::from_millis(16));
        assert!(wait_for(|| f
            .orchestrator
            .get_status(id)
            .is_some_and(|s| s.state == RequestState::Completed)));

        let report = f.orchestrator.report();
        assert_eq!(report.scheduler.completed, 1);
        assert!(serde_json::to_string(&report).is_ok());
    }

    #[test]
    fn test_page_hidden_pauses_engine() {
        let f = fixture(Settings::default());
        f.orchestrator.set_page_visible(false);
        assert!(f.orchestrator.engine().is_paused());
        assert!(f.engine.is_paused());
        f.orchestrator.set_page_visible(true);
        assert!(!f.orchestrator.engine().is_paused());
    }

    #[test]
    fn test_destroy_idempotent() {
        let f = fixture(Settings::default());
        f.orchestrator.destroy();
        f.orchestrator.destroy();
        assert!(f.orchestrator.is_destroyed());
        assert!(!f.orchestrator.monitor().is_monitoring());
        assert!(matches!(
            f.orchestrator.enqueue(AnimationRequest::new("fade", "#a")),
            Err(AnimationError::Shutdown)
        ));
    }
}
