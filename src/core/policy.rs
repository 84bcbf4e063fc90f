//! Policy layer: single source of truth for motion/visual/interaction preferences.
//!
//! Merges host system signals with persisted user overrides, validates and
//! persists changes, and publishes the effective policy (`PreferencesApplied`)
//! so the engine manager can set its global time-scale.
//!
//! Accessibility invariant: an active system reduced-motion signal always
//! yields `reduce_motion = true`, whatever the stored user values say.

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::announcer::{Announcer, Politeness};
use crate::core::event_bus::EventBus;
use crate::core::events::PreferencesApplied;
use crate::entities::preferences::{MAX_SPEED_MULTIPLIER, MIN_SPEED_MULTIPLIER};
use crate::entities::{
    Accommodations, ColorScheme, PolicyError, PreferenceKey, PreferenceStore, PreferenceValue, Preferences,
    SystemSignal, SystemSignals, UserPreferences,
};

/// Global time-scale while motion is reduced or animations are disabled.
pub const REDUCED_TIME_SCALE: f64 = 0.01;

/// Result of one preference application.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AppliedPolicy {
    pub time_scale: f64,
    pub reduce_motion: bool,
    pub data_saver: bool,
    pub accommodations: Accommodations,
}

impl AppliedPolicy {
    fn compute(effective: &Preferences, system: &SystemSignals) -> Self {
        let reduce_motion = effective.reduce_motion || !effective.enable_animations;
        Self {
            time_scale: if reduce_motion {
                REDUCED_TIME_SCALE
            } else {
                effective.animation_speed_multiplier
            },
            reduce_motion,
            data_saver: system.data_saver,
            accommodations: Accommodations {
                reduced_motion: effective.reduce_motion,
                high_contrast: effective.high_contrast,
                color_blind_friendly: effective.color_blind_friendly,
                larger_click_targets: effective.larger_click_targets,
                reduced_transparency: effective.reduced_transparency,
                dark_scheme: system.color_scheme == ColorScheme::Dark,
            },
        }
    }
}

struct PolicyState {
    user: UserPreferences,
    system: SystemSignals,
    effective: Preferences,
    applied: AppliedPolicy,
    assistive_tech: bool,
}

pub struct PolicyLayer {
    state: Mutex<PolicyState>,
    store: Arc<dyn PreferenceStore>,
    announcer: Announcer,
    bus: Option<EventBus>,
}

impl PolicyLayer {
    /// Load persisted user preferences and apply them with default system signals.
    pub fn new(store: Arc<dyn PreferenceStore>, bus: Option<EventBus>) -> Self {
        Self::with_signals(store, SystemSignals::default(), bus)
    }

    pub fn with_signals(store: Arc<dyn PreferenceStore>, system: SystemSignals, bus: Option<EventBus>) -> Self {
        let user = match store.load() {
            Ok(Some(user)) => sanitize(user),
            Ok(None) => UserPreferences::default(),
            Err(e) => {
                warn!("Failed to load preferences, using defaults: {:#}", e);
                UserPreferences::default()
            }
        };
        let effective = Preferences::derive(&user, &system);
        let applied = AppliedPolicy::compute(&effective, &system);

        let layer = Self {
            state: Mutex::new(PolicyState {
                user,
                system,
                effective,
                applied,
                assistive_tech: false,
            }),
            store,
            announcer: Announcer::default(),
            bus,
        };
        let applied = layer.apply_preferences();
        info!(
            "PolicyLayer init: time_scale={}, reduce_motion={}",
            applied.time_scale, applied.reduce_motion
        );
        layer
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PolicyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_preferences(&self) -> Preferences {
        self.lock().effective.clone()
    }

    pub fn user_preferences(&self) -> UserPreferences {
        self.lock().user.clone()
    }

    pub fn system_signals(&self) -> SystemSignals {
        self.lock().system
    }

    /// Validate, persist and re-apply one change. Returns whether it changed anything.
    pub fn update_preference(
        &self,
        key: PreferenceKey,
        value: impl Into<PreferenceValue>,
    ) -> Result<bool, PolicyError> {
        self.update_preferences(&[(key, value.into())]).map(|n| n > 0)
    }

    /// Apply a batch atomically: either every change validates or none is applied.
    /// Returns the number of keys whose value changed.
    pub fn update_preferences(&self, changes: &[(PreferenceKey, PreferenceValue)]) -> Result<usize, PolicyError> {
        let (user, changed) = {
            let mut state = self.lock();
            let mut user = state.user.clone();
            let mut changed = 0;
            for (key, value) in changes {
                if user.set(*key, *value)? {
                    changed += 1;
                }
            }
            if changed == 0 {
                return Ok(0);
            }
            state.user = user.clone();
            debug!("Preferences updated: {} key(s) changed", changed);
            (user, changed)
        };

        self.persist(&user);
        self.apply_preferences();
        Ok(changed)
    }

    /// Restore user defaults (system signals still apply).
    pub fn reset(&self) {
        let user = UserPreferences::default();
        self.lock().user = user.clone();
        self.persist(&user);
        self.apply_preferences();
    }

    fn persist(&self, user: &UserPreferences) {
        if let Err(e) = self.store.save(user) {
            warn!("Failed to persist preferences: {:#}", e);
        }
    }

    /// Recompute effective preferences and publish them.
    pub fn apply_preferences(&self) -> AppliedPolicy {
        let applied = {
            let mut state = self.lock();
            state.effective = Preferences::derive(&state.user, &state.system);
            state.applied = AppliedPolicy::compute(&state.effective, &state.system);
            state.applied
        };
        debug!(
            "Policy applied: time_scale={}, reduce_motion={}, accommodations={:?}",
            applied.time_scale, applied.reduce_motion, applied.accommodations
        );
        if let Some(bus) = &self.bus {
            bus.emit(PreferencesApplied {
                time_scale: applied.time_scale,
                reduce_motion: applied.reduce_motion,
                data_saver: applied.data_saver,
                accommodations: applied.accommodations,
            });
        }
        applied
    }

    pub fn applied(&self) -> AppliedPolicy {
        self.lock().applied
    }

    /// Effective global time-scale for the engine.
    pub fn time_scale(&self) -> f64 {
        self.lock().applied.time_scale
    }

    /// Gate every non-essential animation must consult before starting.
    pub fn should_reduce_motion(&self) -> bool {
        self.lock().applied.reduce_motion
    }

    pub fn data_saver(&self) -> bool {
        self.lock().system.data_saver
    }

    pub fn accommodations(&self) -> Accommodations {
        self.lock().applied.accommodations
    }

    /// React to a host signal change: re-derive, re-apply and, when assistive
    /// technology is present, announce material changes.
    pub fn set_system_signal(&self, signal: SystemSignal) -> bool {
        let (before, assistive) = {
            let mut state = self.lock();
            let before = state.effective.clone();
            if !state.system.apply(signal) {
                return false;
            }
            (before, state.assistive_tech)
        };
        debug!("System signal changed: {:?}", signal);

        self.apply_preferences();
        let after = self.get_preferences();

        if assistive {
            if before.reduce_motion != after.reduce_motion {
                let (message, politeness) = if after.reduce_motion {
                    ("Reduced motion enabled", Politeness::Assertive)
                } else {
                    ("Reduced motion disabled", Politeness::Polite)
                };
                self.announcer.announce(message, politeness);
            }
            if before.high_contrast != after.high_contrast {
                let state = if after.high_contrast { "enabled" } else { "disabled" };
                self.announcer.announce(format!("High contrast {}", state), Politeness::Polite);
            }
            if before.reduced_transparency != after.reduced_transparency {
                let state = if after.reduced_transparency { "enabled" } else { "disabled" };
                self.announcer.announce(format!("Reduced transparency {}", state), Politeness::Polite);
            }
        }
        true
    }

    pub fn set_assistive_technology(&self, detected: bool) {
        self.lock().assistive_tech = detected;
    }

    pub fn assistive_technology(&self) -> bool {
        self.lock().assistive_tech
    }

    pub fn announcer(&self) -> &Announcer {
        &self.announcer
    }
}

/// Clamp values that may have been hand-edited in the store.
fn sanitize(mut user: UserPreferences) -> UserPreferences {
    if !user.animation_speed_multiplier.is_finite() {
        user.animation_speed_multiplier = 1.0;
    }
    user.animation_speed_multiplier = user.animation_speed_multiplier.clamp(MIN_SPEED_MULTIPLIER, MAX_SPEED_MULTIPLIER);
    if !user.sound_volume.is_finite() {
        user.sound_volume = 0.5;
    }
    user.sound_volume = user.sound_volume.clamp(0.0, 1.0);
    user
}

/// In-memory store, for tests and hosts without persistence.
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    saved: Mutex<Option<UserPreferences>>,
    saves: AtomicUsize,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(prefs: UserPreferences) -> Self {
        Self {
            saved: Mutex::new(Some(prefs)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn saved(&self) -> Option<UserPreferences> {
        self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> anyhow::Result<Option<UserPreferences>> {
        Ok(self.saved())
    }

    fn save(&self, prefs: &UserPreferences) -> anyhow::Result<()> {
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = Some(prefs.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> (PolicyLayer, Arc<MemoryPreferenceStore>) {
        let store = Arc::new(MemoryPreferenceStore::new());
        (PolicyLayer::new(store.clone(), None), store)
    }

    #[test]
    fn test_defaults() {
        let (policy, _) = layer();
        let prefs = policy.get_preferences();
        assert!(!prefs.reduce_motion);
        assert!(prefs.enable_animations);
        assert_eq!(policy.time_scale(), 1.0);
        assert!(!policy.should_reduce_motion());
    }

    #[test]
    fn test_update_persists_and_applies() {
        let (policy, store) = layer();
        assert_eq!(policy.update_preference(PreferenceKey::AnimationSpeedMultiplier, 2.0), Ok(true));
        assert_eq!(policy.time_scale(), 2.0);
        assert_eq!(store.saved().unwrap().animation_speed_multiplier, 2.0);
        assert_eq!(store.save_count(), 1);

        // No-op update does not persist again
        assert_eq!(policy.update_preference(PreferenceKey::AnimationSpeedMultiplier, 2.0), Ok(false));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_batch_update_is_atomic() {
        let (policy, store) = layer();
        let result = policy.update_preferences(&[
            (PreferenceKey::EnableSoundEffects, true.into()),
            (PreferenceKey::SoundVolume, 3.0.into()),
        ]);
        assert!(result.is_err());
        assert!(!policy.get_preferences().enable_sound_effects);
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_disabling_animations_reduces_time_scale() {
        let (policy, _) = layer();
        policy.update_preference(PreferenceKey::EnableAnimations, false).unwrap();
        assert!(policy.should_reduce_motion());
        assert_eq!(policy.time_scale(), REDUCED_TIME_SCALE);
    }

    #[test]
    fn test_system_reduced_motion_beats_stale_user_value() {
        let store = Arc::new(MemoryPreferenceStore::with(UserPreferences {
            reduce_motion: false,
            enable_animations: true,
            ..Default::default()
        }));
        let policy = PolicyLayer::new(store, None);

        assert!(policy.set_system_signal(SystemSignal::ReducedMotion(true)));
        assert!(policy.get_preferences().reduce_motion);
        assert!(policy.should_reduce_motion());
        assert_eq!(policy.time_scale(), REDUCED_TIME_SCALE);

        // User cannot switch it off while the system signal is on
        policy.update_preference(PreferenceKey::ReduceMotion, false).unwrap();
        assert!(policy.should_reduce_motion());

        policy.set_system_signal(SystemSignal::ReducedMotion(false));
        assert!(!policy.should_reduce_motion());
    }

    #[test]
    fn test_announces_only_with_assistive_tech() {
        let (policy, _) = layer();
        policy.set_system_signal(SystemSignal::HighContrast(true));
        assert!(policy.announcer().live().is_empty());

        policy.set_assistive_technology(true);
        policy.set_system_signal(SystemSignal::ReducedMotion(true));
        assert_eq!(
            policy.announcer().current(Politeness::Assertive).as_deref(),
            Some("Reduced motion enabled")
        );
    }

    #[test]
    fn test_unchanged_signal_is_ignored() {
        let (policy, _) = layer();
        assert!(!policy.set_system_signal(SystemSignal::DataSaver(false)));
        assert!(policy.set_system_signal(SystemSignal::DataSaver(true)));
        assert!(policy.data_saver());
    }

    #[test]
    fn test_sanitizes_loaded_values() {
        let store = Arc::new(MemoryPreferenceStore::with(UserPreferences {
            animation_speed_multiplier: 40.0,
            sound_volume: -1.0,
            ..Default::default()
        }));
        let policy = PolicyLayer::new(store, None);
        let prefs = policy.get_preferences();
        assert_eq!(prefs.animation_speed_multiplier, MAX_SPEED_MULTIPLIER);
        assert_eq!(prefs.sound_volume, 0.0);
    }

    #[test]
    fn test_emits_applied_event() {
        let bus = EventBus::new();
        let policy = PolicyLayer::new(Arc::new(MemoryPreferenceStore::new()), Some(bus.clone()));
        bus.poll();
        policy.set_system_signal(SystemSignal::ReducedMotion(true));
        let events = bus.poll();
        let applied = events
            .iter()
            .find_map(|e| crate::core::event_bus::downcast_event::<PreferencesApplied>(e))
            .unwrap();
        assert_eq!(applied.time_scale, REDUCED_TIME_SCALE);
    }
}
