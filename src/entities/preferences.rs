//! Motion, visual and interaction preferences.
//!
//! `UserPreferences` is the persisted, user-settable subset. `SystemSignals`
//! mirrors the host's media-query style signals. `Preferences` is the effective
//! record derived from both, where an active system signal always wins.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::PolicyError;

pub const MIN_SPEED_MULTIPLIER: f64 = 0.1;
pub const MAX_SPEED_MULTIPLIER: f64 = 4.0;

/// Effective preferences handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub reduce_motion: bool,
    pub animation_speed_multiplier: f64,
    pub enable_animations: bool,
    pub high_contrast: bool,
    pub color_blind_friendly: bool,
    pub larger_click_targets: bool,
    pub reduced_transparency: bool,
    pub enable_sound_effects: bool,
    pub sound_volume: f64,
}

impl Preferences {
    /// Merge user choices with system signals. System signals only ever switch
    /// accommodations on; a stale user `false` cannot override them.
    pub fn derive(user: &UserPreferences, system: &SystemSignals) -> Self {
        Self {
            reduce_motion: system.reduced_motion || user.reduce_motion,
            animation_speed_multiplier: user.animation_speed_multiplier,
            enable_animations: user.enable_animations,
            high_contrast: system.high_contrast || user.high_contrast,
            color_blind_friendly: user.color_blind_friendly,
            larger_click_targets: user.larger_click_targets,
            reduced_transparency: system.reduced_transparency || user.reduced_transparency,
            enable_sound_effects: user.enable_sound_effects,
            sound_volume: user.sound_volume,
        }
    }
}

/// Persisted user overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub reduce_motion: bool,
    pub animation_speed_multiplier: f64,
    pub enable_animations: bool,
    pub high_contrast: bool,
    pub color_blind_friendly: bool,
    pub larger_click_targets: bool,
    pub reduced_transparency: bool,
    pub enable_sound_effects: bool,
    pub sound_volume: f64,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            reduce_motion: false,
            animation_speed_multiplier: 1.0,
            enable_animations: true,
            high_contrast: false,
            color_blind_friendly: false,
            larger_click_targets: false,
            reduced_transparency: false,
            enable_sound_effects: false,
            sound_volume: 0.5,
        }
    }
}

impl UserPreferences {
    /// Validate and apply one change. Returns whether the value actually changed.
    pub fn set(&mut self, key: PreferenceKey, value: PreferenceValue) -> Result<bool, PolicyError> {
        let invalid = |reason: &str| PolicyError::InvalidValue {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if key.is_numeric() {
            let PreferenceValue::Number(v) = value else {
                return Err(invalid("expected a number"));
            };
            if !v.is_finite() {
                return Err(invalid("must be finite"));
            }
            let slot = match key {
                PreferenceKey::AnimationSpeedMultiplier => {
                    if !(MIN_SPEED_MULTIPLIER..=MAX_SPEED_MULTIPLIER).contains(&v) {
                        return Err(invalid("must be within 0.1..=4.0"));
                    }
                    &mut self.animation_speed_multiplier
                }
                _ => {
                    if !(0.0..=1.0).contains(&v) {
                        return Err(invalid("must be within 0.0..=1.0"));
                    }
                    &mut self.sound_volume
                }
            };
            let changed = (*slot - v).abs() > f64::EPSILON;
            *slot = v;
            return Ok(changed);
        }

        let PreferenceValue::Bool(v) = value else {
            return Err(invalid("expected a boolean"));
        };
        let slot = match key {
            PreferenceKey::ReduceMotion => &mut self.reduce_motion,
            PreferenceKey::EnableAnimations => &mut self.enable_animations,
            PreferenceKey::HighContrast => &mut self.high_contrast,
            PreferenceKey::ColorBlindFriendly => &mut self.color_blind_friendly,
            PreferenceKey::LargerClickTargets => &mut self.larger_click_targets,
            PreferenceKey::ReducedTransparency => &mut self.reduced_transparency,
            PreferenceKey::EnableSoundEffects => &mut self.enable_sound_effects,
            PreferenceKey::AnimationSpeedMultiplier | PreferenceKey::SoundVolume => {
                return Err(invalid("expected a number"));
            }
        };
        let changed = *slot != v;
        *slot = v;
        Ok(changed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PreferenceKey {
    ReduceMotion,
    AnimationSpeedMultiplier,
    EnableAnimations,
    HighContrast,
    ColorBlindFriendly,
    LargerClickTargets,
    ReducedTransparency,
    EnableSoundEffects,
    SoundVolume,
}

impl PreferenceKey {
    pub fn as_str(self) -> &'static str {
        match self {
            PreferenceKey::ReduceMotion => "reduceMotion",
            PreferenceKey::AnimationSpeedMultiplier => "animationSpeedMultiplier",
            PreferenceKey::EnableAnimations => "enableAnimations",
            PreferenceKey::HighContrast => "highContrast",
            PreferenceKey::ColorBlindFriendly => "colorBlindFriendly",
            PreferenceKey::LargerClickTargets => "largerClickTargets",
            PreferenceKey::ReducedTransparency => "reducedTransparency",
            PreferenceKey::EnableSoundEffects => "enableSoundEffects",
            PreferenceKey::SoundVolume => "soundVolume",
        }
    }

    fn is_numeric(self) -> bool {
        matches!(self, PreferenceKey::AnimationSpeedMultiplier | PreferenceKey::SoundVolume)
    }
}

impl fmt::Display for PreferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreferenceKey {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const KEYS: [PreferenceKey; 9] = [
            PreferenceKey::ReduceMotion,
            PreferenceKey::AnimationSpeedMultiplier,
            PreferenceKey::EnableAnimations,
            PreferenceKey::HighContrast,
            PreferenceKey::ColorBlindFriendly,
            PreferenceKey::LargerClickTargets,
            PreferenceKey::ReducedTransparency,
            PreferenceKey::EnableSoundEffects,
            PreferenceKey::SoundVolume,
        ];
        KEYS.into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PolicyError::InvalidValue {
                key: s.to_string(),
                reason: "unknown preference".into(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PreferenceValue {
    Bool(bool),
    Number(f64),
}

impl From<bool> for PreferenceValue {
    fn from(v: bool) -> Self {
        PreferenceValue::Bool(v)
    }
}

impl From<f64> for PreferenceValue {
    fn from(v: f64) -> Self {
        PreferenceValue::Number(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorScheme {
    #[default]
    Light,
    Dark,
}

/// Host signals (prefers-reduced-motion, prefers-contrast, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemSignals {
    pub reduced_motion: bool,
    pub high_contrast: bool,
    pub reduced_transparency: bool,
    pub color_scheme: ColorScheme,
    pub data_saver: bool,
}

/// One system signal change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemSignal {
    ReducedMotion(bool),
    HighContrast(bool),
    ReducedTransparency(bool),
    ColorScheme(ColorScheme),
    DataSaver(bool),
}

impl SystemSignals {
    /// Apply a change; returns whether anything differed.
    pub fn apply(&mut self, signal: SystemSignal) -> bool {
        let before = *self;
        match signal {
            SystemSignal::ReducedMotion(v) => self.reduced_motion = v,
            SystemSignal::HighContrast(v) => self.high_contrast = v,
            SystemSignal::ReducedTransparency(v) => self.reduced_transparency = v,
            SystemSignal::ColorScheme(v) => self.color_scheme = v,
            SystemSignal::DataSaver(v) => self.data_saver = v,
        }
        before != *self
    }
}

/// Visual accommodation flags consumed by UI code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Accommodations {
    pub reduced_motion: bool,
    pub high_contrast: bool,
    pub color_blind_friendly: bool,
    pub larger_click_targets: bool,
    pub reduced_transparency: bool,
    pub dark_scheme: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_signal_wins() {
        let user = UserPreferences::default();
        let system = SystemSignals {
            reduced_motion: true,
            ..Default::default()
        };
        let prefs = Preferences::derive(&user, &system);
        assert!(prefs.reduce_motion);
        assert!(prefs.enable_animations);
    }

    #[test]
    fn test_set_validates() {
        let mut user = UserPreferences::default();
        assert_eq!(user.set(PreferenceKey::AnimationSpeedMultiplier, 2.0.into()), Ok(true));
        assert_eq!(user.set(PreferenceKey::AnimationSpeedMultiplier, 2.0.into()), Ok(false));
        assert!(user.set(PreferenceKey::AnimationSpeedMultiplier, 9.0.into()).is_err());
        assert!(user.set(PreferenceKey::SoundVolume, f64::NAN.into()).is_err());
        assert!(user.set(PreferenceKey::EnableAnimations, 1.0.into()).is_err());
        assert_eq!(user.set(PreferenceKey::EnableAnimations, false.into()), Ok(true));
        assert!(!user.enable_animations);
    }

    #[test]
    fn test_key_parse() {
        assert_eq!("reducemotion".parse::<PreferenceKey>().unwrap(), PreferenceKey::ReduceMotion);
        assert!("volume".parse::<PreferenceKey>().is_err());
    }

    #[test]
    fn test_signal_apply_reports_change() {
        let mut signals = SystemSignals::default();
        assert!(signals.apply(SystemSignal::ReducedMotion(true)));
        assert!(!signals.apply(SystemSignal::ReducedMotion(true)));
    }
}
