//! Performance monitor: frame/memory sampling and tier classification.
//!
//! Frames are fed through `record_frame(dt)` (the engine's frame observer);
//! every `frame_window` of accumulated frame time becomes one
//! `PerformanceSample`. Memory is sampled on its own ticker. Evaluation runs
//! once per `evaluate_interval` and maps a weighted score to a tier:
//!
//! | signal          | points                               |
//! |-----------------|--------------------------------------|
//! | fps             | >=55: 40, >=45: 30, >=30: 15         |
//! | frame time      | <=18ms: 20, <=25ms: 10, <=33ms: 5    |
//! | memory usage    | <50%: 20, <70%: 10, <85%: 5          |
//! | cores           | >=8: 10, >=4: 5                      |
//! | device memory   | >=8GB: 10, >=4GB: 5                  |
//! | reduced motion  | -30                                  |
//! | data saver      | -15                                  |
//!
//! Score >= 70 is HIGH, >= 40 MEDIUM, otherwise LOW. Missing fps or memory
//! data scores as healthy.

use log::{debug, info, trace, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use sysinfo::System;

use crate::core::event_bus::EventBus;
use crate::core::events::PerformanceTierChanged;
use crate::core::ticker::Ticker;
use crate::entities::{DeviceInfo, MemoryInfo, MemoryProbe, PerformanceSample, PerformanceTier};

/// Samples averaged when evaluating fps and frame time.
const EVAL_SAMPLES: usize = 5;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Ring size per metric.
    pub history_len: usize,
    pub evaluate_interval: Duration,
    pub memory_interval: Duration,
    /// Frame time accumulated per fps sample.
    pub frame_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_len: 100,
            evaluate_interval: Duration::from_secs(1),
            memory_interval: Duration::from_secs(1),
            frame_window: Duration::from_secs(1),
        }
    }
}

/// Inputs to the tier score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInput {
    pub fps: Option<f64>,
    pub frame_time_ms: Option<f64>,
    pub memory_usage: Option<f64>,
    pub cores: usize,
    pub memory_gb: f64,
    pub reduced_motion: bool,
    pub data_saver: bool,
}

pub fn score(input: &ScoreInput) -> i32 {
    let mut score = 0;

    score += match input.fps {
        None => 40,
        Some(fps) if fps >= 55.0 => 40,
        Some(fps) if fps >= 45.0 => 30,
        Some(fps) if fps >= 30.0 => 15,
        Some(_) => 0,
    };
    score += match input.frame_time_ms {
        None => 20,
        Some(ms) if ms <= 18.0 => 20,
        Some(ms) if ms <= 25.0 => 10,
        Some(ms) if ms <= 33.0 => 5,
        Some(_) => 0,
    };
    score += match input.memory_usage {
        None => 20,
        Some(u) if u < 0.5 => 20,
        Some(u) if u < 0.7 => 10,
        Some(u) if u < 0.85 => 5,
        Some(_) => 0,
    };
    score += match input.cores {
        c if c >= 8 => 10,
        c if c >= 4 => 5,
        _ => 0,
    };
    score += if input.memory_gb >= 8.0 {
        10
    } else if input.memory_gb >= 4.0 {
        5
    } else {
        0
    };

    if input.reduced_motion {
        score -= 30;
    }
    if input.data_saver {
        score -= 15;
    }
    score
}

pub fn tier_for(score: i32) -> PerformanceTier {
    if score >= 70 {
        PerformanceTier::High
    } else if score >= 40 {
        PerformanceTier::Medium
    } else {
        PerformanceTier::Low
    }
}

/// Snapshot returned by `get_performance_report`.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub tier: PerformanceTier,
    pub score: i32,
    pub fps: Option<f64>,
    pub frame_time_ms: Option<f64>,
    pub memory: Option<MemoryInfo>,
    pub memory_usage: Option<f64>,
    pub device: DeviceInfo,
    pub target_frame_rate: u32,
    pub reduced_complexity: bool,
    pub samples: usize,
    pub recommendations: Vec<String>,
}

struct MonitorState {
    frames: VecDeque<PerformanceSample>,
    memory: VecDeque<(MemoryInfo, Instant)>,
    window_frames: u32,
    window_time: Duration,
    tier: PerformanceTier,
    target_frame_rate: u32,
    reduced_complexity: bool,
    reduced_motion: bool,
    data_saver: bool,
}

impl MonitorState {
    fn latest_memory(&self) -> Option<MemoryInfo> {
        self.memory.back().map(|(m, _)| *m)
    }

    /// Mean fps and frame time of the last few samples.
    fn recent_frame_stats(&self) -> (Option<f64>, Option<f64>) {
        let n = self.frames.len().min(EVAL_SAMPLES);
        if n == 0 {
            return (None, None);
        }
        let recent = self.frames.iter().rev().take(n);
        let (fps, ft) = recent.fold((0.0, 0.0), |(f, t), s| (f + s.fps, t + s.frame_time_ms));
        (Some(fps / n as f64), Some(ft / n as f64))
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, cap: usize) {
    while ring.len() >= cap.max(1) {
        ring.pop_front();
    }
    ring.push_back(item);
}

pub struct PerformanceMonitor {
    probe: Arc<dyn MemoryProbe>,
    device: DeviceInfo,
    config: MonitorConfig,
    bus: Option<EventBus>,
    state: Mutex<MonitorState>,
    tickers: Mutex<Vec<Ticker>>,
}

impl PerformanceMonitor {
    pub fn new(
        probe: Arc<dyn MemoryProbe>,
        device: DeviceInfo,
        config: MonitorConfig,
        bus: Option<EventBus>,
    ) -> Self {
        info!(
            "PerformanceMonitor init: {} cores, {:.1} GB, history={}",
            device.cores,
            device.memory_gb(),
            config.history_len
        );
        Self {
            probe,
            device,
            config,
            bus,
            state: Mutex::new(MonitorState {
                frames: VecDeque::new(),
                memory: VecDeque::new(),
                window_frames: 0,
                window_time: Duration::ZERO,
                tier: PerformanceTier::High,
                target_frame_rate: PerformanceTier::High.target_frame_rate(),
                reduced_complexity: false,
                reduced_motion: false,
                data_saver: false,
            }),
            tickers: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed one frame delta. Returns the sample produced when a window closes.
    pub fn record_frame(&self, dt: Duration) -> Option<PerformanceSample> {
        let mut state = self.lock();
        state.window_frames += 1;
        state.window_time += dt;
        if state.window_time < self.config.frame_window || state.window_time.is_zero() {
            return None;
        }

        let secs = state.window_time.as_secs_f64();
        let sample = PerformanceSample {
            fps: state.window_frames as f64 / secs,
            frame_time_ms: secs * 1000.0 / state.window_frames as f64,
            memory_bytes: state.latest_memory().map(|m| m.used).unwrap_or(0),
            timestamp: Instant::now(),
        };
        state.window_frames = 0;
        state.window_time = Duration::ZERO;
        push_bounded(&mut state.frames, sample, self.config.history_len);
        trace!("Frame sample: {:.1} fps, {:.1} ms", sample.fps, sample.frame_time_ms);
        Some(sample)
    }

    /// Read the memory probe. A missing reading is logged and skipped.
    pub fn sample_memory(&self) -> Option<MemoryInfo> {
        let Some(info) = self.probe.sample() else {
            trace!("Memory probe returned no reading");
            return None;
        };
        push_bounded(&mut self.lock().memory, (info, Instant::now()), self.config.history_len);
        Some(info)
    }

    pub fn memory_snapshot(&self) -> Option<MemoryInfo> {
        self.lock().latest_memory()
    }

    pub fn memory_usage(&self) -> Option<f64> {
        self.memory_snapshot().map(|m| m.usage_fraction())
    }

    fn score_input(&self, state: &MonitorState) -> ScoreInput {
        let (fps, frame_time_ms) = state.recent_frame_stats();
        ScoreInput {
            fps,
            frame_time_ms,
            memory_usage: state.latest_memory().map(|m| m.usage_fraction()),
            cores: self.device.cores,
            memory_gb: self.device.memory_gb(),
            reduced_motion: state.reduced_motion,
            data_saver: state.data_saver,
        }
    }

    /// Recompute the tier; on change apply mitigations and emit `PerformanceTierChanged`.
    pub fn evaluate_performance_level(&self) -> PerformanceTier {
        let change = {
            let mut state = self.lock();
            let points = score(&self.score_input(&state));
            let new = tier_for(points);
            let old = state.tier;
            if new == old {
                None
            } else {
                state.tier = new;
                state.target_frame_rate = new.target_frame_rate();
                state.reduced_complexity = new == PerformanceTier::Low;
                Some((old, new, points))
            }
        };

        match change {
            Some((old, new, points)) => {
                info!("Performance tier {} -> {} (score {})", old, new, points);
                if let Some(bus) = &self.bus {
                    bus.emit(PerformanceTierChanged { old, new });
                }
                new
            }
            None => self.tier(),
        }
    }

    /// Accessibility constraints that lower the score.
    pub fn set_user_constraints(&self, reduced_motion: bool, data_saver: bool) {
        let mut state = self.lock();
        if state.reduced_motion != reduced_motion || state.data_saver != data_saver {
            debug!(
                "Performance constraints: reduced_motion={}, data_saver={}",
                reduced_motion, data_saver
            );
        }
        state.reduced_motion = reduced_motion;
        state.data_saver = data_saver;
    }

    pub fn tier(&self) -> PerformanceTier {
        self.lock().tier
    }

    /// Frame rate for the current tier. The orchestrator forwards it to the
    /// engine on every `PerformanceTierChanged`.
    pub fn target_frame_rate(&self) -> u32 {
        self.lock().target_frame_rate
    }

    /// Marker for callers to pick cheaper animation variants.
    pub fn reduced_complexity(&self) -> bool {
        self.lock().reduced_complexity
    }

    pub fn history(&self) -> Vec<PerformanceSample> {
        self.lock().frames.iter().copied().collect()
    }

    pub fn memory_history(&self) -> Vec<MemoryInfo> {
        self.lock().memory.iter().map(|(m, _)| *m).collect()
    }

    pub fn device(&self) -> DeviceInfo {
        self.device
    }

    pub fn get_performance_report(&self) -> PerformanceReport {
        let state = self.lock();
        let input = self.score_input(&state);
        let memory = state.latest_memory();

        let mut recommendations = Vec::new();
        if input.fps.is_some_and(|fps| fps < 30.0) {
            recommendations.push("fps below 30, reduce concurrent animation count".to_string());
        }
        if input.frame_time_ms.is_some_and(|ms| ms > 33.0) {
            recommendations.push("frame time above 33 ms, simplify animated properties".to_string());
        }
        if input.memory_usage.is_some_and(|u| u > 0.8) {
            recommendations.push("memory usage above 80%, clear unused animation resources".to_string());
        }
        if state.tier == PerformanceTier::Low {
            recommendations.push("low performance tier, prefer reduced-complexity variants".to_string());
        }
        if state.reduced_motion {
            recommendations.push("reduced motion active, keep motion to essential transitions".to_string());
        }
        if state.data_saver {
            recommendations.push("data saver active, defer non-critical preloads".to_string());
        }

        PerformanceReport {
            tier: state.tier,
            score: score(&input),
            fps: input.fps,
            frame_time_ms: input.frame_time_ms,
            memory,
            memory_usage: input.memory_usage,
            device: self.device,
            target_frame_rate: state.target_frame_rate,
            reduced_complexity: state.reduced_complexity,
            samples: state.frames.len(),
            recommendations,
        }
    }

    /// Start the memory and evaluation loops. Idempotent.
    pub fn start_monitoring(self: &Arc<Self>) -> std::io::Result<()> {
        let mut tickers = self.tickers.lock().unwrap_or_else(|e| e.into_inner());
        if !tickers.is_empty() {
            return Ok(());
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        tickers.push(Ticker::spawn("perf-memory", self.config.memory_interval, move || {
            if let Some(monitor) = weak.upgrade() {
                monitor.sample_memory();
            }
        })?);

        let weak: Weak<Self> = Arc::downgrade(self);
        tickers.push(Ticker::spawn("perf-evaluate", self.config.evaluate_interval, move || {
            if let Some(monitor) = weak.upgrade() {
                monitor.evaluate_performance_level();
            }
        })?);

        info!("Performance monitoring started");
        Ok(())
    }

    /// Stop both loops. Idempotent.
    pub fn stop_monitoring(&self) {
        let tickers = std::mem::take(&mut *self.tickers.lock().unwrap_or_else(|e| e.into_inner()));
        if tickers.is_empty() {
            return;
        }
        for mut ticker in tickers {
            ticker.stop();
        }
        info!("Performance monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        !self.tickers.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

/// System memory via sysinfo (used vs total RAM).
pub struct SystemMemoryProbe {
    sys: Mutex<System>,
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&self) -> Option<MemoryInfo> {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_memory();
        let limit = sys.total_memory();
        if limit == 0 {
            warn!("sysinfo reported zero total memory");
            return None;
        }
        Some(MemoryInfo {
            used: sys.used_memory(),
            limit,
        })
    }
}
