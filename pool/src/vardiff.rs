use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Instant;

use crate::session::MinerControlState;

/// Guard against division by a zero-length interval.
const MIN_INTERVAL_SECS: f64 = 0.000_001;

/// Gains for the feedback-loop strategy.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PidParams {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Integral term is clamped to `[-integral_limit, integral_limit]`.
    pub integral_limit: f64,
}

impl Default for PidParams {
    fn default() -> Self {
        Self {
            kp: 0.1,
            ki: 0.01,
            kd: 0.05,
            integral_limit: 100.0,
        }
    }
}

/// Parameters for the burst-aware smoothing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BurstParams {
    /// Number of most recent samples inspected for bursts.
    pub burst_window: usize,
    /// A short-window mean below this many seconds counts as a burst.
    pub burst_threshold_secs: f64,
    pub burst_cap: f64,
    pub burst_aggression: f64,
    pub min_factor: f64,
    pub max_factor: f64,
    pub smoothing: f64,
}

impl Default for BurstParams {
    fn default() -> Self {
        Self {
            burst_window: 3,
            burst_threshold_secs: 10.0,
            burst_cap: 5.0,
            burst_aggression: 0.7,
            min_factor: 0.5,
            max_factor: 2.0,
            smoothing: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlStrategy {
    Pid(PidParams),
    Burst(BurstParams),
}

impl Default for ControlStrategy {
    fn default() -> Self {
        Self::Pid(PidParams::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct VarDiffConfig {
    /// Desired average time between shares.
    pub target_share_secs: f64,
    /// Capacity of the per-miner rolling interval window.
    pub window_size: usize,
    pub strategy: ControlStrategy,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            target_share_secs: 120.0,
            window_size: 15,
            strategy: ControlStrategy::default(),
        }
    }
}

impl VarDiffConfig {
    /// Optional env overrides (useful for tests / tuning):
    /// - SHAI_VARDIFF_TARGET_SHARE_SECS
    /// - SHAI_VARDIFF_WINDOW
    /// - SHAI_VARDIFF_STRATEGY (`pid` or `burst`, default parameters)
    pub fn from_env_or_default() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("SHAI_VARDIFF_TARGET_SHARE_SECS") {
            if let Ok(n) = v.parse::<f64>() {
                if n.is_finite() && n > 0.0 {
                    self.target_share_secs = n;
                }
            }
        }
        if let Ok(v) = std::env::var("SHAI_VARDIFF_WINDOW") {
            if let Ok(n) = v.parse::<usize>() {
                self.window_size = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("SHAI_VARDIFF_STRATEGY") {
            match v.to_lowercase().as_str() {
                "pid" => self.strategy = ControlStrategy::Pid(PidParams::default()),
                "burst" => self.strategy = ControlStrategy::Burst(BurstParams::default()),
                other => tracing::warn!("Unknown SHAI_VARDIFF_STRATEGY '{}', keeping {:?}", other, self.strategy),
            }
        }
        self
    }
}

/// Fixed-capacity FIFO of recent inter-share intervals (seconds).
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest once at capacity.
    pub fn push(&mut self, interval_secs: f64) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(interval_secs);
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Mean of the `n` most recent samples, if at least `n` are held.
    pub fn tail_mean(&self, n: usize) -> Option<f64> {
        if n == 0 || self.samples.len() < n {
            return None;
        }
        Some(self.samples.iter().rev().take(n).sum::<f64>() / n as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.samples.iter()
    }
}

/// Integral and derivative memory of the feedback loop.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControllerState {
    pub integral: f64,
    pub last_error: f64,
}

/// Clamp a difficulty into `[1, block_difficulty]`.
pub fn clamp_difficulty(difficulty: f64, block_difficulty: f64) -> f64 {
    let ceiling = if block_difficulty.is_finite() { block_difficulty.max(1.0) } else { f64::MAX };
    if !difficulty.is_finite() {
        return if difficulty == f64::INFINITY { ceiling } else { 1.0 };
    }
    difficulty.min(ceiling).max(1.0)
}

/// Per-miner adaptive difficulty controller.
///
/// Stateless itself; all memory lives in the caller's `MinerControlState`
/// so one controller serves every miner.
#[derive(Debug, Clone)]
pub struct DifficultyController {
    cfg: VarDiffConfig,
}

impl DifficultyController {
    pub fn new(cfg: VarDiffConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &VarDiffConfig {
        &self.cfg
    }

    pub fn target_share_secs(&self) -> f64 {
        self.cfg.target_share_secs.max(MIN_INTERVAL_SECS)
    }

    /// Record the interval since the miner's last share and return the new
    /// difficulty for `current`.
    pub fn adjust(
        &self,
        state: &mut MinerControlState,
        current: f64,
        block_difficulty: f64,
        now: Instant,
    ) -> f64 {
        let elapsed = now.saturating_duration_since(state.last_share).as_secs_f64();
        state.last_share = now;
        self.apply_sample(
            &mut state.window,
            &mut state.controller,
            elapsed,
            current,
            block_difficulty,
        )
    }

    /// Push one interval sample and compute the next difficulty.
    pub fn apply_sample(
        &self,
        window: &mut RollingWindow,
        controller: &mut ControllerState,
        interval_secs: f64,
        current: f64,
        block_difficulty: f64,
    ) -> f64 {
        let interval_secs = if interval_secs.is_finite() { interval_secs.max(0.0) } else { 0.0 };
        window.push(interval_secs);

        let target = self.target_share_secs();
        let current = clamp_difficulty(current, block_difficulty);

        let next = match self.cfg.strategy {
            ControlStrategy::Pid(params) => {
                let avg = window.mean().unwrap_or(interval_secs);
                let error = avg - target;

                controller.integral = (controller.integral + error)
                    .clamp(-params.integral_limit, params.integral_limit);
                let derivative = error - controller.last_error;
                controller.last_error = error;

                let output = params.kp * error + params.ki * controller.integral + params.kd * derivative;
                current * (1.0 - output)
            }
            ControlStrategy::Burst(params) => {
                let factor = match window.tail_mean(params.burst_window) {
                    Some(short) if short < params.burst_threshold_secs => {
                        let ratio = (target / short.max(MIN_INTERVAL_SECS)).min(params.burst_cap);
                        1.0 + (ratio - 1.0) * params.burst_aggression
                    }
                    _ => {
                        let avg = window.mean().unwrap_or(interval_secs).max(MIN_INTERVAL_SECS);
                        let ratio = (target / avg).clamp(params.min_factor, params.max_factor);
                        1.0 + (ratio - 1.0) * params.smoothing
                    }
                };
                current * factor
            }
        };

        clamp_difficulty(next, block_difficulty)
    }
}
