use serde::{Deserialize, Serialize};

pub const DEFAULT_LEV_DD: f64 = 0.08;
pub const DEFAULT_Z_REVERT: f64 = 0.55;
pub const DEFAULT_Z_VEL_CYCLES: usize = 3;
pub const DEFAULT_NO_BOUNCE: f64 = 0.02;
pub const DEFAULT_HARD_MAX_LEV_DD: f64 = 0.15;
pub const DEFAULT_Z_HIST_MAX: usize = 8;
pub const DEFAULT_NO_BOUNCE_WINDOW: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeStopConfig {
    pub enabled: bool,
    pub lev_dd: f64,
    pub z_revert: f64,
    pub z_vel_cycles: usize,
    pub no_bounce: f64,
    pub hard_max_lev_dd: f64,
    pub z_hist_max: usize,
    pub no_bounce_window: usize,
}

impl Default for EdgeStopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lev_dd: DEFAULT_LEV_DD,
            z_revert: DEFAULT_Z_REVERT,
            z_vel_cycles: DEFAULT_Z_VEL_CYCLES,
            no_bounce: DEFAULT_NO_BOUNCE,
            hard_max_lev_dd: DEFAULT_HARD_MAX_LEV_DD,
            z_hist_max: DEFAULT_Z_HIST_MAX,
            no_bounce_window: DEFAULT_NO_BOUNCE_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EdgeStopState {
    #[serde(default)]
    pub entry_z: Option<f64>,
    #[serde(default)]
    pub z_history: Vec<f64>,
    #[serde(default)]
    pub lev_roi_history: Vec<f64>,
}

impl EdgeStopState {
    pub fn set_entry_z_if_missing(&mut self, entry_z: Option<f64>) {
        if self.entry_z.is_none() {
            self.entry_z = entry_z.filter(|z| z.is_finite());
        }
    }

    // Appends the current observation; called before `should_stop` so the
    // current cycle is part of the history.
    pub fn record(&mut self, cfg: &EdgeStopConfig, z_now: Option<f64>, lev_roi: Option<f64>) {
        if let Some(z) = z_now.filter(|z| z.is_finite()) {
            push_bounded(&mut self.z_history, z, cfg.z_hist_max.max(1));
        }
        if let Some(roi) = lev_roi.filter(|r| r.is_finite()) {
            push_bounded(&mut self.lev_roi_history, roi, cfg.no_bounce_window.max(1));
        }
    }

    pub fn reset(&mut self) {
        *self = EdgeStopState::default();
    }
}

fn push_bounded(history: &mut Vec<f64>, value: f64, max_len: usize) {
    history.push(value);
    if history.len() > max_len {
        let excess = history.len() - max_len;
        history.drain(..excess);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeStopReason {
    Disabled,
    NoLevRoi,
    HardKill,
    NoZ,
    DrawdownNotMet,
    Hold,
    Triggered,
}

impl EdgeStopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeStopReason::Disabled => "disabled",
            EdgeStopReason::NoLevRoi => "no_lev_roi",
            EdgeStopReason::HardKill => "hard_kill",
            EdgeStopReason::NoZ => "no_z",
            EdgeStopReason::DrawdownNotMet => "dd_not_met",
            EdgeStopReason::Hold => "hold",
            EdgeStopReason::Triggered => "edge_decay",
        }
    }
}

impl std::fmt::Display for EdgeStopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct EdgeStopDetail {
    pub lev_roi: Option<f64>,
    pub z_now: Option<f64>,
    pub entry_z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_decaying: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_recent_lev_roi: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeStopDecision {
    pub stop: bool,
    pub reason: EdgeStopReason,
    pub detail: EdgeStopDetail,
}

impl EdgeStopDecision {
    fn hold(reason: EdgeStopReason, detail: EdgeStopDetail) -> Self {
        Self {
            stop: false,
            reason,
            detail,
        }
    }

    fn stop(reason: EdgeStopReason, detail: EdgeStopDetail) -> Self {
        Self {
            stop: true,
            reason,
            detail,
        }
    }
}

/// True when the last `n + 1` |z| values are strictly decreasing.
pub fn z_decaying_toward_zero(z_history: &[f64], n: usize) -> bool {
    if z_history.len() < n + 1 {
        return false;
    }
    let tail = &z_history[z_history.len() - (n + 1)..];
    tail.windows(2).all(|w| w[1].abs() < w[0].abs())
}

pub fn should_stop(
    state: &EdgeStopState,
    cfg: &EdgeStopConfig,
    z_now: Option<f64>,
    lev_roi: Option<f64>,
) -> EdgeStopDecision {
    let mut detail = EdgeStopDetail {
        lev_roi,
        z_now,
        entry_z: state.entry_z,
        ..Default::default()
    };

    if !cfg.enabled {
        return EdgeStopDecision::hold(EdgeStopReason::Disabled, detail);
    }
    let Some(lev_roi) = lev_roi.filter(|r| r.is_finite()) else {
        return EdgeStopDecision::hold(EdgeStopReason::NoLevRoi, detail);
    };

    if lev_roi <= -cfg.hard_max_lev_dd.abs() {
        detail.rule = Some("hard_max_lev_dd");
        return EdgeStopDecision::stop(EdgeStopReason::HardKill, detail);
    }

    let (Some(z_now), Some(entry_z)) = (
        z_now.filter(|z| z.is_finite()),
        state.entry_z.filter(|z| z.is_finite()),
    ) else {
        return EdgeStopDecision::hold(EdgeStopReason::NoZ, detail);
    };

    if lev_roi > -cfg.lev_dd.abs() {
        return EdgeStopDecision::hold(EdgeStopReason::DrawdownNotMet, detail);
    }

    if z_now.abs() > entry_z.abs() * cfg.z_revert {
        detail.rule = Some("z_not_reverted_enough");
        return EdgeStopDecision::hold(EdgeStopReason::Hold, detail);
    }

    let decaying = z_decaying_toward_zero(&state.z_history, cfg.z_vel_cycles);
    detail.z_decaying = Some(decaying);
    if !decaying {
        return EdgeStopDecision::hold(EdgeStopReason::Hold, detail);
    }

    let window = cfg.no_bounce_window.max(1);
    let recent = &state.lev_roi_history[state.lev_roi_history.len().saturating_sub(window)..];
    if let Some(best) = recent.iter().copied().reduce(f64::max) {
        detail.best_recent_lev_roi = Some(best);
        if best > -cfg.no_bounce.abs() {
            detail.rule = Some("bounce_detected");
            return EdgeStopDecision::hold(EdgeStopReason::Hold, detail);
        }
    }

    detail.rule = Some("edge_decay_stop");
    EdgeStopDecision::stop(EdgeStopReason::Triggered, detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> EdgeStopConfig {
        EdgeStopConfig {
            enabled: true,
            ..Default::default()
        }
    }

    fn decaying_state() -> EdgeStopState {
        EdgeStopState {
            entry_z: Some(2.0),
            z_history: vec![1.6, 1.3, 1.0, 0.9],
            lev_roi_history: vec![-0.05, -0.07, -0.09, -0.10],
        }
    }

    #[test]
    fn disabled_never_stops() {
        let cfg = EdgeStopConfig::default();
        let decision = should_stop(&decaying_state(), &cfg, Some(0.9), Some(-0.5));
        assert!(!decision.stop);
        assert_eq!(decision.reason, EdgeStopReason::Disabled);
    }

    #[test]
    fn missing_roi_holds() {
        let decision = should_stop(&decaying_state(), &enabled(), Some(0.9), None);
        assert!(!decision.stop);
        assert_eq!(decision.reason, EdgeStopReason::NoLevRoi);
    }

    #[test]
    fn hard_kill_ignores_z_and_history() {
        let cfg = EdgeStopConfig {
            hard_max_lev_dd: 0.15,
            ..enabled()
        };
        let empty = EdgeStopState::default();
        let decision = should_stop(&empty, &cfg, None, Some(-0.16));
        assert!(decision.stop);
        assert_eq!(decision.reason, EdgeStopReason::HardKill);
        assert_eq!(decision.detail.rule, Some("hard_max_lev_dd"));

        // z still far from reverting, history bouncing: still a kill
        let noisy = EdgeStopState {
            entry_z: Some(1.0),
            z_history: vec![0.5, 2.0, 3.0],
            lev_roi_history: vec![0.1, 0.2],
        };
        assert!(should_stop(&noisy, &cfg, Some(3.0), Some(-0.16)).stop);
    }

    #[test]
    fn missing_z_inputs_hold_without_panicking() {
        let mut state = decaying_state();
        let decision = should_stop(&state, &enabled(), None, Some(-0.10));
        assert_eq!(decision.reason, EdgeStopReason::NoZ);
        state.entry_z = None;
        let decision = should_stop(&state, &enabled(), Some(0.9), Some(-0.10));
        assert_eq!(decision.reason, EdgeStopReason::NoZ);
        let decision = should_stop(&state, &enabled(), Some(f64::NAN), Some(-0.10));
        assert!(!decision.stop);
    }

    #[test]
    fn drawdown_gate_must_be_met() {
        let decision = should_stop(&decaying_state(), &enabled(), Some(0.9), Some(-0.05));
        assert!(!decision.stop);
        assert_eq!(decision.reason, EdgeStopReason::DrawdownNotMet);
    }

    #[test]
    fn z_must_revert_enough() {
        // 2.0 * 0.55 = 1.1
        let decision = should_stop(&decaying_state(), &enabled(), Some(1.2), Some(-0.10));
        assert_eq!(decision.reason, EdgeStopReason::Hold);
        assert_eq!(decision.detail.rule, Some("z_not_reverted_enough"));
    }

    #[test]
    fn smart_stop_fires_on_full_decay() {
        let decision = should_stop(&decaying_state(), &enabled(), Some(0.9), Some(-0.10));
        assert!(decision.stop);
        assert_eq!(decision.reason, EdgeStopReason::Triggered);
        assert_eq!(decision.detail.best_recent_lev_roi, Some(-0.05));
    }

    #[test]
    fn smart_stop_needs_n_plus_one_strictly_decaying_points() {
        let cfg = enabled();
        let mut state = decaying_state();
        // only three points: n + 1 = 4 required
        state.z_history = vec![1.3, 1.0, 0.9];
        assert!(!should_stop(&state, &cfg, Some(0.9), Some(-0.10)).stop);

        // a flat step breaks strict decay
        state.z_history = vec![1.6, 1.3, 1.3, 0.9];
        let decision = should_stop(&state, &cfg, Some(0.9), Some(-0.10));
        assert!(!decision.stop);
        assert_eq!(decision.detail.z_decaying, Some(false));

        // magnitude matters, not sign
        state.z_history = vec![-1.6, 1.3, -1.0, 0.9];
        assert!(should_stop(&state, &cfg, Some(0.9), Some(-0.10)).stop);
    }

    #[test]
    fn bounce_inside_window_holds() {
        let mut state = decaying_state();
        state.lev_roi_history = vec![-0.01, -0.09, -0.10];
        let decision = should_stop(&state, &enabled(), Some(0.9), Some(-0.10));
        assert!(!decision.stop);
        assert_eq!(decision.detail.rule, Some("bounce_detected"));
    }

    #[test]
    fn bounce_outside_window_is_ignored() {
        let cfg = EdgeStopConfig {
            no_bounce_window: 2,
            ..enabled()
        };
        let mut state = decaying_state();
        state.lev_roi_history = vec![-0.01, -0.09, -0.10];
        assert!(should_stop(&state, &cfg, Some(0.9), Some(-0.10)).stop);
    }

    #[test]
    fn record_bounds_histories() {
        let cfg = EdgeStopConfig {
            z_hist_max: 3,
            no_bounce_window: 2,
            ..enabled()
        };
        let mut state = EdgeStopState::default();
        for i in 0..5 {
            state.record(&cfg, Some(i as f64), Some(-(i as f64) / 100.0));
        }
        state.record(&cfg, None, None);
        assert_eq!(state.z_history, vec![2.0, 3.0, 4.0]);
        assert_eq!(state.lev_roi_history, vec![-0.03, -0.04]);
    }

    #[test]
    fn entry_z_is_set_once() {
        let mut state = EdgeStopState::default();
        state.set_entry_z_if_missing(None);
        assert!(state.entry_z.is_none());
        state.set_entry_z_if_missing(Some(1.5));
        state.set_entry_z_if_missing(Some(2.5));
        assert_eq!(state.entry_z, Some(1.5));
    }
}
