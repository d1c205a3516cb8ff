use crate::clock::{Clock, Ticker};
use crate::config::{env_bool, env_override, env_string, DEFAULT_BINANCE_FUTURES_ENDPOINT};
use crate::documents::{
    asset_of, load_or_default, read_json, write_json_atomic, DesiredPosition, ExecutionState,
    Side, ZScoreMap,
};
use crate::edge_stop::{should_stop, EdgeStopConfig};
use crate::ports::exchange::{Exchange, ExchangePosition, OrderSide};
use crate::risk::{
    exchange_leverage, hysteresis, leverage_for_z, order_quantity, position_roi,
    rolling_take_profit_hit, take_profit_target, LeverageParams, TakeProfitMode,
    TakeProfitParams,
};
use crate::signal::SignalHistoryDocument;
use crate::status::{StatusPosition, StatusReporter};
use crate::trade::execution::exchange_box::RetryPolicy;
use anyhow::{bail, Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_EXCHANGE_NAME: &str = "binance";
const DEFAULT_INTERVAL_SECS: u64 = 15;
const DEFAULT_HEARTBEAT_SECS: u64 = 60;
const DEFAULT_WAIT_AFTER_CLOSE_SECS: u64 = 2;
const DEFAULT_MARGIN_COOLDOWN_SECS: i64 = 120;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_USD_NOTIONAL: f64 = 50.0;
const DEFAULT_MAX_POSITIONS: usize = 1;
const DEFAULT_Z_ENTER: f64 = 1.2;
const DEFAULT_Z_EXIT: f64 = 0.4;
const DEFAULT_LEV_BASE: f64 = 10.0;
const DEFAULT_LEV_MIN: f64 = 5.0;
const DEFAULT_LEV_MAX: f64 = 15.0;
const DEFAULT_LEV_Z_FULL: f64 = 2.6;
const DEFAULT_ROLL_TP_DROP: f64 = 0.25;
const DEFAULT_TP_K: f64 = 1.8;
const DEFAULT_TP_MIN: f64 = 0.003;
const DEFAULT_TP_MAX: f64 = 0.012;
const DEFAULT_TP_VOL_LOOKBACK_SECS: i64 = 6 * 3600;
const DEFAULT_TP_MIN_SAMPLES: usize = 10;
const DEFAULT_QUOTE_ASSET: &str = "USDT";
const DEFAULT_DESIRED_PATH: &str = "state/desired_position.json";
const DEFAULT_ZMAP_PATH: &str = "state/zmap.json";
const DEFAULT_STATE_PATH: &str = "state/execution_state.json";
const DEFAULT_STATUS_PATH: &str = "state/executor_status.json";
const DEFAULT_SIGNAL_HISTORY_PATH: &str = "state/signal_history.json";
const REASON_HOLD: &str = "hold";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ExecutorYaml {
    exchange_name: Option<String>,
    rest_endpoint: Option<String>,
    armed: Option<bool>,
    interval_secs: Option<u64>,
    heartbeat_secs: Option<u64>,
    wait_after_close_secs: Option<u64>,
    margin_cooldown_secs: Option<i64>,
    http_timeout_secs: Option<u64>,
    retry_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    usd_notional: Option<f64>,
    max_notional_usd: Option<f64>,
    max_positions: Option<usize>,
    z_enter: Option<f64>,
    z_exit: Option<f64>,
    lev_base: Option<f64>,
    lev_min: Option<f64>,
    lev_max: Option<f64>,
    lev_z_full: Option<f64>,
    roll_tp_drop: Option<f64>,
    tp_mode: Option<String>,
    tp_pct: Option<f64>,
    tp_k: Option<f64>,
    tp_min: Option<f64>,
    tp_max: Option<f64>,
    tp_vol_lookback_secs: Option<i64>,
    tp_min_samples: Option<usize>,
    sl_pct: Option<f64>,
    rotate_min_roi: Option<f64>,
    allow_open_on_hold: Option<bool>,
    edge_stop_enabled: Option<bool>,
    edge_stop_lev_dd: Option<f64>,
    edge_stop_z_revert: Option<f64>,
    edge_stop_z_vel_cycles: Option<usize>,
    edge_stop_no_bounce: Option<f64>,
    edge_stop_hard_max_lev_dd: Option<f64>,
    edge_stop_z_hist_max: Option<usize>,
    edge_stop_no_bounce_window: Option<usize>,
    quote_asset: Option<String>,
    desired_path: Option<String>,
    zmap_path: Option<String>,
    state_path: Option<String>,
    status_path: Option<String>,
    signal_history_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub exchange_name: String,
    pub rest_endpoint: String,
    pub armed: bool,
    pub interval_secs: u64,
    pub heartbeat_secs: u64,
    pub wait_after_close_secs: u64,
    pub margin_cooldown_secs: i64,
    pub http_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub usd_notional: f64,
    // 0 disables the cap.
    pub max_notional_usd: f64,
    pub max_positions: usize,
    pub z_enter: f64,
    pub z_exit: f64,
    pub leverage: LeverageParams,
    pub roll_tp_drop: f64,
    pub take_profit: TakeProfitParams,
    pub tp_vol_lookback_secs: i64,
    // 0 disables the fixed stop-loss.
    pub sl_pct: f64,
    pub rotate_min_roi: Option<f64>,
    // When false, a flat symbol does not open on a `hold` document.
    pub allow_open_on_hold: bool,
    pub edge_stop: EdgeStopConfig,
    pub quote_asset: String,
    pub desired_path: PathBuf,
    pub zmap_path: PathBuf,
    pub state_path: PathBuf,
    pub status_path: PathBuf,
    pub signal_history_path: PathBuf,
}

impl ExecutorConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        match env_string("EXECUTOR_CONFIG_PATH") {
            Some(path) => Self::from_yaml_path(path),
            None => Self::from_env(),
        }
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open executor config {}", path_ref.display()))?;
        let yaml: ExecutorYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse executor config {}", path_ref.display()))?;
        let mut cfg = Self::from_yaml(yaml)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::from_yaml(ExecutorYaml::default())?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_yaml(yaml: ExecutorYaml) -> Result<Self> {
        let tp_mode = match yaml.tp_mode.as_deref() {
            Some(raw) => raw.parse::<TakeProfitMode>().map_err(anyhow::Error::msg)?,
            None => TakeProfitMode::Fixed,
        };
        let defaults = RetryPolicy::default();
        let edge_defaults = EdgeStopConfig::default();
        Ok(ExecutorConfig {
            exchange_name: yaml
                .exchange_name
                .unwrap_or_else(|| DEFAULT_EXCHANGE_NAME.to_string()),
            rest_endpoint: yaml
                .rest_endpoint
                .unwrap_or_else(|| DEFAULT_BINANCE_FUTURES_ENDPOINT.to_string()),
            armed: yaml.armed.unwrap_or(false),
            interval_secs: yaml.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS),
            heartbeat_secs: yaml.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS),
            wait_after_close_secs: yaml
                .wait_after_close_secs
                .unwrap_or(DEFAULT_WAIT_AFTER_CLOSE_SECS),
            margin_cooldown_secs: yaml
                .margin_cooldown_secs
                .unwrap_or(DEFAULT_MARGIN_COOLDOWN_SECS),
            http_timeout_secs: yaml.http_timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            retry: RetryPolicy {
                attempts: yaml.retry_attempts.unwrap_or(defaults.attempts),
                base_delay_ms: yaml.retry_base_delay_ms.unwrap_or(defaults.base_delay_ms),
                max_delay_ms: yaml.retry_max_delay_ms.unwrap_or(defaults.max_delay_ms),
            },
            usd_notional: yaml.usd_notional.unwrap_or(DEFAULT_USD_NOTIONAL),
            max_notional_usd: yaml.max_notional_usd.unwrap_or(0.0),
            max_positions: yaml.max_positions.unwrap_or(DEFAULT_MAX_POSITIONS),
            z_enter: yaml.z_enter.unwrap_or(DEFAULT_Z_ENTER),
            z_exit: yaml.z_exit.unwrap_or(DEFAULT_Z_EXIT),
            leverage: LeverageParams {
                lev_base: yaml.lev_base.unwrap_or(DEFAULT_LEV_BASE),
                lev_min: yaml.lev_min.unwrap_or(DEFAULT_LEV_MIN),
                lev_max: yaml.lev_max.unwrap_or(DEFAULT_LEV_MAX),
                lev_z_full: yaml.lev_z_full.unwrap_or(DEFAULT_LEV_Z_FULL),
            },
            roll_tp_drop: yaml.roll_tp_drop.unwrap_or(DEFAULT_ROLL_TP_DROP),
            take_profit: TakeProfitParams {
                mode: tp_mode,
                tp_pct: yaml.tp_pct.unwrap_or(0.0),
                k: yaml.tp_k.unwrap_or(DEFAULT_TP_K),
                tp_min: yaml.tp_min.unwrap_or(DEFAULT_TP_MIN),
                tp_max: yaml.tp_max.unwrap_or(DEFAULT_TP_MAX),
                min_samples: yaml.tp_min_samples.unwrap_or(DEFAULT_TP_MIN_SAMPLES),
            },
            tp_vol_lookback_secs: yaml
                .tp_vol_lookback_secs
                .unwrap_or(DEFAULT_TP_VOL_LOOKBACK_SECS),
            sl_pct: yaml.sl_pct.unwrap_or(0.0),
            rotate_min_roi: yaml.rotate_min_roi,
            allow_open_on_hold: yaml.allow_open_on_hold.unwrap_or(true),
            edge_stop: EdgeStopConfig {
                enabled: yaml.edge_stop_enabled.unwrap_or(edge_defaults.enabled),
                lev_dd: yaml.edge_stop_lev_dd.unwrap_or(edge_defaults.lev_dd),
                z_revert: yaml.edge_stop_z_revert.unwrap_or(edge_defaults.z_revert),
                z_vel_cycles: yaml
                    .edge_stop_z_vel_cycles
                    .unwrap_or(edge_defaults.z_vel_cycles),
                no_bounce: yaml.edge_stop_no_bounce.unwrap_or(edge_defaults.no_bounce),
                hard_max_lev_dd: yaml
                    .edge_stop_hard_max_lev_dd
                    .unwrap_or(edge_defaults.hard_max_lev_dd),
                z_hist_max: yaml.edge_stop_z_hist_max.unwrap_or(edge_defaults.z_hist_max),
                no_bounce_window: yaml
                    .edge_stop_no_bounce_window
                    .unwrap_or(edge_defaults.no_bounce_window),
            },
            quote_asset: yaml
                .quote_asset
                .unwrap_or_else(|| DEFAULT_QUOTE_ASSET.to_string())
                .to_ascii_uppercase(),
            desired_path: PathBuf::from(
                yaml.desired_path
                    .unwrap_or_else(|| DEFAULT_DESIRED_PATH.to_string()),
            ),
            zmap_path: PathBuf::from(
                yaml.zmap_path
                    .unwrap_or_else(|| DEFAULT_ZMAP_PATH.to_string()),
            ),
            state_path: PathBuf::from(
                yaml.state_path
                    .unwrap_or_else(|| DEFAULT_STATE_PATH.to_string()),
            ),
            status_path: PathBuf::from(
                yaml.status_path
                    .unwrap_or_else(|| DEFAULT_STATUS_PATH.to_string()),
            ),
            signal_history_path: PathBuf::from(
                yaml.signal_history_path
                    .unwrap_or_else(|| DEFAULT_SIGNAL_HISTORY_PATH.to_string()),
            ),
        })
    }

    fn apply_env_overrides(&mut self) {
        env_override(&mut self.exchange_name, "EXCHANGE_NAME");
        env_override(&mut self.rest_endpoint, "REST_ENDPOINT");
        if let Some(armed) = env_bool("ARMED") {
            self.armed = armed;
        }
        env_override(&mut self.interval_secs, "EXECUTOR_INTERVAL_SECS");
        env_override(&mut self.heartbeat_secs, "HEARTBEAT_SECS");
        env_override(&mut self.wait_after_close_secs, "WAIT_AFTER_CLOSE_SECS");
        env_override(&mut self.margin_cooldown_secs, "MARGIN_COOLDOWN_SECS");
        env_override(&mut self.http_timeout_secs, "HTTP_TIMEOUT_SECS");
        env_override(&mut self.retry.attempts, "RETRY_ATTEMPTS");
        env_override(&mut self.retry.base_delay_ms, "RETRY_BASE_DELAY_MS");
        env_override(&mut self.retry.max_delay_ms, "RETRY_MAX_DELAY_MS");
        env_override(&mut self.usd_notional, "USD_NOTIONAL");
        env_override(&mut self.max_notional_usd, "MAX_NOTIONAL_USD");
        env_override(&mut self.max_positions, "MAX_POSITIONS");
        env_override(&mut self.z_enter, "Z_ENTER");
        env_override(&mut self.z_exit, "Z_EXIT");
        env_override(&mut self.leverage.lev_base, "LEV_BASE");
        env_override(&mut self.leverage.lev_min, "LEV_MIN");
        env_override(&mut self.leverage.lev_max, "LEV_MAX");
        env_override(&mut self.leverage.lev_z_full, "LEV_Z_FULL");
        env_override(&mut self.roll_tp_drop, "ROLL_TP_DROP");
        env_override(&mut self.take_profit.mode, "TP_MODE");
        env_override(&mut self.take_profit.tp_pct, "TP_PCT");
        env_override(&mut self.take_profit.k, "TP_K");
        env_override(&mut self.take_profit.tp_min, "TP_MIN");
        env_override(&mut self.take_profit.tp_max, "TP_MAX");
        env_override(&mut self.take_profit.min_samples, "TP_MIN_SAMPLES");
        env_override(&mut self.tp_vol_lookback_secs, "TP_VOL_LOOKBACK_SECS");
        env_override(&mut self.sl_pct, "SL_PCT");
        if let Some(raw) = env_string("ROTATE_MIN_ROI") {
            match raw.parse::<f64>() {
                Ok(v) => self.rotate_min_roi = Some(v),
                Err(_) => log::warn!("[CONFIG] ignoring unparsable ROTATE_MIN_ROI={}", raw),
            }
        }
        if let Some(allow) = env_bool("ALLOW_OPEN_ON_HOLD") {
            self.allow_open_on_hold = allow;
        }
        if let Some(enabled) = env_bool("EDGE_STOP_ENABLED") {
            self.edge_stop.enabled = enabled;
        }
        env_override(&mut self.edge_stop.lev_dd, "EDGE_STOP_LEV_DD");
        env_override(&mut self.edge_stop.z_revert, "EDGE_STOP_Z_REVERT");
        env_override(&mut self.edge_stop.z_vel_cycles, "EDGE_STOP_Z_VEL_CYCLES");
        env_override(&mut self.edge_stop.no_bounce, "EDGE_STOP_NO_BOUNCE");
        env_override(&mut self.edge_stop.hard_max_lev_dd, "EDGE_STOP_HARD_MAX_LEV_DD");
        env_override(&mut self.edge_stop.z_hist_max, "EDGE_STOP_Z_HIST_MAX");
        env_override(&mut self.edge_stop.no_bounce_window, "EDGE_STOP_NO_BOUNCE_WINDOW");
        if let Some(quote) = env_string("QUOTE_ASSET") {
            self.quote_asset = quote.to_ascii_uppercase();
        }
        env_override(&mut self.desired_path, "DESIRED_PATH");
        env_override(&mut self.zmap_path, "ZMAP_PATH");
        env_override(&mut self.state_path, "EXECUTION_STATE_PATH");
        env_override(&mut self.status_path, "EXECUTOR_STATUS_PATH");
        env_override(&mut self.signal_history_path, "SIGNAL_HISTORY_PATH");
    }

    fn validate(&self) -> Result<()> {
        if self.z_exit < 0.0 || self.z_exit >= self.z_enter {
            bail!(
                "z_exit ({}) must be non-negative and below z_enter ({})",
                self.z_exit,
                self.z_enter
            );
        }
        let lev = &self.leverage;
        if lev.lev_min <= 0.0 || lev.lev_min > lev.lev_max {
            bail!(
                "leverage bounds must satisfy 0 < lev_min ({}) <= lev_max ({})",
                lev.lev_min,
                lev.lev_max
            );
        }
        if !(0.0..1.0).contains(&self.roll_tp_drop) {
            bail!("roll_tp_drop ({}) must be in [0, 1)", self.roll_tp_drop);
        }
        if self.usd_notional <= 0.0 {
            bail!("usd_notional must be positive");
        }
        Ok(())
    }

    fn notional_for(&self, symbol: &str, desired: Option<&DesiredPosition>) -> f64 {
        let notional = desired
            .filter(|d| d.symbol.as_deref() == Some(symbol) && d.notional_usd > 0.0)
            .map(|d| d.notional_usd)
            .unwrap_or(self.usd_notional);
        if self.max_notional_usd > 0.0 {
            notional.min(self.max_notional_usd)
        } else {
            notional
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitRecord {
    pub symbol: String,
    pub side: Side,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryRecord {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub leverage: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CycleReport {
    pub exits: Vec<ExitRecord>,
    pub entries: Vec<EntryRecord>,
    pub skipped: Vec<String>,
    pub errors: Vec<String>,
}

impl CycleReport {
    fn note(&self) -> String {
        if let Some(exit) = self.exits.last() {
            format!("exit:{}:{}", exit.symbol, exit.reason)
        } else if let Some(entry) = self.entries.last() {
            format!("entry:{}:{}", entry.symbol, entry.side.label())
        } else if !self.errors.is_empty() {
            "degraded".to_string()
        } else {
            "ok".to_string()
        }
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Option<T> {
    match read_json(path) {
        Ok(value) => value,
        Err(err) => {
            log::warn!("[STATE] {}; ignoring this cycle", err);
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseOutcome {
    Flat,
    Unconfirmed,
    Rejected,
}

impl CloseOutcome {
    fn accepted(self) -> bool {
        self != CloseOutcome::Rejected
    }
}

pub struct Reconciler {
    cfg: ExecutorConfig,
    exchange: Arc<dyn Exchange>,
    clock: Arc<dyn Clock>,
    state: ExecutionState,
    status: StatusReporter,
}

impl Reconciler {
    pub fn new(cfg: ExecutorConfig, exchange: Arc<dyn Exchange>, clock: Arc<dyn Clock>) -> Self {
        let state: ExecutionState = load_or_default(&cfg.state_path);
        log::info!(
            "[STATE] loaded execution state for {} symbols from {}",
            state.symbols.len(),
            cfg.state_path.display()
        );
        let status = StatusReporter::new(
            cfg.status_path.clone(),
            "executor",
            cfg.armed,
            cfg.interval_secs,
            cfg.heartbeat_secs,
            clock.clone(),
        );
        Self {
            cfg,
            exchange,
            clock,
            state,
            status,
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub async fn run(&mut self) -> Result<()> {
        log::info!(
            "[CONFIG] exchange={} armed={} notional={} max_positions={} z_enter={} z_exit={} lev=[{}, {}] base={} z_full={}",
            self.cfg.exchange_name,
            self.cfg.armed,
            self.cfg.usd_notional,
            self.cfg.max_positions,
            self.cfg.z_enter,
            self.cfg.z_exit,
            self.cfg.leverage.lev_min,
            self.cfg.leverage.lev_max,
            self.cfg.leverage.lev_base,
            self.cfg.leverage.lev_z_full
        );
        log::info!(
            "[CONFIG] roll_tp_drop={} tp_mode={:?} tp_pct={} sl_pct={} edge_stop={:?}",
            self.cfg.roll_tp_drop,
            self.cfg.take_profit.mode,
            self.cfg.take_profit.tp_pct,
            self.cfg.sl_pct,
            self.cfg.edge_stop
        );
        if !self.cfg.armed {
            log::warn!("[DRY_RUN] executor is not armed; orders are logged only");
        }

        let mut ticker = Ticker::new(
            self.clock.clone(),
            Duration::from_secs(self.cfg.interval_secs.max(1)),
        );
        loop {
            ticker.tick().await;
            if let Err(e) = self.step().await {
                log::error!("[EXECUTOR] step failed: {:?}", e);
            }
            if let Err(e) = self.status.heartbeat_if_due() {
                log::warn!("[STATUS] failed to write heartbeat: {}", e);
            }
        }
    }

    /// One reconciliation cycle: exit rules for every open position, then
    /// the directional engine per symbol carrying a z-score, then state and
    /// status persistence. Exchange failures are logged and recorded in the
    /// report, never returned.
    pub async fn step(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let desired: Option<DesiredPosition> = read_document(&self.cfg.desired_path);
        let zmap: ZScoreMap = read_document(&self.cfg.zmap_path).unwrap_or_default();
        let history: Option<SignalHistoryDocument> =
            if self.cfg.take_profit.mode == TakeProfitMode::Vol {
                read_document(&self.cfg.signal_history_path)
            } else {
                None
            };

        let positions = match self.exchange.list_open_positions().await {
            Ok(positions) => positions,
            Err(err) => {
                log::error!("[EXCHANGE] list_open_positions failed: {}; skipping cycle", err);
                report.errors.push(format!("list_open_positions: {}", err));
                self.finish_cycle(&BTreeMap::new(), &report);
                return Ok(report);
            }
        };
        let mut held: BTreeMap<String, ExchangePosition> = positions
            .into_iter()
            .filter(|p| p.signed_qty != 0.0 && p.signed_qty.is_finite())
            .map(|p| (p.symbol.clone(), p))
            .collect();

        for (symbol, st) in self.state.symbols.iter_mut() {
            if st.pending_close && !held.contains_key(symbol) {
                log::info!("[EXIT] {} confirmed flat", symbol);
                st.pending_close = false;
            }
        }

        // symbols whose close went out this cycle but is not confirmed flat
        let mut settling: BTreeSet<String> = BTreeSet::new();
        let symbols: Vec<String> = held.keys().cloned().collect();
        for symbol in symbols {
            let Some(pos) = held.get(&symbol).cloned() else {
                continue;
            };
            let pending = self
                .state
                .get(&symbol)
                .map(|s| s.pending_close)
                .unwrap_or(false);
            let reason = if pending {
                log::warn!(
                    "[EXIT] {} still holds {} from an unconfirmed close",
                    symbol,
                    pos.signed_qty
                );
                "ensure_flat".to_string()
            } else {
                let z_now = zmap.get(&symbol).copied().flatten();
                match self.evaluate_exit(&pos, z_now, desired.as_ref(), history.as_ref()) {
                    Some(reason) => reason,
                    None => continue,
                }
            };
            let outcome = self.close_and_confirm(&pos, &reason, &mut report).await;
            if !outcome.accepted() {
                continue;
            }
            let st = self.state.entry(&symbol);
            if !pending {
                st.reentry_block = Some(pos.side());
                st.cooldown_signal_id = desired.as_ref().and_then(|d| d.signal_id.clone());
            }
            st.clear_position();
            st.pending_close = outcome == CloseOutcome::Unconfirmed;
            held.remove(&symbol);
            if outcome == CloseOutcome::Unconfirmed {
                settling.insert(symbol.clone());
            }
            report.exits.push(ExitRecord {
                symbol: symbol.clone(),
                side: pos.side(),
                reason,
            });
        }

        let mut ranked: Vec<(String, f64)> = zmap
            .iter()
            .filter_map(|(symbol, z)| z.filter(|v| v.is_finite()).map(|v| (symbol.clone(), v)))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.abs()
                .partial_cmp(&a.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        for (symbol, z) in ranked {
            if settling.contains(&symbol) {
                log::info!("[ENTRY] {} skipped: close not yet confirmed", symbol);
                report.skipped.push(format!("{}:close_unconfirmed", symbol));
                continue;
            }
            self.reconcile_symbol(&symbol, z, &mut held, desired.as_ref(), &mut report)
                .await;
        }

        write_json_atomic(&self.cfg.state_path, &self.state).with_context(|| {
            format!(
                "failed to persist execution state {}",
                self.cfg.state_path.display()
            )
        })?;
        self.finish_cycle(&held, &report);
        Ok(report)
    }

    // Updates ROI bookkeeping and returns the first exit rule that fires:
    // edge-stop, rolling take-profit, target take-profit, stop-loss.
    fn evaluate_exit(
        &mut self,
        pos: &ExchangePosition,
        z_now: Option<f64>,
        desired: Option<&DesiredPosition>,
        history: Option<&SignalHistoryDocument>,
    ) -> Option<String> {
        let now = self.clock.now_secs();
        let roi = position_roi(pos);
        let st = self.state.entry(&pos.symbol);
        if st.opened_at.is_none() {
            st.opened_at = Some(now);
        }
        if st.hysteresis_side.is_flat() {
            st.hysteresis_side = pos.side();
        }
        if let Some(roi) = roi {
            st.last_roi = Some(roi);
            st.peak_roi = Some(st.peak_roi.map_or(roi, |peak| peak.max(roi)));
        }

        let entry_hint = desired
            .filter(|d| d.symbol.as_deref() == Some(pos.symbol.as_str()))
            .and_then(|d| d.z_score)
            .or(z_now);
        st.edge_stop.set_entry_z_if_missing(entry_hint);
        st.edge_stop.record(&self.cfg.edge_stop, z_now, roi);

        let decision = should_stop(&st.edge_stop, &self.cfg.edge_stop, z_now, roi);
        if decision.stop {
            log::warn!(
                "[EXIT] {} edge_stop reason={} detail={}",
                pos.symbol,
                decision.reason,
                serde_json::to_string(&decision.detail).unwrap_or_default()
            );
            return Some(format!("edge_stop:{}", decision.reason));
        }

        let Some(roi) = roi else {
            log::debug!(
                "[EXIT] {} has no margin figure; ROI exits skipped this cycle",
                pos.symbol
            );
            return None;
        };
        let peak = st.peak_roi.unwrap_or(roi);
        if rolling_take_profit_hit(roi, peak, self.cfg.roll_tp_drop) {
            log::info!(
                "[EXIT] {} rolling take-profit roi={:.4} peak={:.4} drop={}",
                pos.symbol,
                roi,
                peak,
                self.cfg.roll_tp_drop
            );
            return Some("rolling_tp".to_string());
        }

        let series = history
            .and_then(|h| {
                asset_of(&pos.symbol, &self.cfg.quote_asset)
                    .map(|asset| h.history.series_since(asset, self.cfg.tp_vol_lookback_secs))
            })
            .unwrap_or_default();
        let (target, rule) = take_profit_target(&self.cfg.take_profit, &series);
        if let Some(target) = target {
            if roi >= target {
                log::info!(
                    "[EXIT] {} target take-profit roi={:.4} target={:.4} rule={}",
                    pos.symbol,
                    roi,
                    target,
                    rule
                );
                return Some(format!("target_tp:{}", rule));
            }
        }

        if self.cfg.sl_pct > 0.0 && roi <= -self.cfg.sl_pct {
            log::info!(
                "[EXIT] {} stop-loss roi={:.4} sl_pct={}",
                pos.symbol,
                roi,
                self.cfg.sl_pct
            );
            return Some("stop_loss".to_string());
        }
        None
    }

    async fn reconcile_symbol(
        &mut self,
        symbol: &str,
        z: f64,
        held: &mut BTreeMap<String, ExchangePosition>,
        desired: Option<&DesiredPosition>,
        report: &mut CycleReport,
    ) {
        let prev = self
            .state
            .get(symbol)
            .map(|s| s.hysteresis_side)
            .unwrap_or_default();
        let want = hysteresis(z, prev, self.cfg.z_enter, self.cfg.z_exit);
        {
            let st = self.state.entry(symbol);
            st.hysteresis_side = want;
            if let Some(blocked) = st.reentry_block {
                if blocked != want {
                    log::info!(
                        "[ENTRY] {} re-entry latch on {} released (hysteresis={})",
                        symbol,
                        blocked.label(),
                        want.label()
                    );
                    st.reentry_block = None;
                }
            }
        }

        let held_pos = held.get(symbol).cloned();
        let held_side = held_pos.as_ref().map(|p| p.side()).unwrap_or_default();
        if want == held_side {
            if !want.is_flat() {
                self.ensure_leverage(symbol, z, report).await;
            }
            return;
        }

        if want.is_flat() {
            if let Some(pos) = held_pos {
                let outcome = self.close_and_confirm(&pos, "signal_flat", report).await;
                if outcome.accepted() {
                    let st = self.state.entry(symbol);
                    st.clear_position();
                    st.pending_close = outcome == CloseOutcome::Unconfirmed;
                    held.remove(symbol);
                    report.exits.push(ExitRecord {
                        symbol: symbol.to_string(),
                        side: pos.side(),
                        reason: "signal_flat".to_string(),
                    });
                }
            }
            return;
        }

        if let Some(pos) = held_pos {
            if let Some(min_roi) = self.cfg.rotate_min_roi {
                let roi = position_roi(&pos).unwrap_or(f64::NEG_INFINITY);
                if roi < min_roi {
                    log::info!(
                        "[ENTRY] {} flip to {} deferred: roi={:.4} < rotate_min_roi={}",
                        symbol,
                        want.label(),
                        roi,
                        min_roi
                    );
                    report.skipped.push(format!("{}:rotate_min_roi", symbol));
                    return;
                }
            }
            let outcome = self.close_and_confirm(&pos, "flip", report).await;
            if !outcome.accepted() {
                return;
            }
            let st = self.state.entry(symbol);
            st.clear_position();
            st.pending_close = outcome == CloseOutcome::Unconfirmed;
            held.remove(symbol);
            report.exits.push(ExitRecord {
                symbol: symbol.to_string(),
                side: pos.side(),
                reason: "flip".to_string(),
            });
            if outcome == CloseOutcome::Unconfirmed {
                log::info!(
                    "[ENTRY] {} {} deferred: flip close not yet confirmed",
                    symbol,
                    want.label()
                );
                report.skipped.push(format!("{}:close_unconfirmed", symbol));
                return;
            }
        }

        if let Some(reason) = self.entry_block(symbol, want, desired) {
            log::info!("[ENTRY] {} {} skipped: {}", symbol, want.label(), reason);
            report.skipped.push(format!("{}:{}", symbol, reason));
            return;
        }
        if held.len() >= self.cfg.max_positions {
            log::info!(
                "[ENTRY] {} {} skipped: {} of {} positions in use",
                symbol,
                want.label(),
                held.len(),
                self.cfg.max_positions
            );
            report.skipped.push(format!("{}:max_positions", symbol));
            return;
        }
        if let Some(pos) = self.open_position(symbol, want, z, desired, report).await {
            held.insert(symbol.to_string(), pos);
        }
    }

    fn entry_block(
        &self,
        symbol: &str,
        want: Side,
        desired: Option<&DesiredPosition>,
    ) -> Option<String> {
        let Some(desired) = desired else {
            return Some("no desired document".to_string());
        };
        if desired.is_degraded() {
            return Some(format!("desired document degraded ({})", desired.reason));
        }
        if !self.cfg.allow_open_on_hold && desired.reason == REASON_HOLD {
            return Some("flat on a hold signal; waiting for a fresh signal".to_string());
        }
        // no state yet: nothing latched
        let st = self.state.get(symbol)?;
        if st.reentry_block == Some(want) {
            return Some(format!("re-entry latch on {}", want.label()));
        }
        if let (Some(stopped), Some(current)) = (&st.cooldown_signal_id, &desired.signal_id) {
            if stopped == current {
                return Some(format!("waiting for a fresh signal (stopped on {})", stopped));
            }
        }
        let now = self.clock.now_secs();
        if st.in_cooldown(now) {
            return Some(format!(
                "margin cooldown for {}s",
                st.cooldown_until.unwrap_or(now) - now
            ));
        }
        None
    }

    async fn ensure_leverage(&mut self, symbol: &str, z: f64, report: &mut CycleReport) -> bool {
        let lev = exchange_leverage(leverage_for_z(z, &self.cfg.leverage));
        if self.state.get(symbol).and_then(|s| s.leverage) == Some(lev) {
            return true;
        }
        match self.exchange.set_leverage(symbol, lev).await {
            Ok(()) if self.cfg.armed => {
                log::info!("[EXCHANGE] {} leverage set to {}x (z={:.3})", symbol, lev, z);
                self.state.entry(symbol).leverage = Some(lev);
                true
            }
            // dry runs never reach the exchange; nothing to cache
            Ok(()) => true,
            Err(err) => {
                log::error!(
                    "[EXCHANGE] set_leverage failed symbol={} leverage={}x: {}",
                    symbol,
                    lev,
                    err
                );
                report.errors.push(format!("{}:set_leverage: {}", symbol, err));
                false
            }
        }
    }

    async fn open_position(
        &mut self,
        symbol: &str,
        side: Side,
        z: f64,
        desired: Option<&DesiredPosition>,
        report: &mut CycleReport,
    ) -> Option<ExchangePosition> {
        let order_side = OrderSide::opening(side)?;
        if !self.ensure_leverage(symbol, z, report).await {
            return None;
        }
        let lev = leverage_for_z(z, &self.cfg.leverage);
        let notional = self.cfg.notional_for(symbol, desired);

        let filters = match self.exchange.symbol_filters(symbol).await {
            Ok(filters) => filters,
            Err(err) => {
                log::error!("[ENTRY] symbol_filters failed symbol={}: {}", symbol, err);
                report.errors.push(format!("{}:symbol_filters: {}", symbol, err));
                return None;
            }
        };
        let mark = match self.exchange.get_mark_price(symbol).await {
            Ok(mark) => mark,
            Err(err) => {
                log::error!("[ENTRY] get_mark_price failed symbol={}: {}", symbol, err);
                report.errors.push(format!("{}:get_mark_price: {}", symbol, err));
                return None;
            }
        };

        let qty = order_quantity(notional, lev, mark, filters.step_size, filters.min_qty);
        if qty.is_zero() {
            log::warn!(
                "[ENTRY] {} {} skipped: qty below exchange minimum (notional={} lev={:.2} mark={} step={} min_qty={})",
                symbol,
                side.label(),
                notional,
                lev,
                mark,
                filters.step_size,
                filters.min_qty
            );
            report.skipped.push(format!("{}:below_min_qty", symbol));
            return None;
        }

        match self
            .exchange
            .place_market_order(symbol, order_side, qty, false)
            .await
        {
            Ok(ack) => {
                log::info!(
                    "[ENTRY] opened {} side={} qty={} lev={:.2} notional={} z={:.3} order_id={}",
                    symbol,
                    side.label(),
                    qty,
                    lev,
                    notional,
                    z,
                    ack.order_id
                );
                let now = self.clock.now_secs();
                let st = self.state.entry(symbol);
                st.clear_position();
                st.opened_at = Some(now);
                st.edge_stop.entry_z = Some(z);
                st.cooldown_signal_id = None;
                report.entries.push(EntryRecord {
                    symbol: symbol.to_string(),
                    side,
                    qty,
                    leverage: exchange_leverage(lev),
                });
                let signed = crate::risk::decimal_to_f64(qty);
                Some(ExchangePosition {
                    symbol: symbol.to_string(),
                    signed_qty: if side == Side::Short { -signed } else { signed },
                    entry_price: mark,
                    leverage: Some(lev),
                    ..Default::default()
                })
            }
            Err(err) => {
                log::error!(
                    "[ENTRY] order failed symbol={} side={} qty={} reason=open: {}",
                    symbol,
                    order_side.as_str(),
                    qty,
                    err
                );
                if err.is_margin_insufficient() {
                    let until = self.clock.now_secs() + self.cfg.margin_cooldown_secs;
                    log::warn!(
                        "[ENTRY] {} margin insufficient; entries blocked until {}",
                        symbol,
                        until
                    );
                    self.state.entry(symbol).cooldown_until = Some(until);
                }
                report.errors.push(format!("{}:place_market_order: {}", symbol, err));
                None
            }
        }
    }

    async fn close_position(
        &self,
        pos: &ExchangePosition,
        reason: &str,
        report: &mut CycleReport,
    ) -> bool {
        let Some(side) = OrderSide::closing(pos.signed_qty) else {
            return true;
        };
        let Some(qty) = Decimal::from_f64(pos.signed_qty.abs()).map(|q| q.normalize()) else {
            log::error!(
                "[EXIT] cannot express qty {} for {} as a decimal",
                pos.signed_qty,
                pos.symbol
            );
            return false;
        };
        match self
            .exchange
            .place_market_order(&pos.symbol, side, qty, true)
            .await
        {
            Ok(ack) => {
                log::info!(
                    "[EXIT] closed {} side={} qty={} reason={} order_id={}",
                    pos.symbol,
                    side.as_str(),
                    qty,
                    reason,
                    ack.order_id
                );
                true
            }
            Err(err) => {
                log::error!(
                    "[EXIT] close failed symbol={} side={} qty={} reason={}: {}",
                    pos.symbol,
                    side.as_str(),
                    qty,
                    reason,
                    err
                );
                report
                    .errors
                    .push(format!("{}:close({}): {}", pos.symbol, reason, err));
                false
            }
        }
    }

    /// Reduce-only close, then after `wait_after_close_secs` re-reads the
    /// symbol and closes any residual quantity.
    async fn close_and_confirm(
        &self,
        pos: &ExchangePosition,
        reason: &str,
        report: &mut CycleReport,
    ) -> CloseOutcome {
        if !self.close_position(pos, reason, report).await {
            return CloseOutcome::Rejected;
        }
        self.clock
            .sleep(Duration::from_secs(self.cfg.wait_after_close_secs))
            .await;
        match self.exchange.list_open_positions().await {
            Ok(positions) => {
                let residual = positions
                    .into_iter()
                    .find(|p| p.symbol == pos.symbol && p.signed_qty != 0.0);
                if let Some(residual) = residual {
                    log::warn!(
                        "[EXIT] {} still holds {} after close; closing residual",
                        pos.symbol,
                        residual.signed_qty
                    );
                    if self.close_position(&residual, "ensure_flat", report).await {
                        return CloseOutcome::Flat;
                    }
                    return CloseOutcome::Unconfirmed;
                }
                CloseOutcome::Flat
            }
            Err(err) => {
                log::warn!(
                    "[EXIT] could not confirm {} is flat after close: {}",
                    pos.symbol,
                    err
                );
                report
                    .errors
                    .push(format!("{}:ensure_flat: {}", pos.symbol, err));
                CloseOutcome::Unconfirmed
            }
        }
    }

    fn finish_cycle(&mut self, held: &BTreeMap<String, ExchangePosition>, report: &CycleReport) {
        let positions: Vec<StatusPosition> = held
            .values()
            .map(|pos| {
                let st = self.state.get(&pos.symbol);
                StatusPosition {
                    symbol: pos.symbol.clone(),
                    side: pos.side(),
                    qty: pos.signed_qty,
                    roi: st.and_then(|s| s.last_roi),
                    peak_roi: st.and_then(|s| s.peak_roi),
                    leverage: pos.leverage,
                }
            })
            .collect();
        let last_error = report.errors.last().cloned();
        if let Err(err) = self.status.write_cycle(
            &report.note(),
            positions,
            last_error,
            serde_json::to_value(report).ok(),
        ) {
            log::warn!("[STATUS] failed to write status: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RunMode;
    use crate::dispersion::{RelativeHistory, RelativeSnapshot};
    use crate::documents::REASON_NO_PRICES;
    use crate::error::{ExchangeError, MARGIN_INSUFFICIENT_CODE};
    use crate::ports::exchange::{OrderAck, SymbolFilters};
    use crate::trade::execution::exchange_box::ExchangeBox;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    type OrderLog = Arc<Mutex<Vec<(String, OrderSide, Decimal, bool)>>>;

    struct DummyExchange {
        positions: Mutex<Vec<ExchangePosition>>,
        orders: OrderLog,
        leverage_calls: Mutex<Vec<(String, u32)>>,
        mark: f64,
        fail_positions: AtomicBool,
        list_calls: AtomicUsize,
        fail_list_call: Mutex<Option<usize>>,
        reject_code: Mutex<Option<i64>>,
    }

    impl DummyExchange {
        fn new(positions: Vec<ExchangePosition>) -> Self {
            Self {
                positions: Mutex::new(positions),
                orders: Arc::new(Mutex::new(Vec::new())),
                leverage_calls: Mutex::new(Vec::new()),
                mark: 100.0,
                fail_positions: AtomicBool::new(false),
                list_calls: AtomicUsize::new(0),
                fail_list_call: Mutex::new(None),
                reject_code: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Exchange for DummyExchange {
        async fn list_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
            let call = self.list_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_positions.load(Ordering::SeqCst)
                || *self.fail_list_call.lock().unwrap() == Some(call)
            {
                return Err(ExchangeError::TransientNetwork("connection reset".into()));
            }
            Ok(self.positions.lock().unwrap().clone())
        }

        async fn get_mark_price(&self, _symbol: &str) -> Result<f64, ExchangeError> {
            Ok(self.mark)
        }

        async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
            self.leverage_calls
                .lock()
                .unwrap()
                .push((symbol.to_string(), leverage));
            Ok(())
        }

        async fn place_market_order(
            &self,
            symbol: &str,
            side: OrderSide,
            qty: Decimal,
            reduce_only: bool,
        ) -> Result<OrderAck, ExchangeError> {
            if let Some(code) = *self.reject_code.lock().unwrap() {
                return Err(ExchangeError::Rejection {
                    code,
                    message: "Margin is insufficient.".into(),
                });
            }
            self.orders
                .lock()
                .unwrap()
                .push((symbol.to_string(), side, qty, reduce_only));
            let mut positions = self.positions.lock().unwrap();
            if reduce_only {
                positions.retain(|p| p.symbol != symbol);
            } else {
                let size = crate::risk::decimal_to_f64(qty);
                positions.push(ExchangePosition {
                    symbol: symbol.to_string(),
                    signed_qty: if side == OrderSide::Sell { -size } else { size },
                    entry_price: self.mark,
                    leverage: Some(10.0),
                    unrealized_pnl: Some(0.0),
                    margin: Some(size * self.mark / 10.0),
                    ..Default::default()
                });
            }
            Ok(OrderAck {
                order_id: format!("o-{}", self.orders.lock().unwrap().len()),
                symbol: symbol.to_string(),
                side,
                qty,
            })
        }

        async fn symbol_filters(&self, _symbol: &str) -> Result<SymbolFilters, ExchangeError> {
            Ok(SymbolFilters {
                step_size: dec!(0.1),
                min_qty: dec!(0.1),
            })
        }
    }

    fn config(dir: &TempDir) -> ExecutorConfig {
        let mut cfg = ExecutorConfig::from_yaml(ExecutorYaml::default()).unwrap();
        cfg.armed = true;
        cfg.desired_path = dir.path().join("desired.json");
        cfg.zmap_path = dir.path().join("zmap.json");
        cfg.state_path = dir.path().join("execution_state.json");
        cfg.status_path = dir.path().join("executor_status.json");
        cfg.signal_history_path = dir.path().join("signal_history.json");
        cfg
    }

    fn position(symbol: &str, qty: f64, pnl: f64) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.to_string(),
            signed_qty: qty,
            entry_price: 100.0,
            leverage: Some(10.0),
            unrealized_pnl: Some(pnl),
            margin: Some(10.0),
            ..Default::default()
        }
    }

    fn write_desired(cfg: &ExecutorConfig, reason: &str, signal_id: Option<&str>) {
        let doc = DesiredPosition {
            side: if reason == REASON_NO_PRICES {
                Side::Flat
            } else {
                Side::Short
            },
            symbol: Some("SOLUSDT".to_string()),
            notional_usd: 50.0,
            reason: reason.to_string(),
            z_score: Some(1.5),
            signal_id: signal_id.map(str::to_string),
            timestamp: 1_700_000_000,
            candidates: Vec::new(),
        };
        write_json_atomic(&cfg.desired_path, &doc).unwrap();
    }

    fn write_zmap(cfg: &ExecutorConfig, pairs: &[(&str, Option<f64>)]) {
        let zmap: ZScoreMap = pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        write_json_atomic(&cfg.zmap_path, &zmap).unwrap();
    }

    fn seed_state(cfg: &ExecutorConfig, symbol: &str, side: Side, peak: f64) {
        let mut state = ExecutionState::default();
        let st = state.entry(symbol);
        st.hysteresis_side = side;
        st.peak_roi = Some(peak);
        st.opened_at = Some(1_000);
        write_json_atomic(&cfg.state_path, &state).unwrap();
    }

    fn reconciler(
        cfg: ExecutorConfig,
        exchange: Arc<DummyExchange>,
    ) -> (Reconciler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_secs(10_000));
        let r = Reconciler::new(cfg, exchange, clock.clone());
        (r, clock)
    }

    #[tokio::test]
    async fn hard_kill_precedes_take_profit() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.edge_stop.enabled = true;
        write_desired(&cfg, "hold", Some("sig-1"));
        write_zmap(&cfg, &[("SOLUSDT", Some(-0.5))]);
        // peak 0.30 would also trip the rolling take-profit
        seed_state(&cfg, "SOLUSDT", Side::Long, 0.30);

        let exchange = Arc::new(DummyExchange::new(vec![position("SOLUSDT", 2.0, -1.6)]));
        let (mut r, _clock) = reconciler(cfg, exchange.clone());
        let report = r.step().await.unwrap();

        assert_eq!(report.exits.len(), 1);
        assert_eq!(report.exits[0].reason, "edge_stop:hard_kill");
        let orders = exchange.orders.lock().unwrap().clone();
        assert_eq!(orders, vec![("SOLUSDT".to_string(), OrderSide::Sell, dec!(2), true)]);

        let st = r.state().get("SOLUSDT").unwrap();
        assert_eq!(st.reentry_block, Some(Side::Long));
        assert_eq!(st.cooldown_signal_id.as_deref(), Some("sig-1"));
        assert!(st.peak_roi.is_none());
    }

    #[tokio::test]
    async fn rolling_take_profit_fires_after_pullback() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        seed_state(&cfg, "SOLUSDT", Side::Long, 0.08);

        let exchange = Arc::new(DummyExchange::new(vec![position("SOLUSDT", 2.0, 0.5)]));
        let (mut r, _clock) = reconciler(cfg, exchange.clone());
        let report = r.step().await.unwrap();

        assert_eq!(report.exits[0].reason, "rolling_tp");
        assert_eq!(exchange.orders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unconfirmed_close_still_latches_reentry() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        write_desired(&cfg, "hold", Some("sig-1"));
        write_zmap(&cfg, &[("SOLUSDT", Some(-1.5))]);
        seed_state(&cfg, "SOLUSDT", Side::Long, 0.08);

        let exchange = Arc::new(DummyExchange::new(vec![position("SOLUSDT", 2.0, 0.5)]));
        // the read after the close fails
        *exchange.fail_list_call.lock().unwrap() = Some(2);
        let (mut r, _clock) = reconciler(cfg, exchange.clone());

        let report = r.step().await.unwrap();
        assert_eq!(report.exits[0].reason, "rolling_tp");
        assert!(report.errors[0].contains("ensure_flat"));
        assert_eq!(report.skipped, vec!["SOLUSDT:close_unconfirmed".to_string()]);
        let st = r.state().get("SOLUSDT").unwrap();
        assert_eq!(st.reentry_block, Some(Side::Long));
        assert_eq!(st.cooldown_signal_id.as_deref(), Some("sig-1"));
        assert!(st.pending_close);
        assert!(st.peak_roi.is_none());

        // a residual shows up on the next read and is closed without reopening
        exchange
            .positions
            .lock()
            .unwrap()
            .push(position("SOLUSDT", 0.5, 0.0));
        let report = r.step().await.unwrap();
        assert_eq!(report.exits[0].reason, "ensure_flat");
        assert!(report.entries.is_empty());
        let orders = exchange.orders.lock().unwrap().clone();
        assert_eq!(
            orders,
            vec![
                ("SOLUSDT".to_string(), OrderSide::Sell, dec!(2), true),
                ("SOLUSDT".to_string(), OrderSide::Sell, dec!(0.5), true),
            ]
        );
        let st = r.state().get("SOLUSDT").unwrap();
        assert!(!st.pending_close);
        assert_eq!(st.reentry_block, Some(Side::Long));
        assert_eq!(st.cooldown_signal_id.as_deref(), Some("sig-1"));
    }

    #[tokio::test]
    async fn fixed_target_take_profit_closes() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.take_profit.tp_pct = 0.03;
        seed_state(&cfg, "SOLUSDT", Side::Long, 0.0);

        let exchange = Arc::new(DummyExchange::new(vec![position("SOLUSDT", 2.0, 0.4)]));
        let (mut r, _clock) = reconciler(cfg, exchange.clone());
        let report = r.step().await.unwrap();

        assert_eq!(report.exits[0].reason, "target_tp:fixed");
        assert_eq!(
            exchange.orders.lock().unwrap().clone(),
            vec![("SOLUSDT".to_string(), OrderSide::Sell, dec!(2), true)]
        );
        assert_eq!(r.state().get("SOLUSDT").unwrap().reentry_block, Some(Side::Long));
    }

    #[tokio::test]
    async fn vol_target_reads_signal_history() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.take_profit.mode = TakeProfitMode::Vol;
        seed_state(&cfg, "SOLUSDT", Side::Long, 0.0);

        // SOL alternates 0.00 / 0.01: std 0.005, target 1.8 * 0.005 = 0.009
        let mut history = RelativeHistory::default();
        for i in 0..12i64 {
            let rel = if i % 2 == 0 { 0.0 } else { 0.01 };
            history.push(
                RelativeSnapshot {
                    ts: 9_000 + i * 60,
                    rel: [("SOL".to_string(), rel)].into_iter().collect(),
                },
                21_600,
            );
        }
        let doc = SignalHistoryDocument {
            history,
            selection: Default::default(),
        };
        write_json_atomic(&cfg.signal_history_path, &doc).unwrap();

        let exchange = Arc::new(DummyExchange::new(vec![position("SOLUSDT", 2.0, 0.08)]));
        let (mut r, _clock) = reconciler(cfg, exchange.clone());
        let report = r.step().await.unwrap();
        assert!(report.exits.is_empty());

        *exchange.positions.lock().unwrap() = vec![position("SOLUSDT", 2.0, 0.1)];
        let report = r.step().await.unwrap();
        assert_eq!(report.exits[0].reason, "target_tp:vol");
        assert_eq!(exchange.orders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stop_loss_fires_when_no_take_profit_does() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.take_profit.tp_pct = 0.03;
        cfg.sl_pct = 0.05;
        seed_state(&cfg, "SOLUSDT", Side::Long, 0.0);

        let exchange = Arc::new(DummyExchange::new(vec![position("SOLUSDT", 2.0, -0.6)]));
        let (mut r, _clock) = reconciler(cfg, exchange.clone());
        let report = r.step().await.unwrap();

        assert_eq!(report.exits[0].reason, "stop_loss");
        assert_eq!(exchange.orders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rolling_take_profit_wins_over_target() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.take_profit.tp_pct = 0.03;
        seed_state(&cfg, "SOLUSDT", Side::Long, 0.10);

        // roi 0.05 clears the target and sits below 0.75 * peak
        let exchange = Arc::new(DummyExchange::new(vec![position("SOLUSDT", 2.0, 0.5)]));
        let (mut r, _clock) = reconciler(cfg, exchange.clone());
        let report = r.step().await.unwrap();

        assert_eq!(report.exits.len(), 1);
        assert_eq!(report.exits[0].reason, "rolling_tp");
    }

    #[tokio::test]
    async fn roi_exits_wait_for_a_margin_figure() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.take_profit.tp_pct = 0.01;
        cfg.sl_pct = 0.05;
        seed_state(&cfg, "SOLUSDT", Side::Long, 0.08);

        let mut pos = position("SOLUSDT", 2.0, -5.0);
        pos.margin = None;
        pos.leverage = None;
        let exchange = Arc::new(DummyExchange::new(vec![pos]));
        let (mut r, _clock) = reconciler(cfg, exchange.clone());
        let report = r.step().await.unwrap();

        assert!(report.exits.is_empty());
        assert!(exchange.orders.lock().unwrap().is_empty());
        let st = r.state().get("SOLUSDT").unwrap();
        assert_eq!(st.peak_roi, Some(0.08));
        assert!(st.last_roi.is_none());
    }

    #[tokio::test]
    async fn rising_roi_only_moves_the_peak() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        seed_state(&cfg, "SOLUSDT", Side::Long, 0.02);

        let exchange = Arc::new(DummyExchange::new(vec![position("SOLUSDT", 2.0, 0.5)]));
        let (mut r, _clock) = reconciler(cfg.clone(), exchange.clone());
        let report = r.step().await.unwrap();

        assert!(report.exits.is_empty());
        assert!(exchange.orders.lock().unwrap().is_empty());
        let persisted: ExecutionState = read_json(&cfg.state_path).unwrap().unwrap();
        assert_eq!(persisted.get("SOLUSDT").unwrap().peak_roi, Some(0.05));
    }

    #[tokio::test]
    async fn enters_with_leverage_sized_quantity() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        write_desired(&cfg, "enter", Some("sig-1"));
        write_zmap(&cfg, &[("SOLUSDT", Some(1.3))]);

        let exchange = Arc::new(DummyExchange::new(vec![]));
        let (mut r, _clock) = reconciler(cfg.clone(), exchange.clone());
        let report = r.step().await.unwrap();

        // lev 12.5 -> 50 * 12.5 / 100 = 6.25, floored to the 0.1 step
        assert_eq!(
            exchange.orders.lock().unwrap().clone(),
            vec![("SOLUSDT".to_string(), OrderSide::Sell, dec!(6.2), false)]
        );
        assert_eq!(
            exchange.leverage_calls.lock().unwrap().clone(),
            vec![("SOLUSDT".to_string(), 12)]
        );
        assert_eq!(report.entries[0].leverage, 12);

        let (mut restarted, _clock) = reconciler(cfg, exchange.clone());
        let st = restarted.state().get("SOLUSDT").unwrap().clone();
        assert_eq!(st.hysteresis_side, Side::Short);
        assert_eq!(st.edge_stop.entry_z, Some(1.3));
        assert_eq!(st.opened_at, Some(10_000));

        // already short: no second entry, leverage unchanged
        restarted.step().await.unwrap();
        assert_eq!(exchange.orders.lock().unwrap().len(), 1);
        assert_eq!(exchange.leverage_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn flip_closes_before_opening() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        write_desired(&cfg, "flip", Some("sig-2"));
        write_zmap(&cfg, &[("SOLUSDT", Some(1.5))]);
        seed_state(&cfg, "SOLUSDT", Side::Long, 0.0);

        let exchange = Arc::new(DummyExchange::new(vec![position("SOLUSDT", 2.0, 0.0)]));
        let (mut r, clock) = reconciler(cfg, exchange.clone());
        let report = r.step().await.unwrap();

        let orders = exchange.orders.lock().unwrap().clone();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0], ("SOLUSDT".to_string(), OrderSide::Sell, dec!(2), true));
        assert_eq!(orders[1].1, OrderSide::Sell);
        assert!(!orders[1].3);
        assert_eq!(report.exits[0].reason, "flip");
        // waited wait_after_close_secs between the legs
        assert_eq!(clock.now_secs(), 10_002);
    }

    #[tokio::test]
    async fn rotate_min_roi_defers_flip() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.rotate_min_roi = Some(0.01);
        write_desired(&cfg, "flip", Some("sig-2"));
        write_zmap(&cfg, &[("SOLUSDT", Some(1.5))]);
        seed_state(&cfg, "SOLUSDT", Side::Long, 0.0);

        let exchange = Arc::new(DummyExchange::new(vec![position("SOLUSDT", 2.0, 0.0)]));
        let (mut r, _clock) = reconciler(cfg, exchange.clone());
        let report = r.step().await.unwrap();

        assert!(exchange.orders.lock().unwrap().is_empty());
        assert_eq!(report.skipped, vec!["SOLUSDT:rotate_min_roi".to_string()]);
    }

    #[tokio::test]
    async fn dry_run_places_no_orders() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.armed = false;
        write_desired(&cfg, "enter", Some("sig-1"));
        write_zmap(&cfg, &[("SOLUSDT", Some(1.3))]);

        let dummy = DummyExchange::new(vec![]);
        let orders = dummy.orders.clone();
        let clock = Arc::new(ManualClock::at_secs(10_000));
        let boxed = ExchangeBox::new(
            Box::new(dummy),
            RunMode::Dry,
            RetryPolicy::default(),
            clock.clone(),
        );
        let mut r = Reconciler::new(cfg, Arc::new(boxed), clock);
        let report = r.step().await.unwrap();

        assert_eq!(report.entries.len(), 1);
        assert!(orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dry_run_leaves_leverage_uncached() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.armed = false;
        write_desired(&cfg, "enter", Some("sig-1"));
        write_zmap(&cfg, &[("SOLUSDT", Some(1.3))]);

        let clock = Arc::new(ManualClock::at_secs(10_000));
        let boxed = ExchangeBox::new(
            Box::new(DummyExchange::new(vec![])),
            RunMode::Dry,
            RetryPolicy::default(),
            clock.clone(),
        );
        let mut dry = Reconciler::new(cfg.clone(), Arc::new(boxed), clock);
        dry.step().await.unwrap();
        assert!(dry.state().get("SOLUSDT").unwrap().leverage.is_none());

        // an armed run on the same state file still sets leverage first
        cfg.armed = true;
        let exchange = Arc::new(DummyExchange::new(vec![]));
        let (mut armed, _clock) = reconciler(cfg, exchange.clone());
        armed.step().await.unwrap();
        assert_eq!(
            exchange.leverage_calls.lock().unwrap().clone(),
            vec![("SOLUSDT".to_string(), 12)]
        );
        assert_eq!(exchange.orders.lock().unwrap().len(), 1);
        assert_eq!(armed.state().get("SOLUSDT").unwrap().leverage, Some(12));
    }

    #[tokio::test]
    async fn hold_document_does_not_open_when_disabled() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.allow_open_on_hold = false;
        write_desired(&cfg, "hold", Some("sig-1"));
        write_zmap(&cfg, &[("SOLUSDT", Some(1.3))]);

        let exchange = Arc::new(DummyExchange::new(vec![]));
        let (mut r, _clock) = reconciler(cfg.clone(), exchange.clone());
        let report = r.step().await.unwrap();
        assert!(exchange.orders.lock().unwrap().is_empty());
        assert!(report.skipped[0].contains("hold signal"));

        write_desired(&cfg, "enter", Some("sig-2"));
        r.step().await.unwrap();
        assert_eq!(exchange.orders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn quantity_below_minimum_is_skipped() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        write_desired(&cfg, "enter", Some("sig-1"));
        write_zmap(&cfg, &[("BTCUSDT", Some(1.3))]);

        let mut dummy = DummyExchange::new(vec![]);
        dummy.mark = 100_000.0;
        let exchange = Arc::new(dummy);
        let (mut r, _clock) = reconciler(cfg, exchange.clone());
        let report = r.step().await.unwrap();

        assert!(exchange.orders.lock().unwrap().is_empty());
        assert_eq!(report.skipped, vec!["BTCUSDT:below_min_qty".to_string()]);
    }

    #[tokio::test]
    async fn exchange_failures_stay_inside_the_cycle() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        write_desired(&cfg, "enter", Some("sig-1"));
        write_zmap(&cfg, &[("SOLUSDT", Some(1.3))]);

        let exchange = Arc::new(DummyExchange::new(vec![]));
        exchange.fail_positions.store(true, Ordering::SeqCst);
        let (mut r, _clock) = reconciler(cfg.clone(), exchange.clone());
        let report = r.step().await.unwrap();

        assert_eq!(report.errors.len(), 1);
        assert!(exchange.orders.lock().unwrap().is_empty());
        let status: crate::status::StatusDocument =
            read_json(&cfg.status_path).unwrap().unwrap();
        assert_eq!(status.note, "degraded");
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn margin_rejection_starts_cooldown() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        write_desired(&cfg, "enter", Some("sig-1"));
        write_zmap(&cfg, &[("SOLUSDT", Some(1.3))]);

        let exchange = Arc::new(DummyExchange::new(vec![]));
        *exchange.reject_code.lock().unwrap() = Some(MARGIN_INSUFFICIENT_CODE);
        let (mut r, clock) = reconciler(cfg, exchange.clone());

        let report = r.step().await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(r.state().get("SOLUSDT").unwrap().cooldown_until, Some(10_120));

        *exchange.reject_code.lock().unwrap() = None;
        r.step().await.unwrap();
        assert!(exchange.orders.lock().unwrap().is_empty());

        clock.advance(Duration::from_secs(121));
        r.step().await.unwrap();
        assert_eq!(exchange.orders.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn degraded_desired_blocks_entries_not_exits() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        write_desired(&cfg, REASON_NO_PRICES, None);
        write_zmap(&cfg, &[("SOLUSDT", Some(1.5)), ("ETHUSDT", Some(-1.4))]);
        seed_state(&cfg, "ETHUSDT", Side::Long, 0.08);

        let exchange = Arc::new(DummyExchange::new(vec![position("ETHUSDT", 1.0, 0.5)]));
        let (mut r, _clock) = reconciler(cfg, exchange.clone());
        let report = r.step().await.unwrap();

        let orders = exchange.orders.lock().unwrap().clone();
        assert_eq!(orders.len(), 1);
        assert!(orders[0].3, "only the reduce-only exit goes out");
        assert_eq!(report.exits[0].symbol, "ETHUSDT");
        assert!(report.entries.is_empty());
    }

    #[tokio::test]
    async fn stopped_symbol_waits_for_fresh_signal() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        write_desired(&cfg, "hold", Some("sig-1"));
        write_zmap(&cfg, &[("SOLUSDT", Some(-1.5))]);
        seed_state(&cfg, "SOLUSDT", Side::Long, 0.08);

        let exchange = Arc::new(DummyExchange::new(vec![position("SOLUSDT", 2.0, 0.5)]));
        let (mut r, _clock) = reconciler(cfg.clone(), exchange.clone());

        // rolling TP closes; same-side re-entry is latched
        r.step().await.unwrap();
        assert_eq!(exchange.orders.lock().unwrap().len(), 1);

        // hysteresis flips: latch released, but the stop's signal id is still live
        write_zmap(&cfg, &[("SOLUSDT", Some(1.5))]);
        let report = r.step().await.unwrap();
        assert_eq!(exchange.orders.lock().unwrap().len(), 1);
        assert!(report.skipped[0].contains("fresh signal"));
        assert!(r.state().get("SOLUSDT").unwrap().reentry_block.is_none());

        write_desired(&cfg, "rotate", Some("sig-2"));
        r.step().await.unwrap();
        let orders = exchange.orders.lock().unwrap().clone();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].1, OrderSide::Sell);
        assert!(!orders[1].3);
    }

    #[tokio::test]
    async fn position_budget_serves_strongest_z_first() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        write_desired(&cfg, "enter", Some("sig-1"));
        write_zmap(&cfg, &[("AUSDT", Some(1.3)), ("BUSDT", Some(-2.0))]);

        let exchange = Arc::new(DummyExchange::new(vec![]));
        let (mut r, _clock) = reconciler(cfg, exchange.clone());
        let report = r.step().await.unwrap();

        let orders = exchange.orders.lock().unwrap().clone();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].0, "BUSDT");
        assert_eq!(orders[0].1, OrderSide::Buy);
        assert_eq!(report.skipped, vec!["AUSDT:max_positions".to_string()]);
    }

    #[test]
    fn notional_is_capped() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.max_notional_usd = 30.0;
        let desired = DesiredPosition {
            symbol: Some("SOLUSDT".into()),
            notional_usd: 80.0,
            ..Default::default()
        };
        assert_eq!(cfg.notional_for("SOLUSDT", Some(&desired)), 30.0);
        cfg.max_notional_usd = 0.0;
        assert_eq!(cfg.notional_for("SOLUSDT", Some(&desired)), 80.0);
        assert_eq!(cfg.notional_for("ETHUSDT", Some(&desired)), 50.0);
    }

    #[test]
    fn yaml_config_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("executor.yaml");
        std::fs::write(
            &path,
            "tp_mode: vol\ntp_k: 2.0\nedge_stop_enabled: true\nedge_stop_no_bounce_window: 6\nmax_positions: 3\nallow_open_on_hold: false\n",
        )
        .unwrap();
        let cfg = ExecutorConfig::from_yaml_path(&path).unwrap();
        assert_eq!(cfg.take_profit.mode, TakeProfitMode::Vol);
        assert_eq!(cfg.take_profit.k, 2.0);
        assert!(cfg.edge_stop.enabled);
        assert_eq!(cfg.edge_stop.no_bounce_window, 6);
        assert_eq!(cfg.max_positions, 3);
        assert!(!cfg.allow_open_on_hold);
        assert_eq!(cfg.leverage.lev_max, DEFAULT_LEV_MAX);
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.z_exit = cfg.z_enter;
        assert!(cfg.validate().is_err());
    }
}
