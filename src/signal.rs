use crate::clock::{Clock, Ticker};
use crate::config::{env_list, env_override, env_string, parse_list};
use crate::dispersion::{
    cross_sectional_z, rank_by_magnitude, select, Held, RelativeHistory, RelativeSnapshot,
    SelectionParams, Transition,
};
use crate::documents::{
    load_or_default, to_symbol, write_json_atomic, Candidate, DesiredPosition, Side, ZScoreMap,
    REASON_NO_PRICES, REASON_ZERO_DISPERSION,
};
use crate::error::FeedError;
use crate::ports::price_feed::{PriceFeed, PriceSnapshot};
use crate::status::StatusReporter;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_UNIVERSE: &str = "ETH,SOL,BNB,XRP,DOGE,ADA,AVAX,LINK";
const DEFAULT_REFERENCE_ASSET: &str = "BTC";
const DEFAULT_QUOTE_ASSET: &str = "USDT";
const DEFAULT_INTERVAL_SECS: u64 = 15;
const DEFAULT_HEARTBEAT_SECS: u64 = 60;
const DEFAULT_LOOKBACK_SECS: i64 = 6 * 3600;
const DEFAULT_MIN_SPAN_SECS: i64 = 1800;
const DEFAULT_Z_ENTER: f64 = 1.2;
const DEFAULT_Z_EXIT: f64 = 0.4;
const DEFAULT_SWITCH_DELTA: f64 = 0.3;
const DEFAULT_USD_NOTIONAL: f64 = 50.0;
const DEFAULT_MAX_CANDIDATES: usize = 5;
const DEFAULT_PRICE_MAX_AGE_SECS: i64 = 300;
const DEFAULT_PRICES_PATH: &str = "state/prices_latest.json";
const DEFAULT_DESIRED_PATH: &str = "state/desired_position.json";
const DEFAULT_ZMAP_PATH: &str = "state/zmap.json";
const DEFAULT_HISTORY_PATH: &str = "state/signal_history.json";
const DEFAULT_STATUS_PATH: &str = "state/signal_status.json";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct SignalYaml {
    universe: Option<Vec<String>>,
    reference_asset: Option<String>,
    quote_asset: Option<String>,
    prices_path: Option<String>,
    price_max_age_secs: Option<i64>,
    replay_file: Option<String>,
    interval_secs: Option<u64>,
    heartbeat_secs: Option<u64>,
    lookback_secs: Option<i64>,
    min_span_secs: Option<i64>,
    z_enter: Option<f64>,
    z_exit: Option<f64>,
    switch_delta: Option<f64>,
    usd_notional: Option<f64>,
    max_candidates: Option<usize>,
    desired_path: Option<String>,
    zmap_path: Option<String>,
    history_path: Option<String>,
    status_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub universe: Vec<String>,
    pub reference_asset: String,
    pub quote_asset: String,
    pub prices_path: String,
    pub price_max_age_secs: i64,
    pub replay_file: Option<String>,
    pub interval_secs: u64,
    pub heartbeat_secs: u64,
    pub lookback_secs: i64,
    pub min_span_secs: i64,
    pub z_enter: f64,
    pub z_exit: f64,
    pub switch_delta: f64,
    pub usd_notional: f64,
    pub max_candidates: usize,
    pub desired_path: PathBuf,
    pub zmap_path: PathBuf,
    pub history_path: PathBuf,
    pub status_path: PathBuf,
}

impl SignalConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        match env_string("SIGNAL_CONFIG_PATH") {
            Some(path) => Self::from_yaml_path(path),
            None => Self::from_env(),
        }
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open signal config {}", path_ref.display()))?;
        let yaml: SignalYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse signal config {}", path_ref.display()))?;
        let mut cfg = Self::from_yaml(yaml);
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::from_yaml(SignalYaml::default());
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_yaml(yaml: SignalYaml) -> Self {
        let universe = yaml
            .universe
            .map(|list| parse_list(&list.join(",")))
            .unwrap_or_else(|| parse_list(DEFAULT_UNIVERSE));
        SignalConfig {
            universe,
            reference_asset: yaml
                .reference_asset
                .unwrap_or_else(|| DEFAULT_REFERENCE_ASSET.to_string())
                .to_ascii_uppercase(),
            quote_asset: yaml
                .quote_asset
                .unwrap_or_else(|| DEFAULT_QUOTE_ASSET.to_string())
                .to_ascii_uppercase(),
            prices_path: yaml
                .prices_path
                .unwrap_or_else(|| DEFAULT_PRICES_PATH.to_string()),
            price_max_age_secs: yaml
                .price_max_age_secs
                .unwrap_or(DEFAULT_PRICE_MAX_AGE_SECS),
            replay_file: yaml.replay_file,
            interval_secs: yaml.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS),
            heartbeat_secs: yaml.heartbeat_secs.unwrap_or(DEFAULT_HEARTBEAT_SECS),
            lookback_secs: yaml.lookback_secs.unwrap_or(DEFAULT_LOOKBACK_SECS),
            min_span_secs: yaml.min_span_secs.unwrap_or(DEFAULT_MIN_SPAN_SECS),
            z_enter: yaml.z_enter.unwrap_or(DEFAULT_Z_ENTER),
            z_exit: yaml.z_exit.unwrap_or(DEFAULT_Z_EXIT),
            switch_delta: yaml.switch_delta.unwrap_or(DEFAULT_SWITCH_DELTA),
            usd_notional: yaml.usd_notional.unwrap_or(DEFAULT_USD_NOTIONAL),
            max_candidates: yaml.max_candidates.unwrap_or(DEFAULT_MAX_CANDIDATES),
            desired_path: PathBuf::from(
                yaml.desired_path
                    .unwrap_or_else(|| DEFAULT_DESIRED_PATH.to_string()),
            ),
            zmap_path: PathBuf::from(
                yaml.zmap_path
                    .unwrap_or_else(|| DEFAULT_ZMAP_PATH.to_string()),
            ),
            history_path: PathBuf::from(
                yaml.history_path
                    .unwrap_or_else(|| DEFAULT_HISTORY_PATH.to_string()),
            ),
            status_path: PathBuf::from(
                yaml.status_path
                    .unwrap_or_else(|| DEFAULT_STATUS_PATH.to_string()),
            ),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(universe) = env_list("SIGNAL_UNIVERSE") {
            self.universe = universe;
        }
        if let Some(value) = env_string("REFERENCE_ASSET") {
            self.reference_asset = value.to_ascii_uppercase();
        }
        if let Some(value) = env_string("QUOTE_ASSET") {
            self.quote_asset = value.to_ascii_uppercase();
        }
        env_override(&mut self.prices_path, "PRICES_PATH");
        env_override(&mut self.price_max_age_secs, "PRICE_MAX_AGE_SECS");
        if let Ok(value) = env::var("REPLAY_FILE") {
            self.replay_file = Some(value).filter(|v| !v.trim().is_empty());
        }
        env_override(&mut self.interval_secs, "SIGNAL_INTERVAL_SECS");
        env_override(&mut self.heartbeat_secs, "HEARTBEAT_SECS");
        env_override(&mut self.lookback_secs, "LOOKBACK_SECS");
        env_override(&mut self.min_span_secs, "MIN_SPAN_SECS");
        env_override(&mut self.z_enter, "Z_ENTER");
        env_override(&mut self.z_exit, "Z_EXIT");
        env_override(&mut self.switch_delta, "SWITCH_DELTA");
        env_override(&mut self.usd_notional, "USD_NOTIONAL");
        env_override(&mut self.max_candidates, "MAX_CANDIDATES");
        env_override(&mut self.desired_path, "DESIRED_PATH");
        env_override(&mut self.zmap_path, "ZMAP_PATH");
        env_override(&mut self.history_path, "SIGNAL_HISTORY_PATH");
        env_override(&mut self.status_path, "SIGNAL_STATUS_PATH");
    }

    fn validate(&self) -> Result<()> {
        let tradable = self
            .universe
            .iter()
            .filter(|a| **a != self.reference_asset)
            .count();
        if tradable < 2 {
            bail!("universe needs at least two assets besides {}", self.reference_asset);
        }
        if self.z_exit < 0.0 || self.z_exit >= self.z_enter {
            bail!(
                "z_exit ({}) must be non-negative and below z_enter ({})",
                self.z_exit,
                self.z_enter
            );
        }
        if self.lookback_secs <= 0 || self.min_span_secs > self.lookback_secs {
            bail!(
                "lookback_secs ({}) must be positive and cover min_span_secs ({})",
                self.lookback_secs,
                self.min_span_secs
            );
        }
        Ok(())
    }

    pub fn selection_params(&self) -> SelectionParams {
        SelectionParams {
            z_enter: self.z_enter,
            z_exit: self.z_exit,
            switch_delta: self.switch_delta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectionState {
    #[serde(default)]
    pub side: Side,
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub signal_id: Option<String>,
    #[serde(default)]
    pub entry_z: Option<f64>,
}

impl SelectionState {
    fn held(&self) -> Option<Held> {
        match (&self.asset, self.side) {
            (Some(asset), side) if !side.is_flat() => Some(Held {
                asset: asset.clone(),
                side,
            }),
            _ => None,
        }
    }
}

/// Persisted by the signal loop; the executor reads it for volatility-based
/// take-profit targets.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalHistoryDocument {
    #[serde(default)]
    pub history: RelativeHistory,
    #[serde(default)]
    pub selection: SelectionState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    WarmingUp { points: usize, span_secs: i64 },
    Degraded(DesiredPosition),
    Emitted(DesiredPosition),
}

pub struct SignalEngine {
    cfg: SignalConfig,
    feed: Box<dyn PriceFeed>,
    clock: Arc<dyn Clock>,
    doc: SignalHistoryDocument,
    status: StatusReporter,
}

impl SignalEngine {
    pub fn new(cfg: SignalConfig, feed: Box<dyn PriceFeed>, clock: Arc<dyn Clock>) -> Self {
        let mut doc: SignalHistoryDocument = load_or_default(&cfg.history_path);
        doc.history.prune(cfg.lookback_secs);
        log::info!(
            "[SIGNAL] loaded {} history points ({}s span), holding {:?} {}",
            doc.history.len(),
            doc.history.span_secs(),
            doc.selection.side,
            doc.selection.asset.as_deref().unwrap_or("-")
        );
        let status = StatusReporter::new(
            cfg.status_path.clone(),
            "signal",
            false,
            cfg.interval_secs,
            cfg.heartbeat_secs,
            clock.clone(),
        );
        Self {
            cfg,
            feed,
            clock,
            doc,
            status,
        }
    }

    pub fn history(&self) -> &SignalHistoryDocument {
        &self.doc
    }

    pub async fn run(&mut self) -> Result<()> {
        log::info!(
            "[CONFIG] universe={:?} reference={} quote={} lookback={}s min_span={}s z_enter={} z_exit={} switch_delta={}",
            self.cfg.universe,
            self.cfg.reference_asset,
            self.cfg.quote_asset,
            self.cfg.lookback_secs,
            self.cfg.min_span_secs,
            self.cfg.z_enter,
            self.cfg.z_exit,
            self.cfg.switch_delta
        );

        if self.feed.is_replay() {
            log::info!("[BACKTEST] Replaying price dump.");
            loop {
                if let Err(e) = self.step().await {
                    log::error!("[BACKTEST] signal step failed: {:?}", e);
                }
                if !self.feed.advance() {
                    log::info!("[BACKTEST] End of price dump reached.");
                    break;
                }
            }
            return Ok(());
        }

        log::info!("[LIVE] Running signal loop every {}s.", self.cfg.interval_secs);
        let mut ticker = Ticker::new(
            self.clock.clone(),
            Duration::from_secs(self.cfg.interval_secs.max(1)),
        );
        loop {
            ticker.tick().await;
            if let Err(e) = self.step().await {
                log::error!("[SIGNAL] step failed: {:?}", e);
            }
            if let Err(e) = self.status.heartbeat_if_due() {
                log::warn!("[STATUS] failed to write heartbeat: {}", e);
            }
        }
    }

    // One cycle. Outputs are written before the history is committed, so a
    // failed cycle leaves the persisted history unchanged.
    pub async fn step(&mut self) -> Result<CycleOutcome> {
        let snapshot = match self.feed.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(FeedError::Exhausted) => bail!("price feed exhausted"),
            Err(err) => {
                log::warn!("[SIGNAL] {}", err);
                let now = self.clock.now_secs();
                return self.emit_degraded(REASON_NO_PRICES, now, &[]);
            }
        };
        let Some(rel) = self.relative_snapshot(&snapshot) else {
            log::warn!(
                "[SIGNAL] no usable {} reference price in snapshot ts={}",
                self.cfg.reference_asset,
                snapshot.ts
            );
            return self.emit_degraded(REASON_NO_PRICES, snapshot.ts, &[]);
        };

        let mut working = self.doc.clone();
        working.history.push(rel, self.cfg.lookback_secs);

        let points = working.history.len();
        let span_secs = working.history.span_secs();
        if points < 2 || span_secs < self.cfg.min_span_secs {
            log::debug!(
                "[SIGNAL] warming up: {} points over {}s (need {}s)",
                points,
                span_secs,
                self.cfg.min_span_secs
            );
            self.commit(working)?;
            return Ok(CycleOutcome::WarmingUp { points, span_secs });
        }

        let returns = working.history.window_returns();
        let Some(z) = cross_sectional_z(&returns) else {
            let assets: Vec<String> = returns.keys().cloned().collect();
            log::info!("[SIGNAL] zero cross-sectional dispersion; emitting FLAT");
            let outcome = self.emit_degraded(REASON_ZERO_DISPERSION, snapshot.ts, &assets)?;
            self.commit(working)?;
            return Ok(outcome);
        };

        let ranked = rank_by_magnitude(&z);
        let held = working.selection.held();
        let transition = select(held.as_ref(), &z, &ranked, &self.cfg.selection_params());
        let desired =
            self.apply_transition(&mut working.selection, &transition, &ranked, snapshot.ts);

        let zmap: ZScoreMap = self
            .all_symbols(returns.keys())
            .into_iter()
            .map(|(asset, symbol)| (symbol, z.get(&asset).copied()))
            .collect();
        self.write_outputs(&desired, &zmap)?;
        self.commit(working)?;

        log::info!(
            "[SIGNAL] {} side={} symbol={} z={} signal_id={}",
            desired.reason,
            desired.side.label(),
            desired.symbol.as_deref().unwrap_or("-"),
            desired
                .z_score
                .map(|v| format!("{:.3}", v))
                .unwrap_or_else(|| "-".to_string()),
            desired.signal_id.as_deref().unwrap_or("-")
        );
        if let Err(e) = self.status.write_cycle(
            &desired.reason,
            Vec::new(),
            None,
            serde_json::to_value(&desired).ok(),
        ) {
            log::warn!("[STATUS] failed to write status: {}", e);
        }
        Ok(CycleOutcome::Emitted(desired))
    }

    fn relative_snapshot(&self, snapshot: &PriceSnapshot) -> Option<RelativeSnapshot> {
        RelativeSnapshot::from_prices(
            snapshot.ts,
            &snapshot.prices,
            &self.cfg.reference_asset,
            &self.cfg.universe,
        )
    }

    fn all_symbols<'a>(&self, extra: impl Iterator<Item = &'a String>) -> Vec<(String, String)> {
        let mut assets: Vec<String> = self
            .cfg
            .universe
            .iter()
            .filter(|a| **a != self.cfg.reference_asset)
            .cloned()
            .collect();
        for asset in extra {
            if !assets.contains(asset) {
                assets.push(asset.clone());
            }
        }
        assets
            .into_iter()
            .map(|asset| {
                let symbol = to_symbol(&asset, &self.cfg.quote_asset);
                (asset, symbol)
            })
            .collect()
    }

    fn apply_transition(
        &self,
        selection: &mut SelectionState,
        transition: &Transition,
        ranked: &[(String, f64)],
        ts: i64,
    ) -> DesiredPosition {
        if transition.is_state_change() {
            selection.signal_id = Some(uuid::Uuid::new_v4().to_string());
        }
        let (side, asset, z_score) = match transition {
            Transition::StayFlat => (Side::Flat, None, ranked.first().map(|(_, z)| *z)),
            Transition::Enter { asset, side, z }
            | Transition::Rotate { asset, side, z, .. }
            | Transition::Flip { asset, side, z } => {
                selection.entry_z = Some(*z);
                (*side, Some(asset.clone()), Some(*z))
            }
            Transition::Hold { asset, side, z } => (*side, Some(asset.clone()), *z),
            Transition::Exit { asset, z } => {
                log::info!("[SIGNAL] exit {} at z={:.3}", asset, z);
                selection.entry_z = None;
                (Side::Flat, None, Some(*z))
            }
        };
        selection.side = side;
        selection.asset = if side.is_flat() { None } else { asset.clone() };

        let candidates = ranked
            .iter()
            .take(self.cfg.max_candidates.max(1))
            .map(|(asset, z)| Candidate {
                symbol: to_symbol(asset, &self.cfg.quote_asset),
                z_score: *z,
                side: Side::from_z(*z),
            })
            .collect();

        DesiredPosition {
            side,
            symbol: asset.map(|a| to_symbol(&a, &self.cfg.quote_asset)),
            notional_usd: self.cfg.usd_notional,
            reason: transition.reason().to_string(),
            z_score,
            signal_id: selection.signal_id.clone(),
            timestamp: ts,
            candidates,
        }
    }

    fn emit_degraded(&mut self, reason: &str, ts: i64, assets: &[String]) -> Result<CycleOutcome> {
        let desired = DesiredPosition {
            side: Side::Flat,
            symbol: None,
            notional_usd: self.cfg.usd_notional,
            reason: reason.to_string(),
            z_score: None,
            signal_id: None,
            timestamp: ts,
            candidates: Vec::new(),
        };
        let zmap: ZScoreMap = self
            .all_symbols(assets.iter())
            .into_iter()
            .map(|(_, symbol)| (symbol, None))
            .collect();
        self.write_outputs(&desired, &zmap)?;
        if let Err(e) = self
            .status
            .write_cycle(reason, Vec::new(), Some(reason.to_string()), None)
        {
            log::warn!("[STATUS] failed to write status: {}", e);
        }
        Ok(CycleOutcome::Degraded(desired))
    }

    fn write_outputs(&self, desired: &DesiredPosition, zmap: &ZScoreMap) -> Result<()> {
        write_json_atomic(&self.cfg.zmap_path, zmap)
            .with_context(|| format!("failed to write {}", self.cfg.zmap_path.display()))?;
        write_json_atomic(&self.cfg.desired_path, desired)
            .with_context(|| format!("failed to write {}", self.cfg.desired_path.display()))?;
        Ok(())
    }

    fn commit(&mut self, working: SignalHistoryDocument) -> Result<()> {
        write_json_atomic(&self.cfg.history_path, &working)
            .with_context(|| format!("failed to persist {}", self.cfg.history_path.display()))?;
        self.doc = working;
        Ok(())
    }
}
