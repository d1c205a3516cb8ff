use crate::edge_stop::EdgeStopState;
use crate::error::StateError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
    #[default]
    Flat,
}

impl Side {
    // Rich asset (positive z) is sold, cheap asset is bought.
    pub fn from_z(z: f64) -> Side {
        if z > 0.0 {
            Side::Short
        } else if z < 0.0 {
            Side::Long
        } else {
            Side::Flat
        }
    }

    pub fn from_signed_qty(qty: f64) -> Side {
        if qty > 0.0 {
            Side::Long
        } else if qty < 0.0 {
            Side::Short
        } else {
            Side::Flat
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
            Side::Flat => Side::Flat,
        }
    }

    pub fn is_flat(self) -> bool {
        self == Side::Flat
    }

    pub fn label(self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
            Side::Flat => "FLAT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub z_score: f64,
    pub side: Side,
}

pub const REASON_NO_PRICES: &str = "no_prices";
pub const REASON_ZERO_DISPERSION: &str = "zero_dispersion";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DesiredPosition {
    pub side: Side,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub notional_usd: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub z_score: Option<f64>,
    #[serde(default)]
    pub signal_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl DesiredPosition {
    /// Documents emitted while the signal loop lacks usable data. The
    /// executor keeps managing exits but opens nothing on them.
    pub fn is_degraded(&self) -> bool {
        self.side.is_flat()
            && (self.reason == REASON_NO_PRICES || self.reason == REASON_ZERO_DISPERSION)
    }
}

pub fn to_symbol(asset: &str, quote: &str) -> String {
    format!("{}{}", asset, quote)
}

pub fn asset_of<'a>(symbol: &'a str, quote: &str) -> Option<&'a str> {
    symbol.strip_suffix(quote).filter(|asset| !asset.is_empty())
}

pub type ZScoreMap = BTreeMap<String, Option<f64>>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SymbolState {
    #[serde(default)]
    pub hysteresis_side: Side,
    #[serde(default)]
    pub peak_roi: Option<f64>,
    #[serde(default)]
    pub last_roi: Option<f64>,
    #[serde(default)]
    pub opened_at: Option<i64>,
    #[serde(default)]
    pub leverage: Option<u32>,
    // Side closed by an exit rule; re-entry on it waits until hysteresis
    // leaves that side.
    #[serde(default)]
    pub reentry_block: Option<Side>,
    #[serde(default)]
    pub cooldown_signal_id: Option<String>,
    #[serde(default)]
    pub cooldown_until: Option<i64>,
    #[serde(default)]
    pub edge_stop: EdgeStopState,
    // A close went out but the symbol was not confirmed flat; the next
    // cycle closes whatever is left.
    #[serde(default)]
    pub pending_close: bool,
}

impl SymbolState {
    pub fn clear_position(&mut self) {
        self.peak_roi = None;
        self.last_roi = None;
        self.opened_at = None;
        self.edge_stop.reset();
    }

    pub fn in_cooldown(&self, now_secs: i64) -> bool {
        self.cooldown_until.map(|until| now_secs < until).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionState {
    pub symbols: BTreeMap<String, SymbolState>,
}

impl ExecutionState {
    pub fn entry(&mut self, symbol: &str) -> &mut SymbolState {
        self.symbols.entry(symbol.to_string()).or_default()
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolState> {
        self.symbols.get(symbol)
    }
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let payload = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);
    fs::write(&tmp_path, payload)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StateError::Io(err)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match read_json(path) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(err) => {
            log::warn!("[STATE] {}; starting from defaults", err);
            T::default()
        }
    }
}
