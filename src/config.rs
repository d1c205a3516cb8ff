use std::env;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_BINANCE_FUTURES_ENDPOINT: &str = "https://fapi.binance.com";

#[derive(Debug)]
pub struct BinanceCredentials {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Dry,
    Armed,
}

impl RunMode {
    pub fn from_flag(armed: bool) -> Self {
        if armed {
            RunMode::Armed
        } else {
            RunMode::Dry
        }
    }

    pub fn is_armed(self) -> bool {
        self == RunMode::Armed
    }
}

#[derive(Debug)]
pub enum ConfigError {
    MissingVar(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::MissingVar(name) => write!(f, "{} must be set", name),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Armed mode fails without keys. A dry run without keys still starts, but
/// position reads are signed calls, so every dry cycle degrades.
pub fn get_binance_credentials_from_env(
    mode: RunMode,
) -> Result<Option<BinanceCredentials>, ConfigError> {
    resolve_credentials(
        env_string("BINANCE_API_KEY"),
        env_string("BINANCE_API_SECRET"),
        mode,
    )
}

fn resolve_credentials(
    api_key: Option<String>,
    api_secret: Option<String>,
    mode: RunMode,
) -> Result<Option<BinanceCredentials>, ConfigError> {
    match (api_key, api_secret, mode) {
        (Some(api_key), Some(api_secret), _) => Ok(Some(BinanceCredentials {
            api_key,
            api_secret,
        })),
        (None, _, RunMode::Armed) => Err(ConfigError::MissingVar("BINANCE_API_KEY".into())),
        (_, None, RunMode::Armed) => Err(ConfigError::MissingVar("BINANCE_API_SECRET".into())),
        _ => {
            log::warn!(
                "[CONFIG] dry run without BINANCE_API_KEY/BINANCE_API_SECRET: \
                 position reads need signed calls, every cycle will report degraded"
            );
            Ok(None)
        }
    }
}

pub fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|v| {
        let v = v.to_ascii_lowercase();
        v == "1" || v == "true" || v == "yes" || v == "on"
    })
}

pub fn env_override<T: FromStr>(slot: &mut T, name: &str) {
    if let Some(raw) = env_string(name) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => log::warn!("[CONFIG] ignoring unparsable {}={}", name, raw),
        }
    }
}

pub fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|v| parse_list(&v))
}

pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
