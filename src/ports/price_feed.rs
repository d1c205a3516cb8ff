use crate::clock::Clock;
use crate::error::FeedError;
use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PriceSnapshot {
    pub ts: i64,
    pub prices: BTreeMap<String, f64>,
}

#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn snapshot(&self) -> Result<PriceSnapshot, FeedError>;

    /// Moves a replay feed to its next snapshot. Returns false once
    /// exhausted; live feeds never are.
    fn advance(&self) -> bool {
        true
    }

    fn is_replay(&self) -> bool {
        false
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DocTimestamp {
    Secs(i64),
    Text(String),
}

impl DocTimestamp {
    fn to_secs(&self) -> Option<i64> {
        match self {
            // millisecond stamps are common in exports
            DocTimestamp::Secs(v) if *v > 10_000_000_000 => Some(v / 1000),
            DocTimestamp::Secs(v) => Some(*v),
            DocTimestamp::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.timestamp()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PriceRow {
    token: Option<String>,
    price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PricesDocument {
    timestamp: Option<DocTimestamp>,
    #[serde(default)]
    rows: Vec<PriceRow>,
}

/// Reads the latest-prices document published by the market-data collector:
/// `{"timestamp": ..., "rows": [{"token": "ETH", "price": 3000.0}, ...]}`.
pub struct FilePriceFeed {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    max_age_secs: Option<i64>,
}

impl FilePriceFeed {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>, max_age_secs: Option<i64>) -> Self {
        Self {
            path: path.into(),
            clock,
            max_age_secs: max_age_secs.filter(|v| *v > 0),
        }
    }
}

#[async_trait]
impl PriceFeed for FilePriceFeed {
    async fn snapshot(&self) -> Result<PriceSnapshot, FeedError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            FeedError::Unavailable(format!("read {}: {}", self.path.display(), e))
        })?;
        let doc: PricesDocument = serde_json::from_str(&content).map_err(|e| {
            FeedError::Unavailable(format!("parse {}: {}", self.path.display(), e))
        })?;

        let now = self.clock.now_secs();
        let ts = doc
            .timestamp
            .as_ref()
            .and_then(DocTimestamp::to_secs)
            .unwrap_or(now);
        if let Some(max_age) = self.max_age_secs {
            if now.saturating_sub(ts) > max_age {
                return Err(FeedError::Unavailable(format!(
                    "prices are {}s old (max {}s)",
                    now - ts,
                    max_age
                )));
            }
        }

        let prices: BTreeMap<String, f64> = doc
            .rows
            .into_iter()
            .filter_map(|row| {
                let token = row.token?.trim().to_ascii_uppercase();
                let price = row.price.filter(|p| p.is_finite() && *p > 0.0)?;
                (!token.is_empty()).then_some((token, price))
            })
            .collect();
        if prices.is_empty() {
            return Err(FeedError::Unavailable("prices document has no rows".into()));
        }
        Ok(PriceSnapshot { ts, prices })
    }
}
