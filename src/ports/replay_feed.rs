use crate::error::FeedError;
use crate::ports::price_feed::{PriceFeed, PriceSnapshot};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

// One line of the JSONL price dump
#[derive(Debug, Clone, Deserialize)]
struct DumpedPrices {
    timestamp: i64,
    prices: BTreeMap<String, f64>,
}

/// Replays a JSONL price dump one snapshot per cycle.
#[derive(Debug)]
pub struct ReplayPriceFeed {
    data: Vec<DumpedPrices>,
    cursor: AtomicUsize,
}

impl ReplayPriceFeed {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            FeedError::Unavailable(format!("failed to open replay file {}: {}", path.display(), e))
        })?;
        let reader = BufReader::new(file);
        let mut data = Vec::new();

        for line in reader.lines() {
            let line = line
                .map_err(|e| FeedError::Unavailable(format!("failed to read replay line: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DumpedPrices = serde_json::from_str(&line).map_err(|e| {
                FeedError::Unavailable(format!("failed to parse replay entry '{}': {}", line, e))
            })?;
            data.push(entry);
        }

        if data.is_empty() {
            return Err(FeedError::Unavailable(
                "price dump file is empty or invalid".to_string(),
            ));
        }

        Ok(Self {
            data,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl PriceFeed for ReplayPriceFeed {
    async fn snapshot(&self) -> Result<PriceSnapshot, FeedError> {
        let cursor = self.cursor.load(AtomicOrdering::SeqCst);
        let entry = self.data.get(cursor).ok_or(FeedError::Exhausted)?;
        // dumps are stored in milliseconds
        Ok(PriceSnapshot {
            ts: entry.timestamp / 1000,
            prices: entry.prices.clone(),
        })
    }

    fn advance(&self) -> bool {
        let cursor = self.cursor.load(AtomicOrdering::SeqCst);
        if cursor + 1 < self.data.len() {
            self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
            true
        } else {
            false
        }
    }

    fn is_replay(&self) -> bool {
        true
    }
}
