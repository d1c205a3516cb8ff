use crate::clock::Clock;
use crate::documents::{load_or_default, write_json_atomic, Side};
use crate::error::StateError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPosition {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub roi: Option<f64>,
    pub peak_roi: Option<f64>,
    pub leverage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusDocument {
    pub ts: i64,
    pub updated_at: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub alive: bool,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub armed: bool,
    #[serde(default)]
    pub interval_secs: u64,
    #[serde(default)]
    pub heartbeat_ts: Option<i64>,
    #[serde(default)]
    pub cycles: u64,
    #[serde(default)]
    pub positions: Vec<StatusPosition>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

pub struct StatusReporter {
    path: PathBuf,
    component: String,
    armed: bool,
    interval_secs: u64,
    heartbeat_secs: i64,
    last_heartbeat: Option<i64>,
    cycles: u64,
    clock: Arc<dyn Clock>,
}

impl StatusReporter {
    pub fn new(
        path: impl Into<PathBuf>,
        component: &str,
        armed: bool,
        interval_secs: u64,
        heartbeat_secs: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            path: path.into(),
            component: component.to_string(),
            armed,
            interval_secs,
            heartbeat_secs: heartbeat_secs.max(1) as i64,
            last_heartbeat: None,
            cycles: 0,
            clock,
        }
    }

    pub fn write_cycle(
        &mut self,
        note: &str,
        positions: Vec<StatusPosition>,
        last_error: Option<String>,
        detail: Option<serde_json::Value>,
    ) -> Result<(), StateError> {
        self.cycles += 1;
        let now = self.clock.now();
        let doc = StatusDocument {
            ts: now.timestamp(),
            updated_at: now.to_rfc3339(),
            component: self.component.clone(),
            alive: true,
            note: note.to_string(),
            armed: self.armed,
            interval_secs: self.interval_secs,
            heartbeat_ts: self.last_heartbeat,
            cycles: self.cycles,
            positions,
            last_error,
            detail,
        };
        write_json_atomic(&self.path, &doc)
    }

    /// Refreshes liveness fields on the existing document without dropping
    /// what the last cycle wrote.
    pub fn heartbeat_if_due(&mut self) -> Result<bool, StateError> {
        let now = self.clock.now();
        let due = self
            .last_heartbeat
            .map(|last| now.timestamp() - last >= self.heartbeat_secs)
            .unwrap_or(true);
        if !due {
            return Ok(false);
        }
        let mut doc: StatusDocument = load_or_default(&self.path);
        doc.ts = now.timestamp();
        doc.updated_at = now.to_rfc3339();
        doc.component = self.component.clone();
        doc.alive = true;
        doc.armed = self.armed;
        doc.interval_secs = self.interval_secs;
        doc.heartbeat_ts = Some(now.timestamp());
        if doc.note.is_empty() {
            doc.note = "heartbeat".to_string();
        }
        write_json_atomic(&self.path, &doc)?;
        self.last_heartbeat = Some(now.timestamp());
        Ok(true)
    }
}
