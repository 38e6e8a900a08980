//! Worker heartbeat files.
//!
//! Each long-lived worker writes `<component>.heartbeat.json` under the data
//! root; `/status` reads them back to report per-component health without
//! any cross-thread plumbing.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::heartbeat_path;
use crate::error::{FailOpen, Result};
use crate::util;

/// A single heartbeat record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    /// Component name (`kaitd`, `pipeline`, `feedback`, `promotion`).
    pub component: String,
    /// When the heartbeat was written.
    pub ts: DateTime<Utc>,
    /// Free-form status, normally `ok`.
    pub status: String,
}

/// Reported health of a component derived from its heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    /// Heartbeat is recent.
    Ok,
    /// Heartbeat exists but is older than three intervals.
    Stale,
    /// No heartbeat file found.
    Missing,
}

/// Writes and reads heartbeat files, throttling writes per component.
#[derive(Debug)]
pub struct HeartbeatRegistry {
    data_root: PathBuf,
    interval_s: u64,
    last_beat: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl HeartbeatRegistry {
    /// Create a registry rooted at the data directory.
    pub fn new(data_root: impl Into<PathBuf>, interval_s: u64) -> Self {
        Self {
            data_root: data_root.into(),
            interval_s,
            last_beat: Mutex::new(HashMap::new()),
        }
    }

    /// Record a heartbeat for a component, throttled to the interval.
    ///
    /// Fail-open: a write failure logs a warning and is otherwise ignored.
    pub fn beat(&self, component: &str) {
        let now = Utc::now();
        {
            let mut last = self.last_beat.lock().expect("heartbeat lock poisoned");
            if let Some(prev) = last.get(component) {
                if (now - *prev).num_seconds() < self.interval_s as i64 {
                    return;
                }
            }
            last.insert(component.to_string(), now);
        }

        let record = Heartbeat {
            component: component.to_string(),
            ts: now,
            status: "ok".to_string(),
        };
        self.write(component, &record)
            .fail_open_default(&format!("writing {} heartbeat", component));
    }

    fn write(&self, component: &str, record: &Heartbeat) -> Result<()> {
        util::atomic_write_json(&heartbeat_path(&self.data_root, component), record)
    }

    /// Read a component's status from its heartbeat file.
    pub fn component_status(&self, component: &str) -> ComponentStatus {
        Self::status_at(&self.data_root, component, self.interval_s, Utc::now())
    }

    /// Status for a component under a data root, with an explicit clock.
    pub fn status_at(
        data_root: &Path,
        component: &str,
        interval_s: u64,
        now: DateTime<Utc>,
    ) -> ComponentStatus {
        let path = heartbeat_path(data_root, component);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return ComponentStatus::Missing;
        };
        let Ok(record) = serde_json::from_str::<Heartbeat>(&content) else {
            return ComponentStatus::Missing;
        };

        let age = (now - record.ts).num_seconds();
        if age <= (interval_s as i64) * 3 {
            ComponentStatus::Ok
        } else {
            ComponentStatus::Stale
        }
    }
}
