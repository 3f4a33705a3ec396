//! Activity record and filter surface.
//!
//! The activity/audit persistence backend itself is external (spec
//! §1) — the core's only responsibility is classifying severity and
//! normalizing the filter parameters the external HTTP surface
//! accepts (spec §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub kind: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitiveDataDetection {
    pub detected: bool,
    pub detections: Vec<Detection>,
}

/// An opaque activity record. The core never persists these — it only
/// classifies and filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub server_name: String,
    pub tool_name: Option<String>,
    pub session_id: Option<String>,
    pub request_id: String,
    pub status: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub response: Option<Value>,
    pub response_truncated: bool,
    pub intent_type: Option<String>,
    pub sensitive_data: Option<SensitiveDataDetection>,
    pub flow_type: Option<String>,
    pub risk_level: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Severity classification is a pure function of the detections found —
/// the highest severity among them, or `None` if nothing was detected.
pub fn classify_detection_severity(detections: &[Detection]) -> Option<Severity> {
    detections
        .iter()
        .map(|d| d.severity)
        .max_by_key(|s| match s {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        })
}

/// Filter parameters accepted by the external HTTP surface (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityFilter {
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(rename = "type")]
    pub single_type: Option<String>,
    pub server: Option<String>,
    pub tool: Option<String>,
    pub session_id: Option<String>,
    pub status: Option<String>,
    pub request_id: Option<String>,
    pub intent_type: Option<String>,
    pub sensitive_data: Option<bool>,
    pub detection_type: Option<String>,
    pub severity: Option<Severity>,
    pub flow_type: Option<String>,
    pub risk_level: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(default)]
    pub include_call_tool: bool,
}

impl ActivityFilter {
    /// Apply the clamp/precedence rules (spec §6/§8, DESIGN.md Open
    /// Question #3): `types` (comma-separated) is authoritative over a
    /// bare `type`; absence of both means no type filter. `limit`
    /// clamps to `[1, 100]`, defaulting to 50; `offset` defaults to 0.
    pub fn normalize(mut self) -> Self {
        if self.types.is_empty() {
            if let Some(t) = self.single_type.take() {
                self.types = t.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
            }
        } else {
            self.single_type = None;
        }

        self.limit = Some(match self.limit {
            None => DEFAULT_LIMIT as i64,
            Some(n) if n <= 0 => DEFAULT_LIMIT as i64,
            Some(n) if n > MAX_LIMIT as i64 => MAX_LIMIT as i64,
            Some(n) => n,
        });

        self.offset = Some(self.offset.unwrap_or(0).max(0));

        self
    }

    pub fn matches_type(&self, event_type: &str) -> bool {
        self.types.is_empty() || self.types.iter().any(|t| t == event_type)
    }
}
