use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate view published to the server: check or item name to its latest value.
///
/// Backed by a `BTreeMap` so two snapshots with equal content always
/// serialize to identical bytes.
pub type Snapshot = BTreeMap<String, serde_json::Value>;

/// Output of one batch run of the built-in checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckBatch {
    pub produced_at: DateTime<Utc>,
    pub values: Snapshot,
}

impl CheckBatch {
    pub fn new(values: Snapshot) -> Self {
        Self {
            produced_at: Utc::now(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Result of a single item run (custom check or exporter scrape).
///
/// # Examples
///
/// ```
/// use oxmon_common::types::ResultEnvelope;
///
/// let ok = ResultEnvelope::success("c1", 42);
/// assert!(ok.is_success());
///
/// let failed: ResultEnvelope<i32> = ResultEnvelope::failure("c1", "exit status 2");
/// assert_eq!(failed.to_json()["error"], "exit status 2");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope<T> {
    pub name: String,
    pub outcome: RunOutcome<T>,
    pub produced_at: DateTime<Utc>,
}

/// Either the value an item produced or the error that ended its run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome<T> {
    Value(T),
    Error(String),
}

impl<T> ResultEnvelope<T> {
    pub fn success(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            outcome: RunOutcome::Value(value),
            produced_at: Utc::now(),
        }
    }

    pub fn failure(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: RunOutcome::Error(message.into()),
            produced_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Value(_))
    }
}

impl<T: Serialize> ResultEnvelope<T> {
    /// Value stored in the last-value table for this result.
    ///
    /// Failed runs become `{"error": message}` so the failure is visible in
    /// the published snapshot instead of silently keeping an older value.
    pub fn to_json(&self) -> serde_json::Value {
        match &self.outcome {
            RunOutcome::Value(v) => serde_json::to_value(v)
                .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() })),
            RunOutcome::Error(message) => serde_json::json!({ "error": message }),
        }
    }
}
