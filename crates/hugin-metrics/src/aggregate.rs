//! Folds metric deltas into session totals.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{MetricDelta, SyncStatus, TokenUsage};

/// Per-model accumulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelTotals {
    pub requests: u64,
    pub tokens: TokenUsage,
}

/// Current aggregate state of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionTotals {
    /// Distinct records folded.
    pub requests: u64,
    pub tokens: TokenUsage,
    pub tool_calls: BTreeMap<String, u64>,
    /// Records whose upstream status was >= 400.
    pub error_responses: u64,
    pub models: BTreeMap<String, ModelTotals>,
    pub last_model: Option<String>,
    pub last_status: Option<u16>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub pending: u64,
    pub synced: u64,
    pub failed: u64,
}

impl SessionTotals {
    /// Total tool calls across tools.
    pub fn total_tool_calls(&self) -> u64 {
        self.tool_calls.values().sum()
    }

    fn fold(&mut self, delta: &MetricDelta) {
        // Additive counters
        self.requests += 1;
        self.tokens.add(&delta.tokens);
        for (tool, count) in &delta.tools {
            *self.tool_calls.entry(tool.clone()).or_insert(0) += count;
        }
        if delta.status_code.is_some_and(|s| s >= 400) {
            self.error_responses += 1;
        }
        if let Some(model) = &delta.model {
            let entry = self.models.entry(model.clone()).or_default();
            entry.requests += 1;
            entry.tokens.add(&delta.tokens);
        }
        match delta.sync_status {
            SyncStatus::Pending => self.pending += 1,
            SyncStatus::Success => self.synced += 1,
            SyncStatus::Failed => self.failed += 1,
        }

        // Last write wins
        if delta.model.is_some() {
            self.last_model = delta.model.clone();
        }
        if delta.status_code.is_some() {
            self.last_status = delta.status_code;
        }
        self.first_seen = Some(match self.first_seen {
            Some(t) => t.min(delta.timestamp),
            None => delta.timestamp,
        });
        self.last_seen = Some(match self.last_seen {
            Some(t) => t.max(delta.timestamp),
            None => delta.timestamp,
        });
    }
}

/// Collapse duplicate record ids, keeping the latest line for each at its first position.
pub fn dedupe_latest(deltas: Vec<MetricDelta>) -> Vec<MetricDelta> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<MetricDelta> = Vec::with_capacity(deltas.len());
    for delta in deltas {
        match positions.get(&delta.record_id) {
            Some(&idx) => unique[idx] = delta,
            None => {
                positions.insert(delta.record_id.clone(), unique.len());
                unique.push(delta);
            }
        }
    }
    unique
}

/// Fold deltas into totals. Each record id counts once no matter how often it was appended.
pub fn aggregate(deltas: &[MetricDelta]) -> SessionTotals {
    let unique = dedupe_latest(deltas.to_vec());
    let mut totals = SessionTotals::default();
    for delta in &unique {
        totals.fold(delta);
    }
    totals
}
