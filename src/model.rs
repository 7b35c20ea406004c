//! Row types shared by discovery, the aggregation engine, and the stores.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Number of integer map-groups (and, separately, float map-groups) on a
/// source row (`metricIntGroup1..15`, `metricFloatGroup1..15`).
pub const METRIC_GROUP_COUNT: usize = 15;

/// Milliseconds per minute bucket.
pub const MINUTE_MS: i64 = 60_000;

/// Half-open time interval `[start_ms, end_ms)` over epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    /// Creates a window, rejecting empty or inverted intervals.
    pub fn new(start_ms: i64, end_ms: i64) -> Result<Self> {
        if start_ms >= end_ms {
            bail!("invalid time window: start {start_ms} >= end {end_ms}");
        }
        Ok(Self { start_ms, end_ms })
    }

    /// Returns true if `other` lies entirely within this window.
    pub fn covers(&self, other: &TimeWindow) -> bool {
        self.start_ms <= other.start_ms && self.end_ms >= other.end_ms
    }

    /// Returns true if `ts_ms` falls inside the window.
    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ms && ts_ms < self.end_ms
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

/// Descriptive columns copied unchanged from source to target. Within one
/// aggregation group the first-seen row's values win; they are expected to
/// be constant per client/session/minute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dimensions {
    pub platform: String,
    pub app_name: String,
    pub app_version: String,
    pub user_id: String,
    pub device_name: String,
    pub device_model: String,
    pub device_operating_system: String,
    pub country_iso: String,
    pub isp: i32,
    pub asn: i32,
    pub conn_type: i32,
}

/// One raw source row: identity, descriptive columns, and the dynamic
/// metric maps (one map per group).
#[derive(Debug, Clone, Default)]
pub struct SourceRow {
    pub timestamp_ms: i64,
    pub customer_id: i32,
    pub client_id: String,
    pub session_id: i64,
    pub dimensions: Dimensions,
    /// `metricIntGroup1..15`; indices beyond the populated length are
    /// treated as empty maps. Sorted maps keep accumulation order
    /// deterministic, which replay idempotence depends on for floats.
    pub int_groups: Vec<BTreeMap<String, i64>>,
    /// `metricFloatGroup1..15`.
    pub float_groups: Vec<BTreeMap<String, f64>>,
}

/// Composite identity under which source rows collapse into one output row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey {
    pub customer_id: i32,
    pub client_id: String,
    pub session_id: i64,
    pub minute_bucket_ms: i64,
}

impl AggregationKey {
    /// Derives the key for a source row.
    pub fn of(row: &SourceRow) -> Self {
        Self {
            customer_id: row.customer_id,
            client_id: row.client_id.clone(),
            session_id: row.session_id,
            minute_bucket_ms: minute_bucket(row.timestamp_ms),
        }
    }
}

/// Truncates a timestamp to the start of its containing minute.
pub fn minute_bucket(timestamp_ms: i64) -> i64 {
    timestamp_ms - timestamp_ms.rem_euclid(MINUTE_MS)
}

/// One flattened output row: fixed metric slots instead of maps. Slot
/// vectors are sized by the schema plan and zero-initialized.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRow {
    /// Minute bucket of the contributing source rows.
    pub timestamp_ms: i64,
    pub customer_id: i32,
    pub client_id: String,
    pub session_id: i64,
    pub dimensions: Dimensions,
    pub int_slots: Vec<i32>,
    pub float_slots: Vec<f32>,
}
