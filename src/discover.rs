//! Key discovery: scans a bounded window of source data and builds the
//! deterministic key catalog.
//!
//! The scan is a set union over every map group of every row, so row order
//! never matters; sorting happens once when the catalog is built. Rows with
//! malformed map data are counted and skipped, never fatal.

use std::collections::BTreeSet;

use anyhow::Result;

use crate::catalog::KeyCatalog;
use crate::chunks::ChunkPlan;
use crate::model::{SourceRow, TimeWindow};
use crate::store::SourceReader;

/// Counters reported by a discovery run.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscoveryStats {
    pub rows_scanned: u64,
    pub rows_skipped: u64,
    pub int_keys: usize,
    pub float_keys: usize,
}

/// Order-independent key set accumulator. Commutative and idempotent:
/// observing the same rows in any order or multiplicity yields the same
/// catalog.
#[derive(Debug, Default)]
pub struct KeyAccumulator {
    int_keys: BTreeSet<String>,
    float_keys: BTreeSet<String>,
    rows_scanned: u64,
    rows_skipped: u64,
}

impl KeyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one row's map groups into the key sets. A row carrying a
    /// blank key in any group is malformed and skipped whole.
    pub fn observe(&mut self, row: &SourceRow) {
        if row_is_malformed(row) {
            self.rows_skipped += 1;
            return;
        }

        self.rows_scanned += 1;
        for group in &row.int_groups {
            for key in group.keys() {
                if !self.int_keys.contains(key) {
                    self.int_keys.insert(key.clone());
                }
            }
        }
        for group in &row.float_groups {
            for key in group.keys() {
                if !self.float_keys.contains(key) {
                    self.float_keys.insert(key.clone());
                }
            }
        }
    }

    /// Finalizes the accumulated sets into a catalog for `window`.
    pub fn finish(self, window: TimeWindow) -> (KeyCatalog, DiscoveryStats) {
        let stats = DiscoveryStats {
            rows_scanned: self.rows_scanned,
            rows_skipped: self.rows_skipped,
            int_keys: self.int_keys.len(),
            float_keys: self.float_keys.len(),
        };
        (KeyCatalog::build(window, self.int_keys, self.float_keys), stats)
    }
}

fn row_is_malformed(row: &SourceRow) -> bool {
    row.int_groups
        .iter()
        .flat_map(|g| g.keys())
        .any(|k| k.trim().is_empty())
        || row
            .float_groups
            .iter()
            .flat_map(|g| g.keys())
            .any(|k| k.trim().is_empty())
}

/// Scans the discovery window chunk-by-chunk (bounding memory the same way
/// the transform does) for every configured customer, and returns the
/// catalog covering the whole window.
pub async fn discover_keys<S: SourceReader>(
    source: &S,
    plan: &ChunkPlan,
    customer_ids: &[i32],
) -> Result<(KeyCatalog, DiscoveryStats)> {
    let total_chunks = plan.chunk_count();
    let mut accumulator = KeyAccumulator::new();

    for chunk in plan.chunks_from(0) {
        for &customer_id in customer_ids {
            let rows = source.fetch_rows(chunk.window, customer_id).await?;
            for row in &rows {
                accumulator.observe(row);
            }
        }

        tracing::info!(
            chunk = chunk.index + 1,
            total_chunks,
            int_keys = accumulator.int_keys.len(),
            float_keys = accumulator.float_keys.len(),
            "discovery chunk scanned",
        );
    }

    let (catalog, stats) = accumulator.finish(plan.window());

    tracing::info!(
        rows_scanned = stats.rows_scanned,
        rows_skipped = stats.rows_skipped,
        int_keys = stats.int_keys,
        float_keys = stats.float_keys,
        "key discovery completed",
    );

    Ok((catalog, stats))
}
