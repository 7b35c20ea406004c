//! Aggregation engine: consumes one chunk's raw rows, collapses them by
//! composite identity and minute bucket, and writes the flattened batch.
//!
//! The aggregation itself is a pure function of the chunk's rows and the
//! key catalog, so replaying a chunk (after clearing its prior output)
//! reproduces byte-identical sums. The runner enforces the exactly-once
//! discipline: clear the chunk's range, write the batch, and only then
//! mark the chunk complete.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use thiserror::Error;

use crate::catalog::{KeyCatalog, MetricKind};
use crate::chunks::{Chunk, ChunkPlan, ChunkProgress, ChunkState};
use crate::model::{AggregatedRow, AggregationKey, SourceRow};
use crate::store::{SourceReader, TargetWriter};

/// Errors that abort a single chunk. None of these are retried
/// automatically; the chunk stays `Failed` for operator intervention.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error(
        "metric key {key:?} ({} kind, customer {customer_id}) is not in the key catalog; \
         re-run discovery over a window covering the full transformation range",
        kind.as_str()
    )]
    UnknownKey {
        key: String,
        customer_id: i32,
        kind: MetricKind,
    },

    #[error("integer overflow accumulating metric {key:?} for customer {customer_id}")]
    NumericOverflow { key: String, customer_id: i32 },
}

/// Collapses source rows into one output row per aggregation key.
///
/// Descriptive columns come from the first-seen row of each group; metric
/// values are summed into the catalog's slots. Integer slots accumulate
/// with checked 32-bit arithmetic; float slots use 32-bit floats and
/// propagate whatever NaN/Inf the source produces. Output order follows
/// the aggregation key ordering, so it is deterministic.
pub fn aggregate_rows(
    catalog: &KeyCatalog,
    rows: &[SourceRow],
) -> Result<Vec<AggregatedRow>, ChunkError> {
    let int_columns = catalog.int_key_count();
    let float_columns = catalog.float_key_count();

    let mut groups: BTreeMap<AggregationKey, AggregatedRow> = BTreeMap::new();

    for row in rows {
        let key = AggregationKey::of(row);
        let entry = groups.entry(key.clone()).or_insert_with(|| AggregatedRow {
            timestamp_ms: key.minute_bucket_ms,
            customer_id: row.customer_id,
            client_id: row.client_id.clone(),
            session_id: row.session_id,
            dimensions: row.dimensions.clone(),
            int_slots: vec![0; int_columns],
            float_slots: vec![0.0; float_columns],
        });

        for group in &row.int_groups {
            for (metric_key, value) in group {
                let slot =
                    catalog
                        .int_slot(metric_key)
                        .ok_or_else(|| ChunkError::UnknownKey {
                            key: metric_key.clone(),
                            customer_id: row.customer_id,
                            kind: MetricKind::Integer,
                        })?;

                let summed = i32::try_from(*value)
                    .ok()
                    .and_then(|v| entry.int_slots[slot].checked_add(v))
                    .ok_or_else(|| ChunkError::NumericOverflow {
                        key: metric_key.clone(),
                        customer_id: row.customer_id,
                    })?;
                entry.int_slots[slot] = summed;
            }
        }

        for group in &row.float_groups {
            for (metric_key, value) in group {
                let slot =
                    catalog
                        .float_slot(metric_key)
                        .ok_or_else(|| ChunkError::UnknownKey {
                            key: metric_key.clone(),
                            customer_id: row.customer_id,
                            kind: MetricKind::Float,
                        })?;
                entry.float_slots[slot] += *value as f32;
            }
        }
    }

    Ok(groups.into_values().collect())
}

/// Timing and retry policy for the two blocking chunk operations.
///
/// Source reads are retried with linear backoff at the chunk boundary
/// only; write failures and timeouts fail the chunk outright.
#[derive(Debug, Clone, Copy)]
pub struct EnginePolicy {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub read_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(300),
            read_attempts: 3,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Per-chunk result counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkOutcome {
    pub source_rows: usize,
    pub output_rows: usize,
}

/// Whole-run counters across all processed chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub chunks_processed: usize,
    pub source_rows: u64,
    pub output_rows: u64,
}

/// Drives the aggregation engine chunk by chunk.
pub struct ChunkRunner<'a, S, T> {
    source: &'a S,
    target: &'a T,
    catalog: &'a KeyCatalog,
    customer_ids: &'a [i32],
    policy: EnginePolicy,
}

impl<'a, S: SourceReader, T: TargetWriter> ChunkRunner<'a, S, T> {
    pub fn new(
        source: &'a S,
        target: &'a T,
        catalog: &'a KeyCatalog,
        customer_ids: &'a [i32],
        policy: EnginePolicy,
    ) -> Self {
        Self {
            source,
            target,
            catalog,
            customer_ids,
            policy,
        }
    }

    /// Processes every chunk from `start_index` onward, stopping at the
    /// first failure. Chunks below `start_index` are trusted as done.
    pub async fn run_from(
        &self,
        plan: &ChunkPlan,
        progress: &mut ChunkProgress,
        start_index: usize,
    ) -> Result<RunStats> {
        progress.reset_from(start_index)?;

        let total_chunks = plan.chunk_count();
        let mut stats = RunStats::default();

        for chunk in plan.chunks_from(start_index) {
            tracing::info!(
                chunk = chunk.index + 1,
                total_chunks,
                start_ms = chunk.window.start_ms,
                end_ms = chunk.window.end_ms,
                "processing chunk",
            );

            let outcome = self.run_chunk(chunk, progress).await?;

            stats.chunks_processed += 1;
            stats.source_rows += outcome.source_rows as u64;
            stats.output_rows += outcome.output_rows as u64;

            tracing::info!(
                chunk = chunk.index + 1,
                source_rows = outcome.source_rows,
                output_rows = outcome.output_rows,
                "chunk completed",
            );
        }

        tracing::info!(
            chunks = stats.chunks_processed,
            source_rows = stats.source_rows,
            output_rows = stats.output_rows,
            "transformation run completed",
        );

        Ok(stats)
    }

    /// Processes one chunk end to end, recording the state transition in
    /// the progress artifact. `Completed` is persisted strictly after the
    /// batch write is acknowledged.
    pub async fn run_chunk(
        &self,
        chunk: Chunk,
        progress: &mut ChunkProgress,
    ) -> Result<ChunkOutcome> {
        progress.mark(chunk.index, ChunkState::InProgress)?;

        match self.process(chunk).await {
            Ok(outcome) => {
                progress.mark(chunk.index, ChunkState::Completed)?;
                Ok(outcome)
            }
            Err(err) => {
                tracing::error!(chunk = chunk.index, error = %err, "chunk failed");
                progress.mark(chunk.index, ChunkState::Failed)?;
                Err(err)
            }
        }
    }

    async fn process(&self, chunk: Chunk) -> Result<ChunkOutcome> {
        let rows = self.read_rows(chunk).await?;
        let source_rows = rows.len();

        let output = aggregate_rows(self.catalog, &rows)
            .with_context(|| format!("aggregating chunk {}", chunk.index))?;

        if output.is_empty() {
            tracing::info!(chunk = chunk.index, "no data in chunk");
            return Ok(ChunkOutcome {
                source_rows,
                output_rows: 0,
            });
        }

        // Clear any partial output from a previous attempt before writing,
        // so a replayed chunk never double-accumulates.
        self.target
            .clear_range(chunk.window)
            .await
            .with_context(|| format!("clearing target range for chunk {}", chunk.index))?;

        tokio::time::timeout(self.policy.write_timeout, self.target.insert_batch(&output))
            .await
            .map_err(|_| anyhow!("target batch write timed out for chunk {}", chunk.index))?
            .with_context(|| format!("writing batch for chunk {}", chunk.index))?;

        Ok(ChunkOutcome {
            source_rows,
            output_rows: output.len(),
        })
    }

    /// Reads the chunk's rows. Connection-level errors are retried with
    /// linear backoff; hitting the read timeout fails the chunk outright.
    async fn read_rows(&self, chunk: Chunk) -> Result<Vec<SourceRow>> {
        let attempts = self.policy.read_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let read = tokio::time::timeout(self.policy.read_timeout, self.try_read(chunk)).await;
            match read {
                Err(_) => {
                    return Err(anyhow!("source read timed out for chunk {}", chunk.index));
                }
                Ok(Ok(rows)) => return Ok(rows),
                Ok(Err(err)) if attempt < attempts => {
                    tracing::warn!(
                        chunk = chunk.index,
                        attempt,
                        error = %err,
                        "chunk read failed, retrying",
                    );
                    tokio::time::sleep(self.policy.retry_backoff * attempt).await;
                }
                Ok(Err(err)) => {
                    return Err(err)
                        .with_context(|| format!("reading chunk {} source rows", chunk.index));
                }
            }
        }
    }

    async fn try_read(&self, chunk: Chunk) -> Result<Vec<SourceRow>> {
        let mut rows = Vec::new();
        for &customer_id in self.customer_ids {
            let fetched = self.source.fetch_rows(chunk.window, customer_id).await?;
            rows.extend(fetched);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::model::{Dimensions, TimeWindow};

    use super::*;

    fn catalog(int: &[&str], float: &[&str]) -> KeyCatalog {
        let window = TimeWindow::new(0, 86_400_000).unwrap();
        let int: BTreeSet<String> = int.iter().map(|s| s.to_string()).collect();
        let float: BTreeSet<String> = float.iter().map(|s| s.to_string()).collect();
        KeyCatalog::build(window, int, float)
    }

    fn row(client: &str, session: i64, ts_ms: i64, int_metrics: &[(&str, i64)]) -> SourceRow {
        let mut row = SourceRow {
            timestamp_ms: ts_ms,
            customer_id: 1,
            client_id: client.into(),
            session_id: session,
            ..Default::default()
        };
        row.int_groups
            .push(int_metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect());
        row
    }

    #[test]
    fn test_same_minute_rows_sum_into_one_slot() {
        // Two rows, same client/session/minute, x=2 and x=3 -> int1 = 5.
        let catalog = catalog(&["x"], &[]);
        let rows = vec![
            row("A", 1, 60_000, &[("x", 2)]),
            row("A", 1, 60_500, &[("x", 3)]),
        ];

        let output = aggregate_rows(&catalog, &rows).unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].int_slots, vec![5]);
        assert_eq!(output[0].timestamp_ms, 60_000);
    }

    #[test]
    fn test_conservation_across_groups() {
        // Three rows with event_count = 1,1,1 in one minute -> slot = 3.
        let catalog = catalog(&["event_count"], &[]);
        let rows = vec![
            row("A", 1, 0, &[("event_count", 1)]),
            row("A", 1, 100, &[("event_count", 1)]),
            row("A", 1, 59_999, &[("event_count", 1)]),
        ];

        let output = aggregate_rows(&catalog, &rows).unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].int_slots, vec![3]);
    }

    #[test]
    fn test_distinct_identities_stay_separate() {
        let catalog = catalog(&["x"], &[]);
        let rows = vec![
            row("A", 1, 0, &[("x", 1)]),
            row("B", 1, 0, &[("x", 1)]),
            row("A", 2, 0, &[("x", 1)]),
            row("A", 1, 60_000, &[("x", 1)]),
        ];

        let output = aggregate_rows(&catalog, &rows).unwrap();
        assert_eq!(output.len(), 4);
        // Row-count invariant: output <= input, equality when no key repeats.
        assert!(output.len() <= rows.len());
    }

    #[test]
    fn test_first_seen_dimensions_win() {
        let catalog = catalog(&["x"], &[]);
        let mut first = row("A", 1, 0, &[("x", 1)]);
        first.dimensions = Dimensions {
            platform: "ios".into(),
            ..Default::default()
        };
        let mut second = row("A", 1, 100, &[("x", 1)]);
        second.dimensions = Dimensions {
            platform: "android".into(),
            ..Default::default()
        };

        let output = aggregate_rows(&catalog, &[first, second]).unwrap();
        assert_eq!(output[0].dimensions.platform, "ios");
    }

    #[test]
    fn test_float_slots_accumulate() {
        let catalog = catalog(&[], &["rtt"]);
        let mut a = row("A", 1, 0, &[]);
        a.float_groups.push([("rtt".to_string(), 1.5)].into());
        let mut b = row("A", 1, 10, &[]);
        b.float_groups.push([("rtt".to_string(), 2.25)].into());

        let output = aggregate_rows(&catalog, &[a, b]).unwrap();
        assert_eq!(output[0].float_slots, vec![3.75]);
    }

    #[test]
    fn test_unknown_key_is_hard_error() {
        let catalog = catalog(&["x"], &[]);
        let rows = vec![row("A", 1, 0, &[("y", 1)])];

        let err = aggregate_rows(&catalog, &rows).unwrap_err();
        match err {
            ChunkError::UnknownKey {
                key, customer_id, ..
            } => {
                assert_eq!(key, "y");
                assert_eq!(customer_id, 1);
            }
            other => panic!("expected UnknownKey, got {other:?}"),
        }
    }

    #[test]
    fn test_integer_overflow_is_error() {
        let catalog = catalog(&["x"], &[]);
        let rows = vec![
            row("A", 1, 0, &[("x", i32::MAX as i64)]),
            row("A", 1, 1, &[("x", 1)]),
        ];

        let err = aggregate_rows(&catalog, &rows).unwrap_err();
        assert!(matches!(err, ChunkError::NumericOverflow { .. }));

        // A single value outside i32 range is also an overflow.
        let rows = vec![row("A", 1, 0, &[("x", i64::from(i32::MAX) + 1)])];
        assert!(matches!(
            aggregate_rows(&catalog, &rows),
            Err(ChunkError::NumericOverflow { .. })
        ));
    }

    #[test]
    fn test_replay_is_byte_identical() {
        let catalog = catalog(&["a", "b"], &["f"]);
        let mut rows = Vec::new();
        for i in 0..50 {
            let mut r = row("A", i % 3, (i * 700) % 120_000, &[("a", i), ("b", 2)]);
            r.float_groups
                .push([("f".to_string(), 0.1 * i as f64)].into());
            rows.push(r);
        }

        let first = aggregate_rows(&catalog, &rows).unwrap();
        let second = aggregate_rows(&catalog, &rows).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_slots_zero_initialized_for_absent_keys() {
        let catalog = catalog(&["a", "b", "c"], &["f"]);
        let rows = vec![row("A", 1, 0, &[("b", 7)])];

        let output = aggregate_rows(&catalog, &rows).unwrap();
        assert_eq!(output[0].int_slots, vec![0, 7, 0]);
        assert_eq!(output[0].float_slots, vec![0.0]);
    }
}
