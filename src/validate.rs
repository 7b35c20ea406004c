//! Post-hoc validation: re-aggregates sampled metrics independently
//! through both schemas and compares the sums.
//!
//! Every probe runs regardless of earlier failures; mismatches are
//! recorded, not fatal. Integer sums must match exactly; float sums are
//! compared within a small relative tolerance to absorb summation order
//! differences.

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::catalog::{KeyCatalog, MetricKind};
use crate::model::TimeWindow;
use crate::schema::SchemaPlan;
use crate::store::{MetricSum, SourceReader, SumValue, TargetWriter};

/// One metric to validate for one customer.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Probe {
    pub customer_id: i32,
    pub metric_key: String,
}

/// Outcome of one probe: both sums, both row counts, and the verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub customer_id: i32,
    pub metric_key: String,
    pub kind: MetricKind,
    pub passed: bool,
    pub source_sum: SumValue,
    pub target_sum: SumValue,
    pub source_rows: u64,
    pub target_rows: u64,
}

/// Structured validation report, consumed by an external report writer.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub window: TimeWindow,
    pub passed: usize,
    pub failed: usize,
    pub probes: Vec<ProbeResult>,
}

impl ValidationReport {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Runs every probe over `window` and collects the report.
pub async fn run_probes<S: SourceReader, T: TargetWriter>(
    source: &S,
    target: &T,
    catalog: &KeyCatalog,
    window: TimeWindow,
    probes: &[Probe],
    float_tolerance: f64,
) -> Result<ValidationReport> {
    let mut results = Vec::with_capacity(probes.len());

    for probe in probes {
        let (kind, column) = if let Some(slot) = catalog.int_slot(&probe.metric_key) {
            (MetricKind::Integer, SchemaPlan::int_column_name(slot))
        } else if let Some(slot) = catalog.float_slot(&probe.metric_key) {
            (MetricKind::Float, SchemaPlan::float_column_name(slot))
        } else {
            bail!(
                "probe metric {:?} is not in the key catalog",
                probe.metric_key
            );
        };

        let source_sum = source
            .sum_metric(window, probe.customer_id, kind, &probe.metric_key)
            .await
            .with_context(|| format!("summing source metric {:?}", probe.metric_key))?;
        let target_sum = target
            .sum_column(window, probe.customer_id, &column, kind)
            .await
            .with_context(|| format!("summing target column {column}"))?;

        let passed = sums_match(&source_sum, &target_sum, float_tolerance);
        if !passed {
            tracing::warn!(
                customer_id = probe.customer_id,
                metric_key = %probe.metric_key,
                ?source_sum,
                ?target_sum,
                "validation probe failed",
            );
        }

        results.push(ProbeResult {
            customer_id: probe.customer_id,
            metric_key: probe.metric_key.clone(),
            kind,
            passed,
            source_sum: source_sum.value,
            target_sum: target_sum.value,
            source_rows: source_sum.rows,
            target_rows: target_sum.rows,
        });
    }

    let passed = results.iter().filter(|r| r.passed).count();
    let failed = results.len() - passed;

    tracing::info!(passed, failed, "validation completed");

    Ok(ValidationReport {
        window,
        passed,
        failed,
        probes: results,
    })
}

fn sums_match(source: &MetricSum, target: &MetricSum, float_tolerance: f64) -> bool {
    match (source.value, target.value) {
        (SumValue::Int(a), SumValue::Int(b)) => a == b,
        (SumValue::Float(a), SumValue::Float(b)) => {
            let scale = a.abs().max(b.abs());
            if scale == 0.0 {
                return true;
            }
            ((a - b) / scale).abs() <= float_tolerance
        }
        // Kind disagreement between the two stores is always a failure.
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum(value: SumValue, rows: u64) -> MetricSum {
        MetricSum { value, rows }
    }

    #[test]
    fn test_matching_int_sums_pass() {
        assert!(sums_match(
            &sum(SumValue::Int(42), 10),
            &sum(SumValue::Int(42), 3),
            1e-6,
        ));
    }

    #[test]
    fn test_mismatched_int_sums_fail() {
        assert!(!sums_match(
            &sum(SumValue::Int(42), 10),
            &sum(SumValue::Int(41), 3),
            1e-6,
        ));
    }

    #[test]
    fn test_float_sums_within_tolerance_pass() {
        assert!(sums_match(
            &sum(SumValue::Float(100.0), 5),
            &sum(SumValue::Float(100.0 + 1e-5), 5),
            1e-6,
        ));
        assert!(!sums_match(
            &sum(SumValue::Float(100.0), 5),
            &sum(SumValue::Float(101.0), 5),
            1e-6,
        ));
    }

    #[test]
    fn test_zero_float_sums_pass() {
        assert!(sums_match(
            &sum(SumValue::Float(0.0), 0),
            &sum(SumValue::Float(0.0), 0),
            1e-6,
        ));
    }

    #[test]
    fn test_kind_disagreement_fails() {
        assert!(!sums_match(
            &sum(SumValue::Int(42), 1),
            &sum(SumValue::Float(42.0), 1),
            1e-6,
        ));
    }
}
