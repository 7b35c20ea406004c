//! Phase orchestration: wires configuration, stores, and artifacts into
//! the discovery, schema, transform, and validation phases.

use anyhow::{bail, Context, Result};

use crate::catalog::KeyCatalog;
use crate::chunks::{ChunkPlan, ChunkProgress};
use crate::config::Config;
use crate::discover::{self, DiscoveryStats};
use crate::engine::{ChunkRunner, RunStats};
use crate::schema::{self, SchemaPlan};
use crate::store::{ClickHouseSource, ClickHouseTarget};
use crate::validate::{self, ValidationReport};

/// Run-level switches for the transform phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformOptions {
    /// Truncate the entire target table and restart from chunk 0 state.
    pub truncate_target: bool,
    /// Chunk index to resume from; completion of earlier chunks is
    /// trusted.
    pub start_from_chunk: usize,
}

/// Phase 1: scan the window, build the key catalog, persist it.
pub async fn discover_phase(cfg: &Config) -> Result<DiscoveryStats> {
    let window = cfg.time_window()?;
    let plan = ChunkPlan::new(window, cfg.chunking.chunk_width)?;

    let pool = cfg.source.connect().await?;
    let source = ClickHouseSource::new(pool, cfg.source.qualified_table());

    let (catalog, stats) = discover::discover_keys(&source, &plan, &cfg.customers).await?;
    catalog.save(&cfg.artifacts.catalog_path)?;

    Ok(stats)
}

/// Phase 2: derive the fixed column layout and create the target table.
pub async fn schema_phase(cfg: &Config, drop_first: bool) -> Result<SchemaPlan> {
    let catalog = KeyCatalog::load(&cfg.artifacts.catalog_path)?;
    let plan = SchemaPlan::from_catalog(&catalog);

    let pool = cfg.target.connect().await?;
    schema::apply_schema(&pool, &plan, &cfg.target.qualified_table(), drop_first).await?;

    Ok(plan)
}

/// Phase 3: transform the window chunk by chunk.
pub async fn transform_phase(cfg: &Config, opts: TransformOptions) -> Result<RunStats> {
    let window = cfg.time_window()?;
    let plan = ChunkPlan::new(window, cfg.chunking.chunk_width)?;

    if opts.start_from_chunk >= plan.chunk_count() {
        bail!(
            "start_from_chunk {} is out of range ({} chunks in this run)",
            opts.start_from_chunk,
            plan.chunk_count(),
        );
    }
    if opts.truncate_target && opts.start_from_chunk > 0 {
        bail!(
            "truncate_target restarts the run from chunk 0; combining it with \
             start_from_chunk {} would lose the skipped chunks' output",
            opts.start_from_chunk,
        );
    }

    let catalog = KeyCatalog::load(&cfg.artifacts.catalog_path)
        .context("loading key catalog; run the discover phase first")?;
    catalog.ensure_covers(&window)?;

    let source_pool = cfg.source.connect().await?;
    let target_pool = cfg.target.connect().await?;
    let source = ClickHouseSource::new(source_pool, cfg.source.qualified_table());
    let target = ClickHouseTarget::new(target_pool, cfg.target.qualified_table());

    let mut progress = if opts.truncate_target {
        use crate::store::TargetWriter;
        target.truncate().await?;
        ChunkProgress::create(&cfg.artifacts.progress_path, &plan)?
    } else {
        ChunkProgress::load_or_create(&cfg.artifacts.progress_path, &plan)?
    };

    let runner = ChunkRunner::new(
        &source,
        &target,
        &catalog,
        &cfg.customers,
        cfg.chunking.engine_policy(),
    );

    runner
        .run_from(&plan, &mut progress, opts.start_from_chunk)
        .await
}

/// Phase 4: compare sampled metric sums across both schemas.
pub async fn validate_phase(cfg: &Config) -> Result<ValidationReport> {
    if cfg.validation.probes.is_empty() {
        bail!("no validation probes configured");
    }

    let window = cfg.time_window()?;
    let catalog = KeyCatalog::load(&cfg.artifacts.catalog_path)?;

    let source_pool = cfg.source.connect().await?;
    let target_pool = cfg.target.connect().await?;
    let source = ClickHouseSource::new(source_pool, cfg.source.qualified_table());
    let target = ClickHouseTarget::new(target_pool, cfg.target.qualified_table());

    validate::run_probes(
        &source,
        &target,
        &catalog,
        window,
        &cfg.validation.probes,
        cfg.validation.float_tolerance,
    )
    .await
}

/// Full pipeline: discovery, schema, transform, then validation when
/// probes are configured.
pub async fn run_all(cfg: &Config, opts: TransformOptions, drop_first: bool) -> Result<()> {
    let stats = discover_phase(cfg).await?;
    tracing::info!(
        int_keys = stats.int_keys,
        float_keys = stats.float_keys,
        rows_skipped = stats.rows_skipped,
        "discovery phase done",
    );

    schema_phase(cfg, drop_first).await?;

    let run = transform_phase(cfg, opts).await?;
    tracing::info!(
        chunks = run.chunks_processed,
        source_rows = run.source_rows,
        output_rows = run.output_rows,
        "transform phase done",
    );

    if !cfg.validation.probes.is_empty() {
        let report = validate_phase(cfg).await?;
        if !report.all_passed() {
            bail!(
                "validation failed: {}/{} probes mismatched",
                report.failed,
                report.failed + report.passed,
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        serde_yaml::from_str(
            r#"
source: {endpoint: "localhost:9000", database: "default", table: "src"}
target: {endpoint: "localhost:9000", database: "default", table: "dst"}
window: {start: "2025-10-08 00:00:00", end: "2025-10-09 00:00:00"}
customers: [1]
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_truncate_cannot_skip_leading_chunks() {
        let opts = TransformOptions {
            truncate_target: true,
            start_from_chunk: 3,
        };
        let err = transform_phase(&test_config(), opts).await.unwrap_err();
        assert!(err.to_string().contains("chunk 0"));
    }

    #[tokio::test]
    async fn test_out_of_range_resume_is_rejected() {
        let opts = TransformOptions {
            truncate_target: false,
            start_from_chunk: 1_000_000,
        };
        let err = transform_phase(&test_config(), opts).await.unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}
