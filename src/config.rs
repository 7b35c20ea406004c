//! YAML configuration for a migration run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::engine::EnginePolicy;
use crate::model::{TimeWindow, MINUTE_MS};
use crate::store::StoreConfig;
use crate::validate::Probe;

/// Top-level configuration for the mapflat pipeline.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Source store (map-column schema).
    pub source: StoreConfig,

    /// Target store (flattened schema).
    pub target: StoreConfig,

    /// Transformation window boundaries, `YYYY-MM-DD HH:MM:SS` in UTC.
    /// Discovery must cover this entire window.
    pub window: WindowConfig,

    /// Customer IDs to migrate.
    #[serde(default)]
    pub customers: Vec<i32>,

    /// Chunking and blocking-operation policy.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Durable artifact locations.
    #[serde(default)]
    pub artifacts: ArtifactsConfig,

    /// Validation probe set.
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Transformation window boundaries.
#[derive(Debug, Deserialize)]
pub struct WindowConfig {
    pub start: String,
    pub end: String,
}

/// Chunking and blocking-operation policy.
#[derive(Debug, Deserialize)]
pub struct ChunkingConfig {
    /// Chunk width; must evenly divide the transformation window.
    /// Default: 10m.
    #[serde(default = "default_chunk_width", with = "humantime_serde")]
    pub chunk_width: Duration,

    /// Timeout for one chunk's source read. Default: 5m.
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Timeout for one chunk's batch write. Default: 5m.
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Source read attempts per chunk before the chunk fails. Default: 3.
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,

    /// Base backoff between read attempts. Default: 5s.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_width: default_chunk_width(),
            read_timeout: default_io_timeout(),
            write_timeout: default_io_timeout(),
            read_attempts: default_read_attempts(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

impl ChunkingConfig {
    /// Engine view of the blocking-operation policy.
    pub fn engine_policy(&self) -> EnginePolicy {
        EnginePolicy {
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            read_attempts: self.read_attempts,
            retry_backoff: self.retry_backoff,
        }
    }
}

/// Durable artifact locations.
#[derive(Debug, Deserialize)]
pub struct ArtifactsConfig {
    /// Key catalog artifact path. Default: output/key_catalog.json.
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    /// Chunk progress artifact path. Default: output/chunk_progress.json.
    #[serde(default = "default_progress_path")]
    pub progress_path: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            catalog_path: default_catalog_path(),
            progress_path: default_progress_path(),
        }
    }
}

/// Validation probe set.
#[derive(Debug, Deserialize)]
pub struct ValidationConfig {
    /// (customer, metric key) pairs to re-aggregate through both schemas.
    #[serde(default)]
    pub probes: Vec<Probe>,

    /// Relative tolerance for float sum comparison. Default: 1e-6.
    #[serde(default = "default_float_tolerance")]
    pub float_tolerance: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            probes: Vec::new(),
            float_tolerance: default_float_tolerance(),
        }
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_chunk_width() -> Duration {
    Duration::from_secs(600)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_read_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("output/key_catalog.json")
}

fn default_progress_path() -> PathBuf {
    PathBuf::from("output/chunk_progress.json")
}

fn default_float_tolerance() -> f64 {
    1e-6
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.source.endpoint.is_empty() {
            bail!("source.endpoint is required");
        }
        if self.source.table.is_empty() {
            bail!("source.table is required");
        }
        if self.target.endpoint.is_empty() {
            bail!("target.endpoint is required");
        }
        if self.target.table.is_empty() {
            bail!("target.table is required");
        }
        if self.customers.is_empty() {
            bail!("at least one customer ID is required");
        }

        let window = self.time_window()?;
        let width_ms = i64::try_from(self.chunking.chunk_width.as_millis()).unwrap_or(0);
        if width_ms <= 0 {
            bail!("chunking.chunk_width must be positive");
        }
        if width_ms % MINUTE_MS != 0 {
            bail!("chunking.chunk_width must be a whole number of minutes");
        }
        if window.start_ms.rem_euclid(MINUTE_MS) != 0 {
            bail!("window.start must be aligned to a minute boundary");
        }
        if window.duration_ms() % width_ms != 0 {
            bail!(
                "chunking.chunk_width ({width_ms}ms) must evenly divide the {}ms window",
                window.duration_ms(),
            );
        }

        if self.chunking.read_timeout.is_zero() || self.chunking.write_timeout.is_zero() {
            bail!("chunking timeouts must be positive");
        }
        if !(self.validation.float_tolerance > 0.0) {
            bail!("validation.float_tolerance must be positive");
        }

        Ok(())
    }

    /// Parses the configured window boundaries into a time window.
    pub fn time_window(&self) -> Result<TimeWindow> {
        let start = parse_timestamp(&self.window.start)
            .with_context(|| format!("parsing window.start {:?}", self.window.start))?;
        let end = parse_timestamp(&self.window.end)
            .with_context(|| format!("parsing window.end {:?}", self.window.end))?;
        TimeWindow::new(start, end)
    }
}

/// Parses `YYYY-MM-DD HH:MM:SS` (UTC) into epoch milliseconds.
fn parse_timestamp(value: &str) -> Result<i64> {
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .context("expected format YYYY-MM-DD HH:MM:SS")?;
    Ok(naive.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
source:
  endpoint: "localhost:9000"
  database: "default"
  table: "flow_metrics"
target:
  endpoint: "localhost:9000"
  database: "default"
  table: "flow_metrics_flat"
window:
  start: "2025-10-08 00:00:00"
  end: "2025-10-09 00:00:00"
customers: [1960181009]
"#;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let cfg: Config = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.chunking.chunk_width, Duration::from_secs(600));
        assert_eq!(cfg.chunking.read_attempts, 3);
        assert_eq!(cfg.artifacts.catalog_path, default_catalog_path());
        assert!(cfg.validation.probes.is_empty());
    }

    #[test]
    fn test_time_window_parses_to_epoch_ms() {
        let cfg: Config = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        let window = cfg.time_window().unwrap();
        assert_eq!(window.duration_ms(), 86_400_000);
        // 2025-10-08 00:00:00 UTC.
        assert_eq!(window.start_ms, 1_759_881_600_000);
    }

    #[test]
    fn test_rejects_uneven_chunk_width() {
        let yaml = format!("{MINIMAL_YAML}chunking:\n  chunk_width: 7m\n");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("evenly divide"));
    }

    #[test]
    fn test_rejects_sub_minute_chunk_width() {
        // 90s divides the 24h window evenly but splits minute buckets.
        let yaml = format!("{MINIMAL_YAML}chunking:\n  chunk_width: 90s\n");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("whole number of minutes"));
    }

    #[test]
    fn test_rejects_unaligned_window_start() {
        let yaml = MINIMAL_YAML.replace("2025-10-08 00:00:00", "2025-10-08 00:00:30");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("minute boundary"));
    }

    #[test]
    fn test_rejects_missing_customers() {
        let yaml = MINIMAL_YAML.replace("customers: [1960181009]", "customers: []");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_timestamp() {
        let yaml = MINIMAL_YAML.replace("2025-10-08 00:00:00", "08/10/2025");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(cfg.validate().is_err());
    }
}
