use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use mapflat::config::Config;
use mapflat::pipeline::{self, TransformOptions};

/// Map-column to flattened-schema metric migration pipeline.
#[derive(Parser)]
#[command(name = "mapflat", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the window and persist the key catalog.
    Discover,

    /// Create the flattened target table from the key catalog.
    CreateSchema {
        /// Drop an existing target table first.
        #[arg(long)]
        drop_first: bool,
    },

    /// Transform the window chunk by chunk.
    Transform {
        /// Truncate the target table and restart from chunk 0.
        #[arg(long)]
        truncate_target: bool,

        /// Chunk index to resume from.
        #[arg(long, default_value_t = 0)]
        start_from_chunk: usize,
    },

    /// Re-aggregate the configured probes through both schemas and
    /// compare the sums.
    Validate,

    /// Run all phases in order: discover, create-schema, transform,
    /// validate.
    Run {
        /// Drop an existing target table before creating the schema.
        #[arg(long)]
        drop_first: bool,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Command::Version = &cli.command {
        println!("mapflat {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for every pipeline command.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting mapflat",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cli.command, cfg).await })
}

async fn run(command: Command, cfg: Config) -> Result<()> {
    match command {
        Command::Discover => {
            let stats = pipeline::discover_phase(&cfg).await?;
            tracing::info!(
                rows_scanned = stats.rows_scanned,
                rows_skipped = stats.rows_skipped,
                int_keys = stats.int_keys,
                float_keys = stats.float_keys,
                "discovery done",
            );
        }
        Command::CreateSchema { drop_first } => {
            let plan = pipeline::schema_phase(&cfg, drop_first).await?;
            tracing::info!(
                int_columns = plan.int_columns(),
                float_columns = plan.float_columns(),
                "target schema created",
            );
        }
        Command::Transform {
            truncate_target,
            start_from_chunk,
        } => {
            let opts = TransformOptions {
                truncate_target,
                start_from_chunk,
            };
            pipeline::transform_phase(&cfg, opts).await?;
        }
        Command::Validate => {
            let report = pipeline::validate_phase(&cfg).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_passed() {
                anyhow::bail!(
                    "validation failed: {}/{} probes mismatched",
                    report.failed,
                    report.failed + report.passed,
                );
            }
        }
        Command::Run { drop_first } => {
            pipeline::run_all(&cfg, TransformOptions::default(), drop_first).await?;
        }
        Command::Version => unreachable!("handled before runtime startup"),
    }

    Ok(())
}
