//! CLI entry point for the zone pulse tool.
//!
//! Provides subcommands for analyzing the municipal datasets of a city,
//! listing the active rule table, and validating a configuration file.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::Path;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use zone_pulse::{
    config::PipelineConfig,
    output::{append_stress_rows, print_json, print_pretty, write_report},
    parser::{RawTables, load_optional},
    pipeline::{Pipeline, SnapshotFilter},
};

#[derive(Parser)]
#[command(name = "zone_pulse")]
#[command(about = "Zone stress, event and recommendation analysis for municipal datasets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline over a directory of CSV datasets
    Analyze {
        /// Directory holding the four dataset CSVs
        #[arg(short, long, default_value = "data")]
        data_dir: String,

        /// Override the traffic CSV path
        #[arg(long)]
        traffic: Option<String>,

        /// Override the energy CSV path
        #[arg(long)]
        energy: Option<String>,

        /// Override the waste CSV path
        #[arg(long)]
        waste: Option<String>,

        /// Override the grievances CSV path
        #[arg(long)]
        grievances: Option<String>,

        /// JSON pipeline configuration (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<String>,

        /// First date to include (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last date to include (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Only analyze this zone (repeatable)
        #[arg(short, long = "zone")]
        zones: Vec<String>,

        /// Override the simulation seed
        #[arg(long)]
        seed: Option<u64>,

        /// Write the full JSON report to this path
        #[arg(short, long)]
        output: Option<String>,

        /// Gzip compress the report
        #[arg(long, default_value_t = false)]
        gzip: bool,

        /// CSV file to append stress rows to
        #[arg(long)]
        stress_csv: Option<String>,
    },
    /// Log the active rule table
    Rules {
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Validate a configuration file
    CheckConfig {
        #[arg(value_name = "FILE")]
        config: String,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/zone_pulse.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("zone_pulse.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            data_dir,
            traffic,
            energy,
            waste,
            grievances,
            config,
            from,
            to,
            zones,
            seed,
            output,
            gzip,
            stress_csv,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(seed) = seed {
                config.decision.seed = seed;
            }
            let pipeline = Pipeline::new(config)?;

            let mut tables = RawTables::load_dir(Path::new(&data_dir))?;
            for (slot, path) in [
                (&mut tables.traffic, traffic),
                (&mut tables.energy, energy),
                (&mut tables.waste, waste),
                (&mut tables.grievance, grievances),
            ] {
                if let Some(path) = path {
                    *slot = load_optional(Path::new(&path))?;
                }
            }

            let filter = SnapshotFilter {
                from,
                to,
                zones: zones.into_iter().collect(),
            };
            let report = pipeline.run(&tables, &filter);

            for (i, r) in report.recommendations.iter().take(5).enumerate() {
                info!(
                    rank = i + 1,
                    zone = %r.zone_id,
                    title = %r.title,
                    priority = r.priority_rank,
                    roi = r.estimated_roi,
                    events = r.supporting_events.len(),
                    "Recommendation"
                );
            }
            print_pretty(&report.recommendations);

            match output {
                Some(path) => write_report(&path, &report, gzip)?,
                None => print_json(&report.city_stats)?,
            }

            if let Some(path) = stress_csv {
                append_stress_rows(&path, &report.stress_scores)?;
            }
        }
        Commands::Rules { config } => {
            let config = load_config(config.as_deref())?;
            config.validate()?;

            for rule in &config.rules {
                info!(
                    rule_id = %rule.rule_id,
                    domain = rule.domain.map(|d| d.as_str()).unwrap_or("cross-domain"),
                    severity = %rule.severity,
                    condition = ?rule.condition,
                    "Rule"
                );
            }
            info!(total = config.rules.len(), "Rule table");
        }
        Commands::CheckConfig { config: path } => {
            let config = PipelineConfig::load(&path)
                .with_context(|| format!("failed to load config '{path}'"))?;
            config.validate()?;

            info!(
                path = %path,
                rules = config.rules.len(),
                policies = config.decision.policies.len(),
                correlation_pairs = config.correlation.pairs.len(),
                seed = config.decision.seed,
                "Configuration is valid"
            );
        }
    }

    Ok(())
}

/// Loads the configuration at `path`, or the defaults when none is given.
fn load_config(path: Option<&str>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load config '{path}'")),
        None => Ok(PipelineConfig::default()),
    }
}
