//! CLI for the tally aggregation engine.
//!
//! Provides commands for validating configuration, replaying events through
//! a pipeline, and inspecting durable stores.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tally::checkpoint::CHECKPOINT_FILE;
use tally::config::PIPELINE_CONFIG_FILE;
use tally::durable::StoreMetadata;
use tally::export::PromExporter;
use tally::window::now_ns;
use tally::{Event, MonitorRecord, Pipeline, PipelineConfig, Registry, TallyError};
use tracing_subscriber::EnvFilter;

/// tally: namespace-scoped windowed event aggregation CLI.
#[derive(Parser)]
#[command(name = "tally", version, about)]
struct Cli {
    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Validate a config directory and list its namespaces.
    Check {
        /// Path to the config directory.
        config_dir: PathBuf,
    },

    /// Replay JSON-lines events and print a monitor record per namespace.
    Run {
        /// Path to the config directory.
        config_dir: PathBuf,

        /// Events file, one JSON object per line ("-" for stdin).
        #[arg(long, default_value = "-")]
        events: String,

        /// Data directory for durable stores and snapshots.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Monitor query time in seconds since the epoch (default: latest event time).
        #[arg(long)]
        at: Option<f64>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Display durable store metadata and slab usage.
    Info {
        /// Path to the data directory.
        data_dir: PathBuf,
    },
}

/// Output format for monitor records.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON object with records and pipeline counters.
    Json,
    /// Prometheus text exposition of records and pipeline counters.
    Prom,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let result = match cli.command {
        Commands::Check { config_dir } => cmd_check(&config_dir),
        Commands::Run {
            config_dir,
            events,
            data_dir,
            at,
            format,
        } => cmd_run(&config_dir, &events, data_dir, at, &format),
        Commands::Info { data_dir } => cmd_info(&data_dir),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Implements `tally check <config_dir>`.
fn cmd_check(config_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline_config = PipelineConfig::load(config_dir.join(PIPELINE_CONFIG_FILE))?;
    let registry = Registry::load(config_dir)?;

    println!("Config: {}", config_dir.display());
    match &pipeline_config.data_dir {
        Some(dir) => println!("Data directory: {}", dir.display()),
        None => println!("Data directory: none (memory stores only)"),
    }
    println!();

    println!("Group rules: {}", registry.rules().rules.len());
    for (i, rule) in registry.rules().rules.iter().enumerate() {
        println!("  Rule {i}: group=\"{}\"", rule.group);
    }
    println!();

    println!("Namespaces: {}", registry.namespaces().len());
    for ns in registry.namespaces() {
        println!("  \"{}\" (group \"{}\")", ns.name, ns.group);
        println!(
            "    Granularity: {}, cardinality: {}, monitor window: {}",
            format_granularity(ns.granularity_ns()),
            ns.cardinality,
            ns.monitor_window()
        );
        println!(
            "    Store: {}, snapshot: {}, current: {}",
            ns.store_type.as_str(),
            ns.snapshot,
            ns.current
        );
        println!("    Fields: {}", ns.metric_fields().join(", "));
    }

    if registry.rejected().is_empty() {
        return Ok(());
    }

    println!();
    println!("Rejected: {}", registry.rejected().len());
    for rejected in registry.rejected() {
        println!("  - {}: {}", rejected.origin, rejected.error);
    }
    Err(format!("{} namespace configuration(s) rejected", registry.rejected().len()).into())
}

/// Implements `tally run <config_dir>`.
fn cmd_run(
    config_dir: &Path,
    events: &str,
    data_dir: Option<PathBuf>,
    at: Option<f64>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = PipelineConfig::load(config_dir.join(PIPELINE_CONFIG_FILE))?;
    if let Some(dir) = data_dir {
        config = config.with_data_dir(dir);
    }
    let registry = Registry::load(config_dir)?;
    for rejected in registry.rejected() {
        eprintln!("Rejected {}: {}", rejected.origin, rejected.error);
    }

    let reader: Box<dyn BufRead> = if events == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(events)?))
    };

    let query_time = at.map(seconds_to_ns).transpose()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let pipeline = Pipeline::start(registry, config).await?;
        let replay = match replay_events(&pipeline, reader).await {
            Ok(replay) => replay,
            Err(e) => {
                pipeline.shutdown().await?;
                return Err(e);
            }
        };
        pipeline.flush().await?;

        let query_time = query_time.or(replay.latest).unwrap_or_else(now_ns);
        let mut records = Vec::with_capacity(pipeline.namespaces().len());
        for ns in pipeline.namespaces() {
            records.push(pipeline.monitor(&ns.name, query_time).await?);
        }
        let stats = pipeline.stats();
        let mut exporter = PromExporter::new();
        if matches!(format, OutputFormat::Prom) {
            for (ns, record) in pipeline.namespaces().iter().zip(&records) {
                exporter.add_record(ns, record);
            }
            exporter.add_stats(&stats, records.len());
        }
        pipeline.shutdown().await?;

        match format {
            OutputFormat::Csv => print_csv(&records),
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "query_time": query_time,
                    "records": records,
                    "stats": stats,
                    "malformed": replay.malformed,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Prom => print!("{}", exporter.render()),
        }

        eprintln!(
            "Replayed {} events: {} accepted, {} unclassified, {} filtered, {} malformed",
            stats.processed,
            stats.accepted,
            stats.classification_errors,
            stats.filtered_total(),
            replay.malformed
        );
        Ok(())
    })
}

/// Outcome of replaying an events stream.
struct Replay {
    latest: Option<u64>,
    malformed: u64,
}

async fn replay_events(pipeline: &Pipeline, reader: Box<dyn BufRead>) -> Result<Replay, Box<dyn std::error::Error>> {
    let mut replay = Replay {
        latest: None,
        malformed: 0,
    };

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let event = match Event::from_json(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(line = index + 1, error = %e, "skipping malformed event");
                replay.malformed += 1;
                continue;
            }
        };
        replay.latest = replay.latest.max(Some(event.start_time));

        match pipeline.ingest(&event).await {
            Ok(_) | Err(TallyError::Classification(_) | TallyError::Filter(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(replay)
}

fn print_csv(records: &[MonitorRecord]) {
    println!("namespace,query_time_ns,windows,stale,metric,value");
    for record in records {
        for (metric, value) in &record.metrics {
            println!(
                "{},{},{},{},{metric},{value}",
                record.namespace, record.query_time, record.windows, record.stale
            );
        }
    }
}

/// Implements `tally info <data_dir>`.
fn cmd_info(data_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let metadata = StoreMetadata::read(data_dir)?
        .ok_or_else(|| format!("No store found at '{}'", data_dir.display()))?;

    println!("Store: {}", data_dir.display());
    println!("Metadata version: {}", metadata.version);
    println!();

    println!("Namespaces: {}", metadata.namespaces.len());
    println!();
    for layout in &metadata.namespaces {
        println!("  Namespace \"{}\"", layout.name);
        println!("    Granularity: {}", format_granularity(layout.granularity_ns));
        println!("    Cardinality: {}", layout.cardinality);
        println!("    Fields: {}", layout.fields.join(", "));
        println!("    Hash: {:016x}", layout.hash);

        let slab_path = data_dir.join(&layout.file);
        if let Ok(meta) = std::fs::metadata(&slab_path) {
            println!("    Slab: {} ({})", slab_path.display(), format_bytes(meta.len()));
        } else {
            println!("    Slab: {} (missing)", slab_path.display());
        }
        println!();
    }

    if data_dir.join(CHECKPOINT_FILE).exists() {
        println!("Snapshots: present");
    }

    let total_size = dir_size(data_dir)?;
    println!("Total disk usage: {} ({total_size} bytes)", format_bytes(total_size));
    Ok(())
}

/// Converts fractional seconds since the epoch to nanoseconds.
fn seconds_to_ns(seconds: f64) -> Result<u64, Box<dyn std::error::Error>> {
    let duration = Duration::try_from_secs_f64(seconds)?;
    Ok(u64::try_from(duration.as_nanos())?)
}

/// Formats a granularity in nanoseconds as a human-readable duration.
fn format_granularity(ns: u64) -> String {
    const NS_PER_SEC: u64 = 1_000_000_000;
    if ns.is_multiple_of(NS_PER_SEC) {
        let secs = ns / NS_PER_SEC;
        if secs >= 86400 && secs.is_multiple_of(86400) {
            format!("{}d", secs / 86400)
        } else if secs >= 3600 && secs.is_multiple_of(3600) {
            format!("{}h", secs / 3600)
        } else if secs >= 60 && secs.is_multiple_of(60) {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    } else {
        format!("{}ms", ns / 1_000_000)
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

/// Recursively calculates directory size.
fn dir_size(path: &Path) -> Result<u64, Box<dyn std::error::Error>> {
    let mut total = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path)?;
            } else {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_granularity() {
        assert_eq!(format_granularity(60_000_000_000), "1m");
        assert_eq!(format_granularity(90_000_000_000), "90s");
        assert_eq!(format_granularity(500_000_000), "500ms");
        assert_eq!(format_granularity(86_400_000_000_000), "1d");
    }

    #[test]
    fn test_seconds_to_ns() {
        assert_eq!(seconds_to_ns(1.5).unwrap(), 1_500_000_000);
        assert!(seconds_to_ns(-1.0).is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
    }
}
