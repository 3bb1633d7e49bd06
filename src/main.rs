//! harvest CLI - Resumable record acquisition and consolidation.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use harvest::cache::RecordCache;
use harvest::checkpoint::{clear_all_progress, list_saved_progress, CheckpointBackend, ProgressInfo};
use harvest::merge::{CombineStats, ConflictRules, SourceIndex};
use harvest::models::{normalize_key, DedupConfig, StrategyKind};
use harvest::{
    Acquisition, AsyncRateGate, BoundedFetcher, CheckpointStore, Combiner, CompletenessMerger,
    Config, Consolidator, DedupStrategy, Deduplicator, DirectoryBackend, DiskCache, FieldPriority,
    HttpSource, KeyFields, RateLimit, Record, RetryPolicy,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "harvest")]
#[command(version)]
#[command(about = "Resumable bulk acquisition and key-indexed consolidation of records")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one record per key over HTTP, resuming saved progress
    Fetch {
        /// Keys file: a JSON array or one key per line
        #[arg(short, long)]
        keys: PathBuf,

        /// Operation name used for saved progress
        #[arg(long)]
        operation: String,

        /// Path to output JSON file
        #[arg(short, long)]
        output: PathBuf,

        /// URL template with a {key} placeholder (overrides [http])
        #[arg(long)]
        url_template: Option<String>,

        /// Discard saved progress and start over
        #[arg(long)]
        fresh: bool,
    },

    /// Combine sources into one record per key
    Combine {
        /// Source as NAME=FILE, in argument order
        #[arg(short, long = "source", required = true)]
        sources: Vec<String>,

        /// Path to output JSON file
        #[arg(short, long)]
        output: PathBuf,

        /// Resolve names, addresses and dates with the business entity rules
        #[arg(long)]
        smart: bool,
    },

    /// Remove duplicate records
    Dedupe {
        /// Path to input JSON file
        #[arg(short, long)]
        input: PathBuf,

        /// Path to output JSON file
        #[arg(short, long)]
        output: PathBuf,

        /// identity, exact or fuzzy (overrides [dedup])
        #[arg(long)]
        strategy: Option<StrategyKind>,

        /// Fold duplicates into the most complete record
        #[arg(long)]
        merge: bool,
    },

    /// Dedup each source, combine, then dedup the merged set
    Consolidate {
        /// Source as NAME=FILE, in argument order
        #[arg(short, long = "source", required = true)]
        sources: Vec<String>,

        /// Path to output JSON file
        #[arg(short, long)]
        output: PathBuf,

        /// Resolve names, addresses and dates with the business entity rules
        #[arg(long)]
        smart: bool,
    },

    /// Inspect or clear saved progress
    Progress {
        #[command(subcommand)]
        action: ProgressAction,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

#[derive(Subcommand)]
enum ProgressAction {
    /// List every saved operation
    List,
    /// Show one saved operation
    Show { name: String },
    /// Delete one saved operation
    Clear { name: String },
    /// Delete every saved operation
    ClearAll,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_config() {
    let example = r#"# harvest configuration file

[rate_limit]
max_calls = 100        # calls allowed per window
window_secs = 3600
min_spacing_ms = 100   # minimum gap between consecutive calls

[retry]
max_retries = 3
base_delay_ms = 1000
max_delay_ms = 60000

[batch]
concurrency = 5
chunk_size = 100
chunk_pause_ms = 500

[checkpoint]
dir = ".cache/progress"
every = 100
clear_on_complete = true

[cache]
enabled = false
dir = ".cache/records"

[http]
url_template = "https://api.example.com/records/{key}"
timeout_secs = 30
# headers = { Authorization = "Bearer ${API_TOKEN}" }

[merge]
key_fields = ["taxpayer_id", "taxpayer_number", "id"]
field_priority = ["comptroller", "sos"]
prefix_fields = true
output_key = "key"

[dedup]
strategy = "identity"   # identity | exact | fuzzy
fuzzy_fields = ["key", "name"]
merge = false
"#;
    println!("{example}");
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, saving progress");
        },
        _ = terminate => {
            info!("Received terminate signal, saving progress");
        },
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        info!(path = ?path, "No config file, using defaults");
        return Ok(Config::default());
    }
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn read_records(path: &Path) -> Result<Vec<Record>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}"))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Expected a JSON array of objects in {path:?}"))
}

fn write_records(path: &Path, records: &[Record]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {parent:?}"))?;
    }
    let json = serde_json::to_string_pretty(records).context("Failed to serialize records")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {path:?}"))
}

/// Keys from a JSON array, or one per line otherwise.
fn read_keys(path: &Path) -> Result<Vec<String>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}"))?;
    if let Ok(values) = serde_json::from_str::<Vec<Value>>(&content) {
        return Ok(values.iter().filter_map(normalize_key).collect());
    }
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Parse `NAME=FILE` arguments and load each file.
fn read_sources(args: &[String]) -> Result<Vec<(String, Vec<Record>)>> {
    args.iter()
        .map(|arg| {
            let Some((name, file)) = arg.split_once('=') else {
                bail!("Source '{arg}' must be NAME=FILE");
            };
            let records = read_records(Path::new(file))?;
            info!(source = name, records = records.len(), "Loaded source");
            Ok((name.to_string(), records))
        })
        .collect()
}

fn print_progress(info: &ProgressInfo) {
    println!(
        "{:<30} {:<13} {:>6}/{:<6} {:>5.1}%  failed: {}  started: {}",
        info.operation,
        info.status.to_string(),
        info.completed,
        info.total,
        info.completion_percent,
        info.failed,
        info.started_at.format("%Y-%m-%d %H:%M:%S"),
    );
}

fn print_combine_stats(stats: &CombineStats) {
    println!("Records:     {}", stats.total_records);
    for (source, count) in &stats.with_source {
        let only = stats.only_source.get(source).copied().unwrap_or(0);
        let coverage = stats.coverage.get(source).copied().unwrap_or(0.0);
        println!("  {source:<10} {count} ({coverage:.1}%), only here: {only}");
    }
    println!(
        "All sources: {} ({:.1}%)",
        stats.with_all_sources, stats.coverage_all
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            info!("Configuration is valid");
            info!(
                "  Rate limit: {} calls per {}s",
                config.rate_limit.max_calls, config.rate_limit.window_secs
            );
            info!(
                "  Batches: {} concurrent, {} keys per chunk",
                config.batch.concurrency, config.batch.chunk_size
            );
            info!("  Checkpoints: {}", config.checkpoint.dir.display());
            info!("  Key fields: {:?}", config.merge.key_fields);
            return Ok(());
        }

        Commands::Fetch {
            keys,
            operation,
            output,
            url_template,
            fresh,
        } => {
            let config = load_config(&cli.config)?;
            let keys = read_keys(&keys)?;
            let source = Arc::new(
                HttpSource::from_config(&config.http, url_template.as_deref())
                    .context("Failed to build HTTP source")?,
            );

            let gate = Arc::new(AsyncRateGate::new(RateLimit::from(&config.rate_limit)));
            let mut fetcher =
                BoundedFetcher::new(gate, RetryPolicy::from(&config.retry), config.batch.clone());
            if config.cache.enabled {
                let cache: Arc<dyn RecordCache> = Arc::new(
                    DiskCache::new(&config.cache.dir).context("Failed to open record cache")?,
                );
                fetcher = fetcher.with_cache(cache);
            }

            let backend: Arc<dyn CheckpointBackend> = Arc::new(
                DirectoryBackend::new(&config.checkpoint.dir)
                    .context("Failed to open checkpoint directory")?,
            );
            let store = CheckpointStore::new(&operation, backend)
                .with_checkpoint_every(config.checkpoint.every);

            let mut metadata = serde_json::Map::new();
            metadata.insert("url_template".into(), Value::String(source.url_template().to_string()));

            let mut acquisition = Acquisition::new(fetcher, store)
                .with_metadata(metadata)
                .with_clear_on_complete(config.checkpoint.clear_on_complete)
                .with_progress(true);

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                trigger.cancel();
            });

            let fetch = move |key: String| {
                let source = Arc::clone(&source);
                async move { source.fetch(&key).await }
            };
            let report = acquisition
                .run(keys, fetch, cancel, fresh)
                .await
                .context("Acquisition failed")?;

            let records: Vec<Record> = report.records.iter().map(|p| p.record.clone()).collect();
            write_records(&output, &records)?;

            println!("\n=== Fetch {} ===", if report.cancelled { "Interrupted" } else { "Complete" });
            println!("Operation:   {}", report.operation);
            println!("Keys:        {}", report.total);
            println!("Resumed:     {} (previously done: {})", report.resumed, report.previously_completed);
            println!("Succeeded:   {}", report.succeeded.len());
            println!("Failed:      {}", report.failed.len());
            println!("Retried:     {}", report.retried);
            println!("Cached:      {}", report.cached);
            println!("Remaining:   {}", report.remaining);
            println!("Runtime:     {:.1}s", report.elapsed.as_secs_f64());
            println!("Output:      {output:?} ({} records)", records.len());
            for failure in report.failed.iter().take(10) {
                println!("  {} → {}", failure.key, failure.error);
            }
            if report.cancelled {
                println!("Run the same command again to resume.");
            }
        }

        Commands::Combine {
            sources,
            output,
            smart,
        } => {
            let config = load_config(&cli.config)?;
            let key_fields = KeyFields::new(config.merge.key_fields.iter().cloned());
            let indexes: Vec<SourceIndex> = read_sources(&sources)?
                .into_iter()
                .map(|(name, records)| {
                    SourceIndex::build(records, &name, &key_fields, config.merge.prefix_fields)
                })
                .collect();

            let mut combiner =
                Combiner::new(FieldPriority::new(config.merge.field_priority.iter().cloned()));
            if smart {
                combiner = combiner.with_rules(ConflictRules::business_entity(Vec::new()));
            }
            let merged = combiner.combine(&indexes);
            let stats = CombineStats::from_merged(&merged);
            let records: Vec<Record> = merged
                .iter()
                .map(|m| m.to_record(&config.merge.output_key))
                .collect();
            write_records(&output, &records)?;

            println!("\n=== Combine Complete ===");
            print_combine_stats(&stats);
            println!("Output:      {output:?}");
        }

        Commands::Dedupe {
            input,
            output,
            strategy,
            merge,
        } => {
            let config = load_config(&cli.config)?;
            let dedup = DedupConfig {
                strategy: strategy.unwrap_or(config.dedup.strategy),
                merge: merge || config.dedup.merge,
                ..config.dedup.clone()
            };
            let key_fields = KeyFields::new(config.merge.key_fields.iter().cloned());
            let strategy = DedupStrategy::from_config(&dedup, &key_fields);
            let records = read_records(&input)?;

            let (records, stats) = if dedup.merge {
                let outcome = CompletenessMerger::new(strategy).merge(records);
                let records: Vec<Record> =
                    outcome.records.into_iter().map(|c| c.into_record()).collect();
                (records, outcome.stats)
            } else {
                let outcome = Deduplicator::new(strategy).deduplicate(records);
                (outcome.unique, outcome.stats)
            };
            write_records(&output, &records)?;

            println!("\n=== Dedupe Complete ===");
            println!("Original:    {}", stats.original);
            println!("Unique:      {}", stats.unique);
            println!("Duplicates:  {} ({:.1}%)", stats.duplicates, stats.dedup_rate);
            println!("Output:      {output:?}");
        }

        Commands::Consolidate {
            sources,
            output,
            smart,
        } => {
            let config = load_config(&cli.config)?;
            let sources = read_sources(&sources)?;
            let report = Consolidator::from_config(&config, smart)
                .run(sources)
                .context("Consolidation failed")?;
            write_records(&output, &report.records)?;

            println!("\n=== Consolidate Complete ===");
            for source in &report.sources {
                println!(
                    "  {:<10} input: {}, duplicates: {}, unkeyed: {}, indexed: {}",
                    source.source, source.input, source.duplicates, source.skipped, source.indexed
                );
            }
            print_combine_stats(&report.combine);
            println!("Residual duplicates: {}", report.residual.duplicates);
            println!("Output:      {output:?} ({} records)", report.records.len());
        }

        Commands::Progress { action } => {
            let config = load_config(&cli.config)?;
            let backend: Arc<dyn CheckpointBackend> = Arc::new(
                DirectoryBackend::new(&config.checkpoint.dir)
                    .context("Failed to open checkpoint directory")?,
            );

            match action {
                ProgressAction::List => {
                    let saved = list_saved_progress(&backend)?;
                    if saved.is_empty() {
                        println!("No saved progress");
                    }
                    for info in &saved {
                        print_progress(info);
                    }
                }
                ProgressAction::Show { name } => {
                    let store = CheckpointStore::new(&name, backend);
                    match store.progress_info()? {
                        Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                        None => bail!("No saved progress for operation '{name}'"),
                    }
                }
                ProgressAction::Clear { name } => {
                    let mut store = CheckpointStore::new(&name, backend);
                    store.clear()?;
                    println!("Cleared '{name}'");
                }
                ProgressAction::ClearAll => {
                    let cleared = clear_all_progress(&backend)?;
                    println!("Cleared {cleared} operations");
                }
            }
        }
    }

    Ok(())
}
