//! refund-audit CLI - Verify refund shipping-fee claims against screenshot evidence.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use refund_audit::{Config, Dataset, RowScope, TaskOptions, TaskRunner, TaskSnapshot, VisionClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "refund-audit")]
#[command(version)]
#[command(about = "Resumable, rate-limited evidence verification for refund shipping-fee claims")]
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
    /// Create a task from a dataset and run it in the foreground
    Submit {
        /// Path to the dataset (.json rows or table document, or .jsonl)
        #[arg(short, long)]
        dataset: PathBuf,

        /// Operator name recorded in history
        #[arg(long, default_value = "operator")]
        operator: String,

        /// API key (falls back to config, then the configured env var)
        #[arg(long)]
        api_key: Option<String>,

        /// Model name override
        #[arg(long)]
        model: Option<String>,

        /// Maximum rows to process
        #[arg(long)]
        max_rows: Option<usize>,

        /// Minimum seconds between service calls
        #[arg(long)]
        min_interval: Option<f64>,

        /// Amount column override
        #[arg(long)]
        amount_field: Option<String>,

        /// Evidence column override
        #[arg(long)]
        evidence_field: Option<String>,

        /// Create the task without starting it
        #[arg(long)]
        no_start: bool,
    },

    /// Start a pending task and run it in the foreground
    Start {
        task_id: String,

        #[arg(long)]
        api_key: Option<String>,
    },

    /// Resume a paused or failed task from its checkpoint
    Resume {
        task_id: String,

        #[arg(long)]
        api_key: Option<String>,

        /// New minimum seconds between service calls
        #[arg(long)]
        min_interval: Option<f64>,
    },

    /// Ask a running task to stop at the next row
    Pause { task_id: String },

    /// Show task status (latest task if no id is given)
    Status {
        task_id: Option<String>,

        /// Print the full snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// List working rows page by page
    Rows {
        task_id: String,

        /// all, processed or pending
        #[arg(long, default_value = "all")]
        scope: RowScope,

        #[arg(long, default_value = "1")]
        page: usize,

        #[arg(long, default_value = "20")]
        page_size: usize,
    },

    /// Compare the task's rows against its source snapshot
    Check { task_id: String },

    /// Export processed and unprocessed rows as they stand
    Export { task_id: String },

    /// Show the tail of a task's runtime log
    Logs {
        task_id: String,

        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Show operation history
    History {
        /// Restrict to one task
        #[arg(long)]
        task_id: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// List all tasks, newest first
    List,

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Logging already initialized");
    }
}

fn print_example_config() {
    let example = r#"# refund-audit configuration file

[service]
# API key (can also use DASHSCOPE_API_KEY env var, or "${OTHER_VAR}")
# api_key = "sk-..."
api_key_env = "DASHSCOPE_API_KEY"
base_url = "https://dashscope.aliyuncs.com/compatible-mode/v1"
timeout_secs = 120

[task]
model_name = "qwen3-vl-flash"
max_evidence_items_per_row = 4
min_interval_sec = 0.8
max_retries = 4
backoff_base_sec = 1.0
backoff_cap_sec = 60.0
max_rows = 300
checkpoint_every = 10

[storage]
data_dir = "data"

[columns]
# Candidate column names, tried in order
amount = ["*寄回快递实付金额", "寄回快递实付金额", "amount"]
evidence = ["*商品瑕疵+金额截图", "寄回运费截图", "evidence"]
# Identity key columns; keywords are a case-insensitive fallback
id = ["ID", "旺旺ID", "id"]
id_keywords = ["id", "旺旺"]
order_no = ["订单号", "order_no"]
order_no_keywords = ["订单", "单号", "order"]
logistics_no = ["快递单号", "logistics_no"]
logistics_no_keywords = ["物流", "快递", "运单", "logistics"]
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file_or_default(path)
        .with_context(|| format!("Failed to load config from {path:?}"))
}

fn build_runner(config: Config) -> Result<TaskRunner> {
    let client = Arc::new(VisionClient::new(&config.service).context("Failed to create client")?);
    TaskRunner::new(config, client).context("Failed to open task storage")
}

/// Show progress until the task's worker exits. Ctrl-C pauses the task.
async fn follow(runner: &TaskRunner, task_id: &str) -> Result<TaskSnapshot> {
    let snapshot = runner.status(task_id)?;
    let pb = ProgressBar::new(snapshot.total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")?
            .progress_chars("##-"),
    );
    pb.set_position(snapshot.processed as u64);

    loop {
        tokio::select! {
            _ = runner.wait(task_id) => break,
            _ = tokio::signal::ctrl_c() => {
                pb.set_message("pausing at next row...");
                runner.shutdown().await;
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                let s = runner.status(task_id)?;
                pb.set_position(s.processed as u64);
                pb.set_message(format!("ok {} / bad {}", s.ok_rows, s.bad_rows));
            }
        }
    }

    let snapshot = runner.status(task_id)?;
    pb.set_position(snapshot.processed as u64);
    pb.finish_and_clear();
    Ok(snapshot)
}

fn print_snapshot(s: &TaskSnapshot) {
    println!("\n=== Task {} ===", s.task_id);
    println!("Status:      {}", s.status);
    println!("Source:      {}", s.source_name);
    println!("Progress:    {}/{} ({:.0}%)", s.processed, s.total, s.progress_ratio * 100.0);
    println!("OK rows:     {}", s.ok_rows);
    println!("Bad rows:    {}", s.bad_rows);
    println!("Pending:     {}", s.pending);
    println!("Model:       {}", s.model_name);
    println!("Interval:    {:.2}s", s.rate.min_interval_sec);
    if let Some(error) = &s.error_message {
        println!("Error:       {error}");
    }
    if let Some(report) = &s.consistency {
        println!("Consistency: {}", report.message);
    }
    if let Some(artifacts) = &s.artifacts {
        for file in &artifacts.files {
            println!("Artifact:    {} ({} rows) {:?}", file.kind, file.rows, file.path);
        }
        println!("Manifest:    {:?}", artifacts.manifest_file);
    }
    println!("Log:         {:?}", s.log_path);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            info!("Configuration is valid");
            info!("  Endpoint: {}", config.service.base_url);
            info!("  Model: {}", config.task.model_name);
            info!(
                "  Pacing: {:.2}s min interval, {} retries, backoff {:.1}s..{:.0}s",
                config.task.min_interval_sec,
                config.task.max_retries,
                config.task.backoff_base_sec,
                config.task.backoff_cap_sec
            );
            info!("  Data dir: {:?}", config.storage.data_dir);

            if let Err(e) = config.resolve_api_key(None) {
                warn!("{e}");
            }
            return Ok(());
        }

        Commands::Submit {
            dataset,
            operator,
            api_key,
            model,
            max_rows,
            min_interval,
            amount_field,
            evidence_field,
            no_start,
        } => {
            let config = load_config(&cli.config)?;
            let mut options = TaskOptions::from_defaults(&config.task);
            if let Some(model) = model {
                options.model_name = model;
            }
            if let Some(max_rows) = max_rows {
                options.max_rows = max_rows;
            }
            if let Some(interval) = min_interval {
                options.rate.min_interval_sec = interval;
            }
            options.amount_field = amount_field;
            options.evidence_field = evidence_field;

            let data = Dataset::from_path(&dataset)
                .with_context(|| format!("Failed to load dataset {dataset:?}"))?;
            let source_name = dataset
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| dataset.display().to_string());

            let key = if no_start {
                None
            } else {
                Some(
                    config
                        .resolve_api_key(api_key.as_deref())
                        .context("Failed to resolve API key")?,
                )
            };
            let runner = build_runner(config)?;

            let Some(key) = key else {
                let task = runner.create_task(&data, &source_name, &operator, &options)?;
                println!("Created task {} ({} rows)", task.task_id, task.total);
                return Ok(());
            };

            let snapshot = runner.submit(&data, &source_name, &operator, &options, &key)?;
            info!(task_id = %snapshot.task_id, total = snapshot.total, "Task submitted");
            print_snapshot(&follow(&runner, &snapshot.task_id).await?);
        }

        Commands::Start { task_id, api_key } => {
            let config = load_config(&cli.config)?;
            let key = config
                .resolve_api_key(api_key.as_deref())
                .context("Failed to resolve API key")?;
            let runner = build_runner(config)?;

            runner.start(&task_id, &key)?;
            print_snapshot(&follow(&runner, &task_id).await?);
        }

        Commands::Resume {
            task_id,
            api_key,
            min_interval,
        } => {
            let config = load_config(&cli.config)?;
            let key = config
                .resolve_api_key(api_key.as_deref())
                .context("Failed to resolve API key")?;
            let runner = build_runner(config)?;

            runner.resume(&task_id, &key, min_interval)?;
            print_snapshot(&follow(&runner, &task_id).await?);
        }

        Commands::Pause { task_id } => {
            let runner = build_runner(load_config(&cli.config)?)?;
            let snapshot = runner.pause(&task_id)?;
            println!(
                "Pause requested for {} at row {}/{}",
                snapshot.task_id, snapshot.processed, snapshot.total
            );
        }

        Commands::Status { task_id, json } => {
            let runner = build_runner(load_config(&cli.config)?)?;
            let task_id = match task_id {
                Some(id) => id,
                None => match runner.latest_task(None, false)? {
                    Some(task) => task.task_id,
                    None => bail!("No tasks found"),
                },
            };

            let snapshot = runner.status(&task_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_snapshot(&snapshot);
            }
        }

        Commands::Rows {
            task_id,
            scope,
            page,
            page_size,
        } => {
            let runner = build_runner(load_config(&cli.config)?)?;
            let listing = runner.rows(&task_id, scope, page, page_size)?;
            println!(
                "{} rows ({}), page {}/{}",
                listing.total_rows, listing.scope, listing.page, listing.total_pages
            );
            for row in &listing.rows {
                let outcome = match &row.result {
                    Some(r) if r.note.is_empty() => r.verdict.to_string(),
                    Some(r) => format!("{} ({})", r.verdict, r.note),
                    None => "pending".to_string(),
                };
                println!("#{:<5} {:<40} {}", row.row_no, outcome, serde_json::to_string(&row.fields)?);
            }
        }

        Commands::Check { task_id } => {
            let runner = build_runner(load_config(&cli.config)?)?;
            let report = runner.check_consistency(&task_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.can_compare && !report.ok {
                bail!("Consistency check failed: {}", report.message);
            }
        }

        Commands::Export { task_id } => {
            let runner = build_runner(load_config(&cli.config)?)?;
            let manifest = runner.export_snapshot(&task_id)?;
            for file in &manifest.files {
                println!("{:<12} {:>6} rows  {:?}", file.kind.to_string(), file.rows, file.path);
            }
            println!("Manifest: {:?}", manifest.manifest_file);
        }

        Commands::Logs { task_id, lines } => {
            let runner = build_runner(load_config(&cli.config)?)?;
            for line in runner.logs(&task_id, lines)? {
                println!("{line}");
            }
        }

        Commands::History { task_id, limit } => {
            let runner = build_runner(load_config(&cli.config)?)?;
            for event in runner.read_history(task_id.as_deref(), limit)? {
                println!(
                    "{} {:<22} {} {} in={} out={}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.action.to_string(),
                    event.task_id,
                    event.operator,
                    event.input_rows,
                    event.output_rows
                );
            }
        }

        Commands::List => {
            let runner = build_runner(load_config(&cli.config)?)?;
            for task in runner.list_tasks()? {
                println!(
                    "{}  {:<9} {:>4}/{:<4} {}",
                    task.task_id, task.status.to_string(), task.next_idx, task.total, task.source_name
                );
            }
        }
    }

    Ok(())
}
