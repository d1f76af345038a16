use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use orgsync::{ObjectType, OrgSync, RecordStatus, SyncConfig, SyncJob, TriggerKind};

#[derive(Parser)]
#[command(name = "orgsync", about = "Watermark-driven CRM org sync")]
struct Cli {
    /// Database path (default: ~/.orgsync/orgsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON job configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Object type to sync: user, opportunity, account
    #[arg(long, global = true)]
    object: Option<ObjectType>,

    /// Job name (default: <object>-sync)
    #[arg(long, global = true)]
    job: Option<String>,

    /// Records per upsert call
    #[arg(long, global = true)]
    page_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl orgsync::SyncProgress for StderrProgress {
    fn on_run_start(&self, job_name: &str, trigger: TriggerKind) {
        eprintln!("Running {job_name} ({trigger})...");
    }

    fn on_records_fetched(&self, _job_name: &str, count: usize) {
        eprintln!("  Fetched {count} records");
    }

    fn on_page_complete(&self, _job_name: &str, page: usize, total_pages: usize) {
        if page == total_pages {
            eprint!("\r  Upserting pages: {page}/{total_pages}   \n");
        } else {
            eprint!("\r  Upserting pages: {page}/{total_pages}   ");
        }
    }

    fn on_run_complete(&self, job: &SyncJob) {
        eprintln!("  Done: {}", summary(job));
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one poll now
    Sync {
        /// Output the job as JSON
        #[arg(long)]
        json: bool,
    },
    /// Poll on the configured schedule until Ctrl-C
    Watch,
    /// Sync a single pushed record (JSON) from a file or stdin
    Push {
        /// Payload file (default: stdin)
        file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List recent jobs
    Jobs {
        #[arg(long, default_value = "20")]
        limit: u32,
        #[arg(long)]
        json: bool,
    },
    /// Show one job with its per-record results
    Job {
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Inspect or reset watermarks
    Watermark {
        #[command(subcommand)]
        action: WatermarkAction,
    },
    /// Invoke a named retrieve/update/delete operation
    Op {
        /// Operation name, e.g. retrieveUserFromBFlow (omit to list)
        name: Option<String>,
        /// JSON input
        #[arg(long)]
        input: Option<String>,
    },
    /// Show record and job counts
    Status,
}

#[derive(Subcommand)]
enum WatermarkAction {
    /// List stored watermarks
    List,
    /// Forget a job's watermark so its next run starts from the default
    Reset { job: String },
}

fn load_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::default(),
    };
    if let Some(object) = cli.object {
        config.object = object;
    }
    if let Some(ref job) = cli.job {
        config.job_name = Some(job.clone());
    }
    if let Some(page_size) = cli.page_size {
        config.page_size = page_size;
    }
    config.validate()?;
    Ok(config)
}

fn summary(job: &SyncJob) -> String {
    let mut line = format!(
        "{} ({} created, {} updated, {} skipped, {} failed)",
        job.status,
        job.count(RecordStatus::Created),
        job.count(RecordStatus::Updated),
        job.count(RecordStatus::SkippedFiltered),
        job.count(RecordStatus::Failed),
    );
    if let Some(ref error) = job.error {
        line.push_str(&format!(": {error}"));
    }
    line
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => orgsync::Database::open_at(path).await?,
        None => orgsync::Database::open().await?,
    };
    let app = OrgSync::local(db);
    let progress = Arc::new(StderrProgress);

    match cli.command {
        Commands::Sync { json } => {
            let config = load_config(&cli)?;
            let job = app.sync_once(config, progress).await?;
            print_job(&job, json)?;
        }
        Commands::Watch => {
            let config = SyncConfig {
                trigger: TriggerKind::Poll,
                ..load_config(&cli)?
            };
            let trigger = app.start_trigger(config, progress)?;
            eprintln!("Watching {}. Press Ctrl-C to stop.", trigger.job_name());
            tokio::signal::ctrl_c().await?;
            eprintln!("Stopping after the current run...");
            trigger.stop();
            trigger.join().await;
        }
        Commands::Push { ref file, json } => {
            let config = load_config(&cli)?;
            let payload = match file {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let job = app.push(config, &payload, progress).await?;
            print_job(&job, json)?;
        }
        Commands::Jobs { limit, json } => {
            let jobs = app.jobs(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("No jobs recorded.");
            } else {
                for job in &jobs {
                    println!(
                        "{:>6}  {:<24} {:<5} {}  {}",
                        job.id.unwrap_or_default(),
                        job.job_name,
                        job.trigger,
                        job.started_at.format("%Y-%m-%d %H:%M:%S"),
                        job.status,
                    );
                }
            }
        }
        Commands::Job { id, json } => {
            let job = app.job(id).await?;
            print_job(&job, json)?;
        }
        Commands::Watermark { action } => match action {
            WatermarkAction::List => {
                let watermarks = app.watermarks().await?;
                if watermarks.is_empty() {
                    println!("No watermarks stored.");
                }
                for (job, ts) in watermarks {
                    println!("{job:<24} {}", orgsync::date_util::format_timestamp(ts));
                }
            }
            WatermarkAction::Reset { job } => {
                if app.reset_watermark(&job).await? {
                    println!("Reset watermark for {job}");
                } else {
                    println!("No watermark stored for {job}");
                }
            }
        },
        Commands::Op { name: None, .. } => {
            for name in app.registry().names() {
                println!("{name}");
            }
        }
        Commands::Op {
            name: Some(ref name),
            ref input,
        } => {
            let input = match input {
                Some(raw) => serde_json::from_str(raw)?,
                None => serde_json::Value::Null,
            };
            let output = app.run_operation(name, input).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Status => {
            print_status(app.db()).await?;
        }
    }

    Ok(())
}

fn print_job(job: &SyncJob, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(job)?);
        return Ok(());
    }
    println!(
        "Job {} [{}] {}: {}",
        job.id.unwrap_or_default(),
        job.trigger,
        job.job_name,
        summary(job)
    );
    for result in &job.results {
        let target = result
            .destination_id
            .as_deref()
            .or(result.error.as_deref())
            .unwrap_or("");
        println!(
            "  {:<17} {:<32} {}",
            result.status.as_str(),
            result.key.as_deref().unwrap_or("-"),
            target
        );
    }
    Ok(())
}

async fn print_status(db: &orgsync::Database) -> anyhow::Result<()> {
    let (records, jobs, last_success) = db
        .reader()
        .call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT org, object_type, COUNT(*) FROM org_records
                 GROUP BY org, object_type ORDER BY org, object_type",
            )?;
            let records = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            let jobs: i64 = conn.query_row("SELECT COUNT(*) FROM sync_jobs", [], |row| row.get(0))?;
            let last_success: Option<i64> = conn.query_row(
                "SELECT MAX(ended_at_us) FROM sync_jobs WHERE status = 'succeeded'",
                [],
                |row| row.get(0),
            )?;
            Ok::<_, rusqlite::Error>((records, jobs, last_success))
        })
        .await?;

    println!("Sync Status");
    if records.is_empty() {
        println!("  Records:   none");
    }
    for (org, object, count) in records {
        println!("  Org {org} {object:<12} {count}");
    }
    println!("  Jobs:      {jobs}");
    println!(
        "  Last successful run: {}",
        last_success
            .map(|us| orgsync::date_util::format_timestamp(orgsync::date_util::from_micros(us)))
            .unwrap_or_else(|| "never".to_string())
    );
    Ok(())
}
