//! Operator CLI for the testimony pipeline.
//!
//! Exit status: `0` when every item succeeded, `2` when the run finished but
//! some items failed, `1` on a fatal error.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use testimony::{
    ai::OpenAiReasoner,
    crawlers::{FirecrawlCrawler, RobotsCrawler},
    discovery::canonicalize_url,
    maintain, read_batch_file, EntryStatus, ExtractionStage, FetchPool, FsRawStore, FsRecordStore, Ledger,
    RawStore, RecordStore, RequeueSelector, SourceRegistry, SqliteLedger, ValidatedCrawler,
};

use config::{CrawlArgs, ExtractArgs};

#[derive(Parser)]
#[command(name = "testimony")]
#[command(about = "Crawl patient forums and extract grounded testimony records")]
struct Cli {
    /// Directory holding the ledger, raw documents and records
    #[arg(long, global = true, env = "TESTIMONY_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed the ledger and fetch until no work is left
    Crawl(CrawlArgs),

    /// Extract records from every stored document not yet processed
    Extract(ExtractArgs),

    /// Show ledger and store counts
    Status,

    /// List failed ledger entries
    Failed {
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Print entries as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Return failed entries to pending
    Requeue {
        /// Requeue every failed entry
        #[arg(long, conflicts_with = "ids")]
        all: bool,

        /// URLs of the entries to requeue
        ids: Vec<String>,
    },

    /// Merge entries whose URLs canonicalize alike and fail entries now denied by a seed
    Maintain {
        #[arg(long, env = "TESTIMONY_SOURCES", default_value = "sources.json")]
        sources: PathBuf,
    },

    /// Re-validate every record file in the output directory
    VerifyOutput {
        /// Defaults to `<data-dir>/records`
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

/// How a command that did not fail outright finished.
enum Outcome {
    Clean,
    Partial,
}

struct Paths {
    ledger: PathBuf,
    raw: PathBuf,
    records: PathBuf,
}

impl Paths {
    fn new(data_dir: &Path) -> Self {
        Self {
            ledger: data_dir.join("ledger.db"),
            raw: data_dir.join("raw"),
            records: data_dir.join("records"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,testimony=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(Outcome::Clean) => ExitCode::SUCCESS,
        Ok(Outcome::Partial) => ExitCode::from(2),
        Err(e) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<Outcome> {
    tokio::fs::create_dir_all(&cli.data_dir)
        .await
        .with_context(|| format!("Failed to create {}", cli.data_dir.display()))?;
    let paths = Paths::new(&cli.data_dir);

    match cli.command {
        Commands::Crawl(args) => crawl(&paths, args).await,
        Commands::Extract(args) => extract(&paths, args).await,
        Commands::Status => status(&paths).await,
        Commands::Failed { limit, json } => failed(&paths, limit, json).await,
        Commands::Requeue { all, ids } => requeue(&paths, all, ids).await,
        Commands::Maintain { sources } => maintain_ledger(&paths, &sources).await,
        Commands::VerifyOutput { dir } => {
            verify_output(dir.as_deref().unwrap_or(&paths.records)).await
        }
    }
}

/// A token cancelled on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight work");
            token.cancel();
        }
    });
    cancel
}

async fn open_ledger(paths: &Paths) -> Result<SqliteLedger> {
    SqliteLedger::open(&paths.ledger)
        .await
        .with_context(|| format!("Failed to open ledger {}", paths.ledger.display()))
}

async fn load_sources(path: &Path) -> Result<SourceRegistry> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let sources = SourceRegistry::from_json(&json).context("Invalid source registry")?;
    tracing::info!(seeds = sources.len(), "Sources loaded");
    Ok(sources)
}

async fn crawl(paths: &Paths, args: CrawlArgs) -> Result<Outcome> {
    let config = args.fetch_config();
    config.validate().context("Invalid crawl configuration")?;
    let sources = load_sources(&args.sources).await?;

    let ledger = Arc::new(open_ledger(paths).await?);
    let firecrawl = FirecrawlCrawler::from_env().context("Failed to configure crawler")?;
    let crawler = Arc::new(RobotsCrawler::new(ValidatedCrawler::new(firecrawl)));
    let raw = Arc::new(FsRawStore::new(&paths.raw));

    let pool = FetchPool::new(ledger, crawler, raw, config)?.with_sources(sources);
    pool.seed().await.context("Failed to seed ledger")?;
    let summary = pool.run(cancel_on_ctrl_c()).await?;

    println!(
        "{} claimed {}, completed {}, retried {}, directories {}, failed {}, links {}",
        style("crawl").cyan().bold(),
        summary.claimed,
        style(summary.completed).green(),
        summary.retried,
        summary.directories,
        style(summary.failed).red(),
        summary.links_enqueued,
    );
    if summary.cancelled {
        println!("{}", style("interrupted; rerun to resume").yellow());
    }

    Ok(if summary.has_failures() {
        Outcome::Partial
    } else {
        Outcome::Clean
    })
}

async fn extract(paths: &Paths, args: ExtractArgs) -> Result<Outcome> {
    let config = args.extract_config();
    let reasoner = OpenAiReasoner::from_env()
        .context("Failed to configure reasoner")?
        .with_model(&args.model);
    let raw = Arc::new(FsRawStore::new(&paths.raw));
    let records = Arc::new(FsRecordStore::new(&paths.records));

    let stage = ExtractionStage::new(reasoner, raw, records, config)
        .context("Invalid extraction configuration")?;
    let summary = stage.run(&cancel_on_ctrl_c()).await?;

    println!(
        "{} units {}, accepted {}, rejected {}, records {}, skipped {}",
        style("extract").cyan().bold(),
        summary.units,
        style(summary.accepted).green(),
        style(summary.rejected).red(),
        summary.records_written,
        summary.skipped,
    );
    if summary.cancelled {
        println!("{}", style("interrupted; rerun to resume").yellow());
    }

    Ok(if summary.rejected > 0 {
        Outcome::Partial
    } else {
        Outcome::Clean
    })
}

async fn status(paths: &Paths) -> Result<Outcome> {
    let ledger = open_ledger(paths).await?;
    let counts = ledger.counts().await?;
    let raw = FsRawStore::new(&paths.raw);
    let records = FsRecordStore::new(&paths.records);

    println!("{}", style("ledger").cyan().bold());
    println!("  pending      {}", counts.pending);
    println!("  in progress  {}", counts.in_progress);
    println!("  done         {}", style(counts.done).green());
    println!("  failed       {}", style(counts.failed).red());
    println!("{}", style("stores").cyan().bold());
    println!("  documents    {}", raw.list_hashes().await?.len());
    println!("  processed    {}", records.list_sources().await?.len());
    println!("  rejected     {}", records.rejections().await?.len());
    Ok(Outcome::Clean)
}

async fn failed(paths: &Paths, limit: usize, json: bool) -> Result<Outcome> {
    let ledger = open_ledger(paths).await?;
    let entries = ledger.list(EntryStatus::Failed, limit).await?;

    for entry in &entries {
        if json {
            println!("{}", serde_json::to_string(entry)?);
        } else {
            println!(
                "{}  attempts={}  {}",
                entry.id,
                entry.attempts,
                style(entry.last_error.as_deref().unwrap_or("-")).dim()
            );
        }
    }
    if !json {
        println!("{} failed entries shown", entries.len());
    }
    Ok(Outcome::Clean)
}

async fn requeue(paths: &Paths, all: bool, ids: Vec<String>) -> Result<Outcome> {
    let selector = if all {
        RequeueSelector::All
    } else if ids.is_empty() {
        anyhow::bail!("pass entry URLs or --all");
    } else {
        RequeueSelector::Ids(
            ids.into_iter()
                .map(|id| canonicalize_url(&id).unwrap_or(id))
                .collect(),
        )
    };

    let ledger = open_ledger(paths).await?;
    let requeued = ledger.requeue_failed(selector).await?;
    println!("{} {requeued} entries", style("requeued").green().bold());
    Ok(Outcome::Clean)
}

async fn maintain_ledger(paths: &Paths, sources: &Path) -> Result<Outcome> {
    let sources = load_sources(sources).await?;
    let ledger = open_ledger(paths).await?;
    let report = maintain(&ledger, &sources).await?;

    println!(
        "{} merged {}, denied {}",
        style("maintain").cyan().bold(),
        report.merged,
        style(report.denied).yellow(),
    );
    Ok(Outcome::Clean)
}

async fn verify_output(dir: &Path) -> Result<Outcome> {
    let mut files = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;

    let (mut checked, mut valid, mut skipped, mut corrupt) = (0usize, 0usize, 0usize, 0usize);
    while let Some(file) = files.next_entry().await? {
        let path = file.path();
        if !path.extension().is_some_and(|e| e == "json") {
            continue;
        }
        checked += 1;
        match read_batch_file(&path).await {
            Ok((records, bad)) => {
                valid += records.len();
                skipped += bad.len();
                for entry in bad {
                    println!(
                        "{} {} case {}: {}",
                        style("invalid").red(),
                        path.display(),
                        entry.position,
                        entry.reason
                    );
                }
            }
            Err(e) => {
                corrupt += 1;
                println!("{} {e}", style("corrupt").red());
            }
        }
    }

    println!(
        "{} files {checked}, valid records {valid}, invalid {skipped}, corrupt {corrupt}",
        style("verify").cyan().bold()
    );
    Ok(if skipped + corrupt > 0 {
        Outcome::Partial
    } else {
        Outcome::Clean
    })
}
