use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use jobsentinel_core::dedup::DedupEntry;
use jobsentinel_core::traits::{BatchSink, DedupStore, SecretsProvider};
use jobsentinel_core::{
    AppError, FileDedupStore, NullStore, Orchestrator, OrchestratorConfig, RunOutcome,
    SourceSettings, TracingRunReporter, UserPreferences,
};
use jobsentinel_db::{Database, DatabaseConfig, SeenJobRepository};
use jobsentinel_sources::{EnvSecrets, HtmdCleaner, ReqwestFetcher, Source, build_sources};

#[derive(Parser)]
#[command(name = "jobsentinel", version, about = "Deduplicated, scored job feed from many sources")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every enabled source once and print the ranked batch as JSON
    Run {
        /// Preferences file (JSON)
        #[arg(short, long, env = "JOBSENTINEL_PREFS")]
        prefs: PathBuf,

        /// Where seen jobs are remembered between runs
        #[arg(long, value_enum, env = "JOBSENTINEL_STORE", default_value_t = StoreKind::File)]
        store: StoreKind,

        /// Seen-jobs file for `--store file`
        #[arg(long, env = "JOBSENTINEL_SEEN_FILE", default_value = ".jobsentinel/seen.jsonl")]
        seen_file: PathBuf,

        /// Save surfaced jobs to PostgreSQL (requires DATABASE_URL)
        #[arg(long, default_value_t = false)]
        save: bool,

        /// Stop the whole fetch phase after this many seconds
        #[arg(long, env = "JOBSENTINEL_RUN_DEADLINE_SECS")]
        deadline_secs: Option<u64>,

        /// Allow sources on private/loopback addresses
        #[arg(long, default_value_t = false)]
        allow_private_urls: bool,
    },

    /// Check a preferences file without fetching anything
    Validate {
        #[arg(short, long, env = "JOBSENTINEL_PREFS")]
        prefs: PathBuf,
    },

    /// List configured sources
    Sources {
        #[arg(short, long, env = "JOBSENTINEL_PREFS")]
        prefs: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// Forget everything after the run
    None,
    /// JSON lines file
    File,
    /// PostgreSQL (requires DATABASE_URL)
    Postgres,
}

/// The dedup store picked on the command line.
enum Store {
    None(NullStore),
    File(FileDedupStore),
    Postgres(SeenJobRepository),
}

impl DedupStore for Store {
    async fn load_recent(&self, limit: usize) -> Result<Vec<DedupEntry>, AppError> {
        match self {
            Store::None(s) => s.load_recent(limit).await,
            Store::File(s) => s.load_recent(limit).await,
            Store::Postgres(s) => s.load_recent(limit).await,
        }
    }

    async fn record(&self, entries: &[DedupEntry]) -> Result<(), AppError> {
        match self {
            Store::None(s) => s.record(entries).await,
            Store::File(s) => s.record(entries).await,
            Store::Postgres(s) => s.record(entries).await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("jobsentinel=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            prefs,
            store,
            seen_file,
            save,
            deadline_secs,
            allow_private_urls,
        } => {
            let prefs = load_prefs(&prefs)?;
            let database = if save || store == StoreKind::Postgres {
                Some(connect_db().await?)
            } else {
                None
            };
            let store = match store {
                StoreKind::None => Store::None(NullStore),
                StoreKind::File => Store::File(FileDedupStore::new(seen_file)),
                StoreKind::Postgres => match &database {
                    Some(db) => Store::Postgres(db.seen_repo()),
                    None => anyhow::bail!("PostgreSQL store selected but no database connected"),
                },
            };

            let mut config = OrchestratorConfig::default();
            if let Some(secs) = deadline_secs {
                config = config.with_run_deadline(Duration::from_secs(secs));
            }

            let outcome = cmd_run(&prefs, store, config, allow_private_urls).await?;

            if save && let Some(db) = &database {
                let accepted = db
                    .job_repo()
                    .deliver(&outcome.batch)
                    .await
                    .map_err(|e| anyhow::anyhow!(e))?;
                tracing::info!(accepted, "Saved surfaced jobs");
            }

            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Validate { prefs } => {
            let prefs = load_prefs(&prefs)?;
            let http = ReqwestFetcher::new().context("Failed to create HTTP client")?;
            build_sources(&prefs.sources, &http, &EnvSecrets)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!(
                "OK: {} sources ({} enabled), threshold {}",
                prefs.sources.len(),
                prefs.enabled_sources().count(),
                prefs.threshold
            );
        }
        Commands::Sources { prefs } => {
            let prefs = load_prefs(&prefs)?;
            cmd_sources(&prefs);
        }
    }

    Ok(())
}

fn load_prefs(path: &Path) -> Result<UserPreferences> {
    UserPreferences::from_file(path)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Invalid preferences in {}", path.display()))
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    Database::open(&config)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to open database")
}

async fn cmd_run(
    prefs: &UserPreferences,
    store: Store,
    config: OrchestratorConfig,
    allow_private_urls: bool,
) -> Result<RunOutcome> {
    let mut http = ReqwestFetcher::new().context("Failed to create HTTP client")?;
    if allow_private_urls {
        http = http.allow_private_urls();
    }

    let sources = build_sources(&prefs.sources, &http, &EnvSecrets)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    let mut orchestrator: Orchestrator<Source, HtmdCleaner, Store> =
        Orchestrator::new(HtmdCleaner::new(), store, config);
    for (config, source) in sources {
        orchestrator
            .add_source(config, source)
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    let warmed = orchestrator.warm().await;
    tracing::info!(warmed, "Dedup index ready");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    let outcome = orchestrator
        .run_with(prefs, &cancel, &TracingRunReporter)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if outcome.report.all_failed() {
        tracing::warn!("No source succeeded this run");
    }
    Ok(outcome)
}

fn cmd_sources(prefs: &UserPreferences) {
    if prefs.sources.is_empty() {
        println!("No sources configured");
        return;
    }

    for source in &prefs.sources {
        let credentials = if matches!(source.settings, SourceSettings::Reed { .. }) {
            if EnvSecrets.api_key(&source.id).is_some() {
                "key set"
            } else {
                "no key"
            }
        } else {
            "-"
        };
        println!(
            "  {:<20} {:<11} {:<8} rate {}/s burst {}  max_pages {}  {}",
            source.id,
            source.settings.kind(),
            if source.enabled { "enabled" } else { "disabled" },
            source.rate_limit.refill_per_sec,
            source.rate_limit.capacity,
            source.max_pages,
            credentials,
        );
    }
}
