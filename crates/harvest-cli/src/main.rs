use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use harvest_core::{Partition, Tier};
use harvest_engine::{
    brief_markdown, build_scheduler, report_recent_markdown, CycleOptions, CycleRunner,
    CycleSettings, CycleSummary, HarvestConfig, SqliteMirror, SyncEngine, SyncOptions, SyncResult,
    SystemClock,
};
use harvest_fetch::{ApiFetcher, FixtureFetcher, RecordFetcher};
use harvest_storage::{PayloadArchive, RecordStore, SqliteStore};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Procurement registry harvester")]
struct Cli {
    /// YAML config file (defaults to ./harvest.yaml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Serve payloads from `<DIR>/<partition>/<id>.json` instead of the live API.
    #[arg(long, global = true, value_name = "DIR")]
    fixtures: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Probe past each partition's frontier for new ids.
    Discover {
        partitions: Vec<Partition>,
        #[arg(long)]
        start_id: Option<u64>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-check the records due in one tier.
    RunTier {
        #[arg(value_parser = clap::value_parser!(u8).range(1..=4))]
        tier: u8,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Discovery plus every tier.
    Cycle {
        partitions: Vec<Partition>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Push local changes to the configured mirror.
    Sync {
        #[arg(long)]
        full: bool,
        #[arg(long)]
        dry_run: bool,
    },
    Status {
        partitions: Vec<Partition>,
    },
    /// Anomalous transitions and rejected payloads awaiting a human.
    Review,
    /// Digest of the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run cycle + sync on the configured cron until Ctrl-C.
    Schedule,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

struct App {
    config: HarvestConfig,
    store: Arc<SqliteStore>,
    fetcher: Arc<dyn RecordFetcher>,
}

impl App {
    async fn open(config: HarvestConfig, fixtures: Option<PathBuf>) -> Result<Self> {
        let store = SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        let fetcher: Arc<dyn RecordFetcher> = match fixtures {
            Some(dir) => Arc::new(FixtureFetcher::new(dir)),
            None => Arc::new(ApiFetcher::new(config.http_client_config())?),
        };
        Ok(Self {
            config,
            store: Arc::new(store),
            fetcher,
        })
    }

    fn runner(&self) -> CycleRunner {
        CycleRunner::new(
            self.store.clone(),
            self.fetcher.clone(),
            Arc::new(SystemClock),
            CycleSettings::from_config(&self.config),
        )
        .with_archive(self.config.archive_dir.clone().map(PayloadArchive::new))
    }

    fn partitions_or_default(&self, requested: Vec<Partition>) -> Vec<Partition> {
        if requested.is_empty() {
            self.config.partitions.clone()
        } else {
            requested
        }
    }

    async fn mirror(&self) -> Result<SqliteMirror> {
        let Some(url) = &self.config.mirror_url else {
            bail!("no mirror configured; set HARVEST_MIRROR_URL or mirror_url in harvest.yaml");
        };
        SqliteMirror::connect(self.config.mirror_id.clone(), url)
            .await
            .with_context(|| format!("connecting to mirror {url}"))
    }
}

fn print_summary(summary: &CycleSummary) {
    println!("{}", brief_markdown(summary));
    if let Some(dir) = &summary.report_dir {
        println!("reports: {dir}");
    }
}

fn print_sync(result: &SyncResult) {
    println!(
        "sync {}: destination={} records={} transitions={} cursor={} -> {}",
        if result.dry_run { "dry run" } else { "complete" },
        result.destination_id,
        result.pushed_count,
        result.transitions_pushed,
        result
            .previous_cursor
            .map_or_else(|| "unset".to_string(), |c| c.to_rfc3339()),
        result
            .new_cursor
            .map_or_else(|| "unset".to_string(), |c| c.to_rfc3339()),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = HarvestConfig::load(cli.config.as_deref())?;
    if let Commands::Report { runs } = cli.command {
        println!("{}", report_recent_markdown(&config.reports_dir, runs)?);
        return Ok(());
    }
    let app = App::open(config, cli.fixtures).await?;

    match cli.command {
        Commands::Discover {
            partitions,
            start_id,
            dry_run,
        } => {
            let partitions = app.partitions_or_default(partitions);
            let summary = app.runner().discover(&partitions, start_id, dry_run).await?;
            print_summary(&summary);
        }
        Commands::RunTier {
            tier,
            dry_run,
            limit,
        } => {
            let tier = Tier::from_number(tier).context("tier must be 1-4")?;
            let summary = app.runner().run_tier(tier, limit, dry_run).await?;
            print_summary(&summary);
        }
        Commands::Cycle { partitions, dry_run } => {
            let partitions = app.partitions_or_default(partitions);
            let summary = app
                .runner()
                .run_cycle(&partitions, CycleOptions::full(dry_run))
                .await?;
            print_summary(&summary);
        }
        Commands::Sync { full, dry_run } => {
            let mirror = app.mirror().await?;
            let result = SyncEngine::new(app.store.clone())
                .sync(&mirror, SyncOptions { dry_run, full })
                .await?;
            print_sync(&result);
        }
        Commands::Status { partitions } => {
            let partitions = if partitions.is_empty() {
                app.store.partitions().await?
            } else {
                partitions
            };
            for partition in partitions {
                let stats = app.store.partition_stats(partition).await?;
                let by_status = stats
                    .by_status
                    .iter()
                    .map(|(status, n)| format!("{status}={n}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!(
                    "{partition}: records={} archived={} frontier={} highest={} [{by_status}]",
                    stats.total,
                    stats.archived,
                    stats.frontier.map_or_else(|| "-".to_string(), |f| f.to_string()),
                    stats
                        .highest_sequence_id
                        .map_or_else(|| "-".to_string(), |h| h.to_string()),
                );
            }
        }
        Commands::Review => {
            let queue = app.store.review_queue().await?;
            println!("anomalous transitions: {}", queue.anomalous_transitions.len());
            for t in &queue.anomalous_transitions {
                println!(
                    "  {} {} -> {} at {}{}",
                    t.key,
                    t.from_status,
                    t.to_status,
                    t.changed_at.to_rfc3339(),
                    if t.reactivated { " (reactivated)" } else { "" }
                );
            }
            println!("rejected payloads: {}", queue.rejected_attempts.len());
            for a in &queue.rejected_attempts {
                println!(
                    "  {} at {} [{}]: {}",
                    a.key,
                    a.attempted_at.to_rfc3339(),
                    a.origin.label(),
                    a.detail.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Schedule => {
            let runner = Arc::new(app.runner());
            let engine = Arc::new(SyncEngine::new(app.store.clone()));
            let mirror = match app.config.mirror_url {
                Some(_) => Some(Arc::new(app.mirror().await?)),
                None => None,
            };
            let partitions = app.config.partitions.clone();
            let cron = app.config.scheduler_cron.clone();

            let mut sched = build_scheduler(&cron, move || {
                let runner = runner.clone();
                let engine = engine.clone();
                let mirror = mirror.clone();
                let partitions = partitions.clone();
                async move {
                    match runner.run_cycle(&partitions, CycleOptions::full(false)).await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            checked = summary.totals.checked,
                            failed = summary.failed_partitions.len(),
                            "scheduled cycle finished"
                        ),
                        Err(err) => error!(error = %err, "scheduled cycle failed"),
                    }
                    if let Some(mirror) = mirror {
                        match engine.sync(mirror.as_ref(), SyncOptions::default()).await {
                            Ok(result) => info!(pushed = result.pushed_count, "scheduled sync finished"),
                            Err(err) => error!(error = %err, "scheduled sync failed; cursor held"),
                        }
                    }
                }
            })
            .await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { .. } => {}
    }

    Ok(())
}
