mod logging;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tally_core::OrgId;
use tally_storage::{MemoryStore, PgStore, Store};
use tally_sync::{maybe_build_scheduler, JobOutcome, JobRunner, SyncConfig};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "tally")]
#[command(about = "Mirror remote survey data into local records and counters")]
struct Cli {
    /// Log level used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull fields, boundaries and contacts (all orgs when --org is omitted).
    SyncContacts {
        #[arg(long)]
        org: Option<i64>,
    },
    /// Pull poll results for one org (every configured poll unless --flow).
    PullResults {
        #[arg(long)]
        org: i64,
        #[arg(long)]
        flow: Option<String>,
    },
    /// Fold pending counter deltas into squashed totals.
    Squash,
    /// Recompute an org's contact counters from its active contacts.
    RebuildCounts {
        #[arg(long)]
        org: i64,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// Serve the counter read API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);
    let config = SyncConfig::from_env();

    match config.database_url.clone() {
        Some(url) => {
            let store = PgStore::connect(&url).await.context("connecting to postgres")?;
            if let Commands::Migrate = cli.command {
                store.migrate().await.context("applying migrations")?;
                println!("migrations applied");
                return Ok(());
            }
            run(Arc::new(store), config, cli.command).await
        }
        None => {
            warn!("DATABASE_URL not set; using an in-memory store");
            run(Arc::new(MemoryStore::new()), config, cli.command).await
        }
    }
}

async fn job_runner<St: Store>(store: Arc<St>, config: SyncConfig) -> Result<JobRunner<St>> {
    JobRunner::from_config(store, config)
        .await
        .context("loading org registry")
}

async fn run<St: Store>(store: Arc<St>, config: SyncConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.web_port);
            tally_web::serve(store, port).await?;
        }
        Commands::Migrate => bail!("migrate requires DATABASE_URL"),
        Commands::SyncContacts { org } => {
            let runner = job_runner(store, config).await?;
            let orgs: Vec<OrgId> = match org {
                Some(org) => vec![OrgId(org)],
                None => runner.registry().orgs.iter().map(|o| o.id).collect(),
            };
            for org in orgs {
                match runner.pull_contacts(org).await? {
                    JobOutcome::Ran(report) | JobOutcome::Paused(report) => println!(
                        "org {org}: fields [{}] boundaries [{}] contacts [{}]",
                        report.fields, report.boundaries, report.contacts.report
                    ),
                    JobOutcome::Skipped => println!("org {org}: skipped, contact pull in progress"),
                }
            }
        }
        Commands::PullResults { org, flow } => {
            let runner = job_runner(store, config).await?;
            let org = OrgId(org);
            let outcomes = match flow {
                Some(flow) => {
                    let outcome = runner.pull_poll_results(org, &flow).await?;
                    vec![(flow, outcome)]
                }
                None => runner.pull_all_results(org).await?,
            };
            for (flow, outcome) in outcomes {
                match outcome {
                    JobOutcome::Ran(report) => println!(
                        "org {org} flow {flow}: complete, {} runs, {}",
                        report.runs, report.report
                    ),
                    JobOutcome::Paused(report) => println!(
                        "org {org} flow {flow}: paused, {} runs, {}",
                        report.runs, report.report
                    ),
                    JobOutcome::Skipped => {
                        println!("org {org} flow {flow}: skipped, pull in progress")
                    }
                }
            }
        }
        Commands::Squash => {
            let runner = job_runner(store, config).await?;
            match runner.squash().await? {
                JobOutcome::Ran(report) | JobOutcome::Paused(report) => println!(
                    "squashed {} scopes ({} rows, {} clamped)",
                    report.scopes, report.rows, report.clamped
                ),
                JobOutcome::Skipped => println!("skipped, squash in progress"),
            }
        }
        Commands::RebuildCounts { org } => {
            let runner = job_runner(store, config).await?;
            match runner.rebuild_counts(OrgId(org)).await? {
                JobOutcome::Ran(applied) | JobOutcome::Paused(applied) => {
                    println!("org {org}: {} counters corrected", applied.len())
                }
                JobOutcome::Skipped => println!("org {org}: skipped, contact pull in progress"),
            }
        }
        Commands::Schedule => {
            let runner = Arc::new(job_runner(store, config).await?);
            let Some(mut sched) = maybe_build_scheduler(runner).await? else {
                bail!("scheduler is disabled; set TALLY_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }
    Ok(())
}
