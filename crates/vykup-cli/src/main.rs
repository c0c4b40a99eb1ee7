use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vykup_sync::{BuyoutService, IdentityInput, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "vykup-cli")]
#[command(about = "Buyout-rate reconciliation for RetailCRM customers")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Recompute one customer and print the report as JSON.
    Compute(IdentityArgs),
    /// Recompute every customer, page by page.
    RecomputeAll {
        #[arg(long)]
        max_customers: Option<usize>,
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// Run the recompute on the configured cron until Ctrl-C.
    Schedule,
}

#[derive(Debug, Args)]
struct IdentityArgs {
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    customer_id: Option<i64>,
    #[arg(long)]
    order_id: Option<i64>,
    #[arg(long)]
    order_number: Option<String>,
}

impl From<IdentityArgs> for IdentityInput {
    fn from(args: IdentityArgs) -> Self {
        Self {
            phone: args.phone,
            customer_id: args.customer_id,
            order_id: args.order_id,
            order_number: args.order_number,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    // stdout carries the command output; logs go to stderr.
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Compute(args) => {
            let report = vykup_sync::compute_for_customer_from_env(args.into()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::RecomputeAll {
            max_customers,
            page_size,
        } => {
            let summary = vykup_sync::recompute_all_from_env(max_customers, page_size).await?;
            println!(
                "recompute complete: run_id={} formula={} pages={} processed={} updated={} skipped={} errors={}",
                summary.run_id,
                summary.formula,
                summary.pages_fetched,
                summary.processed,
                summary.updated,
                summary.skipped,
                summary.errors
            );
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env()?;
            if !config.scheduler_enabled {
                bail!("scheduler is disabled; set VYKUP_SCHEDULER_ENABLED=1");
            }
            let service = Arc::new(BuyoutService::from_config(&config)?);
            let Some(mut sched) = service.maybe_build_scheduler(&config).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.recompute_cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
