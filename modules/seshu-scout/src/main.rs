use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use seshu_common::{Config, GeoLocation, ScrapeAction, SeshuError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use seshu_scout::clients::Clients;
use seshu_scout::extractors::ExtractorRegistry;
use seshu_scout::pipeline::{Seshu, TracingSink, WorkOutcome};
use seshu_scout::queue::WorkQueue;
use seshu_scout::scheduler::{Scheduler, SimulatedClock};
use seshu_scout::store::SessionStore;
use seshu_scout::timezone::TzfResolver;

#[derive(Parser)]
#[command(name = "seshu-worker", about = "Event source onboarding and scheduled re-scraping")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the session, job, and queue tables if missing
    Migrate,
    /// Run one gather tick and exit
    Gather,
    /// Gather and scrape until interrupted
    Work,
    /// Drop every pending queue entry and expired draft
    Purge,
    /// Extract events from a page into a draft session
    Onboard {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        url: String,
        /// Treat the page as a single event rather than a listing
        #[arg(long)]
        single: bool,
        #[arg(long, requires = "lon")]
        lat: Option<f64>,
        #[arg(long, requires = "lat")]
        lon: Option<f64>,
        #[arg(long, default_value = "")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("seshu=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_redacted();
    let clients = Clients::new(config);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Migrate => migrate(&clients).await,
        Command::Gather => {
            let scheduler = scheduler(&clients).await?;
            let report = scheduler.gather(Utc::now(), &cancel).await?;
            info!(?report, "Gather finished");
            Ok(())
        }
        Command::Work => work(&clients, &cancel).await,
        Command::Purge => {
            let dropped = clients.queue().await?.purge().await?;
            let expired = clients.session_store().await?.purge_expired(Utc::now()).await?;
            info!(dropped, expired, "Purge finished");
            Ok(())
        }
        Command::Onboard {
            owner,
            url,
            single,
            lat,
            lon,
            address,
        } => {
            let location = lat.zip(lon).map(|(latitude, longitude)| GeoLocation {
                latitude,
                longitude,
                address,
            });
            let action = if single {
                ScrapeAction::Recursive
            } else {
                ScrapeAction::Init
            };
            let session = seshu(&clients)
                .await?
                .onboard(&owner, &url, action, location, &cancel)
                .await
                .with_context(|| format!("onboarding {url} failed"))?;
            println!("{}", serde_json::to_string_pretty(&session.event_candidates)?);
            Ok(())
        }
    }
}

async fn migrate(clients: &Clients) -> Result<()> {
    clients.session_store().await?.ensure_schema().await?;
    clients.job_store().await?.ensure_schema().await?;
    clients.queue().await?.ensure_schema().await?;
    info!("Schemas ready");
    Ok(())
}

async fn seshu(clients: &Clients) -> Result<Seshu> {
    let timezones = Arc::new(TzfResolver::new());
    let registry = ExtractorRegistry::standard(timezones.clone(), clients.interpreter()?);
    Ok(Seshu::builder()
        .registry(Arc::new(registry))
        .fetcher(Arc::new(clients.fetcher()?))
        .sessions(Arc::new(clients.session_store().await?))
        .jobs(Arc::new(clients.job_store().await?))
        .queue(Arc::new(clients.queue().await?))
        .sink(Arc::new(TracingSink))
        .timezones(timezones)
        .build())
}

async fn scheduler(clients: &Clients) -> Result<Scheduler> {
    let config = clients.config();
    Ok(Scheduler::new(
        SimulatedClock::new(config.time_compression_ratio),
        Arc::new(clients.job_store().await?),
        Arc::new(clients.queue().await?),
        Duration::from_secs(config.gather_interval_secs),
    ))
}

async fn work(clients: &Clients, cancel: &CancellationToken) -> Result<()> {
    let seshu = seshu(clients).await?;
    let scheduler = scheduler(clients).await?;
    let poll = Duration::from_secs(clients.config().poll_interval_secs.max(1));
    info!(ratio = scheduler.clock().ratio(), "Worker started");

    while !cancel.is_cancelled() {
        match scheduler.gather(Utc::now(), cancel).await {
            Ok(report) if report.published > 0 => {
                info!(bucket = report.bucket, published = report.published, "Jobs queued")
            }
            Ok(_) => {}
            Err(SeshuError::Cancelled) => break,
            Err(e) => warn!(error = %e, "Gather failed"),
        }

        loop {
            match seshu.process_next(cancel).await {
                Ok(WorkOutcome::Idle) => break,
                Ok(_) => {}
                Err(SeshuError::Cancelled) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "Processing failed");
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll) => {}
        }
    }

    info!("Worker stopped");
    Ok(())
}
