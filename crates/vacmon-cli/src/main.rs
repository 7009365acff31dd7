use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vacmon_adapters::{SearchQuery, HH_SOURCE_ID};
use vacmon_analytics::{Aggregator, ChatCompletionsGenerator, InsightConfig, MarketAnalyst};
use vacmon_storage::VacancyStore;
use vacmon_sync::{SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "vacmon")]
#[command(about = "Vacancy market monitor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch listings and upsert them. Without --query every enabled source is collected.
    Collect {
        #[arg(long, default_value = HH_SOURCE_ID)]
        source: String,
        #[arg(long)]
        query: Option<String>,
        #[arg(long, default_value_t = 1)]
        area: u32,
    },
    /// Delete vacancies not refreshed within the retention window.
    Purge {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Print aggregate statistics over the stored vacancies.
    Stats,
    /// Generate the weekly market analysis.
    Insights,
    Serve,
    /// Run the collection on its cron schedule until interrupted.
    Schedule,
    Migrate,
}

fn init_tracing() {
    let json = std::env::var("VACMON_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vacmon=debug".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

async fn pipeline(config: SyncConfig) -> Result<SyncPipeline> {
    let store = VacancyStore::connect(&config.database_url).await?;
    SyncPipeline::new(config, store)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Collect {
        source: HH_SOURCE_ID.to_string(),
        query: None,
        area: 1,
    });

    match command {
        Commands::Collect {
            source,
            query: Some(text),
            area,
        } => {
            let pipeline = pipeline(SyncConfig::from_env()).await?;
            let summary = pipeline
                .collect(&source, &SearchQuery::new(text, area))
                .await?;
            println!(
                "collect complete: source={} new={} updated={} skipped={} total={}",
                source,
                summary.new_count,
                summary.updated_count,
                summary.skipped_count,
                summary.total_count
            );
        }
        Commands::Collect { query: None, .. } => {
            let summary = vacmon_sync::run_collect_once_from_env().await?;
            println!(
                "collect complete: run_id={} sources={} failed={} new={} updated={} skipped={}",
                summary.run_id,
                summary.outcomes.len(),
                summary.failed_sources(),
                summary.totals.new_count,
                summary.totals.updated_count,
                summary.totals.skipped_count
            );
        }
        Commands::Purge { days } => {
            let config = SyncConfig::from_env();
            let days = days.unwrap_or(config.retention_days);
            let pipeline = pipeline(config).await?;
            let deleted = pipeline.purge(days).await?;
            println!("purge complete: deleted={deleted} older_than_days={days}");
        }
        Commands::Stats => {
            let config = SyncConfig::from_env();
            let store = VacancyStore::connect(&config.database_url).await?;
            let snapshot = Aggregator::default().aggregate(&store.all().await?);
            println!(
                "{}",
                serde_json::to_string_pretty(&snapshot).context("serializing stats")?
            );
        }
        Commands::Insights => {
            let config = SyncConfig::from_env();
            let store = VacancyStore::connect(&config.database_url).await?;
            let generator = ChatCompletionsGenerator::new(InsightConfig::from_env())?;
            let analyst = MarketAnalyst::new(Arc::new(generator));
            let result = analyst
                .analyze(&store, Utc::now())
                .await
                .context("market analysis failed")?;
            println!("{}", result.analysis);
        }
        Commands::Serve => {
            vacmon_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(pipeline(config).await?);
            let mut scheduler = pipeline
                .start_scheduler()
                .await?
                .context("scheduler was not created")?;
            info!("waiting for scheduled runs; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("listening for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            VacancyStore::connect(&config.database_url).await?;
            println!("migrate complete: {}", config.database_url);
        }
    }

    Ok(())
}
