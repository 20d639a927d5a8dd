use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use joblake_load::{land_jobs_csv, today_jst, LoadConfig, Loader, PgWarehouse};
use joblake_scrape::{Crawler, ScrapeConfig};
use joblake_storage::{FetcherConfig, PageFetcher};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "joblake-cli")]
#[command(about = "Job listing lake pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl the listing index, scrape details and land the batch as CSV.
    Scrape {
        /// Oldest listing start date to keep, e.g. 2024-12-27.
        #[arg(long)]
        cutoff: Option<NaiveDate>,
    },
    /// Merge the landed CSV partition into the warehouse table.
    Load {
        /// Partition date to load; defaults to yesterday (UTC+9).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Serve the push-trigger entrypoints.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Scrape { cutoff } => {
            let config = ScrapeConfig::from_env()?;
            let cutoff = cutoff.unwrap_or(config.cutoff_date);
            let fetcher = PageFetcher::new(FetcherConfig {
                base_url: config.base_url.clone(),
                ..FetcherConfig::default()
            })?;
            let crawler = Crawler::new(fetcher).with_pacing(config.pacing);

            let rows = crawler.collect(cutoff).await?;
            let store = LoadConfig::from_env()?.bucket_store();
            let key = land_jobs_csv(&store, &rows, today_jst()).await?;
            println!("scrape complete: rows={} object={}", rows.len(), key);
        }
        Commands::Load { date } => {
            let config = LoadConfig::from_env()?;
            let store = config.bucket_store();
            let warehouse = PgWarehouse::connect(&config.database_url).await?;
            let loader = Loader::new(config, store, warehouse);

            let report = match date {
                Some(date) => loader.execute_for_date(date).await,
                None => loader.execute().await,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve => {
            joblake_web::serve_from_env().await?;
        }
    }

    Ok(())
}
