//! Axum entrypoints for the scrape trigger and the warehouse load.
//!
//! Almost every failure path still answers with a 2xx transport status so
//! the delivering push subscription does not retry; the outcome taxonomy
//! travels in the response body instead.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::NaiveDate;
use joblake_core::{JoinedListing, RunReport};
use joblake_load::{
    land_jobs_csv, today_jst, LoadConfig, Loader, MarkerStore, PgWarehouse,
};
use joblake_scrape::{Crawler, ScrapeConfig, ScrapeError};
use joblake_storage::{FetcherConfig, ObjectStore, PageFetcher};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "joblake-web";

/// Expected trigger marker inside the decoded push payload.
const TRIGGER_TYPE: &str = "daily_scraping";

#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    // Required by deserialization; its presence is the envelope check.
    pub subscription: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushMessage {
    #[serde(default)]
    pub data: String,
    #[serde(rename = "messageId", alias = "message_id")]
    pub message_id: String,
}

/// Envelope validation: JSON body with `message` + `subscription`, whose
/// base64 `data` decodes to a JSON payload of the expected trigger type.
/// Anything else is a foreign payload.
pub fn validate_push_envelope(body: &[u8]) -> Option<PushEnvelope> {
    let envelope: PushEnvelope = serde_json::from_slice(body).ok()?;
    let decoded = BASE64.decode(envelope.message.data.as_bytes()).ok()?;
    let payload: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    (payload.get("type")?.as_str()? == TRIGGER_TYPE).then_some(envelope)
}

#[async_trait]
pub trait ScrapeRunner: Send + Sync {
    async fn collect(&self) -> Result<Vec<JoinedListing>, ScrapeError>;
}

#[async_trait]
pub trait LoadRunner: Send + Sync {
    async fn execute(&self) -> RunReport;
}

struct CrawlerRunner {
    crawler: Crawler<PageFetcher>,
    cutoff: NaiveDate,
}

#[async_trait]
impl ScrapeRunner for CrawlerRunner {
    async fn collect(&self) -> Result<Vec<JoinedListing>, ScrapeError> {
        self.crawler.collect(self.cutoff).await
    }
}

struct WarehouseLoadRunner {
    loader: Loader<PgWarehouse>,
}

#[async_trait]
impl LoadRunner for WarehouseLoadRunner {
    async fn execute(&self) -> RunReport {
        self.loader.execute().await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub scraper: Arc<dyn ScrapeRunner>,
    pub loader: Arc<dyn LoadRunner>,
    pub markers: Arc<MarkerStore>,
    pub bucket: ObjectStore,
}

impl AppState {
    pub async fn from_env() -> anyhow::Result<Self> {
        let scrape_config = ScrapeConfig::from_env()?;
        let load_config = LoadConfig::from_env()?;

        let bucket = load_config.bucket_store();
        let markers = Arc::new(MarkerStore::new(load_config.bucket_store()));

        let fetcher = PageFetcher::new(FetcherConfig {
            base_url: scrape_config.base_url.clone(),
            ..FetcherConfig::default()
        })?;
        let crawler = Crawler::new(fetcher).with_pacing(scrape_config.pacing);

        let warehouse = PgWarehouse::connect(&load_config.database_url).await?;
        let loader = Loader::new(load_config, bucket.clone(), warehouse);

        Ok(Self {
            scraper: Arc::new(CrawlerRunner {
                crawler,
                cutoff: scrape_config.cutoff_date,
            }),
            loader: Arc::new(WarehouseLoadRunner { loader }),
            markers,
            bucket,
        })
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/scrape", post(scrape_handler))
        .route("/load", post(load_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let state = AppState::from_env().await?;
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving trigger entrypoints");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn scrape_handler(State(state): State<AppState>, body: Bytes) -> Json<RunReport> {
    let Some(envelope) = validate_push_envelope(&body) else {
        // Acknowledge foreign payloads so the delivery system stops
        // retrying them.
        return Json(RunReport::invalid("not a daily_scraping trigger"));
    };
    let message_id = envelope.message.message_id;

    if state.markers.is_processed(&message_id).await {
        info!(%message_id, "duplicate trigger, skipping");
        return Json(RunReport::skipped(format!(
            "message {message_id} already processed"
        )));
    }

    let rows = match state.scraper.collect().await {
        Ok(rows) => rows,
        Err(err) => {
            let message = format!("Error during scraping: {err}");
            error!("{message}");
            return Json(RunReport::error(message));
        }
    };

    let landed = match land_jobs_csv(&state.bucket, &rows, today_jst()).await {
        Ok(key) => key,
        Err(err) => {
            let message = format!("Error landing scraped data: {err}");
            error!("{message}");
            return Json(RunReport::error(message));
        }
    };

    let metadata = json!({ "job_count": rows.len(), "object": landed });
    match state.markers.mark_processed(&message_id, metadata).await {
        Ok(()) => Json(RunReport::success(format!("scraped {} jobs", rows.len()))),
        Err(err) => {
            // The batch is already landed; a lost marker means a future
            // redelivery will redo the (idempotent) work.
            let message = format!("scrape committed but marker write failed: {err}");
            error!("{message}");
            Json(RunReport::critical_error(message))
        }
    }
}

async fn load_handler(State(state): State<AppState>) -> Json<RunReport> {
    Json(state.loader.execute().await)
}
