//! Collection pass orchestration: aggregate, insert the delta, complete
//! reference descriptions and optionally draft responses.

pub mod config;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use govbiz_adapters::{
    AggregateError, ApiDescriptionClient, CategoryAggregator, CategoryFailure, CompletionFallback,
    RenderEngine, SamGovSource, StaticHtmlEngine, WebDriverEngine,
};
use govbiz_core::{DateWindow, FailureReason, OpportunityRecord};
use govbiz_storage::{HttpFetcher, OpportunityStore, StoreError, StoreSummary};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{parse_code_list, CollectorConfig, FallbackSettings};

pub const CRATE_NAME: &str = "govbiz-sync";

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("invalid collection request: {0}")]
    Request(#[from] AggregateError),
    #[error("store failure aborted the pass: {0}")]
    Store(#[from] StoreError),
}

/// Drafts a response for an opportunity from its description text.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, record: &OpportunityRecord, description: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub solicitations_only: bool,
    pub pass_timeout: Option<Duration>,
    pub max_responses: usize,
    pub response_timeout: Duration,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            solicitations_only: false,
            pass_timeout: None,
            max_responses: 5,
            response_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub notice_id: String,
    pub url: String,
    pub reason: FailureReason,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseFailure {
    pub notice_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedResponse {
    pub notice_id: String,
    pub text: String,
}

/// Outcome of one pass. `new_records` is the delta: records first inserted
/// by this pass, enriched where completion succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub run_id: Uuid,
    pub window: DateWindow,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub new_records: Vec<OpportunityRecord>,
    pub fetched_total: usize,
    pub unique_candidates: usize,
    pub already_collected: usize,
    pub skipped_non_solicitation: usize,
    pub skipped_without_id: usize,
    pub category_failures: Vec<CategoryFailure>,
    pub fallback_failures: Vec<RecordFailure>,
    pub response_failures: Vec<ResponseFailure>,
    pub responses: Vec<GeneratedResponse>,
    pub timed_out: bool,
}

impl CollectionReport {
    fn new(run_id: Uuid, window: DateWindow) -> Self {
        Self {
            run_id,
            window,
            started_at: Utc::now(),
            finished_at: None,
            new_records: Vec::new(),
            fetched_total: 0,
            unique_candidates: 0,
            already_collected: 0,
            skipped_non_solicitation: 0,
            skipped_without_id: 0,
            category_failures: Vec::new(),
            fallback_failures: Vec::new(),
            response_failures: Vec::new(),
            responses: Vec::new(),
            timed_out: false,
        }
    }

    pub fn new_ids(&self) -> Vec<&str> {
        self.new_records.iter().map(|r| r.notice_id.as_str()).collect()
    }

    pub fn is_clean(&self) -> bool {
        !self.timed_out
            && self.category_failures.is_empty()
            && self.fallback_failures.is_empty()
            && self.response_failures.is_empty()
    }
}

pub struct Collector {
    aggregator: CategoryAggregator,
    store: Mutex<OpportunityStore>,
    fallback: Option<CompletionFallback>,
    responder: Option<Arc<dyn ResponseGenerator>>,
    options: CollectOptions,
}

impl Collector {
    pub fn new(aggregator: CategoryAggregator, store: OpportunityStore, options: CollectOptions) -> Self {
        Self {
            aggregator,
            store: Mutex::new(store),
            fallback: None,
            responder: None,
            options,
        }
    }

    /// Wires the SAM.gov source, the store and (when enabled) the completion
    /// fallback from one configuration.
    pub async fn from_config(config: &CollectorConfig) -> Result<Self> {
        let http = Arc::new(
            HttpFetcher::new(config.http_client_config()).context("building http client")?,
        );
        let source = SamGovSource::new(config.sam_gov_config()?, http.clone());
        let aggregator = CategoryAggregator::new(Arc::new(source), config.aggregator_config());
        let store = OpportunityStore::open(&config.storage_path)
            .await
            .with_context(|| format!("opening store {}", config.storage_path.display()))?;

        let mut collector = Self::new(aggregator, store, config.collect_options());
        if config.fallback.enabled {
            let engine: Arc<dyn RenderEngine> = match config.webdriver_config() {
                Some(webdriver) => {
                    Arc::new(WebDriverEngine::new(webdriver).context("building webdriver engine")?)
                }
                None => Arc::new(StaticHtmlEngine::new(http.clone(), config.poll_interval())),
            };
            info!(engine = engine.engine_id(), "completion fallback enabled");

            let mut fallback = CompletionFallback::new(engine, config.fallback_config());
            if config.fallback.try_api_description {
                if let Some(api_key) = &config.api_key {
                    fallback = fallback
                        .with_api_descriptions(ApiDescriptionClient::new(http.clone(), api_key.clone()));
                }
            }
            collector = collector.with_fallback(fallback);
        }
        Ok(collector)
    }

    pub fn with_fallback(mut self, fallback: CompletionFallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_response_generator(mut self, responder: Arc<dyn ResponseGenerator>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub async fn summary(&self) -> StoreSummary {
        self.store.lock().await.summary()
    }

    pub async fn stored_records(&self) -> Vec<OpportunityRecord> {
        self.store.lock().await.all().cloned().collect()
    }

    pub async fn collect_recent(
        &self,
        days_back: u32,
        categories: &[String],
    ) -> Result<CollectionReport, CollectError> {
        self.collect(DateWindow::days_back(Utc::now(), days_back), categories)
            .await
    }

    /// Runs one pass. Category and per-record failures are tallied in the
    /// report; only invalid requests and store I/O failures are errors.
    pub async fn collect(
        &self,
        window: DateWindow,
        categories: &[String],
    ) -> Result<CollectionReport, CollectError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("collect", %run_id, window = %window);
        async move {
            let mut store = self.store.lock().await;
            let mut report = CollectionReport::new(run_id, window);
            let deadline = self.options.pass_timeout.map(|limit| Instant::now() + limit);

            self.run_pass(&mut store, &window, categories, deadline, &mut report)
                .await?;
            if report.timed_out {
                warn!("pass deadline reached; keeping committed records");
            }

            report.finished_at = Some(Utc::now());
            info!(
                new = report.new_records.len(),
                already_collected = report.already_collected,
                category_failures = report.category_failures.len(),
                fallback_failures = report.fallback_failures.len(),
                timed_out = report.timed_out,
                "collection pass finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// The deadline bounds aggregation, completion and response drafting.
    /// Inserting candidates is never cut short, so every record this pass
    /// commits is also in its delta.
    async fn run_pass(
        &self,
        store: &mut OpportunityStore,
        window: &DateWindow,
        categories: &[String],
        deadline: Option<Instant>,
        report: &mut CollectionReport,
    ) -> Result<(), CollectError> {
        let aggregated = before(deadline, self.aggregator.aggregate(window, categories)).await;
        let Some(outcome) = aggregated else {
            report.timed_out = true;
            return Ok(());
        };
        let outcome = outcome?;
        report.fetched_total = outcome.fetched_total;
        report.skipped_without_id = outcome.skipped_without_id;
        report.unique_candidates = outcome.records.len();
        report.category_failures = outcome.failures;

        for record in outcome.records {
            if self.options.solicitations_only && !record.is_solicitation() {
                report.skipped_non_solicitation += 1;
                continue;
            }
            if store.insert_if_absent(record.clone()).await? {
                report.new_records.push(record);
            } else {
                report.already_collected += 1;
            }
        }
        info!(
            candidates = report.unique_candidates,
            new = report.new_records.len(),
            "candidates committed"
        );

        if let Some(fallback) = &self.fallback {
            let completed = before(deadline, self.complete_new_records(fallback, store, report)).await;
            match completed {
                Some(result) => result?,
                None => {
                    report.timed_out = true;
                    return Ok(());
                }
            }
        }
        if let Some(responder) = &self.responder {
            let drafted = before(deadline, self.generate_responses(responder.as_ref(), report)).await;
            if drafted.is_none() {
                report.timed_out = true;
            }
        }
        Ok(())
    }

    /// Enriches each new reference-description record as its completion
    /// finishes, so a deadline keeps everything already written back.
    async fn complete_new_records(
        &self,
        fallback: &CompletionFallback,
        store: &mut OpportunityStore,
        report: &mut CollectionReport,
    ) -> Result<(), CollectError> {
        let candidates: Vec<(usize, OpportunityRecord)> = report
            .new_records
            .iter()
            .enumerate()
            .filter(|(_, record)| record.needs_completion())
            .map(|(index, record)| (index, record.clone()))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        info!(candidates = candidates.len(), "completing reference descriptions");

        let mut pending: FuturesUnordered<_> = candidates
            .iter()
            .map(|(index, record)| async move { (*index, fallback.complete(record).await) })
            .collect();

        while let Some((index, result)) = pending.next().await {
            let notice_id = report.new_records[index].notice_id.clone();
            if result.success {
                store
                    .enrich(&notice_id, result.description_opt(), result.documents_opt())
                    .await?;
                if let Some(updated) = store.get(&notice_id) {
                    report.new_records[index] = updated.clone();
                }
            } else {
                report.fallback_failures.push(RecordFailure {
                    notice_id,
                    url: result.url,
                    reason: result.failure.unwrap_or(FailureReason::NoContentFound),
                    attempts: result.attempts,
                });
            }
        }
        Ok(())
    }

    async fn generate_responses(&self, responder: &dyn ResponseGenerator, report: &mut CollectionReport) {
        let limit = self.options.response_timeout;
        let mut attempted = 0usize;
        for record in &report.new_records {
            if attempted >= self.options.max_responses {
                break;
            }
            let Some(text) = record.description_text() else {
                continue;
            };
            attempted += 1;

            match tokio::time::timeout(limit, responder.generate(record, text)).await {
                Ok(Ok(response)) => report.responses.push(GeneratedResponse {
                    notice_id: record.notice_id.clone(),
                    text: response,
                }),
                Ok(Err(err)) => {
                    warn!(notice_id = %record.notice_id, error = %err, "response generation failed");
                    report.response_failures.push(ResponseFailure {
                        notice_id: record.notice_id.clone(),
                        message: err.to_string(),
                    });
                }
                Err(_) => {
                    warn!(notice_id = %record.notice_id, "response generation timed out");
                    report.response_failures.push(ResponseFailure {
                        notice_id: record.notice_id.clone(),
                        message: format!("timed out after {}s", limit.as_secs()),
                    });
                }
            }
        }
    }
}

/// Runs `stage` to completion, or until `deadline` when one is set.
async fn before<F: Future>(deadline: Option<Instant>, stage: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, stage).await.ok(),
        None => Some(stage.await),
    }
}

/// Writes `<reports_dir>/<run_id>/collection_report.json`.
pub async fn write_report(reports_dir: &Path, report: &CollectionReport) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("collection_report.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing collection report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
