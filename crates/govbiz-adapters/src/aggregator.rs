//! Fans a set of category codes out to one query each and unions the
//! results, giving OR semantics over a source that only ANDs its filters.

use std::sync::Arc;

use futures::future::join_all;
use govbiz_core::{DateWindow, OpportunityRecord};
use govbiz_storage::{retry_with_backoff, BackoffPolicy};
use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::source::{OpportunitySource, PageToken, SourceError, SourceQuery};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub max_categories: usize,
    pub max_window_days: i64,
    pub max_pages_per_query: usize,
    pub backoff: BackoffPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_categories: 3,
            max_window_days: 7,
            max_pages_per_query: 100,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("no category codes supplied")]
    NoCategories,
    #[error("{requested} category codes requested, at most {max} allowed")]
    TooManyCategories { requested: usize, max: usize },
    #[error("window {0} ends before it starts")]
    InvalidWindow(DateWindow),
    #[error("window spans {days} days, at most {max} allowed")]
    WindowTooLong { days: i64, max: i64 },
}

/// A category whose query exhausted its retries or hit a permanent error.
/// Pages it had already fetched are discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryFailure {
    pub code: String,
    pub message: String,
    pub pages_discarded: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateOutcome {
    /// Unique by notice id, in first-seen order across codes in request order.
    pub records: Vec<OpportunityRecord>,
    pub failures: Vec<CategoryFailure>,
    pub fetched_total: usize,
    pub skipped_without_id: usize,
}

impl AggregateOutcome {
    pub fn failed_codes(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.code.as_str())
    }
}

#[derive(Debug, Default)]
struct CategoryPages {
    records: Vec<OpportunityRecord>,
    skipped_without_id: usize,
}

pub struct CategoryAggregator {
    source: Arc<dyn OpportunitySource>,
    config: AggregatorConfig,
}

impl CategoryAggregator {
    pub fn new(source: Arc<dyn OpportunitySource>, config: AggregatorConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Validates the request and returns the distinct codes in request order.
    pub fn validate<'a>(
        &self,
        window: &DateWindow,
        categories: &'a [String],
    ) -> Result<Vec<&'a str>, AggregateError> {
        let mut codes: Vec<&str> = Vec::with_capacity(categories.len());
        for code in categories.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
        if codes.is_empty() {
            return Err(AggregateError::NoCategories);
        }
        if codes.len() > self.config.max_categories {
            return Err(AggregateError::TooManyCategories {
                requested: codes.len(),
                max: self.config.max_categories,
            });
        }
        if window.from > window.to {
            return Err(AggregateError::InvalidWindow(*window));
        }
        let days = window.span_days();
        if days > self.config.max_window_days {
            return Err(AggregateError::WindowTooLong {
                days,
                max: self.config.max_window_days,
            });
        }
        Ok(codes)
    }

    pub async fn aggregate(
        &self,
        window: &DateWindow,
        categories: &[String],
    ) -> Result<AggregateOutcome, AggregateError> {
        let codes = self.validate(window, categories)?;

        let results = join_all(codes.iter().map(|code| {
            let span = info_span!("category_query", source = self.source.source_id(), code);
            self.query_category(window, code).instrument(span)
        }))
        .await;

        let mut outcome = AggregateOutcome::default();
        let mut merged: IndexMap<String, OpportunityRecord> = IndexMap::new();
        for (code, result) in codes.iter().zip(results) {
            let pages = match result {
                Ok(pages) => pages,
                Err(failure) => {
                    outcome.failures.push(failure);
                    continue;
                }
            };
            outcome.fetched_total += pages.records.len();
            outcome.skipped_without_id += pages.skipped_without_id;
            for mut record in pages.records {
                match merged.get_mut(&record.notice_id) {
                    Some(existing) => {
                        existing.category_codes.insert((*code).to_string());
                    }
                    None => {
                        record.category_codes.insert((*code).to_string());
                        merged.insert(record.notice_id.clone(), record);
                    }
                }
            }
        }
        outcome.records = merged.into_values().collect();

        info!(
            window = %window,
            codes = codes.len(),
            fetched = outcome.fetched_total,
            unique = outcome.records.len(),
            failed_codes = outcome.failures.len(),
            "category aggregation finished"
        );
        Ok(outcome)
    }

    async fn query_category(
        &self,
        window: &DateWindow,
        code: &str,
    ) -> Result<CategoryPages, CategoryFailure> {
        let mut pages = CategoryPages::default();
        let mut token: Option<PageToken> = None;
        let mut fetched_pages = 0usize;

        loop {
            if fetched_pages >= self.config.max_pages_per_query {
                warn!(pages = fetched_pages, "page limit reached before the source ran dry");
                return Err(CategoryFailure {
                    code: code.to_string(),
                    message: format!(
                        "page limit of {} reached before pagination finished",
                        self.config.max_pages_per_query
                    ),
                    pages_discarded: fetched_pages,
                });
            }

            let query = SourceQuery {
                window: *window,
                category_code: code.to_string(),
                page_token: token.take(),
            };
            let page = retry_with_backoff(
                &self.config.backoff,
                |_| self.source.fetch_page(&query),
                SourceError::disposition,
            )
            .await
            .map_err(|err| {
                warn!(error = %err, pages = fetched_pages, "category query failed; discarding its pages");
                CategoryFailure {
                    code: code.to_string(),
                    message: err.to_string(),
                    pages_discarded: fetched_pages,
                }
            })?;

            fetched_pages += 1;
            pages.skipped_without_id += page.skipped_without_id;
            pages.records.extend(page.records);
            match page.next {
                Some(next) => token = Some(next),
                None => return Ok(pages),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourcePage;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::{BTreeSet, HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    type Script = VecDeque<Result<SourcePage, SourceError>>;

    /// Serves scripted pages per code; an exhausted script is a permanent error.
    struct ScriptedSource {
        scripts: Mutex<HashMap<String, Script>>,
        calls: Mutex<Vec<(String, Option<PageToken>)>>,
    }

    impl ScriptedSource {
        fn new(scripts: Vec<(&str, Vec<Result<SourcePage, SourceError>>)>) -> Self {
            Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|(code, pages)| (code.to_string(), pages.into_iter().collect()))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls_for(&self, code: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|(c, _)| c == code).count()
        }
    }

    #[async_trait]
    impl OpportunitySource for ScriptedSource {
        fn source_id(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_page(&self, query: &SourceQuery) -> Result<SourcePage, SourceError> {
            self.calls
                .lock()
                .unwrap()
                .push((query.category_code.clone(), query.page_token.clone()));
            self.scripts
                .lock()
                .unwrap()
                .get_mut(&query.category_code)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err(SourceError::Rejected("script exhausted".into())))
        }
    }

    fn page(ids: &[&str], next: Option<&str>) -> Result<SourcePage, SourceError> {
        Ok(SourcePage {
            records: ids.iter().map(|id| OpportunityRecord::new(*id, format!("title {id}"))).collect(),
            skipped_without_id: 0,
            next: next.map(|n| PageToken(n.to_string())),
        })
    }

    fn transient() -> Result<SourcePage, SourceError> {
        Err(SourceError::Unavailable("503 from upstream".into()))
    }

    fn window() -> DateWindow {
        DateWindow::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 8, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn fast_config() -> AggregatorConfig {
        AggregatorConfig {
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..AggregatorConfig::default()
        }
    }

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn follows_pagination_to_exhaustion() {
        let source = Arc::new(ScriptedSource::new(vec![(
            "541511",
            vec![page(&["a", "b"], Some("2")), page(&["c"], None)],
        )]));
        let aggregator = CategoryAggregator::new(source.clone(), fast_config());

        let outcome = aggregator.aggregate(&window(), &codes(&["541511"])).await.unwrap();
        let ids: Vec<_> = outcome.records.iter().map(|r| r.notice_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(outcome.fetched_total, 3);
        assert_eq!(source.calls_for("541511"), 2);
        assert_eq!(
            source.calls.lock().unwrap()[1].1,
            Some(PageToken("2".into()))
        );
    }

    #[tokio::test]
    async fn overlapping_codes_merge_into_one_record() {
        let source = Arc::new(ScriptedSource::new(vec![
            ("A", vec![page(&["x", "shared"], None)]),
            ("B", vec![page(&["shared", "y"], None)]),
        ]));
        let aggregator = CategoryAggregator::new(source, fast_config());

        let outcome = aggregator.aggregate(&window(), &codes(&["A", "B"])).await.unwrap();
        let ids: Vec<_> = outcome.records.iter().map(|r| r.notice_id.as_str()).collect();
        assert_eq!(ids, vec!["x", "shared", "y"]);
        let shared = outcome.records.iter().find(|r| r.notice_id == "shared").unwrap();
        assert_eq!(
            shared.category_codes,
            BTreeSet::from(["A".to_string(), "B".to_string()])
        );
        assert_eq!(outcome.fetched_total, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let source = Arc::new(ScriptedSource::new(vec![(
            "A",
            vec![transient(), page(&["a"], None)],
        )]));
        let aggregator = CategoryAggregator::new(source.clone(), fast_config());

        let outcome = aggregator.aggregate(&window(), &codes(&["A"])).await.unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(source.calls_for("A"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_category_is_isolated_and_its_pages_discarded() {
        let source = Arc::new(ScriptedSource::new(vec![
            (
                "A",
                vec![page(&["a1"], Some("1")), transient(), transient(), transient()],
            ),
            ("B", vec![page(&["b1"], None)]),
        ]));
        let aggregator = CategoryAggregator::new(source.clone(), fast_config());

        let outcome = aggregator.aggregate(&window(), &codes(&["A", "B"])).await.unwrap();
        let ids: Vec<_> = outcome.records.iter().map(|r| r.notice_id.as_str()).collect();
        assert_eq!(ids, vec!["b1"]);
        assert_eq!(outcome.failed_codes().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(outcome.failures[0].pages_discarded, 1);
        // first page, then one attempt plus two retries on the second
        assert_eq!(source.calls_for("A"), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let source = Arc::new(ScriptedSource::new(vec![("A", vec![])]));
        let aggregator = CategoryAggregator::new(source.clone(), fast_config());

        let outcome = aggregator.aggregate(&window(), &codes(&["A"])).await.unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(source.calls_for("A"), 1);
    }

    #[tokio::test]
    async fn page_limit_fails_the_category() {
        let source = Arc::new(ScriptedSource::new(vec![(
            "A",
            vec![page(&["a"], Some("1")), page(&["b"], Some("2")), page(&["c"], None)],
        )]));
        let config = AggregatorConfig {
            max_pages_per_query: 2,
            ..fast_config()
        };
        let aggregator = CategoryAggregator::new(source, config);

        let outcome = aggregator.aggregate(&window(), &codes(&["A"])).await.unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.failures[0].pages_discarded, 2);
    }

    #[test]
    fn validation_rejects_bad_requests() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let aggregator = CategoryAggregator::new(source, AggregatorConfig::default());

        assert_eq!(
            aggregator.validate(&window(), &codes(&[" ", ""])),
            Err(AggregateError::NoCategories)
        );
        assert_eq!(
            aggregator.validate(&window(), &codes(&["1", "2", "3", "4"])),
            Err(AggregateError::TooManyCategories { requested: 4, max: 3 })
        );
        let long = DateWindow::days_back(Utc.with_ymd_and_hms(2026, 3, 30, 0, 0, 0).unwrap(), 10);
        assert_eq!(
            aggregator.validate(&long, &codes(&["1"])),
            Err(AggregateError::WindowTooLong { days: 10, max: 7 })
        );
        let inverted = DateWindow {
            from: window().to,
            to: window().from,
        };
        assert_eq!(
            aggregator.validate(&inverted, &codes(&["1"])),
            Err(AggregateError::InvalidWindow(inverted))
        );
        assert_eq!(
            aggregator.validate(&window(), &codes(&["1", "2", "1"])).unwrap(),
            vec!["1", "2"]
        );
    }
}
