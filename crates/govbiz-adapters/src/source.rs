//! Paginated opportunity source and the SAM.gov search API client.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use govbiz_core::{DateWindow, Description, DocumentRef, OpportunityRecord};
use govbiz_storage::{FetchError, HttpFetcher, RetryDisposition};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Opaque continuation token handed back by a source page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageToken(pub String);

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page request: a single category code over a posted-date window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    pub window: DateWindow,
    pub category_code: String,
    pub page_token: Option<PageToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourcePage {
    pub records: Vec<OpportunityRecord>,
    /// Source records dropped because they carried no notice id.
    pub skipped_without_id: usize,
    pub next: Option<PageToken>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding source response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid page token {0:?}")]
    InvalidToken(String),
    #[error("source temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("source rejected query: {0}")]
    Rejected(String),
}

impl SourceError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Fetch(err) => err.disposition(),
            Self::Unavailable(_) => RetryDisposition::Retryable,
            Self::Decode(_) | Self::InvalidToken(_) | Self::Rejected(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

/// A listing API filtered by exactly one category code per query.
#[async_trait]
pub trait OpportunitySource: Send + Sync {
    fn source_id(&self) -> &'static str;
    async fn fetch_page(&self, query: &SourceQuery) -> Result<SourcePage, SourceError>;
}

#[derive(Clone)]
pub struct SamGovConfig {
    pub base_url: String,
    pub api_key: String,
    pub page_limit: u32,
}

impl SamGovConfig {
    pub const PRODUCTION_URL: &'static str = "https://api.sam.gov/opportunities/v2/search";
    pub const ALPHA_URL: &'static str = "https://api-alpha.sam.gov/opportunities/v2/search";
    pub const MAX_PAGE_LIMIT: u32 = 1000;

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: Self::PRODUCTION_URL.to_string(),
            api_key: api_key.into(),
            page_limit: Self::MAX_PAGE_LIMIT,
        }
    }

    pub fn effective_page_limit(&self) -> u32 {
        self.page_limit.clamp(1, Self::MAX_PAGE_LIMIT)
    }
}

impl fmt::Debug for SamGovConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamGovConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("page_limit", &self.page_limit)
            .finish()
    }
}

#[derive(Debug)]
pub struct SamGovSource {
    config: SamGovConfig,
    http: Arc<HttpFetcher>,
}

impl SamGovSource {
    pub fn new(config: SamGovConfig, http: Arc<HttpFetcher>) -> Self {
        Self { config, http }
    }

    fn offset_of(token: Option<&PageToken>) -> Result<u64, SourceError> {
        match token {
            None => Ok(0),
            Some(token) => token
                .0
                .parse::<u64>()
                .map_err(|_| SourceError::InvalidToken(token.0.clone())),
        }
    }
}

#[async_trait]
impl OpportunitySource for SamGovSource {
    fn source_id(&self) -> &'static str {
        "sam_gov"
    }

    async fn fetch_page(&self, query: &SourceQuery) -> Result<SourcePage, SourceError> {
        let offset = Self::offset_of(query.page_token.as_ref())?;
        let limit = self.config.effective_page_limit();
        let params = [
            ("postedFrom", query.window.from.format("%m/%d/%Y").to_string()),
            ("postedTo", query.window.to.format("%m/%d/%Y").to_string()),
            ("ncode", query.category_code.clone()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ];
        let headers = [
            ("X-Api-Key", self.config.api_key.as_str()),
            ("Accept", "application/json"),
        ];

        let response = self
            .http
            .get(&self.config.base_url, &params, &headers)
            .await?;
        let mut page = parse_search_page(&response.body, offset, limit)?;
        for record in &mut page.records {
            record.category_codes.insert(query.category_code.clone());
        }
        debug!(
            code = %query.category_code,
            offset,
            records = page.records.len(),
            has_next = page.next.is_some(),
            "fetched search page"
        );
        Ok(page)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    total_records: u64,
    #[serde(default)]
    opportunities_data: Vec<RawOpportunity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOpportunity {
    notice_id: Option<String>,
    title: Option<String>,
    solicitation_number: Option<String>,
    full_parent_path_name: Option<String>,
    department: Option<String>,
    posted_date: Option<String>,
    #[serde(rename = "type")]
    opportunity_type: Option<String>,
    #[serde(rename = "responseDeadLine")]
    response_deadline: Option<String>,
    description: Option<String>,
    ui_link: Option<String>,
    #[serde(default)]
    resource_links: Option<Vec<String>>,
}

impl RawOpportunity {
    fn into_record(self) -> Option<OpportunityRecord> {
        let notice_id = self
            .notice_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())?;

        let mut record = OpportunityRecord::new(notice_id, self.title.unwrap_or_default().trim());
        record.solicitation_number = non_blank(self.solicitation_number);
        record.posted_at = timestamp_field("postedDate", self.posted_date.as_deref());
        record.response_deadline =
            timestamp_field("responseDeadLine", self.response_deadline.as_deref());
        record.opportunity_type = non_blank(self.opportunity_type);
        record.organization = non_blank(self.full_parent_path_name).or(non_blank(self.department));
        record.description = Description::classify(self.description.as_deref());
        record.ui_link = non_blank(self.ui_link);
        record.documents = self
            .resource_links
            .map(|links| {
                links
                    .into_iter()
                    .filter(|l| !l.trim().is_empty())
                    .map(|l| DocumentRef::from_url(l.trim()))
                    .collect::<Vec<_>>()
            })
            .filter(|docs| !docs.is_empty());
        record.refresh_flags();
        Some(record)
    }
}

fn timestamp_field(field: &str, raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    let parsed = parse_source_timestamp(raw);
    if parsed.is_none() && !raw.trim().is_empty() {
        debug!(field, raw, "unparseable timestamp dropped");
    }
    parsed
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Decodes one search page. The next token is the following offset while
/// the page was non-empty and records remain beyond it.
pub fn parse_search_page(body: &[u8], offset: u64, limit: u32) -> Result<SourcePage, SourceError> {
    let response: SearchResponse = serde_json::from_slice(body)?;
    let returned = response.opportunities_data.len();

    let mut page = SourcePage::default();
    for raw in response.opportunities_data {
        match raw.into_record() {
            Some(record) => page.records.push(record),
            None => page.skipped_without_id += 1,
        }
    }

    let next_offset = offset + u64::from(limit);
    if returned > 0 && next_offset < response.total_records {
        page.next = Some(PageToken(next_offset.to_string()));
    }
    Ok(page)
}

/// Accepts the timestamp shapes the listing API mixes: RFC 3339,
/// `YYYY-MM-DD HH:MM:SS±HH[:MM]`, and bare `YYYY-MM-DD` or `MM/DD/YYYY` dates.
pub fn parse_source_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%#z", "%Y-%m-%dT%H:%M:%S%#z", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(raw, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    ["%Y-%m-%d", "%m/%d/%Y"].iter().find_map(|format| {
        NaiveDate::parse_from_str(raw, format)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}
