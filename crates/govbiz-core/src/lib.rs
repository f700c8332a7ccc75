//! Core domain model for govbiz: opportunity records, description
//! classification, collection windows and scrape results.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "govbiz-core";

/// Public origin for opportunity view pages.
pub const PUBLIC_VIEW_ORIGIN: &str = "https://sam.gov";

/// Opportunity type substring that marks a solicitation notice.
pub const SOLICITATION_TYPE_MARKER: &str = "Solicitation";

/// Source-provided description, classified once at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Description {
    Inline(String),
    Reference(String),
    #[default]
    Missing,
}

impl Description {
    pub fn classify(raw: Option<&str>) -> Self {
        let Some(text) = raw.map(str::trim).filter(|t| !t.is_empty()) else {
            return Self::Missing;
        };
        if looks_like_reference(text) {
            Self::Reference(text.to_string())
        } else {
            Self::Inline(text.to_string())
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference(_))
    }

    pub fn inline_text(&self) -> Option<&str> {
        match self {
            Self::Inline(text) => Some(text),
            _ => None,
        }
    }

    pub fn reference_url(&self) -> Option<&str> {
        match self {
            Self::Reference(url) => Some(url),
            _ => None,
        }
    }
}

/// A reference is a single absolute http(s) URL with no surrounding prose.
pub fn looks_like_reference(text: &str) -> bool {
    let text = text.trim();
    if text.is_empty() || text.chars().any(char::is_whitespace) {
        return false;
    }
    Url::parse(text)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}

/// Rewrites a workspace-internal view URL to its public equivalent.
///
/// `https://sam.gov/workspace/contract/opp/<id>/view` becomes
/// `https://sam.gov/opp/<id>/view`. Anything else is returned unchanged.
pub fn to_public_view_url(url: &str) -> String {
    let Some(workspace_at) = url.find("/workspace/") else {
        return url.to_string();
    };
    let Some(opp_offset) = url[workspace_at..].find("/opp/") else {
        return url.to_string();
    };
    format!("{}{}", &url[..workspace_at], &url[workspace_at + opp_offset..])
}

/// The v1 description endpoint is retired; v2 serves the same path shape.
pub fn api_description_url(reference: &str) -> String {
    reference.replace("/opportunities/v1/", "/opportunities/v2/")
}

pub fn default_public_view_url(notice_id: &str) -> String {
    format!("{PUBLIC_VIEW_ORIGIN}/opp/{notice_id}/view")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub name: String,
    pub url: String,
}

impl DocumentRef {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// Names the document after the last non-empty path segment of its URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let name = Url::parse(&url)
            .ok()
            .and_then(|parsed| {
                parsed
                    .path_segments()
                    .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| url.clone());
        Self { name, url }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFlag {
    DeadlineBeforePosted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub notice_id: String,
    pub title: String,
    pub solicitation_number: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub category_codes: BTreeSet<String>,
    pub opportunity_type: Option<String>,
    pub organization: Option<String>,
    pub description: Description,
    #[serde(default)]
    pub recovered_description: Option<String>,
    pub ui_link: Option<String>,
    #[serde(default)]
    pub documents: Option<Vec<DocumentRef>>,
    #[serde(default)]
    pub flags: Vec<RecordFlag>,
}

impl OpportunityRecord {
    pub fn new(notice_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            notice_id: notice_id.into(),
            title: title.into(),
            solicitation_number: None,
            posted_at: None,
            response_deadline: None,
            category_codes: BTreeSet::new(),
            opportunity_type: None,
            organization: None,
            description: Description::Missing,
            recovered_description: None,
            ui_link: None,
            documents: None,
            flags: Vec::new(),
        }
    }

    /// Recomputes derived flags. Violations are recorded, never rejected.
    pub fn refresh_flags(&mut self) {
        self.flags.retain(|f| *f != RecordFlag::DeadlineBeforePosted);
        if let (Some(posted), Some(deadline)) = (self.posted_at, self.response_deadline) {
            if deadline < posted {
                self.flags.push(RecordFlag::DeadlineBeforePosted);
            }
        }
    }

    pub fn has_flag(&self, flag: RecordFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Inline source text, else the text recovered by the completion fallback.
    pub fn description_text(&self) -> Option<&str> {
        self.description
            .inline_text()
            .or(self.recovered_description.as_deref())
    }

    pub fn needs_completion(&self) -> bool {
        self.description.is_reference() && self.recovered_description.is_none()
    }

    pub fn public_view_url(&self) -> String {
        match self.ui_link.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            Some(link) => to_public_view_url(link),
            None => default_public_view_url(&self.notice_id),
        }
    }

    pub fn is_solicitation(&self) -> bool {
        self.opportunity_type
            .as_deref()
            .is_some_and(|t| t.contains(SOLICITATION_TYPE_MARKER))
    }

    pub fn matches_category(&self, code: &str) -> bool {
        self.category_codes.contains(code)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("window start {from} is after window end {to}")]
    Inverted {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

/// Inclusive posted-date window for a collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, WindowError> {
        if from > to {
            return Err(WindowError::Inverted { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn days_back(now: DateTime<Utc>, days: u32) -> Self {
        Self {
            from: now - Duration::days(i64::from(days)),
            to: now,
        }
    }

    /// Whole calendar days spanned, rounding partial days up.
    pub fn span_days(&self) -> i64 {
        let span = self.to - self.from;
        let days = span.num_days();
        if span > Duration::days(days) {
            days + 1
        } else {
            days
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from <= ts && ts <= self.to
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from.to_rfc3339(), self.to.to_rfc3339())
    }
}

/// Why a completion attempt produced no usable content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RenderTimeout,
    NoContentFound,
    NavigationError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RenderTimeout => "render_timeout",
            Self::NoContentFound => "no_content_found",
            Self::NavigationError => "navigation_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral output of one completion run; consumed to enrich a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub url: String,
    pub description: String,
    pub documents: Vec<DocumentRef>,
    pub success: bool,
    pub failure: Option<FailureReason>,
    pub attempts: u32,
}

impl ScrapeResult {
    pub fn succeeded(
        url: impl Into<String>,
        description: String,
        documents: Vec<DocumentRef>,
        attempts: u32,
    ) -> Self {
        Self {
            url: url.into(),
            description,
            documents,
            success: true,
            failure: None,
            attempts,
        }
    }

    pub fn failed(url: impl Into<String>, reason: FailureReason, attempts: u32) -> Self {
        Self {
            url: url.into(),
            description: String::new(),
            documents: Vec::new(),
            success: false,
            failure: Some(reason),
            attempts,
        }
    }

    pub fn description_opt(&self) -> Option<&str> {
        Some(self.description.trim()).filter(|d| !d.is_empty())
    }

    pub fn documents_opt(&self) -> Option<&[DocumentRef]> {
        Some(self.documents.as_slice()).filter(|d| !d.is_empty())
    }
}
