//! Completion fallback: recovers descriptions and attachment links for
//! records whose source description is only a reference URL.
//!
//! Each attempt walks `Idle -> Navigating -> Rendered -> Extracting` and ends
//! in `Succeeded` or `Failed(reason)`. Only `render_timeout` is retried, once
//! by default. Every attempt opens its own page session and closes it before
//! returning; concurrent attempts are bounded by a semaphore.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use govbiz_core::{api_description_url, DocumentRef, FailureReason, OpportunityRecord, ScrapeResult};
use govbiz_storage::HttpFetcher;
use scraper::Html;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use crate::render::{AnchorLink, PageSession, RenderEngine, RenderError};

pub const CONTENT_MARKERS: [&str; 5] = [
    r#"[data-test="opportunity-description"]"#,
    ".opportunity-description",
    r#"[class*="description-content"]"#,
    r#"div[class*="Description"]"#,
    r#"section[aria-label*="Description"]"#,
];

pub const ATTACHMENT_EXTENSIONS: [&str; 7] = [".pdf", ".doc", ".docx", ".xls", ".xlsx", ".zip", ".txt"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionSelector {
    pub selector: String,
    pub min_chars: usize,
}

impl DescriptionSelector {
    pub fn new(selector: impl Into<String>, min_chars: usize) -> Self {
        Self {
            selector: selector.into(),
            min_chars,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub render_timeout: Duration,
    pub timeout_retries: u32,
    pub max_concurrency: usize,
    pub content_markers: Vec<String>,
    pub description_selectors: Vec<DescriptionSelector>,
    pub attachment_extensions: Vec<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        let mut description_selectors: Vec<_> = CONTENT_MARKERS
            .iter()
            .map(|marker| DescriptionSelector::new(*marker, 100))
            .collect();
        description_selectors.push(DescriptionSelector::new(
            r#"div[class*="opportunity-content"]"#,
            100,
        ));
        description_selectors.push(DescriptionSelector::new("main", 200));
        description_selectors.push(DescriptionSelector::new(r#"[role="main"]"#, 200));

        Self {
            render_timeout: Duration::from_secs(30),
            timeout_retries: 1,
            max_concurrency: 3,
            content_markers: CONTENT_MARKERS.iter().map(ToString::to_string).collect(),
            description_selectors,
            attachment_extensions: ATTACHMENT_EXTENSIONS.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    Idle,
    Navigating,
    Rendered,
    Extracting,
    Succeeded,
    Failed(FailureReason),
}

impl fmt::Display for FallbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Navigating => f.write_str("navigating"),
            Self::Rendered => f.write_str("rendered"),
            Self::Extracting => f.write_str("extracting"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

fn advance(state: &mut FallbackState, next: FallbackState) {
    debug!(from = %state, to = %next, "fallback transition");
    *state = next;
}

fn reason_for(url: &str, err: &RenderError) -> FailureReason {
    match err {
        RenderError::Timeout(_) => FailureReason::RenderTimeout,
        RenderError::Blocked { status, .. } => {
            warn!(%url, status, "page navigation blocked; needs operator review");
            FailureReason::NavigationError
        }
        RenderError::Navigation { .. } | RenderError::Protocol(_) => {
            warn!(%url, error = %err, "page navigation failed");
            FailureReason::NavigationError
        }
    }
}

/// Fetches reference descriptions straight from the API before any page is rendered.
#[derive(Debug, Clone)]
pub struct ApiDescriptionClient {
    http: Arc<HttpFetcher>,
    api_key: String,
}

impl ApiDescriptionClient {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
        }
    }

    /// Any failure yields `None`; the caller falls through to rendering.
    pub async fn fetch(&self, reference: &str) -> Option<String> {
        let url = api_description_url(reference);
        match self.http.get(&url, &[], &[("X-Api-Key", self.api_key.as_str())]).await {
            Ok(response) => {
                let text = description_body_text(&response.text());
                if text.is_none() {
                    debug!(%url, "api description body was empty");
                }
                text
            }
            Err(err) => {
                debug!(%url, error = %err, "api description unavailable; rendering page instead");
                None
            }
        }
    }
}

/// Accepts a JSON `{"description": ...}` body, an HTML fragment or plain text.
pub fn description_body_text(body: &str) -> Option<String> {
    let body = body.trim();
    let text = if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(body) {
        map.get("description")
            .and_then(serde_json::Value::as_str)
            .map(|inner| strip_markup(inner.trim()))
            .unwrap_or_default()
    } else {
        strip_markup(body)
    };
    Some(text.trim().to_string()).filter(|t| !t.is_empty())
}

const LINE_BREAKING: [&str; 13] = [
    "br", "p", "div", "li", "ul", "ol", "tr", "h1", "h2", "h3", "h4", "section", "table",
];

/// Text of an HTML fragment with entities decoded. Block elements and `<br>`
/// start new lines; whitespace inside a line is collapsed.
fn strip_markup(text: &str) -> String {
    let fragment = Html::parse_fragment(text);
    let mut flat = String::with_capacity(text.len());
    for node in fragment.root_element().descendants() {
        if let Some(text) = node.value().as_text() {
            let in_script = node
                .parent()
                .and_then(|parent| parent.value().as_element().map(|el| el.name()))
                .is_some_and(|name| name == "script" || name == "style");
            if !in_script {
                flat.push_str(text);
            }
        } else if node
            .value()
            .as_element()
            .is_some_and(|el| LINE_BREAKING.contains(&el.name()))
        {
            flat.push('\n');
        }
    }
    flat.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolves `href` against the page, keeping only http(s) targets.
pub fn resolve_href(page_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let resolved = match Url::parse(href) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(page_url).ok()?.join(href).ok()?,
        Err(_) => return None,
    };
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

pub fn is_attachment_url(url: &str, extensions: &[String]) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let path = parsed.path().to_ascii_lowercase();
    path.contains("/download")
        || path.contains("/resources/files/")
        || extensions
            .iter()
            .any(|ext| path.ends_with(&ext.to_ascii_lowercase()))
}

/// Attachment links on the page, de-duplicated by resolved target.
pub fn collect_documents(page_url: &str, anchors: &[AnchorLink], extensions: &[String]) -> Vec<DocumentRef> {
    let mut seen = HashSet::new();
    anchors
        .iter()
        .filter_map(|anchor| {
            let target = resolve_href(page_url, &anchor.href)?;
            if !is_attachment_url(&target, extensions) || !seen.insert(target.clone()) {
                return None;
            }
            let name = anchor.text.trim();
            Some(if name.is_empty() {
                DocumentRef::from_url(target)
            } else {
                DocumentRef::new(name, target)
            })
        })
        .collect()
}

/// Owns an attempt's session. Closed in place on the normal path; if the
/// attempt is dropped first (deadline, cancellation) the close runs on a
/// background task.
struct SessionGuard(Option<Box<dyn PageSession>>);

impl SessionGuard {
    async fn close(mut self) {
        if let Some(mut session) = self.0.take() {
            session.close().await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(mut session) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("attempt dropped mid-flight; closing its session in the background");
                handle.spawn(async move { session.close().await });
            }
            Err(_) => warn!("attempt dropped outside a runtime; session left to the engine"),
        }
    }
}

pub struct CompletionFallback {
    engine: Arc<dyn RenderEngine>,
    config: FallbackConfig,
    sessions: Arc<Semaphore>,
    api: Option<ApiDescriptionClient>,
}

impl CompletionFallback {
    pub fn new(engine: Arc<dyn RenderEngine>, config: FallbackConfig) -> Self {
        let sessions = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            engine,
            config,
            sessions,
            api: None,
        }
    }

    pub fn with_api_descriptions(mut self, client: ApiDescriptionClient) -> Self {
        self.api = Some(client);
        self
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Runs the fallback for every record concurrently; results keep input order.
    pub async fn complete_all(&self, records: &[OpportunityRecord]) -> Vec<ScrapeResult> {
        join_all(records.iter().map(|record| self.complete(record))).await
    }

    pub async fn complete(&self, record: &OpportunityRecord) -> ScrapeResult {
        let span = info_span!("completion", notice_id = %record.notice_id);
        self.complete_inner(record).instrument(span).await
    }

    async fn complete_inner(&self, record: &OpportunityRecord) -> ScrapeResult {
        if let (Some(api), Some(reference)) = (&self.api, record.description.reference_url()) {
            if let Some(text) = api.fetch(reference).await {
                info!(chars = text.len(), "description recovered from api");
                return ScrapeResult::succeeded(api_description_url(reference), text, Vec::new(), 0);
            }
        }

        let url = record.public_view_url();
        let max_attempts = 1 + self.config.timeout_retries;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = {
                let _permit = self
                    .sessions
                    .acquire()
                    .await
                    .expect("session semaphore is never closed");
                self.render_attempt(&url).await
            };
            match outcome {
                Ok((description, documents)) => {
                    info!(%url, attempt, documents = documents.len(), "page completion succeeded");
                    return ScrapeResult::succeeded(url, description, documents, attempt);
                }
                Err(FailureReason::RenderTimeout) if attempt < max_attempts => {
                    warn!(%url, attempt, "render timed out; retrying with a fresh session");
                }
                Err(reason) => {
                    warn!(%url, attempt, %reason, "page completion failed");
                    return ScrapeResult::failed(url, reason, attempt);
                }
            }
        }
    }

    async fn render_attempt(&self, url: &str) -> Result<(String, Vec<DocumentRef>), FailureReason> {
        let mut state = FallbackState::Idle;
        let session = self
            .engine
            .open_session()
            .await
            .map_err(|err| reason_for(url, &err))?;

        let mut guard = SessionGuard(Some(session));
        let result = match guard.0.as_deref_mut() {
            Some(session) => self.drive(session, url, &mut state).await,
            None => Err(FailureReason::NavigationError),
        };
        guard.close().await;

        let terminal = match &result {
            Ok(_) => FallbackState::Succeeded,
            Err(reason) => FallbackState::Failed(*reason),
        };
        advance(&mut state, terminal);
        result
    }

    async fn drive(
        &self,
        session: &mut dyn PageSession,
        url: &str,
        state: &mut FallbackState,
    ) -> Result<(String, Vec<DocumentRef>), FailureReason> {
        advance(state, FallbackState::Navigating);
        session.navigate(url).await.map_err(|err| reason_for(url, &err))?;

        let markers: Vec<&str> = self.config.content_markers.iter().map(String::as_str).collect();
        let timeout = self.config.render_timeout;
        let marker = match tokio::time::timeout(timeout, session.wait_for_any(&markers, timeout)).await {
            Err(_) => return Err(FailureReason::RenderTimeout),
            Ok(Err(err)) => return Err(reason_for(url, &err)),
            Ok(Ok(marker)) => marker,
        };
        debug!(%marker, "content marker present");
        advance(state, FallbackState::Rendered);

        advance(state, FallbackState::Extracting);
        let description = self
            .extract_description(session)
            .await
            .map_err(|err| reason_for(url, &err))?;
        let page_url = session.current_url().unwrap_or(url).to_string();
        let anchors = session.anchors().await.map_err(|err| reason_for(url, &err))?;
        let documents = collect_documents(&page_url, &anchors, &self.config.attachment_extensions);

        match description {
            None if documents.is_empty() => Err(FailureReason::NoContentFound),
            description => Ok((description.unwrap_or_default(), documents)),
        }
    }

    async fn extract_description(
        &self,
        session: &mut dyn PageSession,
    ) -> Result<Option<String>, RenderError> {
        for candidate in &self.config.description_selectors {
            let texts = session.text_of(&candidate.selector).await?;
            let found = texts
                .into_iter()
                .map(|text| text.trim().to_string())
                .find(|text| text.chars().count() >= candidate.min_chars);
            if let Some(text) = found {
                debug!(selector = %candidate.selector, chars = text.len(), "description located");
                return Ok(Some(text));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use govbiz_core::Description;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct PageScript {
        wait: Option<Result<String, String>>,
        texts: HashMap<String, Vec<String>>,
        anchors: Vec<AnchorLink>,
        navigation_error: bool,
    }

    /// Hands out sessions that replay one script per attempt.
    #[derive(Default)]
    struct ScriptedEngine {
        scripts: Mutex<VecDeque<PageScript>>,
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
        live: Arc<AtomicUsize>,
        max_live: Arc<AtomicUsize>,
        visited: Arc<Mutex<Vec<String>>>,
        hold: Duration,
    }

    impl ScriptedEngine {
        fn with_scripts(scripts: Vec<PageScript>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl RenderEngine for ScriptedEngine {
        fn engine_id(&self) -> &'static str {
            "scripted"
        }

        async fn open_session(&self) -> Result<Box<dyn PageSession>, RenderError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedSession {
                script,
                url: None,
                hold: self.hold,
                closed: self.closed.clone(),
                live: self.live.clone(),
                visited: self.visited.clone(),
            }))
        }
    }

    struct ScriptedSession {
        script: PageScript,
        url: Option<String>,
        hold: Duration,
        closed: Arc<AtomicUsize>,
        live: Arc<AtomicUsize>,
        visited: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PageSession for ScriptedSession {
        async fn navigate(&mut self, url: &str) -> Result<(), RenderError> {
            self.visited.lock().unwrap().push(url.to_string());
            if self.script.navigation_error {
                return Err(RenderError::Navigation {
                    url: url.to_string(),
                    message: "connection refused".into(),
                });
            }
            self.url = Some(url.to_string());
            Ok(())
        }

        async fn wait_for_any(
            &mut self,
            _selectors: &[&str],
            timeout: Duration,
        ) -> Result<String, RenderError> {
            tokio::time::sleep(self.hold).await;
            match self.script.wait.clone() {
                Some(Ok(marker)) => Ok(marker),
                _ => Err(RenderError::Timeout(timeout)),
            }
        }

        async fn text_of(&mut self, selector: &str) -> Result<Vec<String>, RenderError> {
            Ok(self.script.texts.get(selector).cloned().unwrap_or_default())
        }

        async fn anchors(&mut self) -> Result<Vec<AnchorLink>, RenderError> {
            Ok(self.script.anchors.clone())
        }

        fn current_url(&self) -> Option<&str> {
            self.url.as_deref()
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn long_text() -> String {
        "Provide cloud platform engineering, migration and operations support for the agency. "
            .repeat(3)
    }

    fn rendered(texts: Vec<(&str, String)>, anchors: Vec<AnchorLink>) -> PageScript {
        PageScript {
            wait: Some(Ok(CONTENT_MARKERS[0].to_string())),
            texts: texts
                .into_iter()
                .map(|(selector, text)| (selector.to_string(), vec![text]))
                .collect(),
            anchors,
            navigation_error: false,
        }
    }

    fn timed_out() -> PageScript {
        PageScript {
            wait: Some(Err("slow".into())),
            ..PageScript::default()
        }
    }

    fn anchor(href: &str, text: &str) -> AnchorLink {
        AnchorLink {
            href: href.into(),
            text: text.into(),
        }
    }

    fn reference_record(id: &str) -> OpportunityRecord {
        let mut record = OpportunityRecord::new(id, "Cloud support");
        record.description = Description::Reference(format!(
            "https://api.sam.gov/prod/opportunities/v1/noticedesc?noticeid={id}"
        ));
        record.ui_link = Some(format!("https://sam.gov/workspace/contract/opp/{id}/view"));
        record
    }

    fn fallback(engine: Arc<ScriptedEngine>) -> CompletionFallback {
        CompletionFallback::new(engine, FallbackConfig::default())
    }

    #[tokio::test]
    async fn extracts_description_and_documents_from_public_page() {
        let engine = Arc::new(ScriptedEngine::with_scripts(vec![rendered(
            vec![(CONTENT_MARKERS[0], long_text())],
            vec![
                anchor("/api/prod/files/SOW.pdf", "Statement of Work"),
                anchor("https://sam.gov/api/prod/files/SOW.pdf", "duplicate"),
                anchor("https://sam.gov/help", "Help"),
                anchor("/opp/abc/resources/files/123", ""),
            ],
        )]));
        let result = fallback(engine.clone()).complete(&reference_record("abc")).await;

        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.url, "https://sam.gov/opp/abc/view");
        assert_eq!(result.description, long_text().trim());
        assert_eq!(
            result.documents,
            vec![
                DocumentRef::new("Statement of Work", "https://sam.gov/api/prod/files/SOW.pdf"),
                DocumentRef::new("123", "https://sam.gov/opp/abc/resources/files/123"),
            ]
        );
        assert_eq!(engine.visited.lock().unwrap().as_slice(), ["https://sam.gov/opp/abc/view"]);
        assert_eq!(engine.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_marker_text_falls_through_to_broader_selectors() {
        let body = "Section L instructions. ".repeat(10);
        let engine = Arc::new(ScriptedEngine::with_scripts(vec![rendered(
            vec![(CONTENT_MARKERS[0], "Too short".to_string()), ("main", body.clone())],
            vec![],
        )]));
        let result = fallback(engine).complete(&reference_record("abc")).await;
        assert!(result.success);
        assert_eq!(result.description, body.trim());
    }

    #[tokio::test]
    async fn render_timeout_is_retried_exactly_once() {
        let engine = Arc::new(ScriptedEngine::with_scripts(vec![timed_out(), timed_out(), timed_out()]));
        let result = fallback(engine.clone()).complete(&reference_record("abc")).await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureReason::RenderTimeout));
        assert_eq!(result.attempts, 2);
        assert_eq!(engine.opened.load(Ordering::SeqCst), 2);
        assert_eq!(engine.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_then_success_uses_a_fresh_session() {
        let engine = Arc::new(ScriptedEngine::with_scripts(vec![
            timed_out(),
            rendered(vec![(CONTENT_MARKERS[0], long_text())], vec![]),
        ]));
        let result = fallback(engine.clone()).complete(&reference_record("abc")).await;
        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert_eq!(engine.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_page_is_no_content_found_without_retry() {
        let engine = Arc::new(ScriptedEngine::with_scripts(vec![
            rendered(vec![], vec![anchor("https://sam.gov/help", "Help")]),
            rendered(vec![(CONTENT_MARKERS[0], long_text())], vec![]),
        ]));
        let result = fallback(engine.clone()).complete(&reference_record("abc")).await;

        assert_eq!(result.failure, Some(FailureReason::NoContentFound));
        assert_eq!(result.attempts, 1);
        assert_eq!(engine.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn documents_alone_are_enough_to_succeed() {
        let engine = Arc::new(ScriptedEngine::with_scripts(vec![rendered(
            vec![],
            vec![anchor("https://sam.gov/download/attachment?id=9", "Download all")],
        )]));
        let result = fallback(engine).complete(&reference_record("abc")).await;
        assert!(result.success);
        assert_eq!(result.description_opt(), None);
        assert_eq!(result.documents.len(), 1);
    }

    #[tokio::test]
    async fn navigation_errors_fail_without_retry() {
        let engine = Arc::new(ScriptedEngine::with_scripts(vec![PageScript {
            navigation_error: true,
            ..PageScript::default()
        }]));
        let result = fallback(engine.clone()).complete(&reference_record("abc")).await;
        assert_eq!(result.failure, Some(FailureReason::NavigationError));
        assert_eq!(result.attempts, 1);
        assert_eq!(engine.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded_and_results_keep_input_order() {
        let scripts = (0..6)
            .map(|_| rendered(vec![(CONTENT_MARKERS[0], long_text())], vec![]))
            .collect();
        let engine = Arc::new(ScriptedEngine {
            hold: Duration::from_millis(50),
            ..ScriptedEngine::with_scripts(scripts)
        });
        let config = FallbackConfig {
            max_concurrency: 2,
            ..FallbackConfig::default()
        };
        let fallback = CompletionFallback::new(engine.clone(), config);
        let records: Vec<_> = (0..6).map(|i| reference_record(&format!("n{i}"))).collect();

        let results = fallback.complete_all(&records).await;
        let urls: Vec<_> = results.iter().map(|r| r.url.clone()).collect();
        let expected: Vec<_> = (0..6).map(|i| format!("https://sam.gov/opp/n{i}/view")).collect();
        assert_eq!(urls, expected);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(engine.max_live.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_attempt_still_releases_its_session() {
        let engine = Arc::new(ScriptedEngine {
            hold: Duration::from_secs(3600),
            ..ScriptedEngine::with_scripts(vec![rendered(vec![], vec![])])
        });
        let fallback = fallback(engine.clone());

        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), fallback.complete(&reference_record("slow"))).await;
        assert!(abandoned.is_err());
        assert_eq!(engine.opened.load(Ordering::SeqCst), 1);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.closed.load(Ordering::SeqCst), 1);
        assert_eq!(engine.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn attachment_shapes() {
        let exts: Vec<String> = ATTACHMENT_EXTENSIONS.iter().map(ToString::to_string).collect();
        assert!(is_attachment_url("https://sam.gov/files/RFP.PDF?token=1", &exts));
        assert!(is_attachment_url("https://sam.gov/api/prod/opps/v3/opportunities/resources/files/77/download", &exts));
        assert!(!is_attachment_url("https://sam.gov/opp/abc/view", &exts));
        assert!(!is_attachment_url("not a url", &exts));
    }

    #[test]
    fn hrefs_resolve_against_the_page() {
        let page = "https://sam.gov/opp/abc/view";
        assert_eq!(
            resolve_href(page, "/files/a.pdf").as_deref(),
            Some("https://sam.gov/files/a.pdf")
        );
        assert_eq!(resolve_href(page, "#top"), None);
        assert_eq!(resolve_href(page, "mailto:co@agency.gov"), None);
        assert_eq!(resolve_href(page, "javascript:void(0)"), None);
    }

    #[test]
    fn api_description_bodies() {
        assert_eq!(
            description_body_text("<p>Scope &amp; schedule</p><p>Phase 2</p>").as_deref(),
            Some("Scope & schedule\nPhase 2")
        );
        assert_eq!(
            description_body_text(r#"{"description": "Plain text scope"}"#).as_deref(),
            Some("Plain text scope")
        );
        assert_eq!(
            description_body_text(r#"{"description": "Scope &amp; schedule<br/>Phase 2 <b>only</b>"}"#)
                .as_deref(),
            Some("Scope & schedule\nPhase 2 only")
        );
        assert_eq!(
            description_body_text("Overview:<p>Scope &amp; schedule</p>").as_deref(),
            Some("Overview:\nScope & schedule")
        );
        assert_eq!(
            description_body_text("Deliverables<script>track()</script> due &lt;30 days&gt;").as_deref(),
            Some("Deliverables due <30 days>")
        );
        assert_eq!(description_body_text("   "), None);
        assert_eq!(
            description_body_text("Already plain").as_deref(),
            Some("Already plain")
        );
    }
}
