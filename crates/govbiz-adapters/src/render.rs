//! Page engines used by the completion fallback.
//!
//! An engine hands out isolated sessions. A session navigates to one page,
//! waits (bounded) for content to appear and exposes text and links for
//! extraction. [`StaticHtmlEngine`] serves pages whose content is present in
//! the initial HTML; [`crate::WebDriverEngine`] drives a real browser.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use govbiz_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorLink {
    pub href: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("page content did not appear within {0:?}")]
    Timeout(Duration),
    #[error("navigation to {url} was blocked (status {status})")]
    Blocked { url: String, status: u16 },
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("render engine protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait RenderEngine: Send + Sync {
    fn engine_id(&self) -> &'static str;
    async fn open_session(&self) -> Result<Box<dyn PageSession>, RenderError>;
}

#[async_trait]
pub trait PageSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), RenderError>;

    /// Polls until one of `selectors` matches, returning the first that did.
    async fn wait_for_any(
        &mut self,
        selectors: &[&str],
        timeout: Duration,
    ) -> Result<String, RenderError>;

    /// Visible text of every element matching `selector`, in document order.
    async fn text_of(&mut self, selector: &str) -> Result<Vec<String>, RenderError>;

    async fn anchors(&mut self) -> Result<Vec<AnchorLink>, RenderError>;

    fn current_url(&self) -> Option<&str>;

    /// Releases engine-side resources. Safe to call more than once. The
    /// fallback calls it for every session it opens, from a background task
    /// when the attempt was dropped before finishing.
    async fn close(&mut self);
}

const HIDDEN_CONTAINERS: [&str; 5] = ["nav", "header", "footer", "script", "style"];

fn parse_selector(selector: &str) -> Result<Selector, RenderError> {
    Selector::parse(selector)
        .map_err(|err| RenderError::Protocol(format!("invalid selector {selector:?}: {err}")))
}

/// Text nodes under `element`, skipping navigation chrome and scripts.
pub(crate) fn visible_text(element: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    for node in element.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .take_while(|ancestor| ancestor.id() != element.id())
            .chain(std::iter::once(*element))
            .any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|el| HIDDEN_CONTAINERS.contains(&el.name()))
            });
        let trimmed = text.trim();
        if !hidden && !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }
    parts.join("\n")
}

fn first_matching(html: &str, selectors: &[&str]) -> Result<Option<String>, RenderError> {
    let document = Html::parse_document(html);
    for raw in selectors {
        let selector = parse_selector(raw)?;
        if document.select(&selector).next().is_some() {
            return Ok(Some((*raw).to_string()));
        }
    }
    Ok(None)
}

fn texts_matching(html: &str, selector: &str) -> Result<Vec<String>, RenderError> {
    let document = Html::parse_document(html);
    let selector = parse_selector(selector)?;
    Ok(document.select(&selector).map(visible_text).collect())
}

fn anchors_in(html: &str) -> Result<Vec<AnchorLink>, RenderError> {
    let document = Html::parse_document(html);
    let selector = parse_selector("a[href]")?;
    Ok(document
        .select(&selector)
        .filter_map(|a| {
            a.value().attr("href").map(|href| AnchorLink {
                href: href.trim().to_string(),
                text: a.text().collect::<String>().trim().to_string(),
            })
        })
        .collect())
}

/// Fetches pages over plain HTTP and re-fetches while waiting for content.
#[derive(Debug, Clone)]
pub struct StaticHtmlEngine {
    http: Arc<HttpFetcher>,
    poll_interval: Duration,
}

impl StaticHtmlEngine {
    pub fn new(http: Arc<HttpFetcher>, poll_interval: Duration) -> Self {
        Self {
            http,
            poll_interval,
        }
    }
}

#[async_trait]
impl RenderEngine for StaticHtmlEngine {
    fn engine_id(&self) -> &'static str {
        "static_html"
    }

    async fn open_session(&self) -> Result<Box<dyn PageSession>, RenderError> {
        Ok(Box::new(StaticHtmlSession {
            http: self.http.clone(),
            poll_interval: self.poll_interval,
            url: None,
            html: None,
        }))
    }
}

struct StaticHtmlSession {
    http: Arc<HttpFetcher>,
    poll_interval: Duration,
    url: Option<String>,
    html: Option<String>,
}

impl StaticHtmlSession {
    async fn load(&mut self, url: &str) -> Result<(), RenderError> {
        let response = self
            .http
            .get(url, &[], &[("Accept", "text/html")])
            .await
            .map_err(|err| map_fetch_error(url, err))?;
        self.url = Some(response.final_url.clone());
        self.html = Some(response.text());
        Ok(())
    }

    fn html(&self) -> Result<&str, RenderError> {
        self.html
            .as_deref()
            .ok_or_else(|| RenderError::Protocol("no page loaded in session".into()))
    }
}

fn map_fetch_error(url: &str, err: FetchError) -> RenderError {
    match err.status() {
        Some(status @ (401 | 403 | 429)) => RenderError::Blocked {
            url: url.to_string(),
            status,
        },
        _ if err.is_timeout() => RenderError::Navigation {
            url: url.to_string(),
            message: "request timed out".into(),
        },
        _ => RenderError::Navigation {
            url: url.to_string(),
            message: err.to_string(),
        },
    }
}

#[async_trait]
impl PageSession for StaticHtmlSession {
    async fn navigate(&mut self, url: &str) -> Result<(), RenderError> {
        self.load(url).await
    }

    async fn wait_for_any(
        &mut self,
        selectors: &[&str],
        timeout: Duration,
    ) -> Result<String, RenderError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = first_matching(self.html()?, selectors)? {
                return Ok(found);
            }
            if Instant::now() + self.poll_interval >= deadline {
                return Err(RenderError::Timeout(timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
            let Some(url) = self.url.clone() else {
                return Err(RenderError::Protocol("no page loaded in session".into()));
            };
            debug!(%url, "content not present yet; re-fetching");
            self.load(&url).await?;
        }
    }

    async fn text_of(&mut self, selector: &str) -> Result<Vec<String>, RenderError> {
        texts_matching(self.html()?, selector)
    }

    async fn anchors(&mut self) -> Result<Vec<AnchorLink>, RenderError> {
        anchors_in(self.html()?)
    }

    fn current_url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    async fn close(&mut self) {
        self.html = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <header><nav>Home | Search</nav></header>
          <main>
            <nav>Breadcrumbs</nav>
            <div data-test="opportunity-description">
              <p>Provide cloud platform support.</p>
              <script>track()</script>
              <p>Period of performance: 12 months.</p>
            </div>
            <a href="/api/prod/files/SOW.pdf">Statement of Work</a>
            <a href="https://sam.gov/help">Help</a>
          </main>
          <footer>Footer text</footer>
        </body></html>
    "#;

    #[test]
    fn visible_text_skips_chrome_and_scripts() {
        let texts = texts_matching(PAGE, "main").unwrap();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("Provide cloud platform support."));
        assert!(texts[0].contains("Statement of Work"));
        assert!(!texts[0].contains("Breadcrumbs"));
        assert!(!texts[0].contains("track()"));
    }

    #[test]
    fn first_matching_reports_selector_in_priority_order() {
        let found = first_matching(
            PAGE,
            &[".missing", "[data-test=\"opportunity-description\"]", "main"],
        )
        .unwrap();
        assert_eq!(found.as_deref(), Some("[data-test=\"opportunity-description\"]"));
        assert_eq!(first_matching(PAGE, &[".missing"]).unwrap(), None);
    }

    #[test]
    fn anchors_keep_raw_hrefs_and_text() {
        let anchors = anchors_in(PAGE).unwrap();
        assert_eq!(
            anchors[0],
            AnchorLink {
                href: "/api/prod/files/SOW.pdf".into(),
                text: "Statement of Work".into(),
            }
        );
        assert_eq!(anchors.len(), 2);
    }

    #[test]
    fn invalid_selector_is_a_protocol_error() {
        assert!(matches!(
            texts_matching(PAGE, "div[[["),
            Err(RenderError::Protocol(_))
        ));
    }

    #[test]
    fn blocked_statuses_are_distinguished() {
        let err = map_fetch_error(
            "https://sam.gov/opp/x/view",
            FetchError::HttpStatus {
                status: 403,
                url: "https://sam.gov/opp/x/view".into(),
            },
        );
        assert!(matches!(err, RenderError::Blocked { status: 403, .. }));
        let err = map_fetch_error(
            "https://sam.gov/opp/x/view",
            FetchError::HttpStatus {
                status: 404,
                url: "https://sam.gov/opp/x/view".into(),
            },
        );
        assert!(matches!(err, RenderError::Navigation { .. }));
    }
}
