//! Browser engine speaking the W3C WebDriver wire protocol to a driver
//! process such as chromedriver.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::render::{AnchorLink, PageSession, RenderEngine, RenderError};

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub endpoint: String,
    pub headless: bool,
    pub page_load_timeout: Duration,
    pub poll_interval: Duration,
    pub browser_args: Vec<String>,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9515".to_string(),
            headless: true,
            page_load_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            browser_args: vec![
                "--disable-dev-shm-usage".to_string(),
                "--no-sandbox".to_string(),
                "--disable-gpu".to_string(),
                "--window-size=1920,1080".to_string(),
            ],
        }
    }
}

impl WebDriverConfig {
    fn capabilities(&self) -> Value {
        let mut args = self.browser_args.clone();
        if self.headless {
            args.insert(0, "--headless=new".to_string());
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "pageLoadStrategy": "normal",
                    "timeouts": { "pageLoad": self.page_load_timeout.as_millis() as u64 },
                    "goog:chromeOptions": { "args": args }
                }
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct WebDriverEngine {
    client: reqwest::Client,
    config: WebDriverConfig,
}

impl WebDriverEngine {
    /// Driver commands can block for a whole page load, so the client timeout
    /// sits above the page-load timeout.
    pub fn new(config: WebDriverConfig) -> Result<Self, RenderError> {
        let client = reqwest::Client::builder()
            .timeout(config.page_load_timeout + Duration::from_secs(30))
            .build()
            .map_err(|err| RenderError::Protocol(format!("building webdriver client: {err}")))?;
        Ok(Self { client, config })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

#[async_trait]
impl RenderEngine for WebDriverEngine {
    fn engine_id(&self) -> &'static str {
        "webdriver"
    }

    async fn open_session(&self) -> Result<Box<dyn PageSession>, RenderError> {
        let endpoint = self.config.endpoint.trim_end_matches('/');
        let value = command(
            &self.client,
            Method::POST,
            &format!("{endpoint}/session"),
            Some(self.config.capabilities()),
        )
        .await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| RenderError::Protocol("new session response lacks sessionId".into()))?;
        debug!(session_id, "webdriver session opened");

        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            base: format!("{endpoint}/session/{session_id}"),
            poll_interval: self.config.poll_interval,
            url: None,
            closed: false,
        }))
    }
}

async fn command(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, RenderError> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request
        .send()
        .await
        .map_err(|err| RenderError::Protocol(format!("webdriver unreachable: {err}")))?;
    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .map_err(|err| RenderError::Protocol(format!("webdriver returned non-JSON: {err}")))?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);
    if status.is_success() {
        Ok(value)
    } else {
        Err(map_wire_error(&value))
    }
}

/// Maps a WebDriver error payload (`{"error": ..., "message": ...}`).
fn map_wire_error(value: &Value) -> RenderError {
    let code = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match code {
        "timeout" | "script timeout" => RenderError::Timeout(Duration::ZERO),
        "unknown error" if message.contains("net::ERR_") => {
            let url = message
                .split_whitespace()
                .find(|part| part.starts_with("http"))
                .unwrap_or_default()
                .to_string();
            if message.contains("ERR_BLOCKED") || message.contains("ERR_ACCESS_DENIED") {
                RenderError::Blocked { url, status: 403 }
            } else {
                RenderError::Navigation { url, message }
            }
        }
        _ => RenderError::Protocol(format!("{code}: {message}")),
    }
}

fn element_ids(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(ELEMENT_KEY).and_then(Value::as_str))
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

struct WebDriverSession {
    client: reqwest::Client,
    base: String,
    poll_interval: Duration,
    url: Option<String>,
    closed: bool,
}

impl WebDriverSession {
    async fn find_all(&self, selector: &str) -> Result<Vec<String>, RenderError> {
        let value = command(
            &self.client,
            Method::POST,
            &format!("{}/elements", self.base),
            Some(json!({ "using": "css selector", "value": selector })),
        )
        .await?;
        Ok(element_ids(&value))
    }

    async fn element_string(&self, element: &str, property: &str) -> Result<String, RenderError> {
        let value = command(
            &self.client,
            Method::GET,
            &format!("{}/element/{element}/{property}", self.base),
            None,
        )
        .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl PageSession for WebDriverSession {
    async fn navigate(&mut self, url: &str) -> Result<(), RenderError> {
        let result = command(
            &self.client,
            Method::POST,
            &format!("{}/url", self.base),
            Some(json!({ "url": url })),
        )
        .await;
        match result {
            Ok(_) => {
                self.url = Some(url.to_string());
                Ok(())
            }
            Err(RenderError::Navigation { message, .. }) => Err(RenderError::Navigation {
                url: url.to_string(),
                message,
            }),
            Err(RenderError::Blocked { status, .. }) => Err(RenderError::Blocked {
                url: url.to_string(),
                status,
            }),
            Err(other) => Err(other),
        }
    }

    async fn wait_for_any(
        &mut self,
        selectors: &[&str],
        timeout: Duration,
    ) -> Result<String, RenderError> {
        let deadline = Instant::now() + timeout;
        loop {
            for selector in selectors {
                if !self.find_all(selector).await?.is_empty() {
                    return Ok((*selector).to_string());
                }
            }
            if Instant::now() + self.poll_interval >= deadline {
                return Err(RenderError::Timeout(timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn text_of(&mut self, selector: &str) -> Result<Vec<String>, RenderError> {
        let mut texts = Vec::new();
        for element in self.find_all(selector).await? {
            texts.push(self.element_string(&element, "text").await?);
        }
        Ok(texts)
    }

    async fn anchors(&mut self) -> Result<Vec<AnchorLink>, RenderError> {
        let mut anchors = Vec::new();
        for element in self.find_all("a[href]").await? {
            let href = self.element_string(&element, "property/href").await?;
            let text = self.element_string(&element, "text").await?;
            anchors.push(AnchorLink {
                href: href.trim().to_string(),
                text: text.trim().to_string(),
            });
        }
        Ok(anchors)
    }

    fn current_url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = command(&self.client, Method::DELETE, &self.base, None).await {
            warn!(session = %self.base, error = %err, "failed to close webdriver session");
        }
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Dropped mid-flight (deadline or cancellation): release the browser in the background.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let client = self.client.clone();
            let base = self.base.clone();
            handle.spawn(async move {
                let _ = client.delete(base).send().await;
            });
        }
    }
}
