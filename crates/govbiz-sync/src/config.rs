//! Collector configuration: defaults, then an optional YAML file, then
//! environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use govbiz_adapters::{AggregatorConfig, FallbackConfig, SamGovConfig, WebDriverConfig};
use govbiz_storage::{BackoffPolicy, HttpClientConfig, TokenBucketConfig};
use serde::{Deserialize, Serialize};

use crate::CollectOptions;

pub const DEFAULT_CONFIG_FILE: &str = "govbiz.yaml";
pub const DEFAULT_NAICS_CODES: [&str; 3] = ["541511", "541512", "541690"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub use_alpha: bool,
    pub base_url: Option<String>,
    pub page_limit: u32,
    pub naics_codes: Vec<String>,
    pub max_categories: usize,
    pub max_window_days: i64,
    pub days_back: u32,
    pub storage_path: PathBuf,
    pub reports_dir: Option<PathBuf>,
    pub solicitations_only: bool,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub requests_per_second: Option<u32>,
    pub max_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_pages_per_query: usize,
    pub pass_timeout_secs: Option<u64>,
    pub max_responses: usize,
    pub response_timeout_secs: u64,
    pub fallback: FallbackSettings,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            use_alpha: false,
            base_url: None,
            page_limit: SamGovConfig::MAX_PAGE_LIMIT,
            naics_codes: DEFAULT_NAICS_CODES.iter().map(ToString::to_string).collect(),
            max_categories: 3,
            max_window_days: 7,
            days_back: 1,
            storage_path: PathBuf::from("./data/opportunities.json"),
            reports_dir: None,
            solicitations_only: true,
            http_timeout_secs: 20,
            user_agent: "govbiz-collector/0.1".to_string(),
            global_concurrency: 8,
            requests_per_second: None,
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            max_pages_per_query: 100,
            pass_timeout_secs: None,
            max_responses: 5,
            response_timeout_secs: 60,
            fallback: FallbackSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSettings {
    pub enabled: bool,
    /// Browser rendering needs a WebDriver endpoint; without one pages are
    /// fetched as static HTML.
    pub webdriver_url: Option<String>,
    pub headless: bool,
    pub render_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub max_concurrency: usize,
    pub timeout_retries: u32,
    pub try_api_description: bool,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            webdriver_url: None,
            headless: true,
            render_timeout_secs: 30,
            poll_interval_ms: 250,
            max_concurrency: 3,
            timeout_retries: 1,
            try_api_description: true,
        }
    }
}

impl CollectorConfig {
    /// Loads `path` when given (it must exist), else `govbiz.yaml` in the
    /// working directory when present, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_yaml_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let lookup = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(key) = lookup("SAM_GOV_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(path) = lookup("GOVBIZ_STORAGE_PATH") {
            self.storage_path = PathBuf::from(path);
        }
        if let Some(codes) = lookup("GOVBIZ_NAICS_CODES") {
            self.naics_codes = parse_code_list(&codes);
        }
        if let Some(url) = lookup("GOVBIZ_WEBDRIVER_URL") {
            self.fallback.webdriver_url = Some(url);
        }
        if let Some(secs) = lookup("GOVBIZ_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = secs
                .parse()
                .with_context(|| format!("GOVBIZ_HTTP_TIMEOUT_SECS is not a number: {secs:?}"))?;
        }
        if let Some(agent) = lookup("GOVBIZ_USER_AGENT") {
            self.user_agent = agent;
        }
        Ok(())
    }

    /// Applies the source's compliance limits, returning a message per change.
    pub fn enforce_limits(&mut self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.naics_codes.len() > self.max_categories {
            let dropped = self.naics_codes.split_off(self.max_categories);
            notes.push(format!(
                "only {} category codes are allowed per pass; ignoring {}",
                self.max_categories,
                dropped.join(", ")
            ));
        }
        if i64::from(self.days_back) > self.max_window_days {
            notes.push(format!(
                "days_back {} exceeds the {}-day window limit; clamping",
                self.days_back, self.max_window_days
            ));
            self.days_back = u32::try_from(self.max_window_days.max(1)).unwrap_or(1);
        }
        notes
    }

    pub fn sam_gov_config(&self) -> Result<SamGovConfig> {
        let Some(api_key) = self.api_key.clone() else {
            bail!("SAM_GOV_API_KEY is not set");
        };
        let mut config = SamGovConfig::new(api_key);
        config.page_limit = self.page_limit;
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        } else if self.use_alpha {
            config.base_url = SamGovConfig::ALPHA_URL.to_string();
        }
        Ok(config)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.global_concurrency,
            token_bucket: self.requests_per_second.filter(|rps| *rps > 0).map(|rps| {
                TokenBucketConfig {
                    capacity: rps,
                    refill_every: Duration::from_millis(1000 / u64::from(rps)),
                }
            }),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            max_categories: self.max_categories,
            max_window_days: self.max_window_days,
            max_pages_per_query: self.max_pages_per_query,
            backoff: self.backoff(),
        }
    }

    pub fn fallback_config(&self) -> FallbackConfig {
        FallbackConfig {
            render_timeout: Duration::from_secs(self.fallback.render_timeout_secs),
            timeout_retries: self.fallback.timeout_retries,
            max_concurrency: self.fallback.max_concurrency,
            ..FallbackConfig::default()
        }
    }

    pub fn webdriver_config(&self) -> Option<WebDriverConfig> {
        let endpoint = self.fallback.webdriver_url.clone()?;
        Some(WebDriverConfig {
            endpoint,
            headless: self.fallback.headless,
            page_load_timeout: Duration::from_secs(self.fallback.render_timeout_secs),
            poll_interval: self.poll_interval(),
            ..WebDriverConfig::default()
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.fallback.poll_interval_ms.max(10))
    }

    pub fn collect_options(&self) -> CollectOptions {
        CollectOptions {
            solicitations_only: self.solicitations_only,
            pass_timeout: self.pass_timeout_secs.map(Duration::from_secs),
            max_responses: self.max_responses,
            response_timeout: Duration::from_secs(self.response_timeout_secs),
        }
    }
}

/// Splits a comma or whitespace separated code list, dropping blanks.
pub fn parse_code_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_collector_policy() {
        let config = CollectorConfig::default();
        assert_eq!(config.naics_codes, vec!["541511", "541512", "541690"]);
        assert!(config.solicitations_only);
        assert_eq!(config.fallback.render_timeout_secs, 30);
        assert_eq!(config.fallback.max_concurrency, 3);
        assert_eq!(config.aggregator_config().max_window_days, 7);
        assert!(config.sam_gov_config().is_err());
    }

    #[test]
    fn yaml_overrides_only_named_fields() {
        let config = CollectorConfig::from_yaml_str(
            "naics_codes: ['541512']\nuse_alpha: true\nfallback:\n  enabled: false\n  timeout_retries: 2\n",
        )
        .unwrap();
        assert_eq!(config.naics_codes, vec!["541512"]);
        assert!(!config.fallback.enabled);
        assert_eq!(config.fallback.timeout_retries, 2);
        assert_eq!(config.fallback.render_timeout_secs, 30);
        assert_eq!(config.max_categories, 3);
        assert!(CollectorConfig::from_yaml_str("   ").is_ok());
    }

    #[test]
    fn environment_overrides_win() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SAM_GOV_API_KEY", "key-123"),
            ("GOVBIZ_NAICS_CODES", "541511, 541519"),
            ("GOVBIZ_STORAGE_PATH", "/tmp/govbiz/store.json"),
            ("GOVBIZ_WEBDRIVER_URL", "http://chromedriver:9515"),
            ("GOVBIZ_USER_AGENT", "   "),
        ]);
        let mut config = CollectorConfig::from_yaml_str("use_alpha: true").unwrap();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.naics_codes, vec!["541511", "541519"]);
        assert_eq!(config.storage_path, PathBuf::from("/tmp/govbiz/store.json"));
        assert_eq!(config.user_agent, "govbiz-collector/0.1");
        let sam = config.sam_gov_config().unwrap();
        assert_eq!(sam.base_url, SamGovConfig::ALPHA_URL);
        assert_eq!(sam.api_key, "key-123");
        assert_eq!(
            config.webdriver_config().map(|w| w.endpoint),
            Some("http://chromedriver:9515".to_string())
        );
    }

    #[test]
    fn malformed_numeric_env_is_an_error() {
        let mut config = CollectorConfig::default();
        let result = config.apply_env(|key| {
            (key == "GOVBIZ_HTTP_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn limits_truncate_codes_and_clamp_days() {
        let mut config = CollectorConfig {
            naics_codes: parse_code_list("1 2,3,4"),
            days_back: 30,
            ..CollectorConfig::default()
        };
        let notes = config.enforce_limits();
        assert_eq!(config.naics_codes, vec!["1", "2", "3"]);
        assert_eq!(config.days_back, 7);
        assert_eq!(notes.len(), 2);
        assert!(notes[0].contains('4'));
    }

    #[test]
    fn token_bucket_only_when_rate_is_positive() {
        let mut config = CollectorConfig::default();
        assert!(config.http_client_config().token_bucket.is_none());
        config.requests_per_second = Some(4);
        let bucket = config.http_client_config().token_bucket.unwrap();
        assert_eq!(bucket.capacity, 4);
        assert_eq!(bucket.refill_every, Duration::from_millis(250));
        config.requests_per_second = Some(0);
        assert!(config.http_client_config().token_bucket.is_none());
    }
}
