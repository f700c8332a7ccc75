//! Source adapters for govbiz: the paginated opportunity API, the category
//! aggregator that turns its AND-only filter into OR semantics, and the
//! browser-driven completion fallback.

pub mod aggregator;
pub mod fallback;
pub mod render;
pub mod source;
pub mod webdriver;

pub use aggregator::{
    AggregateError, AggregateOutcome, AggregatorConfig, CategoryAggregator, CategoryFailure,
};
pub use fallback::{
    ApiDescriptionClient, CompletionFallback, DescriptionSelector, FallbackConfig, FallbackState,
};
pub use render::{AnchorLink, PageSession, RenderEngine, RenderError, StaticHtmlEngine};
pub use source::{
    parse_search_page, parse_source_timestamp, OpportunitySource, PageToken, SamGovConfig,
    SamGovSource, SourceError, SourcePage, SourceQuery,
};
pub use webdriver::{WebDriverConfig, WebDriverEngine};

pub const CRATE_NAME: &str = "govbiz-adapters";
