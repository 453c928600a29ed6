//! Web search facade used for result injection.
//!
//! Scraping and ranking are external. Failures are reported to the
//! preprocessor, which treats them as "no results".

use futures_util::future::BoxFuture;

use chatflow_types::config::SearchSettings;
use chatflow_types::error::SearchError;

/// Runs a web search and returns result text (possibly empty).
pub trait SearchFacade: Send + Sync {
    fn run<'a>(
        &'a self,
        query: &'a str,
        settings: &'a SearchSettings,
    ) -> BoxFuture<'a, Result<String, SearchError>>;
}

/// System message content wrapping search results.
pub fn format_results(results: &str) -> String {
    format!("Web search results for the next user message:\n\n{}", results.trim())
}
