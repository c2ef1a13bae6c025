//! PageSpeed Insights client

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::report::truncate;

pub const PAGESPEED_ENDPOINT: &str = "https://www.googleapis.com/pagespeedonline/v5/runPagespeed";

/// Analysis mode, each yielding an independent score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Mobile,
    Desktop,
}

impl Strategy {
    /// Order in which every site is analysed
    pub const ALL: [Strategy; 2] = [Strategy::Mobile, Strategy::Desktop];

    /// Value of the `strategy` query parameter
    pub fn as_query(&self) -> &'static str {
        match self {
            Strategy::Mobile => "mobile",
            Strategy::Desktop => "desktop",
        }
    }

    /// Device label shown to the operator
    pub fn label(&self) -> &'static str {
        match self {
            Strategy::Mobile => "Mobile",
            Strategy::Desktop => "Desktop",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Anything that can produce a 0-100 performance score for a URL
pub trait ScoreSource {
    fn fetch_score(&self, api_key: &str, url: &str, strategy: Strategy) -> Result<f64>;
}

/// Blocking HTTP client for the runPagespeed endpoint
pub struct PageSpeedClient {
    client: Client,
    endpoint: String,
}

impl PageSpeedClient {
    /// Lighthouse runs routinely take tens of seconds
    const TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Self::TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: PAGESPEED_ENDPOINT.to_string(),
        })
    }

    /// Point the client at another runPagespeed URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

impl ScoreSource for PageSpeedClient {
    fn fetch_score(&self, api_key: &str, url: &str, strategy: Strategy) -> Result<f64> {
        let mut query = vec![("url", url), ("strategy", strategy.as_query())];
        if !api_key.is_empty() {
            query.push(("key", api_key));
        }

        tracing::debug!(url, strategy = strategy.as_query(), "requesting pagespeed");
        let response = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .with_context(|| format!("Request to PageSpeed Insights failed for {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!("PageSpeed Insights returned HTTP {}: {}", status, truncate(&body, 200));
        }

        let body = response
            .text()
            .context("Failed to read PageSpeed Insights response")?;
        parse_performance_score(&body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageSpeedResponse {
    lighthouse_result: LighthouseResult,
}

#[derive(Debug, Deserialize)]
struct LighthouseResult {
    categories: Categories,
}

#[derive(Debug, Deserialize)]
struct Categories {
    performance: Category,
}

#[derive(Debug, Deserialize)]
struct Category {
    score: Option<f64>,
}

/// Extract `lighthouseResult.categories.performance.score` scaled to 0-100.
///
/// Lighthouse reports a null score when the audit itself errored.
pub fn parse_performance_score(body: &str) -> Result<f64> {
    let response: PageSpeedResponse =
        serde_json::from_str(body).context("Unexpected PageSpeed Insights response")?;

    let score = response
        .lighthouse_result
        .categories
        .performance
        .score
        .context("Performance score missing from Lighthouse result")?;

    Ok(score * 100.0)
}
