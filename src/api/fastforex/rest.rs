use crate::error::{RateWatchError, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Source of raw quotes: for every target, the amount of `base` per one unit of target.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn fetch_multi(&self, base: &str, targets: &[&str]) -> Result<HashMap<String, f64>>;
}

#[derive(Debug, Deserialize)]
struct FetchMultiResponse {
    base: Option<String>,
    results: Option<HashMap<String, f64>>,
    updated: Option<String>,
}

pub struct FastForexClient {
    api_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl FastForexClient {
    pub fn new(api_url: String, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            api_url,
            api_key,
            http,
        })
    }
}

#[async_trait]
impl QuoteProvider for FastForexClient {
    async fn fetch_multi(&self, base: &str, targets: &[&str]) -> Result<HashMap<String, f64>> {
        let to = targets.join(",");
        info!("Requesting {} -> {} quotes from {}", base, to, self.api_url);

        let response = self
            .http
            .get(&self.api_url)
            .query(&[("from", base), ("to", to.as_str()), ("api_key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| {
                error!("Quote provider unreachable: {}", e);
                RateWatchError::Fetch(e.to_string())
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RateWatchError::Auth(format!("provider returned status {}", status)));
        }
        if !status.is_success() {
            return Err(RateWatchError::Fetch(format!("provider returned status {}", status)));
        }

        let body = response.text().await?;
        parse_fetch_multi(&body)
    }
}

fn parse_fetch_multi(body: &str) -> Result<HashMap<String, f64>> {
    let payload: FetchMultiResponse = serde_json::from_str(body)
        .map_err(|e| RateWatchError::Fetch(format!("Invalid API response: {}", e)))?;
    debug!(
        "Provider payload base={:?} updated={:?}",
        payload.base, payload.updated
    );
    payload.results.ok_or_else(|| {
        RateWatchError::Fetch("Invalid API response: missing results field".to_string())
    })
}
