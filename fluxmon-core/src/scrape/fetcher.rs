//! Target fetching

use super::ScrapeTarget;
use crate::{Error, Result, VERSION};
use async_trait::async_trait;

const ACCEPT_HEADER: &str = "text/plain;version=0.0.4;q=0.9,*/*;q=0.1";

/// Retrieves one exposition payload from a target
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, target: &ScrapeTarget) -> Result<String>;
}

/// HTTP(S) fetcher backed by a shared `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("fluxmon/{}", VERSION))
            .build()
            .map_err(|e| Error::Scrape(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, target: &ScrapeTarget) -> Result<String> {
        let response = self
            .client
            .get(&target.url)
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .timeout(target.timeout)
            .send()
            .await
            .map_err(|e| Error::Scrape(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Scrape(format!("server returned HTTP status {}", status)));
        }

        response.text().await.map_err(|e| Error::Scrape(e.to_string()))
    }
}
