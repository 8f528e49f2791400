use super::{Notification, Notifier};
use crate::{Error, Result, VERSION};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Serialize)]
struct Payload<'a> {
    version: &'static str,
    receiver: &'a str,
    groups: &'a [Notification],
}

/// Posts notification batches as JSON
pub struct WebhookNotifier {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("fluxmon/{}", VERSION))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Notify(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, groups: &[Notification]) -> Result<()> {
        let payload = Payload {
            version: "1",
            receiver: &self.name,
            groups,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Notify(format!("{}: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(256).collect();
            return Err(Error::Notify(format!("{} returned {}: {}", self.url, status, body)));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
