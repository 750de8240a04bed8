use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::config::CliConfig;

pub struct OverseerClient {
    client: Client,
    base_url: String,
}

impl OverseerClient {
    pub fn new(config: &CliConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let msg = body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error");
            anyhow::bail!("{status}: {msg}");
        }
        resp.json::<T>().await.context("Failed to parse response")
    }

    /// GET request returning deserialized JSON.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .context("Failed to connect to Overseer control API")?;
        Self::parse(resp).await
    }

    /// POST request with JSON body, returning deserialized JSON.
    pub async fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .context("Failed to connect to Overseer control API")?;
        Self::parse(resp).await
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        self.get("/health").await
    }

    /// `None` before the first generation completes.
    pub async fn summary(&self) -> Result<Option<serde_json::Value>> {
        let resp = self
            .client
            .get(self.url("/summary/latest"))
            .send()
            .await
            .context("Failed to connect to Overseer control API")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::parse(resp).await.map(Some)
    }

    /// Returns whether the request changed anything.
    pub async fn pause(&self, reason: Option<&str>) -> Result<bool> {
        let body = serde_json::json!({ "reason": reason });
        let resp: serde_json::Value = self.post("/control/pause", &body).await?;
        Ok(changed(&resp))
    }

    pub async fn resume(&self) -> Result<bool> {
        let resp: serde_json::Value = self.post("/control/resume", &serde_json::json!({})).await?;
        Ok(changed(&resp))
    }

    pub async fn stop(&self) -> Result<bool> {
        let resp: serde_json::Value = self.post("/control/stop", &serde_json::json!({})).await?;
        Ok(changed(&resp))
    }
}

fn changed(resp: &serde_json::Value) -> bool {
    resp.get("changed")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}
