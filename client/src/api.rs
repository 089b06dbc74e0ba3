//! Process control surface

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::types::{ProcessHandle, ProcessStatus};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Operations the dashboard performs on server processes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessApi: Send + Sync {
    async fn start(&self, command: &str, cwd: Option<String>) -> Result<ProcessHandle>;
    async fn status(&self, id: &str) -> Result<ProcessStatus>;
    async fn kill(&self, id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<ProcessHandle>>;
}

#[derive(Serialize)]
struct StartRequest<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// [`ProcessApi`] over the server's HTTP routes
#[derive(Clone)]
pub struct HttpProcessApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProcessApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }
}

/// Decode a JSON body, turning non-success responses into [`ClientError::Status`]
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
        return Err(ClientError::Status {
            code: status.as_u16(),
            message,
        });
    }
    Ok(serde_json::from_slice(&body)?)
}

#[async_trait]
impl ProcessApi for HttpProcessApi {
    async fn start(&self, command: &str, cwd: Option<String>) -> Result<ProcessHandle> {
        let response = self
            .client
            .post(self.url("/process"))
            .json(&StartRequest { command, cwd })
            .send()
            .await?;
        decode(response).await
    }

    async fn status(&self, id: &str) -> Result<ProcessStatus> {
        let response = self
            .client
            .get(self.url(&format!("/process/{}", id)))
            .send()
            .await?;
        decode(response).await
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/process/{}/kill", id)))
            .send()
            .await?;
        let _: serde_json::Value = decode(response).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProcessHandle>> {
        let response = self.client.get(self.url("/process")).send().await?;
        decode(response).await
    }
}
