//! Transport seam between the protocol engine and the upstream bank

use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// How long one upstream call may take before the session is aborted.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// One EBICS exchange: POST an XML document, get an XML document back.
///
/// Tests wire this to an in-process sandbox host; production uses
/// [`HttpTransport`].
#[async_trait]
pub trait EbicsTransport: Send + Sync {
    async fn post(&self, body: String) -> Result<String>;
}

/// HTTP transport for a real EBICS endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(format!("HTTP client construction failed: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EbicsTransport for HttpTransport {
    async fn post(&self, body: String) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "bank answered HTTP {}",
                status.as_u16()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}
