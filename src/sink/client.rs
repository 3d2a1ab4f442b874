use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderValue;

use super::{CheckResponse, ResultSink, SinkError};

/// Header carrying the organisation a result belongs to.
pub const ORGANISATION_HEADER: &str = "X-Organisation-Id";

/// Posts results as JSON to a collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: Client,
    endpoint: String,
}

impl HttpSink {
    /// Create a sink posting to `endpoint` (e.g. "http://localhost:8080/results").
    pub fn new(endpoint: impl Into<String>) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("pulsebox/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ResultSink for HttpSink {
    /// Sends one result. Any non-2xx answer is reported as rejected, together
    /// with whatever body the collector returned.
    async fn publish(&self, response: &CheckResponse) -> Result<(), SinkError> {
        let organisation = HeaderValue::from_str(&response.organisation_id)?;

        let reply = self
            .client
            .post(&self.endpoint)
            .header(ORGANISATION_HEADER, organisation)
            .json(response)
            .send()
            .await?;

        if !reply.status().is_success() {
            let status = reply.status().as_u16();
            let body = reply.text().await.unwrap_or_default();
            return Err(SinkError::Rejected { status, body });
        }
        Ok(())
    }
}
