use async_trait::async_trait;
use thiserror::Error;

pub mod client;
pub mod response;

pub use client::HttpSink;
pub use response::CheckResponse;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to encode result")]
    Encode(#[from] serde_json::Error),

    #[error("failed to deliver result")]
    Request(#[from] reqwest::Error),

    #[error("invalid organisation id header")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    #[error("result endpoint responded {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Destination for completed check results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, response: &CheckResponse) -> Result<(), SinkError>;
}

/// Writes every result to the log as a JSON line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn publish(&self, response: &CheckResponse) -> Result<(), SinkError> {
        log::info!("result {}", serde_json::to_string(response)?);
        Ok(())
    }
}
