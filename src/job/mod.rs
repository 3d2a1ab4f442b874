use std::time::Duration;

use http::Method;
use thiserror::Error;
use url::Url;

use crate::config::probe_config::TargetConfig;
use crate::http_probe::prelude::*;
use crate::sink::{CheckResponse, ResultSink};

pub mod scheduler;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid URL {url:?}")]
    InvalidUrl {
        url: String,
        #[source]
        source: Option<url::ParseError>,
    },

    #[error("unsupported method {0:?}")]
    InvalidMethod(String),
}

/// A check job as received from the job source, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub reference: String,
    pub method: String,
    pub url: String,
    pub timeout_ms: u64,
    pub get_fallback: bool,
    pub ignore_tls_errors: bool,
    pub follow_redirects: bool,
}

impl Job {
    pub fn from_target(target: &TargetConfig) -> Self {
        Self {
            reference: target.reference.clone().unwrap_or_else(|| target.url.clone()),
            method: target.method.clone(),
            url: target.url.clone(),
            timeout_ms: target.timeout_ms,
            get_fallback: target.get_fallback,
            ignore_tls_errors: target.ignore_tls_errors,
            follow_redirects: target.follow_redirects,
        }
    }

    /// Validate the job. URLs that don't parse or lack a host never reach
    /// the engine; the scheme is left for the engine to judge.
    pub fn into_request(self) -> Result<CheckRequest, JobError> {
        let url = match Url::parse(&self.url) {
            Ok(url) if url.host_str().is_some_and(|h| !h.is_empty()) => url,
            Ok(_) => {
                return Err(JobError::InvalidUrl {
                    url: self.url,
                    source: None,
                });
            }
            Err(e) => {
                return Err(JobError::InvalidUrl {
                    url: self.url,
                    source: Some(e),
                });
            }
        };
        let method = parse_method(&self.method)?;

        Ok(CheckRequest::new(
            self.reference,
            method,
            url,
            Duration::from_millis(self.timeout_ms),
        )
        .with_options(CheckOptions {
            get_fallback: self.get_fallback,
            ignore_tls_errors: self.ignore_tls_errors,
            follow_redirects: self.follow_redirects,
        }))
    }
}

fn parse_method(method: &str) -> Result<Method, JobError> {
    match method.trim().to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "HEAD" => Ok(Method::HEAD),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        "OPTIONS" => Ok(Method::OPTIONS),
        "PATCH" => Ok(Method::PATCH),
        _ => Err(JobError::InvalidMethod(method.to_string())),
    }
}

/// Validate, execute and publish one job. Invalid jobs are logged and dropped.
pub async fn run_job(
    engine: &ProbeEngine,
    sink: &dyn ResultSink,
    organisation_id: &str,
    job: Job,
) -> Option<CheckResult> {
    let reference = job.reference.clone();
    let url = job.url.clone();
    let request = match job.into_request() {
        Ok(request) => request,
        Err(e) => {
            log::error!("Invalid job ref={reference} url={url:?}: {e}");
            return None;
        }
    };

    let result = engine.execute(&request).await;

    let response = CheckResponse::new(organisation_id, &request.reference, &result);
    if let Err(e) = sink.publish(&response).await {
        log::error!(
            "Error sending result ref={}: {}",
            request.reference,
            crate::http_probe::report(&e)
        );
    }
    Some(result)
}
