use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::Method;
use url::Url;

use super::error::{CheckError, FailureCode};

/// Overall outcome of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Up,
    Down,
    Unknown,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "up",
            CheckStatus::Down => "down",
            CheckStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durations of the individual phases of the final exchange, truncated to
/// whole milliseconds. A phase is `None` when its hook points never fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTiming {
    pub dns: Option<Duration>,
    pub connecting: Option<Duration>,
    pub tls: Option<Duration>,
    pub sending: Option<Duration>,
    pub waiting: Option<Duration>,
    pub receiving: Option<Duration>,
}

/// Display-safe summary of a TLS peer certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    /// Big-endian serial number without sign padding.
    pub serial: Vec<u8>,
    /// Serial as uppercase, colon separated hex pairs.
    pub serial_string: String,
    pub signature_algorithm: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub fingerprint_sha256: Vec<u8>,
}

/// Result of one check. Produced exactly once per [`CheckRequest`](super::request::CheckRequest).
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub status: CheckStatus,

    /// Method of the attempt this result describes (GET after a fallback).
    pub method: Method,

    /// Final URL, after redirects.
    pub url: Url,

    /// HTTP status code received, `0` when no response was received.
    pub status_code: u16,

    /// Protocol, e.g. `HTTP/1.1`.
    pub proto: String,

    /// Status line text, e.g. `200 OK`.
    pub status_text: String,

    /// Response headers in received order, repeated headers grouped.
    pub headers: Vec<(String, Vec<String>)>,

    pub body: String,

    /// Overall time for the check.
    pub elapsed: Duration,

    /// Time the check was completed.
    pub timestamp: DateTime<Utc>,

    pub timing: Option<PhaseTiming>,

    pub certificate: Option<CertificateInfo>,

    /// `None` on success.
    pub error: Option<FailureCode>,
}

impl CheckResult {
    /// A fresh, empty result for an attempt made with `method`.
    pub(crate) fn pending(method: Method, url: Url) -> Self {
        Self {
            status: CheckStatus::Unknown,
            method,
            url,
            status_code: 0,
            proto: String::new(),
            status_text: String::new(),
            headers: Vec::new(),
            body: String::new(),
            elapsed: Duration::ZERO,
            timestamp: Utc::now(),
            timing: None,
            certificate: None,
            error: None,
        }
    }

    pub fn success(&self) -> bool {
        self.status == CheckStatus::Up
    }

    /// The error as sent over the wire: empty on success, a taxonomy token or
    /// the decimal status code otherwise.
    pub fn error_code(&self) -> String {
        self.error
            .as_ref()
            .map(FailureCode::to_string)
            .unwrap_or_default()
    }

    /// Taxonomy value of the failure, if it was classified.
    pub fn check_error(&self) -> Option<CheckError> {
        match self.error {
            Some(FailureCode::Check(err)) => Some(err),
            _ => None,
        }
    }
}
