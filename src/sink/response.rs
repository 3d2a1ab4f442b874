use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::http_probe::prelude::*;

/// Header keys are truncated to this size.
pub const MAX_HEADER_KEY_LENGTH: usize = 50;

/// Header values, after joining repeated values, are truncated to this size.
pub const MAX_HEADER_VALUE_LENGTH: usize = 250;

/// Response bodies are truncated to this size.
pub const MAX_BODY_LENGTH: usize = 250;

/// A check result as delivered to the result sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResponse {
    pub organisation_id: String,
    pub reference: String,
    pub status: String,
    pub method: String,
    pub url: String,
    pub status_code: u16,
    pub headers: Vec<HeaderEntry>,
    pub body: String,
    /// Total time in whole milliseconds.
    pub time: u64,
    pub error: String,
    pub timestamp: String,
    pub proto: String,
    pub status_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateResponse {
    pub serial_string: String,
    /// Serial number as lowercase hex.
    pub serial: String,
    pub algorithm: String,
    pub valid_from: String,
    pub valid_to: String,
    pub subject: String,
    pub issuer: String,
    /// SHA-256 fingerprint as lowercase hex.
    pub fingerprint_sha256: String,
}

/// Phase durations in whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimingResponse {
    pub dns: Option<u64>,
    pub connecting: Option<u64>,
    pub tls: Option<u64>,
    pub sending: Option<u64>,
    pub waiting: Option<u64>,
    pub receiving: Option<u64>,
}

impl CheckResponse {
    pub fn new(organisation_id: &str, reference: &str, result: &CheckResult) -> Self {
        Self {
            organisation_id: organisation_id.to_string(),
            reference: reference.to_string(),
            status: result.status.to_string(),
            method: result.method.to_string(),
            url: result.url.to_string(),
            status_code: result.status_code,
            headers: encode_headers(&result.headers),
            body: truncate(&result.body, MAX_BODY_LENGTH).to_string(),
            time: millis(result.elapsed),
            error: result.error_code(),
            timestamp: encode_timestamp(&result.timestamp),
            proto: result.proto.clone(),
            status_text: result.status_text.clone(),
            certificate: result.certificate.as_ref().map(encode_certificate),
            timing: result.timing.as_ref().map(encode_timing),
        }
    }
}

/// Cut `s` to at most `max` bytes without leaving a partial character behind.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn encode_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn encode_headers(headers: &[(String, Vec<String>)]) -> Vec<HeaderEntry> {
    headers
        .iter()
        .map(|(key, values)| HeaderEntry {
            key: truncate(key, MAX_HEADER_KEY_LENGTH).to_string(),
            value: truncate(&values.join("; "), MAX_HEADER_VALUE_LENGTH).to_string(),
        })
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn encode_certificate(cert: &CertificateInfo) -> CertificateResponse {
    CertificateResponse {
        serial_string: cert.serial_string.clone(),
        serial: hex(&cert.serial),
        algorithm: cert.signature_algorithm.clone(),
        valid_from: encode_timestamp(&cert.valid_from),
        valid_to: encode_timestamp(&cert.valid_to),
        subject: cert.subject.clone(),
        issuer: cert.issuer.clone(),
        fingerprint_sha256: hex(&cert.fingerprint_sha256),
    }
}

fn encode_timing(timing: &PhaseTiming) -> TimingResponse {
    TimingResponse {
        dns: timing.dns.map(millis),
        connecting: timing.connecting.map(millis),
        tls: timing.tls.map(millis),
        sending: timing.sending.map(millis),
        waiting: timing.waiting.map(millis),
        receiving: timing.receiving.map(millis),
    }
}
