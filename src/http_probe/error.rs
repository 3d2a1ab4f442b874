use std::fmt;
use std::io;

use rustls::pki_types::CertificateDer;
use thiserror::Error;

/// Closed taxonomy of classified check failures. Each value has a short,
/// stable token which is what gets reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckError {
    /// Something went wrong that could not be classified.
    UnknownError,
    /// The domain wasn't found.
    NxDomain,
    /// Any other failure performing the DNS lookup.
    DnsError,
    Timeout,
    MaxRedirects,
    HostUnreachable,
    ConnectionRefused,
    /// Connection closed before a complete response was received.
    Closed,
    CertExpired,
    CertSelfSigned,
    CertUntrustedAuthority,
    CertWrongHost,
    CertIncompleteChain,
    /// TLS protocol alert or any other certificate problem.
    TlsAlert,
    UnsupportedSchema,
}

impl CheckError {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckError::UnknownError => "unknown_error",
            CheckError::NxDomain => "nxdomain",
            CheckError::DnsError => "dns_error",
            CheckError::Timeout => "timeout",
            CheckError::MaxRedirects => "max_redirects",
            CheckError::HostUnreachable => "ehostunreach",
            CheckError::ConnectionRefused => "econnrefused",
            CheckError::Closed => "closed",
            CheckError::CertExpired => "cert-expired",
            CheckError::CertSelfSigned => "cert-self-signed",
            CheckError::CertUntrustedAuthority => "cert-untrusted-authority",
            CheckError::CertWrongHost => "cert-wrong-host",
            CheckError::CertIncompleteChain => "cert-incomplete-chain",
            CheckError::TlsAlert => "tls_alert",
            CheckError::UnsupportedSchema => "unsupported_schema",
        }
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a `down` result reports: either a classified failure or the
/// unsuccessful HTTP status code that was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    Check(CheckError),
    Status(u16),
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCode::Check(err) => err.fmt(f),
            FailureCode::Status(code) => write!(f, "{code}"),
        }
    }
}

impl From<CheckError> for FailureCode {
    fn from(err: CheckError) -> Self {
        FailureCode::Check(err)
    }
}

/// Raw failure of a single probe attempt, before classification.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("redirect to invalid location {0:?}")]
    InvalidRedirect(String),

    #[error("unable to create request")]
    InvalidRequest(#[from] http::Error),

    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    #[error("lookup of {host} failed: {reason}")]
    Dns {
        host: String,
        not_found: bool,
        reason: String,
    },

    #[error("connect failed")]
    Connect(#[source] io::Error),

    #[error("TLS handshake failed")]
    Handshake {
        #[source]
        source: io::Error,
        /// Chain the server presented, leaf first. Empty when the handshake
        /// failed before certificates were exchanged.
        presented: Vec<CertificateDer<'static>>,
    },

    #[error("error making request")]
    Http(#[source] hyper::Error),

    #[error("error reading response body")]
    Body(#[source] hyper::Error),

    #[error("redirect limit exceeded")]
    RedirectLimit,

    #[error("deadline elapsed")]
    Timeout,
}

impl ProbeFailure {
    /// Certificates presented during a failed handshake.
    pub fn presented_chain(&self) -> &[CertificateDer<'static>] {
        match self {
            ProbeFailure::Handshake { presented, .. } => presented,
            _ => &[],
        }
    }
}
