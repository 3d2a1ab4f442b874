//! Maps raw probe failures onto the closed [`CheckError`] taxonomy.
//!
//! The same failure can surface through several layers (a TLS alert wrapped
//! in an I/O error wrapped in an HTTP error), so the cause chain is first
//! flattened into tagged [`Cause`]s and then matched against an ordered list
//! of rules. The first rule that matches wins.

use std::error::Error as StdError;
use std::io;

use rustls::CertificateError;
use rustls::pki_types::CertificateDer;

use super::certificate::{CertificateFacts, chain_top, summarize, summarize_leaf};
use super::error::{CheckError, ProbeFailure};
use super::report;
use super::result::CertificateInfo;

/// Outcome of classifying a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub error: CheckError,
    /// Certificate the failure was about, when one could be recovered.
    pub certificate: Option<CertificateInfo>,
}

impl Classification {
    fn bare(error: CheckError) -> Self {
        Self {
            error,
            certificate: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cause<'a> {
    UnsupportedScheme,
    Certificate(&'a CertificateError),
    /// Any other TLS failure: alerts, protocol violations, incompatible peers.
    Tls,
    Dns { not_found: bool },
    Os(io::ErrorKind),
    EndOfStream,
    RedirectLimit,
    Timeout,
}

fn collect<'a>(err: &'a (dyn StdError + 'static), out: &mut Vec<Cause<'a>>) {
    let mut next = Some(err);
    while let Some(err) = next {
        if let Some(failure) = err.downcast_ref::<ProbeFailure>() {
            match failure {
                ProbeFailure::UnsupportedScheme(_) | ProbeFailure::InvalidRedirect(_) => {
                    out.push(Cause::UnsupportedScheme)
                }
                ProbeFailure::Dns { not_found, .. } => out.push(Cause::Dns {
                    not_found: *not_found,
                }),
                ProbeFailure::RedirectLimit => out.push(Cause::RedirectLimit),
                ProbeFailure::Timeout => out.push(Cause::Timeout),
                _ => {}
            }
        } else if let Some(tls) = err.downcast_ref::<rustls::Error>() {
            out.push(match tls {
                rustls::Error::InvalidCertificate(reason) => Cause::Certificate(reason),
                _ => Cause::Tls,
            });
        } else if let Some(io_err) = err.downcast_ref::<io::Error>() {
            out.push(Cause::Os(io_err.kind()));
            // The wrapped error is only reachable through `get_ref`.
            if let Some(inner) = io_err.get_ref() {
                collect(inner, out);
                return;
            }
        } else if let Some(http) = err.downcast_ref::<hyper::Error>() {
            if http.is_incomplete_message() || http.is_canceled() {
                out.push(Cause::EndOfStream);
            }
            if http.is_timeout() {
                out.push(Cause::Timeout);
            }
        }
        next = err.source();
    }
}

type Verdict = Option<(CheckError, Option<CertificateInfo>)>;

type Rule = fn(&[Cause<'_>], &[CertificateDer<'static>]) -> Verdict;

/// Rule order matters: categories overlap and earlier rules are more specific.
const RULES: &[Rule] = &[
    unsupported_scheme,
    cert_expired,
    unknown_authority,
    wrong_host,
    tls_alert,
    dns,
    connection,
    end_of_stream,
    redirect_limit,
    timeout,
];

fn any(causes: &[Cause<'_>], pred: impl Fn(&Cause<'_>) -> bool) -> bool {
    causes.iter().any(pred)
}

fn unsupported_scheme(causes: &[Cause<'_>], _: &[CertificateDer<'static>]) -> Verdict {
    any(causes, |c| matches!(c, Cause::UnsupportedScheme))
        .then_some((CheckError::UnsupportedSchema, None))
}

fn cert_expired(causes: &[Cause<'_>], chain: &[CertificateDer<'static>]) -> Verdict {
    any(causes, |c| {
        matches!(
            c,
            Cause::Certificate(CertificateError::Expired | CertificateError::ExpiredContext { .. })
        )
    })
    .then(|| (CheckError::CertExpired, summarize_leaf(chain)))
}

fn unknown_authority(causes: &[Cause<'_>], chain: &[CertificateDer<'static>]) -> Verdict {
    let unknown_issuer = any(causes, |c| {
        matches!(c, Cause::Certificate(CertificateError::UnknownIssuer))
    });
    // A CA certificate served as the leaf is refused before any issuer lookup
    // and only surfaces as an unclassified certificate error.
    let ca_as_leaf = any(causes, |c| {
        matches!(c, Cause::Certificate(CertificateError::Other(_)))
    }) && leaf_is_ca(chain);
    if !unknown_issuer && !ca_as_leaf {
        return None;
    }
    let Some(top) = chain_top(chain) else {
        return Some((CheckError::CertIncompleteChain, None));
    };
    let error = match CertificateFacts::parse(top.as_ref()) {
        Some(facts) if facts.is_ca => CheckError::CertUntrustedAuthority,
        // Self-signed certificates usually carry a subject key id equal to
        // their authority key id. This isn't always true.
        Some(facts) if facts.looks_self_signed() => CheckError::CertSelfSigned,
        _ => CheckError::CertIncompleteChain,
    };
    Some((error, summarize(top.as_ref())))
}

fn leaf_is_ca(chain: &[CertificateDer<'static>]) -> bool {
    chain
        .first()
        .and_then(|leaf| CertificateFacts::parse(leaf.as_ref()))
        .is_some_and(|facts| facts.is_ca)
}

fn wrong_host(causes: &[Cause<'_>], chain: &[CertificateDer<'static>]) -> Verdict {
    any(causes, |c| {
        matches!(
            c,
            Cause::Certificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
            )
        )
    })
    .then(|| (CheckError::CertWrongHost, summarize_leaf(chain)))
}

fn tls_alert(causes: &[Cause<'_>], chain: &[CertificateDer<'static>]) -> Verdict {
    if any(causes, |c| matches!(c, Cause::Certificate(_))) {
        return Some((CheckError::TlsAlert, summarize_leaf(chain)));
    }
    any(causes, |c| matches!(c, Cause::Tls)).then_some((CheckError::TlsAlert, None))
}

fn dns(causes: &[Cause<'_>], _: &[CertificateDer<'static>]) -> Verdict {
    causes.iter().find_map(|c| match c {
        Cause::Dns { not_found: true } => Some((CheckError::NxDomain, None)),
        Cause::Dns { not_found: false } => Some((CheckError::DnsError, None)),
        _ => None,
    })
}

fn connection(causes: &[Cause<'_>], _: &[CertificateDer<'static>]) -> Verdict {
    causes.iter().find_map(|c| match c {
        Cause::Os(io::ErrorKind::ConnectionReset) => Some((CheckError::Closed, None)),
        Cause::Os(io::ErrorKind::ConnectionRefused) => Some((CheckError::ConnectionRefused, None)),
        Cause::Os(io::ErrorKind::HostUnreachable) => Some((CheckError::HostUnreachable, None)),
        _ => None,
    })
}

fn end_of_stream(causes: &[Cause<'_>], _: &[CertificateDer<'static>]) -> Verdict {
    any(causes, |c| {
        matches!(c, Cause::EndOfStream | Cause::Os(io::ErrorKind::UnexpectedEof))
    })
    .then_some((CheckError::Closed, None))
}

fn redirect_limit(causes: &[Cause<'_>], _: &[CertificateDer<'static>]) -> Verdict {
    any(causes, |c| matches!(c, Cause::RedirectLimit)).then_some((CheckError::MaxRedirects, None))
}

fn timeout(causes: &[Cause<'_>], _: &[CertificateDer<'static>]) -> Verdict {
    any(causes, |c| {
        matches!(c, Cause::Timeout | Cause::Os(io::ErrorKind::TimedOut))
    })
    .then_some((CheckError::Timeout, None))
}

/// Classify `failure` for the check identified by `reference`. Failures no
/// rule recognizes are logged, since they point at a gap in the taxonomy.
pub fn classify(failure: &ProbeFailure, reference: &str) -> Classification {
    let mut causes = Vec::new();
    collect(failure, &mut causes);
    let chain = failure.presented_chain();

    for rule in RULES {
        if let Some((error, certificate)) = rule(&causes, chain) {
            return Classification { error, certificate };
        }
    }

    log::warn!(
        "Unhandled error ref={reference} err={failure:?}\n{}",
        report(failure)
    );
    Classification::bare(CheckError::UnknownError)
}
