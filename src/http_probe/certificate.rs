use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::objects::{oid_registry, oid2sn};
use x509_parser::parse_x509_certificate;

use super::result::CertificateInfo;

/// Number of Subject-Alternative-Names shown before the subject is elided.
const MAX_SUBJECT_NAMES: usize = 5;

/// Summarize a DER encoded certificate. Returns `None` when nothing usable
/// was presented.
pub fn summarize(der: &[u8]) -> Option<CertificateInfo> {
    let (_, cert) = parse_x509_certificate(der).ok()?;
    let serial = serial_bytes(cert.raw_serial());

    Some(CertificateInfo {
        subject: extract_subject(&cert),
        issuer: extract_issuer(&cert),
        serial_string: format_serial(&serial),
        serial,
        signature_algorithm: extract_algorithm(&cert),
        valid_from: to_datetime(cert.validity().not_before.timestamp()),
        valid_to: to_datetime(cert.validity().not_after.timestamp()),
        fingerprint_sha256: Sha256::digest(der).to_vec(),
    })
}

/// Summarize the leaf of a presented chain.
pub fn summarize_leaf(chain: &[CertificateDer<'_>]) -> Option<CertificateInfo> {
    summarize(chain.first()?.as_ref())
}

fn extract_subject(cert: &X509Certificate<'_>) -> String {
    // Clients ignore the Common Name when Subject Alt Names are present.
    let names = dns_names(cert);
    if names.len() > MAX_SUBJECT_NAMES {
        return format!("{} ...", names[..MAX_SUBJECT_NAMES].join(" "));
    }
    if !names.is_empty() {
        return names.join(" ");
    }
    common_name(cert.subject().iter_common_name().next())
}

fn extract_issuer(cert: &X509Certificate<'_>) -> String {
    let cn = common_name(cert.issuer().iter_common_name().next());
    match cert
        .issuer()
        .iter_organization()
        .next()
        .and_then(|o| o.as_str().ok())
    {
        Some(org) => format!("{cn} ({org})"),
        None => cn,
    }
}

fn common_name(attr: Option<&x509_parser::x509::AttributeTypeAndValue<'_>>) -> String {
    attr.and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn dns_names<'a>(cert: &'a X509Certificate<'_>) -> Vec<&'a str> {
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return Vec::new();
    };
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(*dns),
            _ => None,
        })
        .collect()
}

fn extract_algorithm(cert: &X509Certificate<'_>) -> String {
    let oid = &cert.signature_algorithm.algorithm;
    oid2sn(oid, oid_registry())
        .map(str::to_string)
        .unwrap_or_else(|_| oid.to_id_string())
}

/// Strip the DER sign padding so the serial reads as its magnitude.
fn serial_bytes(raw: &[u8]) -> Vec<u8> {
    let first = raw.iter().position(|b| *b != 0).unwrap_or(raw.len().saturating_sub(1));
    raw[first..].to_vec()
}

fn format_serial(serial: &[u8]) -> String {
    serial
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn to_datetime(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_default()
}

/// The facts about a presented certificate that drive failure classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFacts {
    pub is_ca: bool,
    pub subject_key_id: Option<Vec<u8>>,
    pub authority_key_id: Option<Vec<u8>>,
}

impl CertificateFacts {
    pub fn parse(der: &[u8]) -> Option<Self> {
        let (_, cert) = parse_x509_certificate(der).ok()?;
        Some(facts(&cert))
    }

    /// Heuristic for self-issued certificates: the subject key identifier
    /// equals the authority key identifier, including both being absent.
    pub fn looks_self_signed(&self) -> bool {
        self.subject_key_id == self.authority_key_id
    }
}

fn facts(cert: &X509Certificate<'_>) -> CertificateFacts {
    let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);
    let mut subject_key_id = None;
    let mut authority_key_id = None;
    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::SubjectKeyIdentifier(kid) => subject_key_id = Some(kid.0.to_vec()),
            ParsedExtension::AuthorityKeyIdentifier(aki) => {
                authority_key_id = aki.key_identifier.as_ref().map(|kid| kid.0.to_vec())
            }
            _ => {}
        }
    }
    CertificateFacts {
        is_ca,
        subject_key_id,
        authority_key_id,
    }
}

/// Walk up the presented chain from the leaf by issuer/subject linkage and
/// return the highest certificate reached. This is the certificate no trusted
/// issuer could be found for.
pub fn chain_top<'a>(chain: &'a [CertificateDer<'static>]) -> Option<&'a CertificateDer<'static>> {
    let parsed: Vec<_> = chain
        .iter()
        .map(|der| parse_x509_certificate(der.as_ref()).ok().map(|(_, c)| c))
        .collect();

    let mut current = 0;
    let mut visited = vec![false; chain.len()];
    if let Some(leaf) = visited.first_mut() {
        *leaf = true;
    }
    loop {
        let Some(Some(cert)) = parsed.get(current) else {
            break;
        };
        let issuer = cert.issuer().as_raw();
        if issuer == cert.subject().as_raw() {
            break;
        }
        let next = parsed.iter().enumerate().position(|(i, candidate)| {
            !visited[i] && matches!(candidate, Some(c) if c.subject().as_raw() == issuer)
        });
        match next {
            Some(i) => {
                visited[i] = true;
                current = i;
            }
            None => break,
        }
    }
    chain.get(current)
}
