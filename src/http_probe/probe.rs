use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http::header::{ACCEPT, ACCEPT_CHARSET, HOST, LOCATION, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Version};
use http_body_util::{BodyExt, Empty};
use rustls::RootCertStore;
use rustls::pki_types::CertificateDer;
use url::{Position, Url};

use crate::metrics::CounterSink;

use super::certificate::summarize;
use super::classify::classify;
use super::error::{FailureCode, ProbeFailure};
use super::request::{CheckRequest, MAX_REDIRECTS};
use super::result::{CheckResult, CheckStatus};
use super::timing::{PhaseTimer, TimingReport};
use super::transport::{Exchange, ProbeTransport, TransportError, TransportFactory, setup_resolver};

/// User-Agent sent with every check.
pub const USER_AGENT_VALUE: &str = concat!(
    "Mozilla/5.0 (compatible; pulsebox/",
    env!("CARGO_PKG_VERSION"),
    "; +https://baseflow.com)"
);
const ACCEPT_VALUE: &str = "text/html,*/*;q=0.5";
const ACCEPT_CHARSET_VALUE: &str = "utf-8,iso-8859-1;q=0.5";

/// Process-wide engine settings.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    /// DNS servers to query. Empty means the system configuration.
    pub dns_hosts: Vec<String>,

    /// Additional trust anchors.
    pub extra_roots: Vec<CertificateDer<'static>>,

    /// Trust the platform's native root certificates.
    pub use_native_roots: bool,
}

/// Executes checks. Cheap to clone; every check builds its own transport, so
/// nothing but the counters is shared between concurrent checks.
#[derive(Clone)]
pub struct ProbeEngine {
    transports: TransportFactory,
    counters: Arc<dyn CounterSink>,
}

/// Everything read from a completed exchange.
struct Completed {
    url: Url,
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    timing: TimingReport,
    peer_certificate: Option<CertificateDer<'static>>,
}

impl ProbeEngine {
    pub fn new(
        settings: EngineSettings,
        counters: Arc<dyn CounterSink>,
    ) -> Result<Self, TransportError> {
        let resolver = setup_resolver(&settings.dns_hosts)?;

        let mut roots = RootCertStore::empty();
        if settings.use_native_roots {
            let native = rustls_native_certs::load_native_certs();
            for err in &native.errors {
                log::warn!("Unable to load native root certificate: {err}");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            log::debug!("Loaded {added} native root certificates ({ignored} ignored)");
        }
        let (_, ignored) = roots.add_parsable_certificates(settings.extra_roots);
        if ignored > 0 {
            log::warn!("Ignored {ignored} unparsable extra root certificates");
        }

        Ok(Self {
            transports: TransportFactory::new(resolver, roots)?,
            counters,
        })
    }

    /// Execute one check. Never fails: every failure ends up in the result.
    pub async fn execute(&self, request: &CheckRequest) -> CheckResult {
        let mut method = request.method.clone();

        let result = loop {
            let started = Instant::now();
            let outcome = self.attempt(request, &method).await;
            let fallback = request.allows_fallback(&method);

            match outcome {
                Ok(done) => {
                    let result = completed(method.clone(), done);
                    if result.success() || !fallback {
                        break result;
                    }
                    log::debug!(
                        "ref={} HEAD returned {}, retrying with GET",
                        request.reference,
                        result.status_code
                    );
                }
                Err(failure) if !fallback => break failed(request, method, started, &failure),
                Err(failure) => {
                    log::debug!("ref={} HEAD failed, retrying with GET: {failure}", request.reference)
                }
            }
            method = Method::GET;
        };

        self.counters.observe(result.success(), result.elapsed);
        log::debug!(
            "ref={} status={} error={:?} time={}ms",
            request.reference,
            result.status,
            result.error_code(),
            result.elapsed.as_millis()
        );
        result
    }

    /// One independent attempt with its own transport and deadline. The
    /// transport, and every connection it opened, is dropped on return.
    async fn attempt(
        &self,
        request: &CheckRequest,
        method: &Method,
    ) -> Result<Completed, ProbeFailure> {
        match request.url.scheme() {
            "http" | "https" => {}
            other => return Err(ProbeFailure::UnsupportedScheme(other.to_string())),
        }

        let timer = PhaseTimer::new();
        let mut transport = self
            .transports
            .transport(request.options.ignore_tls_errors, timer.clone())?;

        let deadline: Duration = request.effective_timeout();
        tokio::time::timeout(deadline, exchange(&mut transport, &timer, request, method))
            .await
            .unwrap_or(Err(ProbeFailure::Timeout))
    }
}

/// Send the request and follow redirects according to the check's options.
/// Timing is recorded for the final hop only.
async fn exchange(
    transport: &mut ProbeTransport,
    timer: &PhaseTimer,
    request: &CheckRequest,
    method: &Method,
) -> Result<Completed, ProbeFailure> {
    let mut url = request.url.clone();
    let mut method = method.clone();
    let mut redirects = 0;

    loop {
        timer.reset();
        let Exchange {
            response,
            peer_certificate,
        } = transport
            .send(&url, |h2| build_request(&method, &url, h2))
            .await?;

        let status = response.status();
        if request.options.follow_redirects && is_redirect(status) {
            if let Some(location) = response.headers().get(LOCATION) {
                if redirects == MAX_REDIRECTS {
                    return Err(ProbeFailure::RedirectLimit);
                }
                redirects += 1;
                let next = redirect_target(&url, location)?;

                if matches!(
                    status,
                    StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
                ) && method != Method::GET
                    && method != Method::HEAD
                {
                    method = Method::GET;
                }

                // Discard the body so the connection can be reused.
                let _ = response.into_body().collect().await;
                log::trace!("ref={} redirect {redirects} to {next}", request.reference);
                url = next;
                continue;
            }
        }

        let (parts, body) = response.into_parts();
        let body = body.collect().await.map_err(ProbeFailure::Body)?.to_bytes();
        let timing = timer.finish(Instant::now());

        return Ok(Completed {
            url,
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body,
            timing,
            peer_certificate,
        });
    }
}

fn build_request(
    method: &Method,
    url: &Url,
    h2: bool,
) -> Result<Request<Empty<Bytes>>, ProbeFailure> {
    let builder = Request::builder()
        .method(method.clone())
        .header(USER_AGENT, USER_AGENT_VALUE)
        .header(ACCEPT, ACCEPT_VALUE)
        .header(ACCEPT_CHARSET, ACCEPT_CHARSET_VALUE);

    let builder = if h2 {
        let mut target = url.clone();
        target.set_fragment(None);
        builder.version(Version::HTTP_2).uri(target.as_str())
    } else {
        builder
            .uri(&url[Position::BeforePath..Position::AfterQuery])
            .header(HOST, host_header(url))
    };
    Ok(builder.body(Empty::new())?)
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn redirect_target(current: &Url, location: &HeaderValue) -> Result<Url, ProbeFailure> {
    let invalid =
        || ProbeFailure::InvalidRedirect(String::from_utf8_lossy(location.as_bytes()).into_owned());
    let location = location.to_str().map_err(|_| invalid())?;
    let next = current.join(location).map_err(|_| invalid())?;
    match next.scheme() {
        "http" | "https" if next.host_str().is_some() => Ok(next),
        _ => Err(invalid()),
    }
}

fn completed(method: Method, done: Completed) -> CheckResult {
    let mut result = CheckResult::pending(method, done.url);
    let code = done.status.as_u16();

    result.status_code = code;
    result.proto = proto(done.version).to_string();
    result.status_text = match done.status.canonical_reason() {
        Some(reason) => format!("{code} {reason}"),
        None => code.to_string(),
    };
    result.headers = group_headers(&done.headers);
    result.body = String::from_utf8_lossy(&done.body).into_owned();
    result.elapsed = done.timing.total;
    result.timing = Some(done.timing.phases);
    result.certificate = done
        .peer_certificate
        .as_ref()
        .and_then(|cert| summarize(cert.as_ref()));
    result.timestamp = Utc::now();

    // Only these count as up; anything else is reported by its code.
    if matches!(
        done.status,
        StatusCode::OK | StatusCode::NON_AUTHORITATIVE_INFORMATION
    ) {
        result.status = CheckStatus::Up;
    } else {
        result.status = CheckStatus::Down;
        result.error = Some(FailureCode::Status(code));
    }
    result
}

fn failed(
    request: &CheckRequest,
    method: Method,
    started: Instant,
    failure: &ProbeFailure,
) -> CheckResult {
    let classification = classify(failure, &request.reference);

    let mut result = CheckResult::pending(method, request.url.clone());
    result.status = CheckStatus::Down;
    result.elapsed = started.elapsed();
    result.timestamp = Utc::now();
    result.error = Some(classification.error.into());
    result.certificate = classification.certificate;
    result
}

fn proto(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "UNKNOWN",
    }
}

/// Group repeated headers under a single, canonically cased name.
fn group_headers(headers: &HeaderMap) -> Vec<(String, Vec<String>)> {
    headers
        .keys()
        .map(|name| {
            let values = headers
                .get_all(name)
                .iter()
                .map(|v| valid_utf8(v.as_bytes()))
                .collect();
            (canonical_name(name.as_str()), values)
        })
        .collect()
}

/// Decode as UTF-8, dropping invalid sequences instead of replacing them.
fn valid_utf8(bytes: &[u8]) -> String {
    bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
}

fn canonical_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
