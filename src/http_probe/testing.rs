//! Loopback servers and certificate fixtures for probe tests.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509Builder, X509Name, X509NameBuilder};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

static NEXT_SERIAL: AtomicU32 = AtomicU32::new(1000);

const DAY: i64 = 86_400;

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs() as i64
}

/// A certificate together with its private key.
pub(crate) struct TestCert {
    pub der: Vec<u8>,
    x509: X509,
    key: PKey<Private>,
}

impl TestCert {
    pub fn cert_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.der.clone())
    }

    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        let pkcs8 = self.key.private_key_to_pkcs8().expect("pkcs8 export");
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8))
    }
}

/// Shape of a certificate to mint.
#[derive(Clone)]
pub(crate) struct CertSpec {
    common_name: String,
    organization: Option<String>,
    dns_names: Vec<String>,
    ips: Vec<String>,
    serial: u32,
    not_before: i64,
    not_after: i64,
    ca: bool,
    key_ids: bool,
}

impl CertSpec {
    pub fn for_names<S: AsRef<str>>(names: &[S]) -> Self {
        let dns_names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        Self {
            common_name: dns_names
                .first()
                .cloned()
                .unwrap_or_else(|| "pulsebox-test".to_string()),
            organization: None,
            dns_names,
            ips: Vec::new(),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            not_before: now() - DAY,
            not_after: now() + 30 * DAY,
            ca: false,
            key_ids: true,
        }
    }

    /// A leaf valid for the loopback address the test servers listen on.
    pub fn loopback() -> Self {
        Self::for_names(&["localhost"]).ip("127.0.0.1")
    }

    pub fn common_name(mut self, cn: &str) -> Self {
        self.common_name = cn.to_string();
        self
    }

    pub fn organization(mut self, org: &str) -> Self {
        self.organization = Some(org.to_string());
        self
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.ips.push(ip.to_string());
        self
    }

    pub fn serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn expired(mut self) -> Self {
        self.not_before = now() - 60 * DAY;
        self.not_after = now() - DAY;
        self
    }

    pub fn ca(mut self) -> Self {
        self.ca = true;
        self
    }

    /// Leave out both key identifier extensions.
    pub fn without_key_ids(mut self) -> Self {
        self.key_ids = false;
        self
    }
}

fn new_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("curve");
    PKey::from_ec_key(EcKey::generate(&group).expect("ec key")).expect("pkey")
}

fn name(cn: &str, org: Option<&str>) -> X509Name {
    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_text("CN", cn).expect("cn");
    if let Some(org) = org {
        name.append_entry_by_text("O", org).expect("org");
    }
    name.build()
}

/// Mint a certificate. Without an issuer the certificate signs itself.
fn mint(spec: &CertSpec, issuer: Option<&TestCert>) -> TestCert {
    let key = new_key();
    let subject = name(&spec.common_name, spec.organization.as_deref());

    let mut b = X509Builder::new().expect("builder");
    b.set_version(2).expect("version");
    let serial = BigNum::from_u32(spec.serial)
        .and_then(|bn| bn.to_asn1_integer())
        .expect("serial");
    b.set_serial_number(&serial).expect("serial");
    b.set_subject_name(&subject).expect("subject");
    match issuer {
        Some(issuer) => b.set_issuer_name(issuer.x509.subject_name()),
        None => b.set_issuer_name(&subject),
    }
    .expect("issuer");
    b.set_pubkey(&key).expect("pubkey");
    b.set_not_before(&Asn1Time::from_unix(spec.not_before).expect("not before"))
        .expect("not before");
    b.set_not_after(&Asn1Time::from_unix(spec.not_after).expect("not after"))
        .expect("not after");

    if spec.ca {
        let bc = BasicConstraints::new().critical().ca().build().expect("bc");
        b.append_extension(bc).expect("bc");
    }
    if spec.key_ids {
        let ski = SubjectKeyIdentifier::new()
            .build(&b.x509v3_context(None, None))
            .expect("ski");
        b.append_extension(ski).expect("ski");
        if let Some(issuer) = issuer {
            let aki = AuthorityKeyIdentifier::new()
                .keyid(true)
                .build(&b.x509v3_context(Some(&*issuer.x509), None))
                .expect("aki");
            b.append_extension(aki).expect("aki");
        }
    }
    if !spec.dns_names.is_empty() || !spec.ips.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for dns in &spec.dns_names {
            san.dns(dns);
        }
        for ip in &spec.ips {
            san.ip(ip);
        }
        let san = san
            .build(&b.x509v3_context(issuer.map(|i| &*i.x509), None))
            .expect("san");
        b.append_extension(san).expect("san");
    }

    let signer = issuer.map(|i| &i.key).unwrap_or(&key);
    b.sign(signer, MessageDigest::sha256()).expect("sign");
    let x509 = b.build();
    TestCert {
        der: x509.to_der().expect("der"),
        x509,
        key,
    }
}

/// A trusted root plus helpers to issue certificates for the scenarios the
/// classifier distinguishes.
pub(crate) struct TestPki {
    pub root: TestCert,
}

impl TestPki {
    pub fn new() -> Self {
        let spec = CertSpec::for_names::<&str>(&[])
            .common_name("Pulsebox Test Root")
            .organization("Pulsebox Testing")
            .ca();
        Self {
            root: mint(&spec, None),
        }
    }

    /// Trust anchors to hand to the engine under test.
    pub fn roots(&self) -> Vec<CertificateDer<'static>> {
        vec![self.root.cert_der()]
    }

    pub fn leaf(&self, spec: CertSpec) -> TestCert {
        mint(&spec, Some(&self.root))
    }

    pub fn intermediate(&self) -> TestCert {
        let spec = CertSpec::for_names::<&str>(&[])
            .common_name("Pulsebox Test Intermediate")
            .organization("Pulsebox Testing")
            .ca();
        mint(&spec, Some(&self.root))
    }

    pub fn issue(spec: CertSpec, issuer: &TestCert) -> TestCert {
        mint(&spec, Some(issuer))
    }

    /// A CA nobody trusts.
    pub fn untrusted_root() -> TestCert {
        let spec = CertSpec::for_names::<&str>(&[])
            .common_name("Untrusted Root")
            .organization("Nobody")
            .ca();
        mint(&spec, None)
    }

    pub fn self_signed(spec: CertSpec) -> TestCert {
        mint(&spec, None)
    }
}

/// Request line of a received request.
#[derive(Debug, Clone)]
pub(crate) struct RawRequest {
    pub method: String,
    pub path: String,
}

/// What a test server does with a request.
pub(crate) enum Reply {
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },
    /// Send nothing and keep the connection open.
    Hang,
    /// Close the connection without responding.
    Close,
    /// Think for a while before replying.
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Reply::Respond {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn ok(body: &str) -> Self {
        Reply::Respond {
            status: 200,
            headers: vec![("Content-Type".into(), "text/html; charset=utf-8".into())],
            body: body.to_string(),
        }
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Reply::Respond {
            status,
            headers: vec![("Location".into(), location.to_string())],
            body: String::new(),
        }
    }

    pub fn after(self, delay: Duration) -> Self {
        Reply::Delayed(delay, Box::new(self))
    }

    /// Wait out any delays, leaving the reply to send.
    async fn settle(mut self) -> Self {
        while let Reply::Delayed(delay, inner) = self {
            tokio::time::sleep(delay).await;
            self = *inner;
        }
        self
    }
}

pub(crate) type Handler = Arc<dyn Fn(&RawRequest) -> Reply + Send + Sync>;

pub(crate) fn handler<F>(f: F) -> Handler
where
    F: Fn(&RawRequest) -> Reply + Send + Sync + 'static,
{
    Arc::new(f)
}

fn reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<RawRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();

    // Drain any request body so closing the socket doesn't reset it.
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut remaining = content_length.saturating_sub(buf.len() - head_end);
    while remaining > 0 {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        remaining = remaining.saturating_sub(n);
    }

    let mut parts = head.lines().next()?.split_whitespace();
    Some(RawRequest {
        method: parts.next()?.to_string(),
        path: parts.next()?.to_string(),
    })
}

/// Answer requests on one connection. Without keep-alive the connection is
/// closed after the first response.
async fn serve<S>(mut stream: S, handler: Handler, keep_alive: bool)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(request) = read_head(&mut stream).await {
        match handler(&request).settle().await {
            Reply::Respond {
                status,
                headers,
                body,
            } => {
                let mut out = format!("HTTP/1.1 {status} {}\r\n", reason(status));
                for (k, v) in &headers {
                    out.push_str(&format!("{k}: {v}\r\n"));
                }
                out.push_str(&format!("Content-Length: {}\r\n", body.len()));
                if !keep_alive {
                    out.push_str("Connection: close\r\n");
                }
                out.push_str("\r\n");
                if request.method != "HEAD" {
                    out.push_str(&body);
                }
                if stream.write_all(out.as_bytes()).await.is_err() {
                    return;
                }
                if !keep_alive {
                    let _ = stream.shutdown().await;
                    return;
                }
            }
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                return;
            }
            Reply::Close | Reply::Delayed(..) => return,
        }
    }
}

/// Plain HTTP server on an ephemeral loopback port.
pub(crate) async fn spawn_http(handler: Handler) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, handler.clone(), false));
        }
    });
    addr
}

/// Plain HTTP server that keeps connections open between requests. The
/// counter tracks how many connections it accepted.
pub(crate) async fn spawn_http_keep_alive(handler: Handler) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(stream, handler.clone(), true));
        }
    });
    (addr, accepted)
}

/// HTTPS server presenting `chain` (leaf first).
pub(crate) async fn spawn_https(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    handler: Handler,
) -> SocketAddr {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .expect("server certificate");
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    serve(tls, handler, false).await;
                }
            });
        }
    });
    addr
}

async fn respond_h2(
    handler: Handler,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, io::Error> {
    let request = RawRequest {
        method: req.method().to_string(),
        path: req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
    };
    match handler(&request).settle().await {
        Reply::Respond {
            status,
            headers,
            body,
        } => {
            let mut response = Response::builder().status(status);
            for (k, v) in &headers {
                response = response.header(k.as_str(), v.as_str());
            }
            Ok(response
                .body(Full::new(Bytes::from(body)))
                .expect("response"))
        }
        Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(io::Error::other("hung up"))
        }
        Reply::Close | Reply::Delayed(..) => Err(io::Error::other("stream reset")),
    }
}

/// HTTPS server that only speaks HTTP/2, presenting `chain` (leaf first).
pub(crate) async fn spawn_h2(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    handler: Handler,
) -> SocketAddr {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .expect("server certificate");
    config.alpn_protocols = vec![b"h2".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let service = service_fn(move |req| respond_h2(handler.clone(), req));
                let _ = http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });
    addr
}

/// A loopback port with nothing listening on it.
pub(crate) async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr
}
