use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::ClientConfig;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{
    NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts,
};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use url::{Host, Url};

use super::error::ProbeFailure;
use super::timing::{Milestone, PhaseTimer};
use super::verifier::{PresentedChain, RecordingVerifier};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid DNS host {0:?}")]
    InvalidDnsHost(String),

    #[error("no trusted root certificates available")]
    NoRootCertificates,

    #[error("unable to build certificate verifier: {0}")]
    Verifier(#[from] rustls::client::VerifierBuilderError),
}

/// Setup a DNS resolver. Without explicit hosts the system configuration is
/// used. Answers are never cached between lookups.
pub fn setup_resolver(dns_hosts: &[String]) -> Result<TokioAsyncResolver, TransportError> {
    let mut opts = ResolverOpts::default();
    opts.attempts = 2;
    opts.timeout = Duration::from_secs(5);
    opts.cache_size = 0;

    if dns_hosts.is_empty() {
        return match trust_dns_resolver::system_conf::read_system_conf() {
            Ok((config, mut system_opts)) => {
                system_opts.cache_size = 0;
                Ok(TokioAsyncResolver::tokio(config, system_opts))
            }
            Err(e) => {
                log::warn!("Unable to read system DNS configuration, using defaults: {e}");
                Ok(TokioAsyncResolver::tokio(ResolverConfig::default(), opts))
            }
        };
    }

    let mut name_servers = NameServerConfigGroup::new();
    for host in dns_hosts {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| TransportError::InvalidDnsHost(host.clone()))?;
        name_servers.push(NameServerConfig {
            socket_addr: (ip, 53).into(),
            protocol: Protocol::Tcp,
            tls_dns_name: None,
            trust_negative_responses: false,
            bind_addr: None,
        });
    }
    let config = ResolverConfig::from_parts(None, vec![], name_servers);
    Ok(TokioAsyncResolver::tokio(config, opts))
}

/// Stream wrapper feeding request-written and first-byte events to the timer
/// for HTTP/1 connections. It sits above TLS, so handshake traffic is never
/// counted.
struct TracedStream<S> {
    inner: S,
    timer: PhaseTimer,
}

impl<S: AsyncRead + Unpin> AsyncRead for TracedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            if buf.filled().len() > before {
                self.timer.read();
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TracedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            if n > 0 {
                self.timer.wrote();
            }
        }
        poll
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = poll {
            if n > 0 {
                self.timer.wrote();
            }
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

enum Sender {
    Http1(http1::SendRequest<Empty<Bytes>>),
    Http2(http2::SendRequest<Empty<Bytes>>),
}

impl Sender {
    async fn ready(&mut self) -> hyper::Result<()> {
        match self {
            Sender::Http1(s) => s.ready().await,
            Sender::Http2(s) => s.ready().await,
        }
    }

    /// HTTP/1 write and first-byte marks come from the traced stream. An
    /// HTTP/2 connection also carries SETTINGS and PING frames, so there the
    /// request hand-off and the response head mark them instead.
    async fn send(
        &mut self,
        req: Request<Empty<Bytes>>,
        timer: &PhaseTimer,
    ) -> hyper::Result<Response<Incoming>> {
        match self {
            Sender::Http1(s) => {
                s.ready().await?;
                s.send_request(req).await
            }
            Sender::Http2(s) => {
                s.ready().await?;
                timer.mark(Milestone::HeadersWritten);
                let response = s.send_request(req).await?;
                timer.mark(Milestone::FirstByte);
                Ok(response)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    fn of(url: &Url) -> Option<Self> {
        Some(Self {
            scheme: url.scheme().to_string(),
            host: url.host_str()?.to_string(),
            port: url.port_or_known_default()?,
        })
    }
}

struct Connection {
    origin: Origin,
    sender: Sender,
    peer_certificate: Option<CertificateDer<'static>>,
}

/// A response together with what is known about the connection it came over.
pub struct Exchange {
    pub response: Response<Incoming>,
    /// Leaf certificate of the TLS connection, if any.
    pub peer_certificate: Option<CertificateDer<'static>>,
}

/// Shared, read-only ingredients for building per-probe transports.
#[derive(Clone)]
pub struct TransportFactory {
    resolver: TokioAsyncResolver,
    provider: Arc<CryptoProvider>,
    verifier: Arc<WebPkiServerVerifier>,
}

impl TransportFactory {
    pub fn new(
        resolver: TokioAsyncResolver,
        roots: rustls::RootCertStore,
    ) -> Result<Self, TransportError> {
        if roots.is_empty() {
            return Err(TransportError::NoRootCertificates);
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()?;
        Ok(Self {
            resolver,
            provider,
            verifier,
        })
    }

    /// Build a private transport for one probe attempt.
    pub fn transport(
        &self,
        ignore_tls_errors: bool,
        timer: PhaseTimer,
    ) -> Result<ProbeTransport, ProbeFailure> {
        let presented = PresentedChain::default();
        let verifier = if ignore_tls_errors {
            RecordingVerifier::accepting_any(self.provider.clone(), presented.clone())
        } else {
            RecordingVerifier::verifying(
                self.verifier.clone(),
                self.provider.clone(),
                presented.clone(),
            )
        };

        let mut tls = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| {
                ProbeFailure::Handshake {
                    source: io::Error::other(e),
                    presented: Vec::new(),
                }
            })?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(ProbeTransport {
            resolver: self.resolver.clone(),
            connector: TlsConnector::from(Arc::new(tls)),
            presented,
            timer,
            idle: None,
            tasks: JoinSet::new(),
        })
    }
}

/// Transport owned by a single probe attempt. Keeps at most one idle
/// connection; every connection task is aborted when it is dropped.
pub struct ProbeTransport {
    resolver: TokioAsyncResolver,
    connector: TlsConnector,
    presented: PresentedChain,
    timer: PhaseTimer,
    idle: Option<Connection>,
    tasks: JoinSet<()>,
}

impl ProbeTransport {
    /// Send `req` to `url`, reusing the idle connection when it points at the
    /// same origin and is still open.
    pub async fn send(
        &mut self,
        url: &Url,
        build: impl FnOnce(bool) -> Result<Request<Empty<Bytes>>, ProbeFailure>,
    ) -> Result<Exchange, ProbeFailure> {
        let origin =
            Origin::of(url).ok_or_else(|| ProbeFailure::InvalidRedirect(url.to_string()))?;

        // A connection the server closed after the last response fails `ready`.
        let reused = match self.idle.take() {
            Some(mut conn) if conn.origin == origin => {
                conn.sender.ready().await.ok().map(|_| conn)
            }
            _ => None,
        };
        let mut conn = match reused {
            Some(conn) => conn,
            None => self.connect(url, origin).await?,
        };
        self.timer.mark(Milestone::ConnAcquired);

        let req = build(matches!(conn.sender, Sender::Http2(_)))?;
        let response = conn
            .sender
            .send(req, &self.timer)
            .await
            .map_err(ProbeFailure::Http)?;
        let peer_certificate = conn.peer_certificate.clone();
        self.idle = Some(conn);

        Ok(Exchange {
            response,
            peer_certificate,
        })
    }

    async fn resolve(&self, url: &Url, port: u16) -> Result<Vec<SocketAddr>, ProbeFailure> {
        let name = match url.host() {
            Some(Host::Ipv4(ip)) => return Ok(vec![SocketAddr::new(ip.into(), port)]),
            Some(Host::Ipv6(ip)) => return Ok(vec![SocketAddr::new(ip.into(), port)]),
            Some(Host::Domain(name)) => name,
            None => return Err(ProbeFailure::InvalidRedirect(url.to_string())),
        };

        self.timer.mark(Milestone::DnsStart);
        let lookup = self.resolver.lookup_ip(name).await;
        self.timer.mark(Milestone::DnsDone);

        let addrs: Vec<SocketAddr> = lookup
            .map_err(|e| dns_failure(name, e))?
            .iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect();
        if addrs.is_empty() {
            return Err(ProbeFailure::Dns {
                host: name.to_string(),
                not_found: true,
                reason: "no addresses".to_string(),
            });
        }
        Ok(addrs)
    }

    async fn connect(&mut self, url: &Url, origin: Origin) -> Result<Connection, ProbeFailure> {
        let addrs = self.resolve(url, origin.port).await?;

        self.timer.mark(Milestone::ConnectStart);
        let tcp = connect_any(&addrs).await;
        self.timer.mark(Milestone::ConnectDone);
        let tcp = tcp.map_err(ProbeFailure::Connect)?;
        let _ = tcp.set_nodelay(true);

        if origin.scheme != "https" {
            let sender = self.handshake(tcp, false).await?;
            return Ok(Connection {
                origin,
                sender,
                peer_certificate: None,
            });
        }

        let server_name = server_name(url)?;
        self.timer.mark(Milestone::TlsStart);
        let tls = self.connector.connect(server_name, tcp).await;
        self.timer.mark(Milestone::TlsDone);
        let tls = tls.map_err(|source| ProbeFailure::Handshake {
            source,
            presented: self.presented.take(),
        })?;

        let (_, session) = tls.get_ref();
        let h2 = session.alpn_protocol() == Some(b"h2".as_slice());
        let peer_certificate = session
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|cert| cert.clone().into_owned());

        let sender = self.handshake(tls, h2).await?;
        Ok(Connection {
            origin,
            sender,
            peer_certificate,
        })
    }

    async fn handshake<S>(&mut self, stream: S, h2: bool) -> Result<Sender, ProbeFailure>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if h2 {
            let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
                .await
                .map_err(ProbeFailure::Http)?;
            self.tasks.spawn(async move {
                if let Err(e) = conn.await {
                    log::debug!("HTTP/2 connection ended: {e}");
                }
            });
            return Ok(Sender::Http2(sender));
        }

        let io = TokioIo::new(TracedStream {
            inner: stream,
            timer: self.timer.clone(),
        });
        let (sender, conn) = http1::handshake(io).await.map_err(ProbeFailure::Http)?;
        self.tasks.spawn(async move {
            if let Err(e) = conn.await {
                log::debug!("HTTP/1 connection ended: {e}");
            }
        });
        Ok(Sender::Http1(sender))
    }
}

async fn connect_any(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses")))
}

fn server_name(url: &Url) -> Result<ServerName<'static>, ProbeFailure> {
    match url.host() {
        Some(Host::Ipv4(ip)) => Ok(ServerName::IpAddress(IpAddr::V4(ip).into())),
        Some(Host::Ipv6(ip)) => Ok(ServerName::IpAddress(IpAddr::V6(ip).into())),
        Some(Host::Domain(name)) => ServerName::try_from(name.to_string())
            .map_err(|_| ProbeFailure::InvalidServerName(name.to_string())),
        None => Err(ProbeFailure::InvalidServerName(url.to_string())),
    }
}

fn dns_failure(host: &str, err: ResolveError) -> ProbeFailure {
    let not_found = matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. });
    ProbeFailure::Dns {
        host: host.to_string(),
        not_found,
        reason: err.to_string(),
    }
}
