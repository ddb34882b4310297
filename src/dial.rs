//! Connection establishment for probes: fresh sockets with keep-alive off
//! and SO_LINGER(0) so closes emit RST instead of parking thousands of
//! sockets in TIME_WAIT, deadline-bounded I/O, TLS without verification
//! (probing, not trusting), and the optional upstream proxy dialer.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, ServerName};
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::endpoint::{Credential, Endpoint};
use crate::probe::{socks5, wire};
use crate::track::{ConnTracker, Tracked};

/// Object-safe stream bound shared by every probe transport.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// A probe-scoped connection; concrete layering (plain, TLS, tunneled)
/// varies per protocol and upstream mode.
pub type ProbeStream = Box<dyn Conn>;

/// Absolute cut-off for one probe. Nested operations may take a fraction of
/// it but never outlive it.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: tokio::time::Instant,
}

impl Deadline {
    pub fn after(d: Duration) -> Self {
        Self {
            at: tokio::time::Instant::now() + d,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at
            .saturating_duration_since(tokio::time::Instant::now())
    }

    /// Run `fut` under the remaining budget.
    pub async fn io<T, E, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        self.io_capped(Duration::MAX, what, fut).await
    }

    /// Run `fut` under `min(remaining, cap)`.
    pub async fn io_capped<T, E, F>(&self, cap: Duration, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let budget = self.remaining().min(cap);
        match tokio::time::timeout(budget, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e.into().context(what.to_string())),
            Err(_) => Err(anyhow!("{what}: timed out")),
        }
    }
}

struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

static INSECURE_TLS: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    Arc::new(config)
});

/// TLS client handshake with certificate verification disabled. SNI comes
/// from `host`; IP literals get none.
pub async fn tls_handshake<S: Conn>(
    stream: S,
    host: &str,
    deadline: &Deadline,
    cap: Duration,
) -> Result<tokio_rustls::client::TlsStream<S>> {
    let name =
        ServerName::try_from(host).map_err(|_| anyhow!("invalid tls server name {host:?}"))?;
    let connector = TlsConnector::from(Arc::clone(&INSECURE_TLS));
    deadline
        .io_capped(cap, "tls handshake failed", connector.connect(name, stream))
        .await
}

fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(false);
    let _ = sock.set_linger(Some(Duration::from_secs(0)));
}

/// Open, tune and track a fresh TCP connection. Resolution and connect each
/// run under `min(remaining, cap)`.
pub async fn direct_connect(
    host: &str,
    port: u16,
    deadline: &Deadline,
    cap: Duration,
    tracker: &Arc<ConnTracker>,
) -> Result<Tracked<TcpStream>> {
    let addrs: Vec<SocketAddr> = if let Ok(ip) = host.parse::<IpAddr>() {
        vec![SocketAddr::new(ip, port)]
    } else {
        deadline
            .io_capped(
                cap,
                "resolve",
                tokio::net::lookup_host((host, port)),
            )
            .await?
            .collect()
    };
    if addrs.is_empty() {
        bail!("no such host {host}");
    }

    let mut last_err = None;
    for addr in addrs {
        match deadline
            .io_capped(cap, "tcp connect", TcpStream::connect(addr))
            .await
        {
            Ok(stream) => {
                tune_socket(&stream);
                return Ok(tracker.track(stream));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("tcp connect: no addresses")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMode {
    Socks5,
    Http,
    Https,
}

impl UpstreamMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "s5" | "socks5" => Ok(UpstreamMode::Socks5),
            "http" => Ok(UpstreamMode::Http),
            "https" => Ok(UpstreamMode::Https),
            other => bail!("unsupported upstream mode: {other}"),
        }
    }
}

/// Dialer through a fixed upstream proxy. Built once at startup, shared
/// read-only; every dial opens a fresh tunnel and spawns nothing.
#[derive(Debug, Clone)]
pub struct UpstreamDialer {
    pub endpoint: Endpoint,
    pub mode: UpstreamMode,
    pub cred: Option<Credential>,
}

impl UpstreamDialer {
    async fn dial(
        &self,
        target_host: &str,
        target_port: u16,
        deadline: &Deadline,
        cap: Duration,
        tracker: &Arc<ConnTracker>,
    ) -> Result<ProbeStream> {
        let mut tcp = direct_connect(
            &self.endpoint.host,
            self.endpoint.port,
            deadline,
            cap,
            tracker,
        )
        .await
        .context("upstream dial")?;

        match self.mode {
            UpstreamMode::Socks5 => {
                socks5::handshake(
                    &mut tcp,
                    target_host,
                    target_port,
                    self.cred.as_ref(),
                    deadline,
                )
                .await
                .context("upstream socks5")?;
                Ok(Box::new(tcp))
            }
            UpstreamMode::Http => {
                let tunnel = wire::connect_through(
                    tcp,
                    target_host,
                    target_port,
                    self.cred.as_ref(),
                    deadline,
                )
                .await
                .context("upstream http")?;
                Ok(Box::new(tunnel))
            }
            UpstreamMode::Https => {
                let tls =
                    tls_handshake(tcp, &self.endpoint.host, deadline, deadline.remaining())
                        .await
                        .context("upstream https")?;
                let tunnel = wire::connect_through(
                    tls,
                    target_host,
                    target_port,
                    self.cred.as_ref(),
                    deadline,
                )
                .await
                .context("upstream https")?;
                Ok(Box::new(tunnel))
            }
        }
    }
}

/// How probes reach their target: directly or through the upstream proxy.
#[derive(Debug, Clone)]
pub enum Dialer {
    Direct,
    Upstream(UpstreamDialer),
}

impl Dialer {
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        deadline: &Deadline,
        cap: Duration,
        tracker: &Arc<ConnTracker>,
    ) -> Result<ProbeStream> {
        match self {
            Dialer::Direct => {
                let stream = direct_connect(host, port, deadline, cap, tracker).await?;
                Ok(Box::new(stream))
            }
            Dialer::Upstream(up) => up.dial(host, port, deadline, cap, tracker).await,
        }
    }
}
