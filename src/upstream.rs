use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// A resolved dial target for the host reverse-proxy.
///
/// Parsed from an upstream spec string:
/// - `unix/<path>` — Unix domain socket; the `unix/` prefix is stripped and
///   the remainder (including any leading slash) is kept verbatim.
/// - `:<port>` — TCP on `127.0.0.1`.
/// - `<host>:<port>` — TCP as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// TCP address in `host:port` form
    Tcp(String),
    /// Unix domain socket path
    Unix(PathBuf),
}

/// Upstream spec could not be parsed into a dial target
#[derive(Debug, Clone)]
pub struct InvalidUpstream {
    pub spec: String,
}

impl std::fmt::Display for InvalidUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid upstream spec {:?} (expected host:port, :port or unix/<path>)",
            self.spec
        )
    }
}

impl std::error::Error for InvalidUpstream {}

impl Upstream {
    /// Parse an upstream spec. Placeholders must already be expanded.
    pub fn parse(spec: &str) -> Result<Self, InvalidUpstream> {
        if let Some(path) = spec.strip_prefix("unix/") {
            if path.is_empty() {
                return Err(InvalidUpstream { spec: spec.to_string() });
            }
            return Ok(Upstream::Unix(PathBuf::from(path)));
        }

        if let Some(port) = spec.strip_prefix(':') {
            return match port.parse::<u16>() {
                Ok(p) => Ok(Upstream::Tcp(format!("127.0.0.1:{}", p))),
                Err(_) => Err(InvalidUpstream { spec: spec.to_string() }),
            };
        }

        match spec.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Upstream::Tcp(spec.to_string()))
            }
            _ => Err(InvalidUpstream { spec: spec.to_string() }),
        }
    }

    /// Dial the upstream, returning a unified stream for TCP and UDS.
    pub async fn connect(&self) -> io::Result<UpstreamStream> {
        match self {
            Upstream::Tcp(addr) => Ok(UpstreamStream::Tcp(TcpStream::connect(addr.as_str()).await?)),
            Upstream::Unix(path) => Ok(UpstreamStream::Unix(UnixStream::connect(path).await?)),
        }
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Upstream::Tcp(addr) => write!(f, "{}", addr),
            Upstream::Unix(path) => write!(f, "unix/{}", path.display()),
        }
    }
}

/// Connected stream to an upstream, either TCP or Unix domain socket
pub enum UpstreamStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
