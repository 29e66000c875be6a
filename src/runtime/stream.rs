use std::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::error::{Error, Result};

#[cfg(feature = "rustls-tls")]
use super::tls_rustls::TlsConfig;
#[cfg(feature = "openssl-tls")]
use super::tls_openssl::TlsConfig;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Options needed to open a socket to a single cluster node.
#[derive(Clone, Debug)]
pub(crate) struct StreamOptions {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) connect_timeout: Option<Duration>,
    #[cfg(any(feature = "rustls-tls", feature = "openssl-tls"))]
    pub(crate) tls: Option<TlsConfig>,
}

/// A TCP connection to a node, optionally wrapped in TLS.
#[derive(Debug)]
pub(crate) enum AsyncStream {
    Tcp(TcpStream),
    #[cfg(feature = "rustls-tls")]
    TlsRustls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    #[cfg(feature = "openssl-tls")]
    TlsOpenssl(Box<tokio_openssl::SslStream<TcpStream>>),
}

impl AsyncStream {
    pub(crate) async fn connect(options: StreamOptions) -> Result<Self> {
        let tcp = connect_tcp(&options.host, options.port, options.connect_timeout).await?;

        #[cfg(feature = "rustls-tls")]
        if let Some(cfg) = &options.tls {
            let stream = super::tls_rustls::connect(&options.host, tcp, cfg).await?;
            return Ok(Self::TlsRustls(Box::new(stream)));
        }
        #[cfg(feature = "openssl-tls")]
        if let Some(cfg) = &options.tls {
            let stream = super::tls_openssl::connect(&options.host, tcp, cfg).await?;
            return Ok(Self::TlsOpenssl(Box::new(stream)));
        }

        Ok(Self::Tcp(tcp))
    }
}

async fn connect_tcp(host: &str, port: u16, connect_timeout: Option<Duration>) -> Result<TcpStream> {
    let timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
    let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::dns_resolve(format!("could not resolve {host}:{port}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(Error::dns_resolve(format!("no addresses for {host}:{port}")));
    }
    // prefer IPv4, consistent with the rest of the dispatch path preferring determinism.
    addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });

    let mut last_err = None;
    for addr in &addrs {
        match super::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Ok(Err(e)) => last_err = Some(Error::from(e)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::dns_resolve(format!("no addresses for {host}:{port}"))))
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::TlsRustls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(feature = "openssl-tls")]
            Self::TlsOpenssl(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::TlsRustls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(feature = "openssl-tls")]
            Self::TlsOpenssl(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "rustls-tls")]
            Self::TlsRustls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(feature = "openssl-tls")]
            Self::TlsOpenssl(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "rustls-tls")]
            Self::TlsRustls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(feature = "openssl-tls")]
            Self::TlsOpenssl(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
