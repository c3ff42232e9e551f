//! Transports and outbound connections
//!
//! Both sides of a session are held as a [`Transport`]: either the plain
//! stream it was accepted/connected with, or the TLS stream that replaced it
//! during interception.

use bytes::{Buf, Bytes};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::TlsStream;

use crate::models::ConnectionOptions;
use crate::proxy::error::ProxyError;

/// Anything a session can relay over
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxedIo = Box<dyn Io>;

#[allow(clippy::large_enum_variant)]
pub enum Transport {
    Plain(BoxedIo),
    Tls(Box<TlsStream<BoxedIo>>),
}

impl Transport {
    pub fn plain<T: Io + 'static>(io: T) -> Self {
        Transport::Plain(Box::new(io))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, data),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Replays bytes that were read ahead before falling through to the inner
/// stream. Writes go straight to the inner stream.
pub struct Prebuffered<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Prebuffered<S> {
    pub fn with_prefix(inner: S, prefix: impl Into<Bytes>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// Bytes not yet handed out
    pub fn buffer(&self) -> &[u8] {
        &self.prefix
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.prefix.is_empty() {
            let n = self.prefix.len().min(out.remaining());
            out.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Opens the outbound side of a session.
pub trait UpstreamConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        options: &'a ConnectionOptions,
    ) -> BoxFuture<'a, Result<BoxedIo, ProxyError>>;
}

/// TCP connector honouring the connect timeout and outgoing address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn open(&self, options: &ConnectionOptions) -> Result<TcpStream, ProxyError> {
        let endpoint = &options.endpoint;
        let addrs: Vec<SocketAddr> = lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| ProxyError::HostNotFound(format!("{}: {}", endpoint.host, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(ProxyError::HostNotFound(endpoint.host.clone()));
        }

        // Only addresses of the bound family can work with an outgoing address
        let candidates: Vec<SocketAddr> = match options.local_address {
            Some(local) => addrs
                .into_iter()
                .filter(|addr| addr.is_ipv4() == local.is_ipv4())
                .collect(),
            None => addrs,
        };

        let mut last_error = ProxyError::HostNotFound(endpoint.host.clone());
        for addr in candidates {
            match connect_socket(addr, options).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    tracing::debug!("Connect to {} failed: {}", addr, err);
                    last_error = ProxyError::from_io(err);
                }
            }
        }
        Err(last_error)
    }
}

async fn connect_socket(addr: SocketAddr, options: &ConnectionOptions) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(local) = options.local_address {
        socket.bind(SocketAddr::new(local, 0))?;
    }
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

impl UpstreamConnector for TcpConnector {
    fn connect<'a>(
        &'a self,
        options: &'a ConnectionOptions,
    ) -> BoxFuture<'a, Result<BoxedIo, ProxyError>> {
        async move {
            let stream = tokio::time::timeout(self.connect_timeout, self.open(options))
                .await
                .map_err(|_| ProxyError::ConnectTimeout)??;
            Ok(Box::new(stream) as BoxedIo)
        }
        .boxed()
    }
}
