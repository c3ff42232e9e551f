//! Shared fixtures for the integration tests: an in-memory outbound
//! connector and helpers for driving sessions over duplex pipes.
#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tproxy_core::models::ConnectionOptions;
use tproxy_core::proxy::error::ProxyError;
use tproxy_core::proxy::transport::{BoxedIo, UpstreamConnector};
use tproxy_core::proxy::{serve_connection, ProxyContext, ProxyOptions};

pub const WAIT: Duration = Duration::from_secs(5);
const PIPE_BYTES: usize = 64 * 1024;

/// Hands every outbound connection to the test as the far end of a duplex pipe.
pub struct MockConnector {
    dialed: Mutex<Vec<ConnectionOptions>>,
    origins: mpsc::UnboundedSender<DuplexStream>,
}

impl UpstreamConnector for MockConnector {
    fn connect<'a>(
        &'a self,
        options: &'a ConnectionOptions,
    ) -> BoxFuture<'a, Result<BoxedIo, ProxyError>> {
        self.dialed.lock().unwrap().push(options.clone());
        let (proxy_side, origin_side) = tokio::io::duplex(PIPE_BYTES);
        let _ = self.origins.send(origin_side);
        async move { Ok(Box::new(proxy_side) as BoxedIo) }.boxed()
    }
}

pub struct TestProxy {
    pub ctx: Arc<ProxyContext>,
    connector: Arc<MockConnector>,
    origins: mpsc::UnboundedReceiver<DuplexStream>,
}

impl TestProxy {
    pub fn new(options: ProxyOptions) -> Self {
        let (tx, origins) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            dialed: Mutex::new(Vec::new()),
            origins: tx,
        });
        let ctx = Arc::new(ProxyContext::with_connector(options, connector.clone()).unwrap());
        Self {
            ctx,
            connector,
            origins,
        }
    }

    /// Open a client connection; returns the client end and the session task.
    pub fn client(&self, id: &str) -> (DuplexStream, JoinHandle<()>) {
        let (client, proxy_side) = tokio::io::duplex(PIPE_BYTES);
        let ctx = self.ctx.clone();
        let id = id.to_string();
        let task = tokio::spawn(async move { serve_connection(proxy_side, id, ctx).await });
        (client, task)
    }

    /// The origin end of the next outbound connection.
    pub async fn next_origin(&mut self) -> DuplexStream {
        tokio::time::timeout(WAIT, self.origins.recv())
            .await
            .expect("outbound connection opened")
            .expect("connector alive")
    }

    pub fn dialed(&self) -> Vec<ConnectionOptions> {
        self.connector.dialed.lock().unwrap().clone()
    }

    pub fn dialed_addresses(&self) -> Vec<(String, u16)> {
        self.dialed()
            .into_iter()
            .map(|o| (o.endpoint.host, o.endpoint.port))
            .collect()
    }
}

pub async fn read_exactly<R: AsyncRead + Unpin>(stream: &mut R, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("read in time")
        .expect("read ok");
    buf
}

/// Read up to and including the blank line ending a message head.
pub async fn read_head<R: AsyncRead + Unpin>(stream: &mut R) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        tokio::time::timeout(WAIT, stream.read_exact(&mut byte))
            .await
            .expect("head in time")
            .expect("head ok");
        head.push(byte[0]);
    }
    head
}

pub async fn read_to_close<R: AsyncRead + Unpin>(stream: &mut R) -> Vec<u8> {
    let mut buf = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut buf))
        .await
        .expect("peer closed in time")
        .expect("read ok");
    buf
}

/// Client end of a CONNECT tunnel as an eager client drives it: the CONNECT
/// head goes out glued to the first bytes written on top (a ClientHello,
/// usually), and the proxy's plaintext answer is consumed before reads reach
/// the layer above.
pub struct TunnelClient<S> {
    inner: S,
    corked: Option<Vec<u8>>,
    flushing: Vec<u8>,
    accepted: Option<usize>,
    remaining: usize,
    skipped: Vec<u8>,
}

impl<S> TunnelClient<S> {
    pub fn new(inner: S, connect_head: &[u8], answer_len: usize) -> Self {
        Self {
            inner,
            corked: Some(connect_head.to_vec()),
            flushing: Vec::new(),
            accepted: None,
            remaining: answer_len,
            skipped: Vec::with_capacity(answer_len),
        }
    }

    /// The proxy's answer to CONNECT, as consumed so far
    pub fn answer(&self) -> &[u8] {
        &self.skipped
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TunnelClient<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.remaining > 0 {
            let mut scratch = [0u8; 64];
            let want = self.remaining.min(scratch.len());
            let mut partial = ReadBuf::new(&mut scratch[..want]);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut partial))?;
            let n = partial.filled().len();
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
            let this = &mut *self;
            this.skipped.extend_from_slice(partial.filled());
            this.remaining -= n;
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TunnelClient<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if let Some(mut head) = this.corked.take() {
            head.extend_from_slice(buf);
            this.flushing = head;
            this.accepted = Some(buf.len());
        }
        while !this.flushing.is_empty() {
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &this.flushing))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.flushing.drain(..n);
        }
        if let Some(n) = this.accepted.take() {
            return Poll::Ready(Ok(n));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
