//! Request/response injection around the relay
//!
//! Each direction runs one [`Pipeline`]: a chunk is recorded on the session,
//! handed to the optional injector, and written out before the next chunk is
//! read. A slow injector therefore holds back its own direction only.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::models::MessageProgress;
use crate::proxy::error::ProxyError;
use crate::proxy::session::Session;

const RELAY_BUFFER_BYTES: usize = 16 * 1024;

/// Rewrites one chunk of relayed bytes.
pub trait Injector: Send + Sync {
    fn inject<'a>(&'a self, chunk: Bytes, session: &'a Session) -> BoxFuture<'a, Bytes>;
}

struct SyncInjector<F>(F);

impl<F> Injector for SyncInjector<F>
where
    F: Fn(Bytes, &Session) -> Bytes + Send + Sync,
{
    fn inject<'a>(&'a self, chunk: Bytes, session: &'a Session) -> BoxFuture<'a, Bytes> {
        let out = (self.0)(chunk, session);
        async move { out }.boxed()
    }
}

struct AsyncInjector<F>(F);

impl<F, Fut> Injector for AsyncInjector<F>
where
    F: Fn(Bytes, Session) -> Fut + Send + Sync,
    Fut: Future<Output = Bytes> + Send + 'static,
{
    fn inject<'a>(&'a self, chunk: Bytes, session: &'a Session) -> BoxFuture<'a, Bytes> {
        (self.0)(chunk, session.clone()).boxed()
    }
}

pub fn inject_fn<F>(f: F) -> Arc<dyn Injector>
where
    F: Fn(Bytes, &Session) -> Bytes + Send + Sync + 'static,
{
    Arc::new(SyncInjector(f))
}

pub fn inject_async<F, Fut>(f: F) -> Arc<dyn Injector>
where
    F: Fn(Bytes, Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Bytes> + Send + 'static,
{
    Arc::new(AsyncInjector(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream
    Request,
    /// Upstream to client
    Response,
}

#[derive(Clone)]
pub struct Pipeline {
    direction: Direction,
    injector: Option<Arc<dyn Injector>>,
}

impl Pipeline {
    pub fn new(direction: Direction, injector: Option<Arc<dyn Injector>>) -> Self {
        Self { direction, injector }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Record a chunk on the session's accumulator for this direction.
    pub fn observe(&self, chunk: &[u8], session: &Session) -> MessageProgress {
        match self.direction {
            Direction::Request => session.append_request_bytes(chunk),
            Direction::Response => session.append_response_bytes(chunk),
        }
    }

    pub async fn transform(&self, chunk: Bytes, session: &Session) -> Bytes {
        match &self.injector {
            Some(injector) => injector.inject(chunk, session).await,
            None => chunk,
        }
    }

    /// Observe then transform one chunk.
    pub async fn process(&self, chunk: Bytes, session: &Session) -> Bytes {
        self.observe(&chunk, session);
        self.transform(chunk, session).await
    }

    /// Run `process` on an already-read chunk and write the result out.
    pub async fn forward<W>(&self, chunk: Bytes, writer: &mut W, session: &Session) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let out = self.process(chunk, session).await;
        if !out.is_empty() {
            writer.write_all(&out).await.map_err(ProxyError::from_io)?;
            writer.flush().await.map_err(ProxyError::from_io)?;
        }
        Ok(())
    }

    /// Relay `reader` into `writer` until EOF. Returns the bytes read.
    pub async fn pump<R, W>(&self, reader: &mut R, writer: &mut W, session: &Session) -> Result<u64, ProxyError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; RELAY_BUFFER_BYTES];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await.map_err(ProxyError::from_io)?;
            if n == 0 {
                tracing::trace!(id = %session.id(), direction = ?self.direction, total, "relay reached EOF");
                return Ok(total);
            }
            total += n as u64;
            self.forward(Bytes::copy_from_slice(&buf[..n]), writer, session)
                .await?;
        }
    }
}
