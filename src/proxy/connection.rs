//! Per-connection driver
//!
//! One task per accepted connection runs [`serve_connection`]: it registers
//! the session, gates authentication, resolves and opens the outbound side,
//! optionally intercepts TLS, relays until either side closes, maps failures
//! to client responses, and tears everything down exactly once.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::models::{ConnectionOptions, HttpMessage, StartLine, Tunnel};
use crate::proxy::auth::{self, AuthOutcome, PROXY_AUTHORIZATION};
use crate::proxy::codec;
use crate::proxy::config::ProxyOptions;
use crate::proxy::error::{self, ProxyError};
use crate::proxy::inject::{Direction, Pipeline};
use crate::proxy::registry::ConnectionRegistry;
use crate::proxy::session::{Session, SessionPhase};
use crate::proxy::target;
use crate::proxy::tls::TlsInterceptor;
use crate::proxy::transport::{BoxedIo, Io, Prebuffered, TcpConnector, Transport, UpstreamConnector};

/// Upper bound for flushing error responses and closing transports
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const DISCARD_BUFFER_BYTES: usize = 8 * 1024;

/// Everything connection tasks share
pub struct ProxyContext {
    pub options: ProxyOptions,
    registry: ConnectionRegistry,
    connector: Arc<dyn UpstreamConnector>,
    interceptor: Option<TlsInterceptor>,
}

impl ProxyContext {
    pub fn new(options: ProxyOptions) -> anyhow::Result<Self> {
        let connector = Arc::new(TcpConnector::new(options.connect_timeout));
        Self::with_connector(options, connector)
    }

    pub fn with_connector(
        options: ProxyOptions,
        connector: Arc<dyn UpstreamConnector>,
    ) -> anyhow::Result<Self> {
        let interceptor = if options.intercept {
            Some(TlsInterceptor::new(
                options.keys.clone(),
                options.verify_upstream_tls,
            )?)
        } else {
            None
        };
        Ok(Self {
            options,
            registry: ConnectionRegistry::new(),
            connector,
            interceptor,
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    fn request_pipeline(&self) -> Pipeline {
        Pipeline::new(Direction::Request, self.options.inject_data.clone())
    }

    fn response_pipeline(&self) -> Pipeline {
        Pipeline::new(Direction::Response, self.options.inject_response.clone())
    }
}

/// Drive one client connection to completion.
pub async fn serve_connection<T>(io: T, id: impl Into<String>, ctx: Arc<ProxyContext>)
where
    T: Io + 'static,
{
    let session = Session::with_limits(
        id,
        ctx.options.max_body_capture_bytes,
        ctx.options.max_header_bytes,
    );
    let registration = ctx.registry.register(session.clone());
    let mut connection = Connection {
        ctx,
        session: session.clone(),
        client: Some(Transport::plain(io)),
        upstream: None,
    };

    let result = tokio::select! {
        result = connection.drive() => result,
        _ = session.destroyed() => {
            tracing::debug!(id = %session.id(), "Teardown requested");
            Ok(())
        }
    };

    if let Err(err) = result {
        log_failure(&session, &err);
        connection.respond_error(&err).await;
    }
    connection.teardown().await;
    drop(registration);
}

fn log_failure(session: &Session, err: &ProxyError) {
    let id = session.id();
    if err.is_expected_disconnect() {
        tracing::debug!(id, "Connection closed: {}", err);
        return;
    }
    match err {
        ProxyError::AuthRejected | ProxyError::MalformedRequest(_) => {
            tracing::warn!(id, "Client error: {}", err)
        }
        ProxyError::ConnectTimeout | ProxyError::HostNotFound(_) | ProxyError::TlsHandshake(_) => {
            tracing::warn!(id, "Tunnel failed: {}", err)
        }
        _ => tracing::error!(id, "Error handling connection: {}", err),
    }
}

struct Connection {
    ctx: Arc<ProxyContext>,
    session: Session,
    client: Option<Transport>,
    upstream: Option<Transport>,
}

impl Connection {
    async fn drive(&mut self) -> Result<(), ProxyError> {
        let Some((mut head, mut rest)) = self.next_head(Vec::new()).await? else {
            return Ok(());
        };

        if let Some(verifier) = self.ctx.options.auth.clone() {
            self.session.advance(SessionPhase::Unauthenticated);
            loop {
                let request = codec::parse(&head, false, false);
                match auth::authenticate(verifier.as_ref(), &request, &self.session).await {
                    AuthOutcome::Accepted { user } => {
                        tracing::debug!(id = %self.session.id(), user = %user, "Proxy credentials accepted");
                        let mut headers = request.headers;
                        headers.remove(PROXY_AUTHORIZATION);
                        self.session.strip_request_header(PROXY_AUTHORIZATION);
                        head = codec::rebuild(&headers, &head);
                        break;
                    }
                    AuthOutcome::Rejected => return Err(ProxyError::AuthRejected),
                    AuthOutcome::Challenge => {
                        self.write_client(error::AUTH_CHALLENGE).await?;
                        let Some(leftover) = self.discard_body(&request, rest).await? else {
                            tracing::debug!(
                                id = %self.session.id(),
                                "Challenged request body cannot be skipped, closing"
                            );
                            return Ok(());
                        };
                        match self.next_head(leftover).await? {
                            Some((next_head, next_rest)) => {
                                head = next_head;
                                rest = next_rest;
                            }
                            None => return Ok(()),
                        }
                    }
                }
            }
        }

        self.session.advance(SessionPhase::ResolvingTarget);
        self.open_tunnel(head, rest).await?;
        self.relay().await
    }

    /// Read the next request head, starting from bytes already buffered.
    /// Every head read here is recorded on the request accumulator.
    async fn next_head(
        &mut self,
        mut buffered: Vec<u8>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, ProxyError> {
        let max = self.ctx.options.max_header_bytes;
        let next = match codec::find_header_end(&buffered) {
            Some(end) => {
                let rest = buffered.split_off(end);
                Some((buffered, rest))
            }
            None => {
                let client = self.client.as_mut().ok_or_else(closed_client)?;
                let mut replay = Prebuffered::with_prefix(client, buffered);
                codec::read_message_head(&mut replay, max).await?
            }
        };
        if let Some((head, rest)) = &next {
            self.session.append_request_bytes(&[head.as_slice(), rest.as_slice()].concat());
        }
        Ok(next)
    }

    /// Skip the body of a request that was answered with a challenge so the
    /// next request on the socket can be read. Skipped bytes are still
    /// recorded on the request accumulator. Returns whatever followed the
    /// body, or `None` when the body cannot be delimited or has not been sent
    /// (`Expect: 100-continue`).
    async fn discard_body(
        &mut self,
        request: &HttpMessage,
        rest: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, ProxyError> {
        let headers = &request.headers;
        let chunked = codec::is_chunked(headers);
        let length = codec::content_length(headers);
        if !chunked && length.is_none() && headers.contains("content-length") {
            return Ok(None);
        }
        if !chunked && length.unwrap_or(0) == 0 {
            return Ok(Some(rest));
        }
        let awaits_continue = headers
            .get("expect")
            .is_some_and(|value| value.to_ascii_lowercase().contains("100-continue"));
        if awaits_continue {
            return Ok(None);
        }

        if chunked {
            self.skip_chunked(rest).await.map(Some)
        } else {
            self.skip_exact(length.unwrap_or(0), rest).await.map(Some)
        }
    }

    async fn skip_exact(&mut self, length: u64, mut rest: Vec<u8>) -> Result<Vec<u8>, ProxyError> {
        if rest.len() as u64 >= length {
            return Ok(rest.split_off(length as usize));
        }
        let client = self.client.as_mut().ok_or_else(closed_client)?;
        let mut remaining = length - rest.len() as u64;
        let mut buf = vec![0u8; DISCARD_BUFFER_BYTES];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = client.read(&mut buf[..want]).await.map_err(ProxyError::from_io)?;
            if n == 0 {
                return Err(closed_mid_body());
            }
            self.session.append_request_bytes(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(Vec::new())
    }

    /// Read through the `0\r\n\r\n` terminator of a chunked body.
    async fn skip_chunked(&mut self, rest: Vec<u8>) -> Result<Vec<u8>, ProxyError> {
        let terminator = codec::CHUNKED_TERMINATOR;
        let client = self.client.as_mut().ok_or_else(closed_client)?;
        let mut buf = vec![0u8; DISCARD_BUFFER_BYTES];
        // Tail of what was already scanned, so a split terminator is still found
        let mut window: Vec<u8> = Vec::new();
        let mut pending = rest;
        let mut recorded = true;
        loop {
            let mut scan = std::mem::take(&mut window);
            let carried = scan.len();
            scan.extend_from_slice(&pending);
            if let Some(pos) = scan.windows(terminator.len()).position(|w| w == terminator) {
                let end = pos + terminator.len() - carried;
                if !recorded {
                    self.session.append_request_bytes(&pending[..end]);
                }
                return Ok(pending.split_off(end));
            }
            if !recorded {
                self.session.append_request_bytes(&pending);
            }
            let keep = scan.len().min(terminator.len() - 1);
            window = scan.split_off(scan.len() - keep);

            let n = client.read(&mut buf).await.map_err(ProxyError::from_io)?;
            if n == 0 {
                return Err(closed_mid_body());
            }
            pending = buf[..n].to_vec();
            recorded = false;
        }
    }

    async fn open_tunnel(&mut self, head: Vec<u8>, rest: Vec<u8>) -> Result<(), ProxyError> {
        let options = &self.ctx.options;
        let request = codec::parse(&head, false, false);
        let Some(StartLine::Request { method, path, .. }) = request.start_line.clone() else {
            return Err(ProxyError::MalformedRequest("unrecognised request line".into()));
        };
        let is_connect = method.is_connect();
        let target = request_target(&request, &path, is_connect)?;

        let initial = target::resolve_initial(&target)
            .ok_or_else(|| ProxyError::MalformedRequest(format!("invalid target {}", target)))?;
        self.session.set_tunnel(Tunnel::from_target(&initial));

        let data = [head.as_slice(), rest.as_slice()].concat();
        let decision = target::decide_upstream(&options.upstream, &data, &self.session).await;
        let mut connection = target::resolve_with_upstream(decision.as_deref(), &target)
            .ok_or_else(|| {
                ProxyError::MalformedRequest(format!(
                    "invalid upstream {}",
                    decision.as_deref().unwrap_or_default()
                ))
            })?;

        let chained_https = connection.upstream.as_ref().is_some_and(|u| u.is_https());
        self.session.set_https(is_connect || chained_https);
        connection.local_address = options.tcp_outgoing_address.resolve(&data, &self.session);
        self.session.set_tunnel(Tunnel::from_options(&connection));

        self.session.advance(SessionPhase::TunnelPending);
        tracing::info!(
            id = %self.session.id(),
            "{} {} => {}",
            method,
            connection.target(),
            connection.endpoint
        );
        let upstream = self.ctx.connector.connect(&connection).await?;
        self.upstream = Some(Transport::Plain(upstream));

        let intercepting = is_connect && self.should_intercept();
        let origin_host = connection.target().host.clone();

        if is_connect && !connection.is_chained() {
            self.write_client(error::OK).await?;
            self.session.advance(SessionPhase::Relaying);
            if intercepting {
                self.intercept(rest, Vec::new(), &origin_host).await?;
            } else if !rest.is_empty() {
                self.send_upstream(rest).await?;
            }
            return Ok(());
        }

        // Pipelined TLS bytes must not reach the next proxy in the clear
        let (head_payload, replay) = if intercepting {
            (head, rest)
        } else {
            (data, Vec::new())
        };
        let payload = with_chain_credentials(&connection, &request, head_payload);
        self.send_upstream(payload).await?;
        self.session.advance(SessionPhase::Relaying);

        if intercepting {
            self.await_chained_connect(replay, &origin_host).await?;
        }
        Ok(())
    }

    /// Relay the next proxy's answer to a chained CONNECT and intercept only
    /// if it accepted the tunnel.
    async fn await_chained_connect(&mut self, replay: Vec<u8>, host: &str) -> Result<(), ProxyError> {
        let max = self.ctx.options.max_header_bytes;
        let upstream = self.upstream.as_mut().ok_or_else(closed_upstream)?;
        let Some((head, rest)) = codec::read_message_head(upstream, max).await? else {
            return Err(ProxyError::Upstream(
                "upstream proxy closed before answering CONNECT".into(),
            ));
        };
        let status = codec::parse(&head, true, false).status_code();

        let client = self.client.as_mut().ok_or_else(closed_client)?;
        self.ctx
            .response_pipeline()
            .forward(Bytes::from(head), client, &self.session)
            .await?;

        if matches!(status, Some(200..=299)) {
            self.intercept(replay, rest, host).await
        } else {
            tracing::debug!(id = %self.session.id(), ?status, "Upstream proxy refused CONNECT");
            if !rest.is_empty() {
                let client = self.client.as_mut().ok_or_else(closed_client)?;
                self.ctx
                    .response_pipeline()
                    .forward(Bytes::from(rest), client, &self.session)
                    .await?;
            }
            if !replay.is_empty() {
                self.send_upstream(replay).await?;
            }
            Ok(())
        }
    }

    fn should_intercept(&self) -> bool {
        self.ctx.interceptor.is_some() && self.session.is_https() && !self.session.is_intercepted()
    }

    /// Swap both plain transports for TLS. Bytes already read from either
    /// side are replayed into the respective handshake.
    async fn intercept(
        &mut self,
        client_replay: Vec<u8>,
        upstream_replay: Vec<u8>,
        host: &str,
    ) -> Result<(), ProxyError> {
        let ctx = self.ctx.clone();
        let Some(interceptor) = ctx.interceptor.as_ref() else {
            return Ok(());
        };
        if !self.session.mark_intercepted() {
            return Ok(());
        }

        let client = take_plain(&mut self.client).ok_or_else(closed_client)?;
        let upstream = take_plain(&mut self.upstream).ok_or_else(closed_upstream)?;
        tracing::info!(id = %self.session.id(), host, "Intercepting TLS");

        let (client, upstream) = interceptor
            .upgrade(
                with_replay(client, client_replay),
                with_replay(upstream, upstream_replay),
                host,
                &self.session,
            )
            .await?;
        self.client = Some(client);
        self.upstream = Some(upstream);
        self.session.advance(SessionPhase::TlsRelaying);
        Ok(())
    }

    /// Request-direction transform for bytes the accumulator already saw.
    async fn send_upstream(&mut self, payload: Vec<u8>) -> Result<(), ProxyError> {
        let out = self
            .ctx
            .request_pipeline()
            .transform(Bytes::from(payload), &self.session)
            .await;
        let upstream = self.upstream.as_mut().ok_or_else(closed_upstream)?;
        upstream.write_all(&out).await.map_err(ProxyError::from_io)?;
        upstream.flush().await.map_err(ProxyError::from_io)
    }

    async fn write_client(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        let client = self.client.as_mut().ok_or_else(closed_client)?;
        client.write_all(data).await.map_err(ProxyError::from_io)?;
        client.flush().await.map_err(ProxyError::from_io)
    }

    async fn relay(&mut self) -> Result<(), ProxyError> {
        let (Some(client), Some(upstream)) = (self.client.take(), self.upstream.take()) else {
            return Ok(());
        };
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
        let requests = self.ctx.request_pipeline();
        let responses = self.ctx.response_pipeline();

        let result = tokio::select! {
            result = requests.pump(&mut client_read, &mut upstream_write, &self.session) => {
                tracing::debug!(id = %self.session.id(), "Client side finished");
                result
            }
            result = responses.pump(&mut upstream_read, &mut client_write, &self.session) => {
                tracing::debug!(id = %self.session.id(), "Upstream side finished");
                result
            }
        };

        self.client = Some(client_read.unsplit(client_write));
        self.upstream = Some(upstream_read.unsplit(upstream_write));
        result.map(|_| ())
    }

    async fn respond_error(&mut self, err: &ProxyError) {
        let (Some(response), Some(client)) = (err.client_response(), self.client.as_mut()) else {
            return;
        };
        let write = async {
            client.write_all(response).await?;
            client.flush().await
        };
        if let Ok(Err(e)) = tokio::time::timeout(SHUTDOWN_GRACE, write).await {
            tracing::debug!(id = %self.session.id(), "Could not deliver error response: {}", e);
        }
    }

    /// Close whatever transports are still held. Safe to repeat.
    async fn teardown(&mut self) {
        self.session.advance(SessionPhase::Closed);
        self.session.destroy();
        for mut transport in [self.client.take(), self.upstream.take()].into_iter().flatten() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, transport.shutdown()).await;
        }
    }
}

fn closed_client() -> ProxyError {
    ProxyError::BrokenPipe("client transport already closed".into())
}

fn closed_mid_body() -> ProxyError {
    ProxyError::BrokenPipe("client closed mid-body".into())
}

fn closed_upstream() -> ProxyError {
    ProxyError::BrokenPipe("upstream transport already closed".into())
}

fn take_plain(slot: &mut Option<Transport>) -> Option<BoxedIo> {
    match slot.take()? {
        Transport::Plain(io) => Some(io),
        tls @ Transport::Tls(_) => {
            *slot = Some(tls);
            None
        }
    }
}

fn with_replay(io: BoxedIo, replay: Vec<u8>) -> BoxedIo {
    if replay.is_empty() {
        io
    } else {
        Box::new(Prebuffered::with_prefix(io, replay))
    }
}

/// The absolute target of a request. Origin-form requests (transparent
/// mode) fall back to the Host header.
fn request_target(request: &HttpMessage, path: &str, is_connect: bool) -> Result<String, ProxyError> {
    if is_connect || path.contains("://") {
        return Ok(path.to_string());
    }
    request
        .headers
        .get("host")
        .map(str::to_string)
        .ok_or_else(|| ProxyError::MalformedRequest(format!("no Host header for {}", path)))
}

/// Add `Proxy-Authorization` for the next proxy when its address carried userinfo.
fn with_chain_credentials(connection: &ConnectionOptions, request: &HttpMessage, payload: Vec<u8>) -> Vec<u8> {
    match (&connection.upstream, &connection.endpoint.credentials) {
        (Some(_), Some(credentials)) => {
            let mut headers = request.headers.clone();
            headers.insert(PROXY_AUTHORIZATION, codec::basic_credentials(credentials));
            codec::rebuild(&headers, &payload)
        }
        _ => payload,
    }
}
