//! TLS interception
//!
//! Replaces a session's plain transports with two TLS sessions: the proxy
//! acts as the server towards the client and as a client towards the origin.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::Acceptor;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio_rustls::{LazyConfigAcceptor, TlsConnector, TlsStream};
use webpki_roots::TLS_SERVER_ROOTS;

use crate::proxy::cert_manager::{CertManager, KeySource};
use crate::proxy::error::ProxyError;
use crate::proxy::session::Session;
use crate::proxy::transport::{BoxedIo, Transport};

fn build_tls_client_config(verify: bool) -> ClientConfig {
    let mut config = if verify {
        let root_store = RootCertStore::from_iter(TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

/// Accepts whatever certificate the origin presents. Signatures are still
/// checked so the handshake itself stays sound.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

pub struct TlsInterceptor {
    certs: CertManager,
    connector: TlsConnector,
}

impl TlsInterceptor {
    pub fn new(keys: KeySource, verify_upstream: bool) -> anyhow::Result<Self> {
        Ok(Self {
            certs: CertManager::new(keys)?,
            connector: TlsConnector::from(Arc::new(build_tls_client_config(verify_upstream))),
        })
    }

    /// Run the server side of the handshake with the client.
    ///
    /// The certificate is picked from the ClientHello's server name, or
    /// `fallback_host` when the client sent none.
    pub async fn accept_client(
        &self,
        io: BoxedIo,
        fallback_host: &str,
        session: &Session,
    ) -> Result<TlsStream<BoxedIo>, ProxyError> {
        let start = LazyConfigAcceptor::new(Acceptor::default(), io)
            .await
            .map_err(|e| ProxyError::TlsHandshake(format!("client hello: {}", e)))?;

        let hostname = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .unwrap_or_else(|| fallback_host.to_string());

        let config = self
            .certs
            .server_config_for_host(&hostname, session)
            .await
            .map_err(|e| ProxyError::TlsHandshake(format!("{:#}", e)))?;

        let stream = start
            .into_stream(config)
            .await
            .map_err(|e| ProxyError::TlsHandshake(format!("client handshake for {}: {}", hostname, e)))?;
        tracing::debug!(id = %session.id(), host = %hostname, "client TLS established");
        Ok(TlsStream::from(stream))
    }

    /// Run the client side of the handshake with the origin, sending `host` as SNI.
    pub async fn connect_upstream(&self, io: BoxedIo, host: &str) -> Result<TlsStream<BoxedIo>, ProxyError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::TlsHandshake(format!("invalid server name {}: {}", host, e)))?;
        let stream = self
            .connector
            .connect(server_name, io)
            .await
            .map_err(|e| ProxyError::TlsHandshake(format!("upstream handshake for {}: {}", host, e)))?;
        Ok(TlsStream::from(stream))
    }

    /// Upgrade both sides of a tunnel. Returns `(client, upstream)`.
    pub async fn upgrade(
        &self,
        client: BoxedIo,
        upstream: BoxedIo,
        host: &str,
        session: &Session,
    ) -> Result<(Transport, Transport), ProxyError> {
        let (client, upstream) = tokio::try_join!(
            self.accept_client(client, host, session),
            self.connect_upstream(upstream, host)
        )?;
        Ok((
            Transport::Tls(Box::new(client)),
            Transport::Tls(Box::new(upstream)),
        ))
    }
}
