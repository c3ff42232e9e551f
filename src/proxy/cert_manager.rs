use anyhow::{anyhow, Context};
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::OnceCell;
use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, KeyPair, KeyUsagePurpose, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use crate::proxy::session::Session;

/// Names covered by the built-in key pair
pub const DEFAULT_HOSTS: &[&str] = &["localhost", "*.localhost", "127.0.0.1", "::1"];

static DEFAULT_KEYS: OnceCell<KeyMaterial> = OnceCell::new();

/// A certificate chain and its private key.
pub struct KeyMaterial {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl KeyMaterial {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { cert_chain, key }
    }

    /// Load from PEM text: all certificates in `cert_pem`, the first key in `key_pem`.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<Self> {
        let cert_chain = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificate PEM")?;
        if cert_chain.is_empty() {
            return Err(anyhow!("No certificate found in PEM input"));
        }
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .context("Failed to parse private key PEM")?
            .ok_or_else(|| anyhow!("No private key found in PEM input"))?;
        Ok(Self { cert_chain, key })
    }

    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        let cert_pem = fs::read(cert_path)
            .with_context(|| format!("Failed to read certificate file {}", cert_path.display()))?;
        let key_pem = fs::read(key_path)
            .with_context(|| format!("Failed to read key file {}", key_path.display()))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Generate a fresh self-signed certificate valid for `hosts`.
    pub fn self_signed(hosts: &[&str]) -> anyhow::Result<Self> {
        let mut params = CertificateParams::default();
        params.subject_alt_names = hosts
            .iter()
            .map(|host| match IpAddr::from_str(host) {
                Ok(ip) => Ok(SanType::IpAddress(ip)),
                Err(_) => Ia5String::try_from(*host)
                    .map(SanType::DnsName)
                    .map_err(|_| anyhow!("Invalid hostname for certificate: {}", host)),
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hosts.first().copied().unwrap_or("localhost"));
        dn.push(DnType::OrganizationName, "tproxy");
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // Backdated for clock skew
        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(365)).unwrap_or(now);

        let key_pair = KeyPair::generate().context("Failed to generate key pair")?;
        let cert = params
            .self_signed(&key_pair)
            .context("Failed to self-sign certificate")?;

        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok(Self {
            cert_chain: vec![cert.der().clone()],
            key,
        })
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// TLS server configuration presenting this material. Offers HTTP/1.1 only.
    pub fn server_config(&self) -> anyhow::Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .context("Failed to build TLS server config")?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

impl Clone for KeyMaterial {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("certificates", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// Process-wide self-signed pair used when interception has no keys configured.
pub fn default_key_material() -> anyhow::Result<&'static KeyMaterial> {
    DEFAULT_KEYS.get_or_try_init(|| {
        tracing::debug!("Generating default interception key pair");
        KeyMaterial::self_signed(DEFAULT_HOSTS)
    })
}

/// Supplies certificate material for a hostname requested via SNI.
pub trait SniResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        hostname: &'a str,
        session: &'a Session,
    ) -> BoxFuture<'a, anyhow::Result<KeyMaterial>>;
}

struct SyncSni<F>(F);

impl<F> SniResolver for SyncSni<F>
where
    F: Fn(&str, &Session) -> anyhow::Result<KeyMaterial> + Send + Sync,
{
    fn resolve<'a>(
        &'a self,
        hostname: &'a str,
        session: &'a Session,
    ) -> BoxFuture<'a, anyhow::Result<KeyMaterial>> {
        let material = (self.0)(hostname, session);
        async move { material }.boxed()
    }
}

struct AsyncSni<F>(F);

impl<F, Fut> SniResolver for AsyncSni<F>
where
    F: Fn(String, Session) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<KeyMaterial>> + Send + 'static,
{
    fn resolve<'a>(
        &'a self,
        hostname: &'a str,
        session: &'a Session,
    ) -> BoxFuture<'a, anyhow::Result<KeyMaterial>> {
        (self.0)(hostname.to_string(), session.clone()).boxed()
    }
}

pub fn sni_fn<F>(f: F) -> Arc<dyn SniResolver>
where
    F: Fn(&str, &Session) -> anyhow::Result<KeyMaterial> + Send + Sync + 'static,
{
    Arc::new(SyncSni(f))
}

pub fn sni_async<F, Fut>(f: F) -> Arc<dyn SniResolver>
where
    F: Fn(String, Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<KeyMaterial>> + Send + 'static,
{
    Arc::new(AsyncSni(f))
}

pub type PerSessionKeys = Arc<dyn Fn(&Session) -> Option<KeyMaterial> + Send + Sync>;

/// Where interception certificates come from
#[derive(Clone, Default)]
pub enum KeySource {
    /// The built-in self-signed pair
    #[default]
    Default,
    Static(KeyMaterial),
    /// Chosen per session; `None` falls back to the built-in pair
    PerSession(PerSessionKeys),
    /// Chosen per handshake from the requested server name
    Sni(Arc<dyn SniResolver>),
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Default => f.write_str("Default"),
            KeySource::Static(material) => f.debug_tuple("Static").field(material).finish(),
            KeySource::PerSession(_) => f.write_str("PerSession(..)"),
            KeySource::Sni(_) => f.write_str("Sni(..)"),
        }
    }
}

/// Turns a [`KeySource`] into server configurations for intercepted tunnels.
pub struct CertManager {
    source: KeySource,
    fixed: Option<Arc<ServerConfig>>,
    fallback: OnceCell<Arc<ServerConfig>>,
}

impl CertManager {
    /// Static and default material is converted up front so configuration
    /// errors surface at startup rather than on the first tunnel.
    pub fn new(source: KeySource) -> anyhow::Result<Self> {
        let fixed = match &source {
            KeySource::Default => Some(default_key_material()?.server_config()?),
            KeySource::Static(material) => Some(material.server_config()?),
            KeySource::PerSession(_) | KeySource::Sni(_) => None,
        };
        Ok(Self {
            source,
            fixed,
            fallback: OnceCell::new(),
        })
    }

    pub fn uses_sni(&self) -> bool {
        matches!(self.source, KeySource::Sni(_))
    }

    fn fallback_config(&self) -> anyhow::Result<Arc<ServerConfig>> {
        self.fallback
            .get_or_try_init(|| default_key_material()?.server_config())
            .cloned()
    }

    /// Server configuration for a tunnel to `host`.
    pub async fn server_config_for_host(
        &self,
        host: &str,
        session: &Session,
    ) -> anyhow::Result<Arc<ServerConfig>> {
        if let Some(config) = &self.fixed {
            return Ok(config.clone());
        }
        match &self.source {
            KeySource::PerSession(keys) => match keys(session) {
                Some(material) => material.server_config(),
                None => self.fallback_config(),
            },
            KeySource::Sni(resolver) => {
                let material = resolver
                    .resolve(host, session)
                    .await
                    .with_context(|| format!("SNI callback failed for {}", host))?;
                material.server_config()
            }
            KeySource::Default | KeySource::Static(_) => self.fallback_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn pem_pair() -> (String, String) {
        let mut params = CertificateParams::new(vec!["test.local".to_string()]).unwrap();
        params.distinguished_name = DistinguishedName::new();
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn loads_pem_material_from_files() {
        let (cert_pem, key_pem) = pem_pair();
        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(cert_pem.as_bytes()).unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        key_file.write_all(key_pem.as_bytes()).unwrap();

        let material = KeyMaterial::from_pem_files(cert_file.path(), key_file.path()).unwrap();
        assert_eq!(material.cert_chain().len(), 1);
        assert!(material.server_config().is_ok());
    }

    #[test]
    fn rejects_pem_without_key() {
        let (cert_pem, _) = pem_pair();
        let err = KeyMaterial::from_pem(cert_pem.as_bytes(), b"").unwrap_err();
        assert!(err.to_string().contains("No private key"));
    }

    #[test]
    fn default_material_is_generated_once() {
        let first = default_key_material().unwrap() as *const KeyMaterial;
        let second = default_key_material().unwrap() as *const KeyMaterial;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn per_session_keys_fall_back_to_default() {
        let custom = KeyMaterial::self_signed(&["custom.test"]).unwrap();
        let manager = CertManager::new(KeySource::PerSession(Arc::new(move |session: &Session| {
            (session.id() == "custom").then(|| custom.clone())
        })))
        .unwrap();

        let custom_config = manager
            .server_config_for_host("custom.test", &Session::new("custom"))
            .await
            .unwrap();
        let fallback_a = manager
            .server_config_for_host("other.test", &Session::new("other"))
            .await
            .unwrap();
        let fallback_b = manager
            .server_config_for_host("other.test", &Session::new("other2"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&fallback_a, &fallback_b));
        assert!(!Arc::ptr_eq(&custom_config, &fallback_a));
    }

    #[tokio::test]
    async fn sni_errors_carry_the_hostname() {
        let manager = CertManager::new(KeySource::Sni(sni_fn(|host, _| {
            Err(anyhow!("no certificate for {}", host))
        })))
        .unwrap();
        assert!(manager.uses_sni());
        let err = manager
            .server_config_for_host("denied.test", &Session::new("a"))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("denied.test"));
    }
}
