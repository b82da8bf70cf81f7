//! TLS for origin connections and the certificate capability handed to filters

use std::sync::Arc;

use dashmap::DashMap;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use crate::error::{Result, TamperError};

/// Client configuration trusting the webpki root set
pub fn default_client_config() -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TamperError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// SNI name for `host`, accepting bracketed IPv6 literals
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    ServerName::try_from(host.to_string())
        .map_err(|e| TamperError::Tls(format!("invalid server name '{}': {}", host, e)))
}

/// Mints a certificate for a host when the store has none
pub type CertGenerator<'a> = &'a (dyn Fn() -> Result<Arc<CertifiedKey>> + Send + Sync);

/// Per-host TLS identities used while intercepting HTTPS.
///
/// The interception core only carries this for filters and tunnel handlers.
pub trait CertStore: Send + Sync {
    /// Cached identity for `hostname`, or the one `generate` produces
    fn fetch(&self, hostname: &str, generate: CertGenerator<'_>) -> Result<Arc<CertifiedKey>>;
}

/// Certificate store that keeps every generated identity in memory
#[derive(Default)]
pub struct MemoryCertStore {
    certs: DashMap<String, Arc<CertifiedKey>>,
}

impl MemoryCertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

impl CertStore for MemoryCertStore {
    fn fetch(&self, hostname: &str, generate: CertGenerator<'_>) -> Result<Arc<CertifiedKey>> {
        let key = hostname.to_ascii_lowercase();
        if let Some(cert) = self.certs.get(&key) {
            return Ok(cert.clone());
        }

        // No shard lock is held while generating; a concurrent insert for the same host wins.
        debug!(host = %hostname, "Generating certificate");
        let cert = generate()?;
        Ok(self.certs.entry(key).or_insert(cert).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_rustls::rustls::pki_types::CertificateDer;
    use tokio_rustls::rustls::sign::{Signer, SigningKey};
    use tokio_rustls::rustls::{SignatureAlgorithm, SignatureScheme};

    #[derive(Debug)]
    struct NoKey;

    impl SigningKey for NoKey {
        fn choose_scheme(&self, _offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
            None
        }

        fn algorithm(&self) -> SignatureAlgorithm {
            SignatureAlgorithm::ECDSA
        }
    }

    fn identity(marker: u8) -> Arc<CertifiedKey> {
        Arc::new(CertifiedKey::new(
            vec![CertificateDer::from(vec![marker])],
            Arc::new(NoKey),
        ))
    }

    #[test]
    fn test_default_client_config_builds() {
        let config = default_client_config().unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("example.test").is_ok());
        assert!(server_name("[::1]").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("bad host").is_err());
    }

    #[test]
    fn test_memory_store_generates_once_per_host() {
        let store = MemoryCertStore::new();
        let generated = AtomicUsize::new(0);
        let generate = || -> Result<Arc<CertifiedKey>> {
            generated.fetch_add(1, Ordering::SeqCst);
            Ok(identity(1))
        };

        let first = store.fetch("Example.test", &generate).unwrap();
        let second = store.fetch("example.test", &generate).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(generated.load(Ordering::SeqCst), 1);

        store.fetch("other.test", &generate).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_generator_may_use_the_store() {
        let store = MemoryCertStore::new();
        let inner = || -> Result<Arc<CertifiedKey>> { Ok(identity(3)) };
        let outer = || -> Result<Arc<CertifiedKey>> {
            assert_eq!(store.len(), 0);
            store.fetch("ca.test", &inner)?;
            store.fetch("example.test", &inner)?;
            Ok(identity(4))
        };

        let cert = store.fetch("example.test", &outer).unwrap();
        // The identity stored while generating is the one every caller sees.
        assert_eq!(&cert.cert[0][..], &[3u8][..]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_memory_store_does_not_cache_failures() {
        let store = MemoryCertStore::new();
        let failing = || -> Result<Arc<CertifiedKey>> { Err(TamperError::Certificate("no CA".to_string())) };
        assert!(store.fetch("example.test", &failing).is_err());
        assert!(store.is_empty());

        let ok = || -> Result<Arc<CertifiedKey>> { Ok(identity(2)) };
        assert!(store.fetch("example.test", &ok).is_ok());
    }
}
