//! TLS plumbing: SNI certificate selection for the HTTPS listener and
//! client configuration for `https://` backends.

use crate::server::SharedSnapshot;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fmt;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Selects the certificate for a handshake from the currently published snapshot
pub struct SniResolver {
    snapshot: SharedSnapshot,
}

impl SniResolver {
    pub fn new(snapshot: SharedSnapshot) -> Self {
        Self { snapshot }
    }

    /// Certificate for `server_name`, if any root domain covers it
    pub fn lookup(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let snapshot = self.snapshot.load();
        let found = snapshot.certificates.resolve(server_name);

        match found {
            Some(entry) => {
                debug!("SNI {} -> {}", server_name, entry.root_domain());
                Some(entry.certified_key())
            }
            None => {
                debug!("No certificate for SNI {}", server_name);
                None
            }
        }
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver")
            .field("certificates", &self.snapshot.load().certificates.len())
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        // Returning None aborts the handshake
        self.lookup(client_hello.server_name()?)
    }
}

/// Acceptor for the HTTPS listener, resolving certificates through `snapshot`
pub fn acceptor(snapshot: SharedSnapshot) -> TlsAcceptor {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(snapshot)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsAcceptor::from(Arc::new(config))
}

/// Connector for `https://` backends, trusting the webpki root set
pub fn backend_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}
