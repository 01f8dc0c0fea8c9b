//! Proxy server configuration

use crate::certificate::CertificateFiles;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Default location of per-root-domain certificate directories
pub const DEFAULT_CERTS_DIR: &str = "/etc/letsencrypt/live";

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_address: IpAddr,
    pub http_port: u16,
    pub https_port: u16,
    pub enable_https: bool,
    pub certs_dir: PathBuf,
    pub certificate_files: CertificateFiles,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 80,
            https_port: 443,
            enable_https: true,
            certs_dir: PathBuf::from(DEFAULT_CERTS_DIR),
            certificate_files: CertificateFiles::default(),
        }
    }
}

impl ProxyConfig {
    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.http_port)
    }

    pub fn https_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.https_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.http_addr().port(), 80);
        assert_eq!(config.https_addr().port(), 443);
        assert!(config.enable_https);
        assert_eq!(config.certificate_files.certificate, "fullchain.pem");
        assert_eq!(config.certificate_files.key, "privkey.pem");
    }
}
