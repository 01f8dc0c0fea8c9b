//! Certificate store: per-root-domain TLS identities loaded from a directory tree
//!
//! Layout: `<certs_dir>/<root domain>/fullchain.pem` + `privkey.pem`
//! (or the bare `cert` / `key` names some deployments use).

use crate::error::CertificateError;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Canonical certificate chain file name
pub const CERTIFICATE_FILE: &str = "fullchain.pem";
/// Canonical private key file name
pub const KEY_FILE: &str = "privkey.pem";

const ALTERNATE_CERTIFICATE_FILE: &str = "cert";
const ALTERNATE_KEY_FILE: &str = "key";

/// File names of a certificate/key pair inside one root domain directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFiles {
    pub certificate: String,
    pub key: String,
}

impl Default for CertificateFiles {
    fn default() -> Self {
        Self {
            certificate: CERTIFICATE_FILE.to_string(),
            key: KEY_FILE.to_string(),
        }
    }
}

impl CertificateFiles {
    fn candidates(&self) -> [(&str, &str); 2] {
        [
            (self.certificate.as_str(), self.key.as_str()),
            (ALTERNATE_CERTIFICATE_FILE, ALTERNATE_KEY_FILE),
        ]
    }
}

/// One loaded TLS identity, keyed by the directory it came from
#[derive(Debug, Clone)]
pub struct CertificateEntry {
    root_domain: String,
    key: Arc<CertifiedKey>,
}

impl CertificateEntry {
    pub fn root_domain(&self) -> &str {
        &self.root_domain
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.key.clone()
    }
}

/// Immutable snapshot of root domain -> certificate
#[derive(Debug, Default, Clone)]
pub struct CertificateStore {
    entries: HashMap<String, CertificateEntry>,
}

impl CertificateStore {
    /// Load every root domain directory under `folder`
    ///
    /// A directory whose pair is missing or malformed is skipped with a warning.
    /// A missing `folder` yields an empty store.
    pub fn load(folder: &Path, files: &CertificateFiles) -> Self {
        let mut entries = HashMap::new();

        let dir = match fs::read_dir(folder) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Cannot read certificate directory {}: {}", folder.display(), e);
                return Self { entries };
            }
        };

        for item in dir.flatten() {
            let path = item.path();
            if !path.is_dir() {
                continue;
            }
            let Some(root_domain) = item.file_name().to_str().map(str::to_ascii_lowercase) else {
                warn!("Skipping non UTF-8 certificate directory {}", path.display());
                continue;
            };

            debug!("Loading certificate for {}", root_domain);

            match load_pair(&path, files) {
                Ok(key) => {
                    entries.insert(
                        root_domain.clone(),
                        CertificateEntry {
                            root_domain,
                            key: Arc::new(key),
                        },
                    );
                }
                Err(e) => warn!("Skipping certificate for {}: {}", root_domain, e),
            }
        }

        info!("Loaded {} certificate(s) from {}", entries.len(), folder.display());

        Self { entries }
    }

    /// Find the certificate covering `name`, most specific root domain first
    ///
    /// `a.b.example.com` tries `a.b.example.com`, `b.example.com`, `example.com`, `com`.
    pub fn resolve(&self, name: &str) -> Option<&CertificateEntry> {
        let host = name.split('/').next().unwrap_or(name).trim_end_matches('.');
        let host = host.to_ascii_lowercase();
        let mut candidate = host.as_str();

        loop {
            if candidate.is_empty() {
                return None;
            }
            if let Some(entry) = self.entries.get(candidate) {
                return Some(entry);
            }
            candidate = candidate.split_once('.')?.1;
        }
    }

    /// Root domains with a loaded certificate
    pub fn root_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.entries.keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Validate a PEM pair and write it as `<folder>/<domain>/fullchain.pem` + `privkey.pem`
pub fn install_certificate(
    folder: &Path,
    domain: &str,
    certificate_pem: &str,
    key_pem: &str,
) -> Result<PathBuf, CertificateError> {
    let dir = domain_dir(folder, domain)?;

    // Reject material that would be skipped on the next reload
    let certs = parse_certificates(certificate_pem.as_bytes(), &dir)?;
    let key = parse_key(key_pem.as_bytes(), &dir)?;
    signing_key(certs, key, &dir)?;

    fs::create_dir_all(&dir)?;
    fs::write(dir.join(CERTIFICATE_FILE), certificate_pem)?;
    fs::write(dir.join(KEY_FILE), key_pem)?;

    info!("Installed certificate for {}", domain);

    Ok(dir)
}

/// Delete a root domain directory. Returns whether anything was removed.
pub fn remove_certificate(folder: &Path, domain: &str) -> Result<bool, CertificateError> {
    let dir = domain_dir(folder, domain)?;
    if !dir.is_dir() {
        return Ok(false);
    }

    fs::remove_dir_all(&dir)?;
    info!("Removed certificate for {}", domain);
    Ok(true)
}

/// Generate a self-signed certificate covering `domain` and `*.domain`
pub fn generate_self_signed(folder: &Path, domain: &str) -> Result<PathBuf, CertificateError> {
    let san = vec![domain.to_string(), format!("*.{}", domain)];
    let cert = generate_simple_self_signed(san)?;

    let cert_pem = cert.serialize_pem()?;
    let key_pem = cert.serialize_private_key_pem();

    let dir = install_certificate(folder, domain, &cert_pem, &key_pem)?;
    info!("Generated self-signed certificate for: {}", domain);
    Ok(dir)
}

fn domain_dir(folder: &Path, domain: &str) -> Result<PathBuf, CertificateError> {
    let domain = domain.trim().to_ascii_lowercase();
    let invalid = domain.is_empty()
        || domain.starts_with('.')
        || domain.contains("..")
        || domain.contains(['/', '\\']);

    if invalid {
        return Err(CertificateError::InvalidDomain(domain));
    }
    Ok(folder.join(domain))
}

fn load_pair(dir: &Path, files: &CertificateFiles) -> Result<CertifiedKey, CertificateError> {
    let (cert_name, key_name) = files
        .candidates()
        .into_iter()
        .find(|(cert, key)| dir.join(cert).is_file() && dir.join(key).is_file())
        .ok_or_else(|| CertificateError::MissingPair(dir.to_path_buf()))?;

    let cert_path = dir.join(cert_name);
    let key_path = dir.join(key_name);

    let read = |path: &Path| {
        fs::read(path).map_err(|source| CertificateError::Read {
            path: path.to_path_buf(),
            source,
        })
    };

    let certs = parse_certificates(&read(&cert_path)?, &cert_path)?;
    let key = parse_key(&read(&key_path)?, &key_path)?;

    signing_key(certs, key, &key_path)
}

fn parse_certificates(
    pem: &[u8],
    path: &Path,
) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertificateError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(CertificateError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn parse_key(
    pem: &[u8],
    path: &Path,
) -> Result<rustls::pki_types::PrivateKeyDer<'static>, CertificateError> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(|source| CertificateError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CertificateError::NoPrivateKey(path.to_path_buf()))
}

fn signing_key(
    certs: Vec<CertificateDer<'static>>,
    key: rustls::pki_types::PrivateKeyDer<'static>,
    path: &Path,
) -> Result<CertifiedKey, CertificateError> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| {
        CertificateError::UnsupportedKey {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;

    Ok(CertifiedKey::new(certs, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_self_signed() {
        let dir = tempdir().unwrap();

        generate_self_signed(dir.path(), "example.com").unwrap();

        assert!(dir.path().join("example.com").join(CERTIFICATE_FILE).exists());
        assert!(dir.path().join("example.com").join(KEY_FILE).exists());
    }

    #[test]
    fn test_resolve_walks_to_root_domain() {
        let dir = tempdir().unwrap();
        generate_self_signed(dir.path(), "example.com").unwrap();

        let store = CertificateStore::load(dir.path(), &CertificateFiles::default());
        assert_eq!(store.len(), 1);

        for name in ["example.com", "a.example.com", "a.b.example.com", "A.Example.COM"] {
            let entry = store.resolve(name).unwrap();
            assert_eq!(entry.root_domain(), "example.com");
        }
        assert!(store.resolve("other.org").is_none());
        assert!(store.resolve("com").is_none());
        assert!(store.resolve("").is_none());
    }

    #[test]
    fn test_resolve_prefers_most_specific() {
        let dir = tempdir().unwrap();
        generate_self_signed(dir.path(), "example.com").unwrap();
        generate_self_signed(dir.path(), "shop.example.com").unwrap();

        let store = CertificateStore::load(dir.path(), &CertificateFiles::default());

        assert_eq!(store.resolve("x.shop.example.com").unwrap().root_domain(), "shop.example.com");
        assert_eq!(store.resolve("www.example.com").unwrap().root_domain(), "example.com");
    }

    #[test]
    fn test_resolve_strips_path_suffix() {
        let dir = tempdir().unwrap();
        generate_self_signed(dir.path(), "example.com").unwrap();

        let store = CertificateStore::load(dir.path(), &CertificateFiles::default());
        assert!(store.resolve("api.example.com/v1").is_some());
    }

    #[test]
    fn test_malformed_directory_is_skipped() {
        let dir = tempdir().unwrap();
        generate_self_signed(dir.path(), "good.test").unwrap();

        let bad = dir.path().join("bad.test");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join(CERTIFICATE_FILE), "not a certificate").unwrap();
        fs::write(bad.join(KEY_FILE), "not a key").unwrap();

        fs::create_dir_all(dir.path().join("empty.test")).unwrap();
        fs::write(dir.path().join("README"), "files at the top level are ignored").unwrap();

        let store = CertificateStore::load(dir.path(), &CertificateFiles::default());
        assert_eq!(store.root_domains(), vec!["good.test".to_string()]);
    }

    #[test]
    fn test_alternate_file_names() {
        let dir = tempdir().unwrap();
        let generated = generate_self_signed(dir.path(), "alt.test").unwrap();
        fs::rename(generated.join(CERTIFICATE_FILE), generated.join("cert")).unwrap();
        fs::rename(generated.join(KEY_FILE), generated.join("key")).unwrap();

        let store = CertificateStore::load(dir.path(), &CertificateFiles::default());
        assert!(store.resolve("www.alt.test").is_some());
    }

    #[test]
    fn test_missing_folder_yields_empty_store() {
        let dir = tempdir().unwrap();
        let store = CertificateStore::load(&dir.path().join("nope"), &CertificateFiles::default());
        assert!(store.is_empty());
    }

    #[test]
    fn test_install_rejects_bad_material_and_names() {
        let dir = tempdir().unwrap();

        let err = install_certificate(dir.path(), "x.test", "garbage", "garbage").unwrap_err();
        assert!(matches!(err, CertificateError::NoCertificates(_)));
        assert!(!dir.path().join("x.test").exists());

        for name in ["", "../etc", "a/b", ".hidden"] {
            assert!(matches!(
                install_certificate(dir.path(), name, "", ""),
                Err(CertificateError::InvalidDomain(_))
            ));
        }
    }

    #[test]
    fn test_remove_certificate() {
        let dir = tempdir().unwrap();
        generate_self_signed(dir.path(), "gone.test").unwrap();

        assert!(remove_certificate(dir.path(), "gone.test").unwrap());
        assert!(!remove_certificate(dir.path(), "gone.test").unwrap());
        assert!(CertificateStore::load(dir.path(), &CertificateFiles::default()).is_empty());
    }
}
