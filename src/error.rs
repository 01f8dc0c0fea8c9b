//! Error types shared across the proxy core

use hyper::StatusCode;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Rejected proxy entry configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntryError {
    #[error("Domain not specified")]
    MissingDomain,

    #[error("Target not specified")]
    MissingTarget,

    #[error("Both target and redirect URL are set for {0}")]
    AmbiguousTarget(String),

    #[error("Invalid target URL {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("Invalid path prefix: {0}")]
    InvalidPath(String),
}

/// Durable entry store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Entry already exists for {0}")]
    Duplicate(String),

    #[error("Stored entry is invalid: {0}")]
    Invalid(#[from] EntryError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Certificate material that could not be loaded or written
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("No certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("Unsupported private key in {path}: {reason}")]
    UnsupportedKey { path: PathBuf, reason: String },

    #[error("No certificate pair found in {0}")]
    MissingPair(PathBuf),

    #[error("Invalid root domain: {0:?}")]
    InvalidDomain(String),

    #[error("Certificate generation failed: {0}")]
    Generate(#[from] rcgen::RcgenError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failure while talking to a backend
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Connection to {addr} refused")]
    Refused { addr: String },

    #[error("Failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("TLS handshake with {host} failed: {source}")]
    Tls { host: String, source: io::Error },

    #[error("Invalid backend target: {0}")]
    InvalidTarget(String),

    #[error("Backend request failed: {0}")]
    Request(#[from] hyper::Error),

    #[error("Failed to build backend request: {0}")]
    Build(#[from] hyper::http::Error),
}

impl UpstreamError {
    /// Status returned to the client when no response headers were sent yet
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Refused { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors surfaced to the admin collaborator and process bootstrap
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error(transparent)]
    Entry(#[from] EntryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refused_maps_to_bad_gateway() {
        let err = UpstreamError::Refused { addr: "127.0.0.1:9".to_string() };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_other_upstream_failures_map_to_500() {
        let err = UpstreamError::Connect {
            addr: "backend.invalid:80".to_string(),
            source: io::Error::new(io::ErrorKind::Other, "dns failure"),
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            UpstreamError::InvalidTarget("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_entry_error_messages() {
        assert_eq!(EntryError::MissingDomain.to_string(), "Domain not specified");
        assert_eq!(EntryError::MissingTarget.to_string(), "Target not specified");
    }
}
