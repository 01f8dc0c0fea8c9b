//! domain-proxy - A multi-tenant HTTP/HTTPS reverse proxy
//!
//! Provides:
//! - Per-domain routing to backend targets, with optional path-prefix entries
//! - TLS termination with per-root-domain certificates selected via SNI
//! - HTTPS-upgrade and unconditional redirects, CORS header injection
//! - Atomic reload of routes and certificates without dropping connections

pub mod certificate;
pub mod config;
pub mod database;
pub mod entry;
pub mod error;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod tls;

pub use certificate::{CertificateEntry, CertificateFiles, CertificateStore};
pub use config::ProxyConfig;
pub use database::{EntryStore, MemoryStore, SqliteStore};
pub use entry::{EntrySpec, ProxyEntry};
pub use error::{EntryError, ProxyError};
pub use proxy::{ProxyEngine, Scheme};
pub use routing::RoutingTable;
pub use server::{ProxyServer, Snapshot};
