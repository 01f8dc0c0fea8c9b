//! Reload coordinator
//!
//! Owns the published [`Snapshot`] (routing table + certificate store) and the
//! listeners. A reload builds both halves off the async threads, then publishes
//! them with one pointer swap, so a reader sees either the old pair or the new
//! pair. Requests already running keep the snapshot they started with.

use crate::certificate::{self, CertificateStore};
use crate::config::ProxyConfig;
use crate::database::EntryStore;
use crate::entry::{split_host, ProxyEntry};
use crate::error::{ProxyError, Result, StoreError};
use crate::proxy::{ProxyEngine, Scheme};
use crate::routing::RoutingTable;
use crate::tls;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Routing table and certificate store published together
#[derive(Debug, Default)]
pub struct Snapshot {
    pub routes: RoutingTable,
    pub certificates: CertificateStore,
}

/// Handle readers use to load the currently published snapshot
pub type SharedSnapshot = Arc<ArcSwap<Snapshot>>;

/// A running accept loop
struct ListenerHandle {
    scheme: Scheme,
    local_addr: SocketAddr,
    /// sending true stops the accept loop; open connections keep running
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the snapshots and listeners; the admin collaborator's entry point
pub struct ProxyServer {
    config: ProxyConfig,
    store: Arc<dyn EntryStore>,
    snapshot: SharedSnapshot,
    engine: Arc<ProxyEngine>,
    listeners: Mutex<Vec<ListenerHandle>>,
    reload_lock: TokioMutex<()>,
    lifecycle_lock: TokioMutex<()>,
}

impl ProxyServer {
    /// Create a stopped server with an empty snapshot
    pub fn new(config: ProxyConfig, store: Arc<dyn EntryStore>) -> Self {
        let snapshot: SharedSnapshot = Arc::new(ArcSwap::from_pointee(Snapshot::default()));

        Self {
            config,
            store,
            engine: Arc::new(ProxyEngine::new(snapshot.clone())),
            snapshot,
            listeners: Mutex::new(Vec::new()),
            reload_lock: TokioMutex::new(()),
            lifecycle_lock: TokioMutex::new(()),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// The currently published snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Rebuild both snapshots from the store and certificate directory and publish them
    ///
    /// A store failure leaves the previous snapshot in place.
    pub async fn reload(&self) -> Result<()> {
        let _guard = self.reload_lock.lock().await;

        let store = self.store.clone();
        let certs_dir = self.config.certs_dir.clone();
        let files = self.config.certificate_files.clone();

        let (entries, certificates) = tokio::task::spawn_blocking(move || {
            let entries = store.list()?;
            let certificates = CertificateStore::load(&certs_dir, &files);
            Ok::<_, StoreError>((entries, certificates))
        })
        .await??;

        let routes = RoutingTable::load(entries);

        info!(
            "Reloaded {} proxy entries and {} certificates",
            routes.len(),
            certificates.len()
        );

        self.snapshot.store(Arc::new(Snapshot {
            routes,
            certificates,
        }));

        Ok(())
    }

    /// Reload, then (re)bind the HTTP and HTTPS listeners
    pub async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().await;

        self.reload().await?;

        let previous: Vec<ListenerHandle> = self.listeners.lock().drain(..).collect();
        shutdown(previous).await;

        let mut listeners = vec![self.bind(Scheme::Http, self.config.http_addr(), None).await?];

        if self.config.enable_https {
            let acceptor = tls::acceptor(self.snapshot.clone());
            listeners.push(
                self.bind(Scheme::Https, self.config.https_addr(), Some(acceptor))
                    .await?,
            );
        }

        *self.listeners.lock() = listeners;

        Ok(())
    }

    /// Close all listeners. Safe to call repeatedly.
    pub async fn stop(&self) {
        let _guard = self.lifecycle_lock.lock().await;

        let listeners: Vec<ListenerHandle> = self.listeners.lock().drain(..).collect();
        shutdown(listeners).await;
    }

    /// Bound address of the plaintext listener, while running
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.local_addr(Scheme::Http)
    }

    /// Bound address of the TLS listener, while running
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.local_addr(Scheme::Https)
    }

    fn local_addr(&self, scheme: Scheme) -> Option<SocketAddr> {
        self.listeners
            .lock()
            .iter()
            .find(|l| l.scheme == scheme)
            .map(|l| l.local_addr)
    }

    async fn bind(
        &self,
        scheme: Scheme,
        addr: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<ListenerHandle> {
        let bind_error = |source| ProxyError::Bind {
            addr: addr.to_string(),
            source,
        };

        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!("{} listener on {}", scheme, local_addr);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let engine = self.engine.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,

                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote_addr)) => {
                            spawn_connection(engine.clone(), stream, remote_addr, scheme, acceptor.clone());
                        }
                        Err(e) => {
                            warn!("Accept error on {}: {}", local_addr, e);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
            info!("{} listener on {} closed", scheme, local_addr);
        });

        Ok(ListenerHandle {
            scheme,
            local_addr,
            shutdown_tx,
            task,
        })
    }

    /// Add a new entry to the store, then reload
    pub async fn add_entry(&self, entry: ProxyEntry) -> Result<ProxyEntry> {
        let stored = entry.clone();
        self.with_store(move |store| store.insert(&stored)).await?;

        info!("Added proxy entry {}", entry.host_key());
        self.reload().await?;
        Ok(entry)
    }

    /// Replace (or create) the entry with the same domain and path, then reload
    pub async fn update_entry(&self, entry: ProxyEntry) -> Result<bool> {
        let replaced = self.with_store(move |store| store.upsert(&entry)).await?;
        self.reload().await?;
        Ok(replaced)
    }

    /// Remove entries for `host` (`domain` or `domain/path`), optionally only
    /// those pointing at `target`, then reload
    pub async fn remove_entry(&self, host: &str, target: Option<&str>) -> Result<usize> {
        let host_owned = host.to_string();
        let target = target.map(str::to_string);
        let removed = self
            .with_store(move |store| store.remove(&host_owned, target.as_deref()))
            .await?;

        info!("Removed {} proxy entries for {}", removed, host);
        self.reload().await?;
        Ok(removed)
    }

    /// Entries in the published routing table
    pub fn list_entries(&self) -> Vec<Arc<ProxyEntry>> {
        self.snapshot().routes.list()
    }

    /// Domains in the published routing table
    pub fn list_domains(&self) -> BTreeSet<String> {
        self.snapshot().routes.domains()
    }

    /// Published entry for `domain` or `domain/path`
    pub fn find_entry(&self, host: &str) -> Option<Arc<ProxyEntry>> {
        let (domain, path) = split_host(host);
        let path = path.trim_matches('/');
        let snapshot = self.snapshot();

        if path.is_empty() {
            snapshot.routes.resolve(&domain)
        } else {
            snapshot
                .routes
                .list()
                .into_iter()
                .find(|e| e.domain() == domain && e.path() == path)
        }
    }

    /// Write a certificate pair for `domain` into the certificate directory, then reload
    pub async fn add_certificate(
        &self,
        domain: &str,
        certificate_pem: &str,
        key_pem: &str,
    ) -> Result<()> {
        let folder = self.config.certs_dir.clone();
        let domain_owned = domain.to_string();
        let cert = certificate_pem.to_string();
        let key = key_pem.to_string();

        tokio::task::spawn_blocking(move || {
            certificate::install_certificate(&folder, &domain_owned, &cert, &key)
        })
        .await??;

        self.reload().await
    }

    /// Delete the certificate directory for `domain`, then reload
    pub async fn remove_certificate(&self, domain: &str) -> Result<bool> {
        let folder = self.config.certs_dir.clone();
        let domain_owned = domain.to_string();

        let removed = tokio::task::spawn_blocking(move || {
            certificate::remove_certificate(&folder, &domain_owned)
        })
        .await??;

        self.reload().await?;
        Ok(removed)
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn EntryStore) -> std::result::Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || f(store.as_ref())).await??)
    }
}

async fn shutdown(listeners: Vec<ListenerHandle>) {
    for listener in listeners {
        let _ = listener.shutdown_tx.send(true);
        if let Err(e) = listener.task.await {
            warn!(
                "{} listener on {} did not stop cleanly: {}",
                listener.scheme, listener.local_addr, e
            );
        }
    }
}

fn spawn_connection(
    engine: Arc<ProxyEngine>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    scheme: Scheme,
    acceptor: Option<TlsAcceptor>,
) {
    tokio::spawn(async move {
        let result = match acceptor {
            None => engine.serve_connection(stream, remote_addr, scheme).await,
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => engine.serve_connection(tls_stream, remote_addr, scheme).await,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", remote_addr, e);
                    return;
                }
            },
        };

        if let Err(e) = result {
            debug!("{} connection error from {}: {}", scheme, remote_addr, e);
        }
    });
}
