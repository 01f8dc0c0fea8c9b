//! Routing table: immutable domain -> entry snapshot

use crate::entry::ProxyEntry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Immutable mapping from domain to its proxy entries
///
/// Each domain holds its entries ordered by path prefix length, longest first,
/// so the first prefix hit during lookup is the most specific one.
#[derive(Debug, Default, Clone)]
pub struct RoutingTable {
    by_domain: HashMap<String, Vec<Arc<ProxyEntry>>>,
}

impl RoutingTable {
    /// Build a table from entries. A repeated `(domain, path)` key keeps the last entry.
    pub fn load<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = ProxyEntry>,
    {
        let mut by_domain: HashMap<String, Vec<Arc<ProxyEntry>>> = HashMap::new();

        for entry in entries {
            let slot = by_domain.entry(entry.domain().to_string()).or_default();
            match slot.iter_mut().find(|e| e.path() == entry.path()) {
                Some(existing) => *existing = Arc::new(entry),
                None => slot.push(Arc::new(entry)),
            }
        }

        for entries in by_domain.values_mut() {
            entries.sort_by(|a, b| b.path().len().cmp(&a.path().len()));
        }

        Self { by_domain }
    }

    /// Exact domain match (the entry that covers the whole domain)
    pub fn resolve(&self, domain: &str) -> Option<Arc<ProxyEntry>> {
        self.by_domain
            .get(domain)?
            .iter()
            .find(|e| e.path().is_empty())
            .cloned()
    }

    /// Longest path-prefix match for a request, falling back to the domain entry
    pub fn resolve_path(&self, domain: &str, request_path: &str) -> Option<Arc<ProxyEntry>> {
        let request_path = request_path.trim_start_matches('/');

        self.by_domain
            .get(domain)?
            .iter()
            .find(|e| prefix_matches(e.path(), request_path))
            .cloned()
    }

    /// All entries, ordered by domain then path
    pub fn list(&self) -> Vec<Arc<ProxyEntry>> {
        let mut entries: Vec<_> = self.by_domain.values().flatten().cloned().collect();
        entries.sort_by(|a, b| (a.domain(), a.path()).cmp(&(b.domain(), b.path())));
        entries
    }

    /// Every domain with at least one entry
    pub fn domains(&self) -> BTreeSet<String> {
        self.by_domain.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_domain.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}
