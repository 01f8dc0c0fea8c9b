//! Durable proxy entry storage
//! The core only needs `list()`; the rest serves the admin collaborator.

use crate::entry::{split_host, EntrySpec, ProxyEntry};
use crate::error::StoreError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, Row};
use std::path::Path;
use tracing::warn;

/// Record store holding proxy entries, unique on `(domain, path)`
pub trait EntryStore: Send + Sync {
    /// Every stored entry. Rows that no longer validate are skipped.
    fn list(&self) -> Result<Vec<ProxyEntry>, StoreError>;

    /// Entries for `host` (`domain` or `domain/path`)
    fn find(&self, host: &str) -> Result<Vec<ProxyEntry>, StoreError> {
        let (domain, path) = split_host(host);
        let path = path.trim_matches('/');
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.domain() == domain && (path.is_empty() || e.path() == path))
            .collect())
    }

    /// Add a new entry; fails with `Duplicate` if the key exists
    fn insert(&self, entry: &ProxyEntry) -> Result<(), StoreError>;

    /// Replace the entry with the same key, or add it. Returns true if one was replaced.
    fn upsert(&self, entry: &ProxyEntry) -> Result<bool, StoreError>;

    /// Remove entries for `host`, optionally only those pointing at `target`
    fn remove(&self, host: &str, target: Option<&str>) -> Result<usize, StoreError>;
}

/// SQLite-backed entry store
/// Uses a Mutex to ensure only one thread accesses the connection at a time
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: String,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path)?;

        // Enable WAL mode so the admin CLI and the server can share the file
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path: db_path_str,
        };

        store.initialize()?;

        Ok(store)
    }

    fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS proxy_entries (
                domain TEXT NOT NULL,
                path TEXT NOT NULL DEFAULT '',
                target TEXT DEFAULT NULL,
                redirect_url TEXT DEFAULT NULL,
                redirect INTEGER NOT NULL DEFAULT 0,
                cors INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (domain, path)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_proxy_entries_domain ON proxy_entries(domain)",
            [],
        )?;

        Ok(())
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn spec_from_row(row: &Row<'_>) -> rusqlite::Result<EntrySpec> {
        Ok(EntrySpec {
            domain: row.get(0)?,
            path: row.get(1)?,
            target: row.get(2)?,
            redirect_url: row.get(3)?,
            redirect: row.get(4)?,
            cors: row.get(5)?,
        })
    }
}

impl EntryStore for SqliteStore {
    fn list(&self) -> Result<Vec<ProxyEntry>, StoreError> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT domain, path, target, redirect_url, redirect, cors
             FROM proxy_entries ORDER BY domain, path",
        )?;

        let specs = stmt
            .query_map([], Self::spec_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(validated(specs))
    }

    fn insert(&self, entry: &ProxyEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        let result = conn.execute(
            "INSERT INTO proxy_entries (domain, path, target, redirect_url, redirect, cors)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.domain(),
                entry.path(),
                entry.target().map(|t| t.as_str()),
                entry.redirect_url(),
                entry.redirect(),
                entry.cors()
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::Duplicate(entry.host_key()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn upsert(&self, entry: &ProxyEntry) -> Result<bool, StoreError> {
        let conn = self.conn.lock();

        let updated = conn.execute(
            "UPDATE proxy_entries
             SET target = ?3, redirect_url = ?4, redirect = ?5, cors = ?6,
                 updated_at = CURRENT_TIMESTAMP
             WHERE domain = ?1 AND path = ?2",
            params![
                entry.domain(),
                entry.path(),
                entry.target().map(|t| t.as_str()),
                entry.redirect_url(),
                entry.redirect(),
                entry.cors()
            ],
        )?;

        if updated > 0 {
            return Ok(true);
        }

        conn.execute(
            "INSERT INTO proxy_entries (domain, path, target, redirect_url, redirect, cors)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.domain(),
                entry.path(),
                entry.target().map(|t| t.as_str()),
                entry.redirect_url(),
                entry.redirect(),
                entry.cors()
            ],
        )?;

        Ok(false)
    }

    fn remove(&self, host: &str, target: Option<&str>) -> Result<usize, StoreError> {
        let (domain, path) = split_host(host);
        let path = path.trim_matches('/');

        let matching: Vec<ProxyEntry> = self
            .find(host)?
            .into_iter()
            .filter(|e| target.map_or(true, |t| targets_match(e, t)))
            .collect();

        let conn = self.conn.lock();
        let mut removed = 0;
        for entry in &matching {
            removed += conn.execute(
                "DELETE FROM proxy_entries WHERE domain = ?1 AND path = ?2",
                params![domain, entry.path()],
            )?;
        }

        if removed == 0 && target.is_none() && path.is_empty() {
            // rows that no longer validate are still removable by domain
            removed = conn.execute("DELETE FROM proxy_entries WHERE domain = ?1", params![domain])?;
        }

        Ok(removed)
    }
}

/// In-memory entry store, for embedding and tests
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<ProxyEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<I: IntoIterator<Item = ProxyEntry>>(entries: I) -> Self {
        Self {
            entries: Mutex::new(entries.into_iter().collect()),
        }
    }
}

impl EntryStore for MemoryStore {
    fn list(&self) -> Result<Vec<ProxyEntry>, StoreError> {
        Ok(self.entries.lock().clone())
    }

    fn insert(&self, entry: &ProxyEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| same_key(e, entry)) {
            return Err(StoreError::Duplicate(entry.host_key()));
        }
        entries.push(entry.clone());
        Ok(())
    }

    fn upsert(&self, entry: &ProxyEntry) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| same_key(e, entry)) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(true)
            }
            None => {
                entries.push(entry.clone());
                Ok(false)
            }
        }
    }

    fn remove(&self, host: &str, target: Option<&str>) -> Result<usize, StoreError> {
        let (domain, path) = split_host(host);
        let path = path.trim_matches('/');

        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| {
            let hit = e.domain() == domain
                && (path.is_empty() || e.path() == path)
                && target.map_or(true, |t| targets_match(e, t));
            !hit
        });
        Ok(before - entries.len())
    }
}

fn same_key(a: &ProxyEntry, b: &ProxyEntry) -> bool {
    a.domain() == b.domain() && a.path() == b.path()
}

fn targets_match(entry: &ProxyEntry, target: &str) -> bool {
    let wanted = target.trim().trim_end_matches('/');
    entry
        .target()
        .map(|t| t.as_str().trim_end_matches('/') == wanted)
        .unwrap_or(false)
        || entry
            .redirect_url()
            .map(|u| u.trim_end_matches('/') == wanted)
            .unwrap_or(false)
}

fn validated(specs: Vec<EntrySpec>) -> Vec<ProxyEntry> {
    specs
        .into_iter()
        .filter_map(|spec| {
            let key = spec.domain.clone();
            match ProxyEntry::from_record(spec) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping stored entry for {}: {}", key, e);
                    None
                }
            }
        })
        .collect()
}
