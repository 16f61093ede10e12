// src/core/db.rs

//! SQLite connection and schema management.
//!
//! Holds the inventory tables this worker reads (`organizations`, `domains`)
//! and the `vulnerabilities` table it owns. The inventory is populated by the
//! surrounding platform; this crate only creates the tables if they are absent.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::debug;

use crate::core::error::StorageError;

/// Shared handle to the worker database.
#[derive(Clone)]
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL lets concurrent worker processes read while one writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        debug!(path = %path.display(), "Database opened.");
        Ok(db)
    }

    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("database lock poisoned")
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA_SQL)?;
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |r| r.get(0),
        )?;
        debug!(version, "Schema ready.");
        Ok(())
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);
INSERT OR IGNORE INTO schema_version VALUES (1);

CREATE TABLE IF NOT EXISTS organizations (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS domains (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    organization_id TEXT NOT NULL,
    name TEXT NOT NULL,
    ip TEXT,
    FOREIGN KEY (organization_id) REFERENCES organizations(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_domains_org ON domains(organization_id);

CREATE TABLE IF NOT EXISTS vulnerabilities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain_id INTEGER NOT NULL,
    source TEXT NOT NULL,                   -- scanner identifier, e.g. dnstwist
    title TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'open',     -- open, closed, remediated
    severity TEXT NOT NULL,                 -- Low, Medium, High, Critical
    needs_population INTEGER NOT NULL DEFAULT 0,
    last_seen TEXT NOT NULL,                -- RFC 3339, UTC
    structured_data TEXT NOT NULL,          -- {"findings": [...]}
    description TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_vulnerabilities_domain ON vulnerabilities(domain_id);

-- At most one open record per (domain, source).
CREATE UNIQUE INDEX IF NOT EXISTS idx_vulnerabilities_open_pair
    ON vulnerabilities(domain_id, source) WHERE state = 'open';
"#;
