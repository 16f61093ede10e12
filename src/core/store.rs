// src/core/store.rs

//! Durable vulnerability records.
//!
//! `upsert` is the only write path. It runs in an immediate transaction so
//! writers for the same (domain, source) pair are serialized even across
//! processes, and it never lets a stored first-observed timestamp move later.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::db::Database;
use crate::core::error::StorageError;
use crate::core::knowledge_base;
use crate::core::models::{
    ScanFinding, ScannerKind, Severity, Target, Vulnerability, VulnerabilityState,
};

/// Persistence contract for reconciled findings.
pub trait VulnerabilityStore: Send + Sync {
    /// Current open record for the pair, if any.
    fn load_open(
        &self,
        domain_id: i64,
        source: ScannerKind,
    ) -> Result<Option<Vulnerability>, StorageError>;

    /// Creates or refreshes the open record for (target, source).
    fn upsert(
        &self,
        target: &Target,
        source: ScannerKind,
        findings: &[ScanFinding],
        run_at: DateTime<Utc>,
    ) -> Result<Vulnerability, StorageError>;
}

/// JSON shape of the `structured_data` column.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StructuredData {
    #[serde(default)]
    findings: Vec<ScanFinding>,
}

/// [`VulnerabilityStore`] backed by the worker's SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

const SELECT_COLUMNS: &str = "id, domain_id, source, title, state, severity, needs_population, \
     last_seen, structured_data, description, created_at";

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Every record for a domain, newest first.
    pub fn list_for_domain(&self, domain_id: i64) -> Result<Vec<Vulnerability>, StorageError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM vulnerabilities WHERE domain_id = ?1 ORDER BY id DESC"
        ))?;
        let rows = stmt.query_map(params![domain_id], RawVulnerability::from_row)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_vulnerability()?);
        }
        Ok(records)
    }

    #[cfg(test)]
    pub(crate) fn count_open(&self, domain_id: i64) -> Result<usize, StorageError> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vulnerabilities WHERE domain_id = ?1 AND state = 'open'",
            params![domain_id],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }
}

impl VulnerabilityStore for SqliteStore {
    fn load_open(
        &self,
        domain_id: i64,
        source: ScannerKind,
    ) -> Result<Option<Vulnerability>, StorageError> {
        let conn = self.db.conn();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM vulnerabilities \
                     WHERE domain_id = ?1 AND source = ?2 AND state = 'open'"
                ),
                params![domain_id, source.as_ref()],
                RawVulnerability::from_row,
            )
            .optional()?;
        raw.map(RawVulnerability::into_vulnerability).transpose()
    }

    fn upsert(
        &self,
        target: &Target,
        source: ScannerKind,
        findings: &[ScanFinding],
        run_at: DateTime<Utc>,
    ) -> Result<Vulnerability, StorageError> {
        let mut conn = self.db.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                "SELECT id, last_seen, structured_data FROM vulnerabilities \
                 WHERE domain_id = ?1 AND source = ?2 AND state = 'open'",
                params![target.domain_id, source.as_ref()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let id = match existing {
            Some((id, last_seen, data)) => {
                let stored: StructuredData = serde_json::from_str(&data)?;
                let merged = keep_earliest_observation(findings, &stored.findings);
                let last_seen = parse_timestamp("last_seen", &last_seen)?.max(run_at);
                tx.execute(
                    "UPDATE vulnerabilities SET structured_data = ?2, last_seen = ?3 WHERE id = ?1",
                    params![
                        id,
                        serde_json::to_string(&StructuredData { findings: merged })?,
                        format_timestamp(last_seen),
                    ],
                )?;
                debug!(id, domain = %target.name, %source, "Updated open vulnerability.");
                id
            }
            None => {
                let profile = knowledge_base::profile(source);
                tx.execute(
                    "INSERT INTO vulnerabilities (domain_id, source, title, state, severity, \
                     needs_population, last_seen, structured_data, description, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?6)",
                    params![
                        target.domain_id,
                        source.as_ref(),
                        profile.title,
                        VulnerabilityState::Open.as_ref(),
                        profile.severity.as_ref(),
                        format_timestamp(run_at),
                        serde_json::to_string(&StructuredData {
                            findings: findings.to_vec(),
                        })?,
                        profile.describe(&target.name),
                    ],
                )?;
                let id = tx.last_insert_rowid();
                info!(id, domain = %target.name, %source, category = %profile.category, "Created vulnerability.");
                id
            }
        };

        let record = tx
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM vulnerabilities WHERE id = ?1"),
                params![id],
                RawVulnerability::from_row,
            )?
            .into_vulnerability()?;
        tx.commit()?;
        Ok(record)
    }
}

/// Replaces `stored` with `incoming`, except that a key already on record keeps
/// whichever first-observed timestamp is earlier. Guards against a concurrent
/// run that loaded history before another run committed.
fn keep_earliest_observation(incoming: &[ScanFinding], stored: &[ScanFinding]) -> Vec<ScanFinding> {
    let recorded: HashMap<&str, DateTime<Utc>> = stored
        .iter()
        .map(|f| (f.key.as_str(), f.first_observed))
        .collect();
    incoming
        .iter()
        .map(|f| {
            let mut f = f.clone();
            if let Some(prior) = recorded.get(f.key.as_str()) {
                f.first_observed = f.first_observed.min(*prior);
            }
            f
        })
        .collect()
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidColumn {
            column,
            value: value.to_string(),
        })
}

/// Row as read from SQLite, before enum and JSON decoding.
struct RawVulnerability {
    id: i64,
    domain_id: i64,
    source: String,
    title: String,
    state: String,
    severity: String,
    needs_population: bool,
    last_seen: String,
    structured_data: String,
    description: String,
    created_at: String,
}

impl RawVulnerability {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            domain_id: row.get(1)?,
            source: row.get(2)?,
            title: row.get(3)?,
            state: row.get(4)?,
            severity: row.get(5)?,
            needs_population: row.get(6)?,
            last_seen: row.get(7)?,
            structured_data: row.get(8)?,
            description: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_vulnerability(self) -> Result<Vulnerability, StorageError> {
        let source = ScannerKind::from_str(&self.source).map_err(|_| StorageError::InvalidColumn {
            column: "source",
            value: self.source.clone(),
        })?;
        let state = VulnerabilityState::from_str(&self.state).map_err(|_| {
            StorageError::InvalidColumn {
                column: "state",
                value: self.state.clone(),
            }
        })?;
        let severity = Severity::from_str(&self.severity).map_err(|_| StorageError::InvalidColumn {
            column: "severity",
            value: self.severity.clone(),
        })?;
        let data: StructuredData = serde_json::from_str(&self.structured_data)?;

        Ok(Vulnerability {
            id: self.id,
            domain_id: self.domain_id,
            source,
            title: self.title,
            state,
            severity,
            needs_population: self.needs_population,
            last_seen: parse_timestamp("last_seen", &self.last_seen)?,
            description: self.description,
            findings: data.findings,
            created_at: parse_timestamp("created_at", &self.created_at)?,
        })
    }
}
