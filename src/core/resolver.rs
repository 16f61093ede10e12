// src/core/resolver.rs

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::core::db::Database;
use crate::core::error::{ResolutionError, StorageError};
use crate::core::models::{Organization, Target};

/// A syntactically valid, dot-separated hostname.
static RE_HOSTNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)([a-z0-9_]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z0-9-]{2,63}\.?$")
        .expect("hostname pattern compiles")
});

/// Resolves an organization to the targets of one run.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    /// Fails only if the organization is unknown; an organization without
    /// domains yields an empty list.
    async fn resolve(&self, organization_id: &str) -> Result<Vec<Target>, ResolutionError>;
}

/// Read-only organization metadata lookup.
pub trait OrganizationDirectory: Send + Sync {
    fn organization(&self, id: &str) -> Result<Option<Organization>, StorageError>;
}

/// A domain row from the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub id: i64,
    pub name: String,
    pub ip: Option<IpAddr>,
}

/// Read-only view of an organization's domains.
pub trait DomainInventory: Send + Sync {
    fn domains(&self, organization_id: &str) -> Result<Vec<DomainRecord>, StorageError>;
}

impl OrganizationDirectory for Database {
    fn organization(&self, id: &str) -> Result<Option<Organization>, StorageError> {
        let conn = self.conn();
        let org = conn
            .query_row(
                "SELECT id, name FROM organizations WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Organization {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(org)
    }
}

impl DomainInventory for Database {
    fn domains(&self, organization_id: &str) -> Result<Vec<DomainRecord>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, ip FROM domains WHERE organization_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![organization_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut domains = Vec::new();
        for row in rows {
            let (id, name, ip) = row?;
            let ip = match ip.as_deref().map(str::parse::<IpAddr>) {
                Some(Ok(addr)) => Some(addr),
                Some(Err(_)) => {
                    warn!(domain = %name, ip = ?ip, "Ignoring unparseable inventory IP.");
                    None
                }
                None => None,
            };
            domains.push(DomainRecord { id, name, ip });
        }
        Ok(domains)
    }
}

/// Name-to-address lookup seam.
#[async_trait]
pub trait AddressLookup: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, String>;
}

/// [`AddressLookup`] backed by the system resolver configuration.
pub struct DnsLookup {
    resolver: TokioAsyncResolver,
}

impl DnsLookup {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for DnsLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AddressLookup for DnsLookup {
    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, String> {
        match self.resolver.lookup_ip(name).await {
            Ok(answer) => Ok(answer.iter().collect()),
            Err(e) => Err(format!("DNS Error: {e}")),
        }
    }
}

/// Resolves targets from the inventory tables plus live DNS.
pub struct InventoryResolver<S> {
    source: S,
    lookup: Arc<dyn AddressLookup>,
}

impl<S> InventoryResolver<S>
where
    S: OrganizationDirectory + DomainInventory + Clone + 'static,
{
    pub fn new(source: S, lookup: Arc<dyn AddressLookup>) -> Self {
        Self { source, lookup }
    }

    async fn load(
        &self,
        organization_id: &str,
    ) -> Result<(Option<Organization>, Vec<DomainRecord>), StorageError> {
        let source = self.source.clone();
        let org_id = organization_id.to_string();
        tokio::task::spawn_blocking(move || {
            let org = source.organization(&org_id)?;
            let domains = match &org {
                Some(_) => source.domains(&org_id)?,
                None => Vec::new(),
            };
            Ok((org, domains))
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

#[async_trait]
impl<S> TargetResolver for InventoryResolver<S>
where
    S: OrganizationDirectory + DomainInventory + Clone + 'static,
{
    async fn resolve(&self, organization_id: &str) -> Result<Vec<Target>, ResolutionError> {
        let (org, domains) = self.load(organization_id).await?;
        let Some(org) = org else {
            return Err(ResolutionError::UnknownOrganization(organization_id.to_string()));
        };
        info!(organization = %org.name, domains = domains.len(), "Resolving scan targets.");

        // Cache for this call only; addresses may change between runs.
        let mut cache: HashMap<String, Vec<IpAddr>> = HashMap::new();
        let mut targets = Vec::with_capacity(domains.len());

        for domain in domains {
            let name = domain.name.trim().trim_end_matches('.').to_ascii_lowercase();
            if !RE_HOSTNAME.is_match(&name) {
                warn!(domain = %domain.name, "Skipping invalid domain name.");
                continue;
            }

            let addresses = match cache.get(&name) {
                Some(cached) => cached.clone(),
                None => {
                    let mut found = match self.lookup.lookup(&name).await {
                        Ok(found) => found,
                        Err(e) => {
                            warn!(domain = %name, error = %e, "Address lookup failed.");
                            Vec::new()
                        }
                    };
                    if found.is_empty() {
                        found.extend(domain.ip);
                    }
                    found.sort();
                    found.dedup();
                    cache.insert(name.clone(), found.clone());
                    found
                }
            };
            debug!(domain = %name, addresses = ?addresses, "Target resolved.");

            targets.push(Target {
                domain_id: domain.id,
                name,
                organization_id: org.id.clone(),
                addresses,
            });
        }
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    struct StaticLookup {
        answers: HashMap<String, Vec<IpAddr>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AddressLookup for StaticLookup {
        async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .get(name)
                .cloned()
                .ok_or_else(|| format!("NXDOMAIN {name}"))
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    fn seeded() -> (TempDir, Database) {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("worker.db")).unwrap();
        db.conn()
            .execute_batch(
                "INSERT INTO organizations (id, name) VALUES ('org-1', 'Org One'), ('org-2', 'Empty Org');
                 INSERT INTO domains (organization_id, name, ip) VALUES
                    ('org-1', 'example.com', NULL),
                    ('org-1', 'Legacy.Example.com.', '192.0.2.99'),
                    ('org-1', 'not a domain', NULL),
                    ('org-1', 'example.com', NULL);",
            )
            .unwrap();
        (dir, db)
    }

    fn resolver(db: Database) -> (InventoryResolver<Database>, Arc<StaticLookup>) {
        let lookup = Arc::new(StaticLookup {
            answers: HashMap::from([("example.com".to_string(), vec![ip(2), ip(1), ip(2)])]),
            calls: AtomicUsize::new(0),
        });
        (InventoryResolver::new(db, lookup.clone()), lookup)
    }

    #[tokio::test]
    async fn test_resolve_builds_targets_with_addresses() {
        let (_dir, db) = seeded();
        let (resolver, lookup) = resolver(db);
        let targets = resolver.resolve("org-1").await.unwrap();

        let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["example.com", "legacy.example.com", "example.com"]);
        assert_eq!(targets[0].addresses, vec![ip(1), ip(2)]);
        // DNS failure falls back to the inventory address.
        assert_eq!(targets[1].addresses, vec![ip(99)]);
        assert!(targets.iter().all(|t| t.organization_id == "org-1"));
        // The duplicate domain row is served from the per-run cache.
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_organization_is_an_error() {
        let (_dir, db) = seeded();
        let (resolver, _) = resolver(db);
        let err = resolver.resolve("nope").await.unwrap_err();
        assert!(matches!(err, ResolutionError::UnknownOrganization(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_organization_without_domains_is_empty() {
        let (_dir, db) = seeded();
        let (resolver, _) = resolver(db);
        assert!(resolver.resolve("org-2").await.unwrap().is_empty());
    }

    #[test]
    fn test_directory_lookup() {
        let (_dir, db) = seeded();
        let org = db.organization("org-1").unwrap().unwrap();
        assert_eq!(org.name, "Org One");
        assert!(db.organization("org-9").unwrap().is_none());
    }

    #[test]
    fn test_hostname_pattern() {
        assert!(RE_HOSTNAME.is_match("examp1e.com"));
        assert!(RE_HOSTNAME.is_match("a-b.c.example.co.uk"));
        assert!(!RE_HOSTNAME.is_match("not a domain"));
        assert!(!RE_HOSTNAME.is_match("localhost"));
        assert!(!RE_HOSTNAME.is_match("-bad.example.com"));
    }
}
