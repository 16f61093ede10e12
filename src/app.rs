// src/app.rs

use std::sync::Arc;

use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Settings;
use crate::core::db::Database;
use crate::core::error::{RunError, StorageError};
use crate::core::models::{RunContext, ScannerKind};
use crate::core::orchestrator::{Orchestrator, RunSummary};
use crate::core::proxy_verifier::{ProxyVerifier, VerificationReport, VerifierError};
use crate::core::resolver::{AddressLookup, DnsLookup, InventoryResolver};
use crate::core::scanner::{CrawlScanner, DnstwistScanner, IdentScanner, ScannerAdapter};
use crate::core::store::SqliteStore;

/// Wires settings, storage and scanners together for one worker process.
pub struct App {
    settings: Settings,
    db: Database,
    lookup: Arc<dyn AddressLookup>,
    dnstwist: Arc<DnstwistScanner>,
    ident: Arc<IdentScanner>,
    crawl: Arc<CrawlScanner>,
}

impl App {
    /// Opens the database named in `settings` and builds the production
    /// scanners and DNS lookup.
    pub fn new(settings: Settings) -> Result<Self, StorageError> {
        let db = Database::open(&settings.database.path)?;
        Ok(Self::with_parts(settings, db, Arc::new(DnsLookup::new())))
    }

    pub fn with_parts(settings: Settings, db: Database, lookup: Arc<dyn AddressLookup>) -> Self {
        let scanners = &settings.scanners;
        Self {
            dnstwist: Arc::new(DnstwistScanner::new(scanners.dnstwist.clone())),
            ident: Arc::new(IdentScanner::new(scanners.intrigue_ident.clone())),
            crawl: Arc::new(CrawlScanner::new(scanners.webscraper.clone())),
            settings,
            db,
            lookup,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Fresh context for a run started now.
    pub fn context(&self, organization_id: &str) -> RunContext {
        RunContext::new(
            organization_id,
            self.settings.proxy.clone(),
            self.settings.user_agent.clone(),
        )
    }

    /// Scanners for `only`, in their fixed order. Empty means all of them.
    pub fn scanners(&self, only: &[ScannerKind]) -> Vec<Arc<dyn ScannerAdapter>> {
        ScannerKind::iter()
            .filter(|kind| only.is_empty() || only.contains(kind))
            .map(|kind| match kind {
                ScannerKind::Dnstwist => self.dnstwist.clone() as Arc<dyn ScannerAdapter>,
                ScannerKind::IntrigueIdent => self.ident.clone() as Arc<dyn ScannerAdapter>,
                ScannerKind::Webscraper => self.crawl.clone() as Arc<dyn ScannerAdapter>,
            })
            .collect()
    }

    pub fn orchestrator(&self, only: &[ScannerKind]) -> Orchestrator {
        Orchestrator::new(
            Arc::new(InventoryResolver::new(self.db.clone(), self.lookup.clone())),
            self.scanners(only),
            Arc::new(SqliteStore::new(self.db.clone())),
        )
    }

    pub async fn run_scan(
        &self,
        organization_id: &str,
        only: &[ScannerKind],
        cancel: &CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let ctx = self.context(organization_id);
        info!(
            organization = organization_id,
            proxied = ctx.proxy.is_configured(),
            "Scan requested."
        );
        self.orchestrator(only).run(&ctx, cancel).await
    }

    pub async fn verify_proxy(
        &self,
        cancel: &CancellationToken,
    ) -> Result<VerificationReport, VerifierError> {
        let verifier = ProxyVerifier::new(
            self.settings.verifier.clone(),
            self.ident.clone(),
            self.crawl.clone(),
        );
        verifier.verify(&self.context("proxy-verification"), cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use tempfile::tempdir;

    struct NoDns;

    #[async_trait]
    impl AddressLookup for NoDns {
        async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, String> {
            Err(format!("no resolver for {name}"))
        }
    }

    fn app() -> (tempfile::TempDir, App) {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.database.path = dir.path().join("worker.db");
        let db = Database::open(&settings.database.path).unwrap();
        (dir, App::with_parts(settings, db, Arc::new(NoDns)))
    }

    #[test]
    fn test_scanner_selection_keeps_fixed_order() {
        let (_dir, app) = app();
        let all: Vec<ScannerKind> = app.scanners(&[]).iter().map(|s| s.kind()).collect();
        assert_eq!(
            all,
            vec![ScannerKind::Dnstwist, ScannerKind::IntrigueIdent, ScannerKind::Webscraper]
        );

        let some: Vec<ScannerKind> = app
            .scanners(&[ScannerKind::Webscraper, ScannerKind::Dnstwist])
            .iter()
            .map(|s| s.kind())
            .collect();
        assert_eq!(some, vec![ScannerKind::Dnstwist, ScannerKind::Webscraper]);
    }

    #[test]
    fn test_context_carries_configured_proxy() {
        let (_dir, mut app) = app();
        app.settings.proxy = crate::core::models::ProxyConfig::uniform("http://proxy:8080");
        let ctx = app.context("org-1");
        assert_eq!(ctx.organization_id, "org-1");
        assert_eq!(ctx.proxy.http.as_deref(), Some("http://proxy:8080"));
        assert_eq!(ctx.user_agent, app.settings().user_agent);
    }

    #[tokio::test]
    async fn test_scan_of_unknown_org_fails() {
        let (_dir, app) = app();
        let err = app
            .run_scan("ghost", &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Resolution(_)));
    }
}
