//! End-to-end runs through the composed worker.
//!
//! A shell script stands in for `dnstwist`, so these tests exercise the real
//! subprocess runner, output parsing, reconciliation and SQLite storage
//! without any network access.

#![cfg(unix)]

use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::{TempDir, tempdir};
use tokio_util::sync::CancellationToken;

use scan_warden::app::App;
use scan_warden::config::Settings;
use scan_warden::core::db::Database;
use scan_warden::core::models::{FindingDetail, ProxyConfig, ScannerKind, VulnerabilityState};
use scan_warden::core::resolver::AddressLookup;
use scan_warden::core::store::{SqliteStore, VulnerabilityStore};

/// Echoes the proxy variables it was started with into an extra JSON field.
const FAKE_DNSTWIST: &str = r#"#!/bin/sh
for arg in "$@"; do domain="$arg"; done
cat <<EOF
[{"fuzzer": "*original", "domain": "$domain", "dns_a": ["93.184.216.34"]},
 {"fuzzer": "homoglyph", "domain": "examp1e.com", "dns_a": ["203.0.113.7"],
  "seen_http_proxy": "$HTTP_PROXY", "seen_https_proxy": "$HTTPS_PROXY"}]
EOF
"#;

const BROKEN_DNSTWIST: &str = "#!/bin/sh\necho 'Traceback (most recent call last):'\n";

struct NoDns;

#[async_trait]
impl AddressLookup for NoDns {
    async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, String> {
        Err(format!("no resolver for {name}"))
    }
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn worker(dnstwist: &str) -> (TempDir, App, Database) {
    let dir = tempdir().unwrap();
    let executable = script(dir.path(), "dnstwist", dnstwist);

    let mut settings = Settings::default();
    settings.database.path = dir.path().join("worker.db");
    settings.proxy = ProxyConfig::uniform("http://proxy:8080");
    settings.scanners.dnstwist.executable = executable.to_string_lossy().into_owned();
    settings.scanners.dnstwist.timeout_secs = 30;
    settings.scanners.intrigue_ident.executable = dir.path().join("absent").to_string_lossy().into_owned();
    settings.scanners.webscraper.executable = dir.path().join("absent").to_string_lossy().into_owned();
    settings.scanners.webscraper.project_dir = dir.path().to_path_buf();

    let db = Database::open(&settings.database.path).unwrap();
    db.conn()
        .execute_batch(
            "INSERT INTO organizations (id, name) VALUES ('org-1', 'Org One');
             INSERT INTO domains (id, organization_id, name) VALUES (1, 'org-1', 'example.com');",
        )
        .unwrap();

    let app = App::with_parts(settings, db.clone(), Arc::new(NoDns));
    (dir, app, db)
}

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, d, 8, 30, 0).unwrap()
}

#[tokio::test]
async fn lookalike_domain_keeps_first_sighting_across_runs() {
    let (_dir, app, db) = worker(FAKE_DNSTWIST);
    let store = SqliteStore::new(db);
    let orchestrator = app.orchestrator(&[ScannerKind::Dnstwist]);

    let first = orchestrator
        .run(&app.context("org-1").at(day(1)), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.stored(), 1);

    orchestrator
        .run(&app.context("org-1").at(day(5)), &CancellationToken::new())
        .await
        .unwrap();

    let record = store.load_open(1, ScannerKind::Dnstwist).unwrap().unwrap();
    assert_eq!(record.title, "DNS Twist Domains");
    assert_eq!(record.description, "Registered domains similar to example.com.");
    assert_eq!(record.last_seen, day(5));
    assert_eq!(record.findings.len(), 1, "the original domain row is not a finding");

    let finding = record.finding("examp1e.com").unwrap();
    assert_eq!(finding.first_observed, day(1));
    let FindingDetail::DomainPermutation(detail) = &finding.detail else {
        panic!("unexpected finding family");
    };
    assert_eq!(detail.extra["seen_http_proxy"], "http://proxy:8080");
    assert_eq!(detail.extra["seen_https_proxy"], "http://proxy:8080");
    let open = store
        .list_for_domain(1)
        .unwrap()
        .into_iter()
        .filter(|v| v.state == VulnerabilityState::Open)
        .count();
    assert_eq!(open, 1);
}

#[tokio::test]
async fn broken_tools_do_not_stop_the_run_or_touch_records() {
    let (_dir, app, db) = worker(BROKEN_DNSTWIST);
    let summary = app
        .run_scan("org-1", &[], &CancellationToken::new())
        .await
        .unwrap();

    // dnstwist output is malformed and the crawler binary is missing; the
    // fingerprint scanner has no address to probe and so finds nothing.
    assert_eq!(summary.targets, 1);
    assert_eq!(summary.failed(), 2);
    assert_eq!(summary.empty(), 1);
    assert!(SqliteStore::new(db).list_for_domain(1).unwrap().is_empty());
}
