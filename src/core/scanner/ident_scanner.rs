// src/core/scanner/ident_scanner.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::process::{ToolInvocation, run_tool};
use super::{DEFAULT_TIMEOUT_SECS, ScannerAdapter, deadline};
use crate::core::error::ScanError;
use crate::core::models::{
    FindingDetail, RunContext, ScanFinding, ScannerKind, Target, TechFingerprintFinding,
};

const TOOL: &str = "intrigue-ident";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdentConfig {
    pub executable: String,
    pub timeout_secs: u64,
    /// Scheme used to build the probed URI.
    pub scheme: String,
}

impl Default for IdentConfig {
    fn default() -> Self {
        Self {
            executable: TOOL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            scheme: "https".to_string(),
        }
    }
}

/// Technology-identification scanner backed by `intrigue-ident`.
pub struct IdentScanner {
    config: IdentConfig,
}

/// Top level of an `intrigue-ident --json` report. Other keys are ignored.
#[derive(Debug, Deserialize)]
struct IdentReport {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    fingerprint: Vec<RawFingerprint>,
}

#[derive(Debug, Deserialize)]
struct RawFingerprint {
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    cpe: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    /// Set on checks the tool considers noise.
    #[serde(default)]
    hide: bool,
}

impl IdentScanner {
    pub fn new(config: IdentConfig) -> Self {
        Self { config }
    }

    pub fn target_uri(&self, target: &Target) -> String {
        format!("{}://{}", self.config.scheme, target.name)
    }

    /// Builds the `intrigue-ident` call probing `uri`.
    pub fn invocation_for_uri(&self, uri: &str, ctx: &RunContext) -> ToolInvocation {
        ToolInvocation::new(&self.config.executable)
            .args(["--uri", uri, "--json"])
            .with_proxy(&ctx.proxy)
    }

    pub fn invocation(&self, target: &Target, ctx: &RunContext) -> ToolInvocation {
        self.invocation_for_uri(&self.target_uri(target), ctx)
    }

    pub fn timeout_secs(&self) -> u64 {
        self.config.timeout_secs
    }
}

#[async_trait]
impl ScannerAdapter for IdentScanner {
    fn kind(&self) -> ScannerKind {
        ScannerKind::IntrigueIdent
    }

    async fn scan(
        &self,
        target: &Target,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScanFinding>, ScanError> {
        if !target.has_addresses() {
            debug!(target = %target.name, "No resolved address, nothing to fingerprint.");
            return Ok(Vec::new());
        }

        info!(target = %target.name, "Starting technology fingerprint scan.");
        let invocation = self.invocation(target, ctx);
        let stdout = run_tool(&invocation, deadline(self.config.timeout_secs), cancel).await?;
        let findings = parse_output(&stdout, &self.target_uri(target), ctx.run_at)?;
        info!(target = %target.name, technologies = findings.len(), "Fingerprint scan finished.");
        Ok(findings)
    }
}

/// Parses an `intrigue-ident --json` report into fingerprint findings.
///
/// Hidden fingerprints and entries with neither vendor nor product are
/// skipped.
pub fn parse_output(
    stdout: &str,
    probed_uri: &str,
    observed_at: DateTime<Utc>,
) -> Result<Vec<ScanFinding>, ScanError> {
    let report: IdentReport =
        serde_json::from_str(stdout.trim()).map_err(|e| ScanError::malformed(TOOL, e))?;
    let uri = report.url.unwrap_or_else(|| probed_uri.to_string());

    let findings = report
        .fingerprint
        .into_iter()
        .filter(|fp| !fp.hide)
        .filter_map(|fp| {
            let vendor = fp.vendor.unwrap_or_default();
            let product = fp.product.unwrap_or_default();
            if vendor.is_empty() && product.is_empty() {
                return None;
            }
            Some(ScanFinding::new(
                FindingDetail::TechFingerprint(TechFingerprintFinding {
                    vendor,
                    product,
                    version: fp.version.filter(|v| !v.is_empty()),
                    cpe: fp.cpe.filter(|c| !c.is_empty()),
                    tags: fp.tags,
                    uri: uri.clone(),
                }),
                observed_at,
            ))
        })
        .collect();
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ProxyConfig;
    use std::net::{IpAddr, Ipv4Addr};

    const REPORT: &str = r#"{
        "url": "https://example.com",
        "fingerprint": [
            {"type": "fingerprint", "vendor": "Nginx", "product": "Nginx", "version": "1.18.0",
             "update": null, "tags": ["Web Server"], "hide": false,
             "cpe": "cpe:2.3:a:nginx:nginx:1.18.0:::"},
            {"type": "fingerprint", "vendor": "Generic", "product": "Unknown Cookie",
             "version": null, "tags": [], "hide": true},
            {"type": "fingerprint", "vendor": "jQuery", "product": "jQuery", "version": "",
             "tags": ["Javascript"], "hide": false, "cpe": null}
        ],
        "content": [{"type": "content", "name": "Directory Listing Detected", "result": false}],
        "check_count": 412
    }"#;

    fn target(addresses: Vec<IpAddr>) -> Target {
        Target {
            domain_id: 3,
            name: "example.com".to_string(),
            organization_id: "org".to_string(),
            addresses,
        }
    }

    #[test]
    fn test_parse_skips_hidden_and_keys_by_cpe() {
        let findings = parse_output(REPORT, "https://example.com", Utc::now()).unwrap();
        let keys: Vec<&str> = findings.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["cpe:2.3:a:nginx:nginx:1.18.0:::", "jQuery jQuery"]);
    }

    #[test]
    fn test_parse_empty_fingerprint_list() {
        let findings = parse_output(r#"{"url": "https://example.com"}"#, "https://example.com", Utc::now()).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_output("Error: connection refused", "https://example.com", Utc::now()).unwrap_err();
        assert!(matches!(err, ScanError::OutputMalformed { .. }));
    }

    #[test]
    fn test_invocation_carries_proxy() {
        let scanner = IdentScanner::new(IdentConfig::default());
        let ctx = RunContext::new("org", ProxyConfig::uniform("http://proxy:8080"), "scan-warden/0.1");
        let inv = scanner.invocation(&target(Vec::new()), &ctx);

        assert_eq!(inv.args, vec!["--uri", "https://example.com", "--json"]);
        assert_eq!(inv.env_value("HTTP_PROXY"), Some("http://proxy:8080"));
        assert_eq!(inv.env_value("HTTPS_PROXY"), Some("http://proxy:8080"));
    }

    #[tokio::test]
    async fn test_target_without_address_is_not_probed() {
        let scanner = IdentScanner::new(IdentConfig {
            executable: "definitely-not-intrigue-ident".to_string(),
            ..IdentConfig::default()
        });
        let ctx = RunContext::new("org", ProxyConfig::default(), "scan-warden/0.1");
        let findings = scanner
            .scan(&target(Vec::new()), &ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(findings.is_empty());

        // With an address the (missing) binary is actually spawned.
        let err = scanner
            .scan(&target(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))]), &ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::ProcessFailure { .. }));
    }
}
