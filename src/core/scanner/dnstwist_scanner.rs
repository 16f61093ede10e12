// src/core/scanner/dnstwist_scanner.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::process::{ToolInvocation, run_tool};
use super::{DEFAULT_TIMEOUT_SECS, ScannerAdapter, deadline};
use crate::core::error::ScanError;
use crate::core::models::{
    DomainPermutationFinding, FindingDetail, RunContext, ScanFinding, ScannerKind, Target,
};

const TOOL: &str = "dnstwist";

/// Fuzzer name dnstwist gives to the input domain itself.
const ORIGINAL_FUZZER: &str = "*original";

/// Record fields lifted into typed columns; everything else lands in `extra`.
const DNS_FIELDS: &[&str] = &["dns_a", "dns_aaaa", "dns_ns", "dns_mx"];

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DnstwistConfig {
    pub executable: String,
    pub timeout_secs: u64,
    /// TLD dictionary passed with `--tld`.
    pub tld_dictionary: Option<PathBuf>,
}

impl Default for DnstwistConfig {
    fn default() -> Self {
        Self {
            executable: "dnstwist".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            tld_dictionary: None,
        }
    }
}

/// Domain-permutation scanner backed by `dnstwist`.
pub struct DnstwistScanner {
    config: DnstwistConfig,
}

impl DnstwistScanner {
    pub fn new(config: DnstwistConfig) -> Self {
        Self { config }
    }

    /// Builds the `dnstwist` call for `target`: registered permutations only,
    /// fuzzy page hashing, JSON on stdout.
    pub fn invocation(&self, target: &Target, ctx: &RunContext) -> ToolInvocation {
        let mut inv = ToolInvocation::new(&self.config.executable).args(["-r", "-s"]);
        if let Some(dict) = &self.config.tld_dictionary {
            inv = inv.arg("--tld").arg(dict.to_string_lossy());
        }
        inv.args(["--useragent", ctx.user_agent.as_str(), "-f", "json"])
            .arg(&target.name)
            .with_proxy(&ctx.proxy)
    }
}

#[async_trait]
impl ScannerAdapter for DnstwistScanner {
    fn kind(&self) -> ScannerKind {
        ScannerKind::Dnstwist
    }

    async fn scan(
        &self,
        target: &Target,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScanFinding>, ScanError> {
        info!(target = %target.name, "Starting dnstwist scan.");
        let invocation = self.invocation(target, ctx);
        let stdout = run_tool(&invocation, deadline(self.config.timeout_secs), cancel).await?;
        let findings = parse_output(&stdout, ctx.run_at)?;
        info!(target = %target.name, similar = findings.len(), "dnstwist scan finished.");
        Ok(findings)
    }
}

/// Parses dnstwist's JSON report into permutation findings.
///
/// The report is an array of objects. Newer releases key the permuted name as
/// `domain`, older ones as `domain-name` and use dashes in field names; both
/// are accepted. The row for the input domain itself is dropped.
pub fn parse_output(stdout: &str, observed_at: DateTime<Utc>) -> Result<Vec<ScanFinding>, ScanError> {
    let rows: Vec<BTreeMap<String, Value>> =
        serde_json::from_str(stdout.trim()).map_err(|e| ScanError::malformed(TOOL, e))?;

    let mut findings = Vec::with_capacity(rows.len());
    for row in rows {
        // Normalize legacy dashed keys (`dns-a`, `domain-name`).
        let mut fields: BTreeMap<String, Value> = row
            .into_iter()
            .map(|(k, v)| (k.replace('-', "_"), v))
            .collect();

        let domain = match fields
            .remove("domain")
            .or_else(|| fields.remove("domain_name"))
        {
            Some(Value::String(d)) if !d.is_empty() => d,
            other => {
                return Err(ScanError::malformed(
                    TOOL,
                    format!("row without a domain name: {other:?}"),
                ));
            }
        };
        let fuzzer = match fields.remove("fuzzer") {
            Some(Value::String(f)) => f,
            _ => String::new(),
        };
        if fuzzer == ORIGINAL_FUZZER {
            debug!(domain = %domain, "Skipping the original domain row.");
            continue;
        }

        let dns_a = string_list(fields.remove(DNS_FIELDS[0]));
        let dns_aaaa = string_list(fields.remove(DNS_FIELDS[1]));
        let dns_ns = string_list(fields.remove(DNS_FIELDS[2]));
        let dns_mx = string_list(fields.remove(DNS_FIELDS[3]));
        let registered =
            !(dns_a.is_empty() && dns_aaaa.is_empty() && dns_ns.is_empty() && dns_mx.is_empty());

        findings.push(ScanFinding::new(
            FindingDetail::DomainPermutation(DomainPermutationFinding {
                domain,
                fuzzer,
                registered,
                dns_a,
                dns_aaaa,
                dns_ns,
                dns_mx,
                extra: fields,
            }),
            observed_at,
        ));
    }
    Ok(findings)
}

/// dnstwist reports DNS answers as string arrays; a lone string is tolerated.
fn string_list(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) if !s.starts_with('!') => Some(s),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) if !s.is_empty() && !s.starts_with('!') => vec![s],
        _ => Vec::new(),
    }
}
