// src/core/models.rs

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

// --- Enumerazioni di base ---
// Core enumerations

/// Severity of a persisted vulnerability, as stored in the `severity` column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, AsRefStr)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Lifecycle state of a vulnerability record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VulnerabilityState {
    Open,
    Closed,
    Remediated,
}

/// Identifies the external tool family behind a finding. The string form is the
/// persisted `source` of a vulnerability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, EnumIter, AsRefStr)]
pub enum ScannerKind {
    #[strum(serialize = "dnstwist")]
    #[serde(rename = "dnstwist")]
    Dnstwist,
    #[strum(serialize = "intrigue-ident")]
    #[serde(rename = "intrigue-ident")]
    IntrigueIdent,
    #[strum(serialize = "webscraper")]
    #[serde(rename = "webscraper")]
    Webscraper,
}

// --- Target e contesto di esecuzione ---
// Targets and run context

/// A domain from an organization's inventory, resolved for the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Inventory row id of the domain.
    pub domain_id: i64,
    /// Fully qualified domain name.
    pub name: String,
    pub organization_id: String,
    pub addresses: Vec<IpAddr>,
}

impl Target {
    pub fn has_addresses(&self) -> bool {
        !self.addresses.is_empty()
    }
}

/// Forward proxy settings for every outbound probe of a run.
///
/// This is a plain value: it is built once from configuration and threaded
/// through [`RunContext`] into each invocation. Nothing reads proxy variables
/// from the process environment after startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub http: Option<String>,
    pub https: Option<String>,
    pub no_proxy: Option<String>,
}

impl ProxyConfig {
    /// Routes both schemes through the same proxy.
    pub fn uniform(proxy: impl Into<String>) -> Self {
        let proxy = proxy.into();
        Self {
            http: Some(proxy.clone()),
            https: Some(proxy),
            no_proxy: None,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.http.is_some() || self.https.is_some()
    }

    /// Environment variables a child process needs to route through the proxy.
    ///
    /// Both the upper and lower case spellings are emitted; tools differ in
    /// which one they read.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        if let Some(http) = &self.http {
            vars.push(("HTTP_PROXY".to_string(), http.clone()));
            vars.push(("http_proxy".to_string(), http.clone()));
        }
        if let Some(https) = &self.https {
            vars.push(("HTTPS_PROXY".to_string(), https.clone()));
            vars.push(("https_proxy".to_string(), https.clone()));
        }
        if let Some(no_proxy) = &self.no_proxy {
            vars.push(("NO_PROXY".to_string(), no_proxy.clone()));
            vars.push(("no_proxy".to_string(), no_proxy.clone()));
        }
        vars
    }

    /// Builds an HTTP client whose proxies come exclusively from this value.
    pub fn http_client(&self, user_agent: &str) -> reqwest::Result<reqwest::Client> {
        // `no_proxy()` drops reqwest's automatic environment proxy lookup.
        let mut builder = reqwest::Client::builder().user_agent(user_agent).no_proxy();
        let exempt = || self.no_proxy.as_deref().and_then(reqwest::NoProxy::from_string);
        if let Some(http) = &self.http {
            builder = builder.proxy(reqwest::Proxy::http(http.as_str())?.no_proxy(exempt()));
        }
        if let Some(https) = &self.https {
            builder = builder.proxy(reqwest::Proxy::https(https.as_str())?.no_proxy(exempt()));
        }
        builder.build()
    }
}

/// Read-only state for a single orchestrator invocation.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub organization_id: String,
    pub run_at: DateTime<Utc>,
    pub proxy: ProxyConfig,
    /// Signature sent with every probe so the traffic is attributable.
    pub user_agent: String,
}

impl RunContext {
    pub fn new(organization_id: impl Into<String>, proxy: ProxyConfig, user_agent: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            run_at: Utc::now(),
            proxy,
            user_agent: user_agent.into(),
        }
    }

    pub fn at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self
    }
}

// --- Modelli dei Finding ---
// Finding models

/// Common capability of every tool-specific finding shape: a natural key that
/// stays stable across runs.
pub trait Identified {
    fn identity_key(&self) -> String;
}

/// A lookalike domain reported by the domain-permutation scanner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainPermutationFinding {
    pub domain: String,
    /// Permutation technique that produced the domain (e.g. "homoglyph").
    pub fuzzer: String,
    pub registered: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_a: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_aaaa: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_ns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_mx: Vec<String>,
    /// Any remaining fields the tool reported, kept verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Identified for DomainPermutationFinding {
    fn identity_key(&self) -> String {
        self.domain.to_ascii_lowercase()
    }
}

/// A software fingerprint detected on a target endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TechFingerprintFinding {
    pub vendor: String,
    pub product: String,
    pub version: Option<String>,
    pub cpe: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// URI that was probed.
    pub uri: String,
}

impl Identified for TechFingerprintFinding {
    fn identity_key(&self) -> String {
        match self.cpe.as_deref().filter(|c| !c.is_empty()) {
            Some(cpe) => cpe.to_string(),
            None => {
                let mut key = format!("{} {}", self.vendor, self.product);
                if let Some(version) = self.version.as_deref().filter(|v| !v.is_empty()) {
                    key.push(' ');
                    key.push_str(version);
                }
                key
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactKind {
    /// A resource served by the target itself.
    Resource,
    /// A foreign host the target links to.
    LinkedHost,
}

/// An artifact discovered by the crawl pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrawlArtifactFinding {
    pub kind: ArtifactKind,
    /// Resource path for `Resource`, hostname for `LinkedHost`.
    pub locator: String,
    pub url: String,
    pub status: Option<u16>,
    pub response_size: Option<u64>,
}

impl Identified for CrawlArtifactFinding {
    fn identity_key(&self) -> String {
        match self.kind {
            ArtifactKind::Resource => self.locator.clone(),
            ArtifactKind::LinkedHost => self.locator.to_ascii_lowercase(),
        }
    }
}

/// Tool-specific payload of a finding, tagged by scanner family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FindingDetail {
    DomainPermutation(DomainPermutationFinding),
    TechFingerprint(TechFingerprintFinding),
    CrawlArtifact(CrawlArtifactFinding),
}

impl Identified for FindingDetail {
    fn identity_key(&self) -> String {
        match self {
            FindingDetail::DomainPermutation(f) => f.identity_key(),
            FindingDetail::TechFingerprint(f) => f.identity_key(),
            FindingDetail::CrawlArtifact(f) => f.identity_key(),
        }
    }
}

/// One discrete observation, keyed by its natural identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanFinding {
    pub key: String,
    pub first_observed: DateTime<Utc>,
    pub detail: FindingDetail,
}

impl ScanFinding {
    pub fn new(detail: FindingDetail, observed_at: DateTime<Utc>) -> Self {
        Self {
            key: detail.identity_key(),
            first_observed: observed_at,
            detail,
        }
    }
}

// --- Vulnerabilità persistite ---
// Persisted vulnerabilities

/// A durable vulnerability record owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vulnerability {
    pub id: i64,
    pub domain_id: i64,
    pub source: ScannerKind,
    pub title: String,
    pub state: VulnerabilityState,
    pub severity: Severity,
    pub needs_population: bool,
    pub last_seen: DateTime<Utc>,
    pub description: String,
    pub findings: Vec<ScanFinding>,
    pub created_at: DateTime<Utc>,
}

impl Vulnerability {
    pub fn finding(&self, key: &str) -> Option<&ScanFinding> {
        self.findings.iter().find(|f| f.key == key)
    }
}

/// Organization metadata as exposed by the directory lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
}
