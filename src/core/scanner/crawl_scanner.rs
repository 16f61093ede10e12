// src/core/scanner/crawl_scanner.rs

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::process::{ToolInvocation, run_tool};
use super::{DEFAULT_TIMEOUT_SECS, ScannerAdapter, deadline};
use crate::core::error::ScanError;
use crate::core::models::{
    ArtifactKind, CrawlArtifactFinding, FindingDetail, RunContext, ScanFinding, ScannerKind,
    Target,
};

const TOOL: &str = "scrapy";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrawlConfig {
    pub executable: String,
    pub timeout_secs: u64,
    /// Scrapy project directory; the crawl runs with this as its working directory.
    pub project_dir: PathBuf,
    pub spider: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            executable: TOOL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            project_dir: PathBuf::from("/app/worker/webscraper"),
            spider: "main".to_string(),
        }
    }
}

/// Crawl scanner backed by the scrapy webscraper project.
pub struct CrawlScanner {
    config: CrawlConfig,
}

/// One JSON-lines item emitted by the spider. Unknown keys are ignored.
#[derive(Debug, Deserialize)]
struct CrawlItem {
    url: String,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    response_size: Option<u64>,
}

impl CrawlScanner {
    pub fn new(config: CrawlConfig) -> Self {
        Self { config }
    }

    /// Builds the scrapy call for a prepared start-URL file. Items are written
    /// to stdout as JSON lines; scrapy's own logging is silenced so stdout
    /// carries nothing else.
    pub fn invocation(&self, domains_file: &Path, ctx: &RunContext) -> ToolInvocation {
        ToolInvocation::new(&self.config.executable)
            .args(["crawl", self.config.spider.as_str(), "-a"])
            .arg(format!("domains_file={}", domains_file.display()))
            .arg("-s")
            .arg(format!("USER_AGENT={}", ctx.user_agent))
            .args(["-o", "-:jsonlines", "--nolog"])
            .current_dir(&self.config.project_dir)
            .with_proxy(&ctx.proxy)
    }

    pub fn timeout_secs(&self) -> u64 {
        self.config.timeout_secs
    }
}

/// Writes the spider's start URLs, one per line, into a temporary file that
/// lives until the returned handle is dropped.
pub fn write_start_urls(urls: &[String]) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("crawl-domains-")
        .suffix(".txt")
        .tempfile()?;
    for url in urls {
        writeln!(file, "{url}")?;
    }
    file.flush()?;
    Ok(file)
}

#[async_trait]
impl ScannerAdapter for CrawlScanner {
    fn kind(&self) -> ScannerKind {
        ScannerKind::Webscraper
    }

    async fn scan(
        &self,
        target: &Target,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScanFinding>, ScanError> {
        info!(target = %target.name, "Starting crawl.");
        let start_urls = write_start_urls(&[format!("https://{}", target.name)])
            .map_err(|e| ScanError::process(TOOL, format!("cannot write start URLs: {e}")))?;

        let invocation = self.invocation(start_urls.path(), ctx);
        let stdout = run_tool(&invocation, deadline(self.config.timeout_secs), cancel).await?;
        let findings = parse_output(&stdout, &target.name, ctx.run_at)?;
        info!(target = %target.name, artifacts = findings.len(), "Crawl finished.");
        Ok(findings)
    }
}

/// Parses the spider's JSON-lines feed.
///
/// Items on the target host (or its `www.` twin) become resource findings
/// keyed by path; items on any other host become linked-host findings keyed by
/// hostname.
pub fn parse_output(
    stdout: &str,
    target_name: &str,
    observed_at: DateTime<Utc>,
) -> Result<Vec<ScanFinding>, ScanError> {
    let root = target_name
        .strip_prefix("www.")
        .unwrap_or(target_name)
        .to_ascii_lowercase();

    let mut findings = Vec::new();
    for (lineno, line) in stdout.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let item: CrawlItem = serde_json::from_str(line)
            .map_err(|e| ScanError::malformed(TOOL, format!("line {}: {e}", lineno + 1)))?;
        let url = Url::parse(&item.url)
            .map_err(|e| ScanError::malformed(TOOL, format!("line {}: bad url {}: {e}", lineno + 1, item.url)))?;
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            debug!(url = %item.url, "Skipping item without a host.");
            continue;
        };

        let same_site = host == root || host.strip_prefix("www.") == Some(root.as_str());
        let (kind, locator) = if same_site {
            (ArtifactKind::Resource, url.path().to_string())
        } else {
            (ArtifactKind::LinkedHost, host)
        };

        findings.push(ScanFinding::new(
            FindingDetail::CrawlArtifact(CrawlArtifactFinding {
                kind,
                locator,
                url: item.url,
                status: item.status,
                response_size: item.response_size,
            }),
            observed_at,
        ));
    }
    Ok(findings)
}
