// src/core/proxy_verifier.rs

//! Manual proxy-propagation check.
//!
//! Every outbound path the worker uses (the in-process HTTP client, the
//! fingerprinting subprocess and the crawl pipeline) sends one request over
//! plain HTTP and one over HTTPS to an echo endpoint. The resulting report is
//! meant for a human: the echo service's admin page shows whether each request
//! arrived through the proxy with the worker's user agent.

use std::fmt;
use std::sync::Arc;

use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, IntoEnumIterator};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::core::error::ScanError;
use crate::core::models::RunContext;
use crate::core::scanner::crawl_scanner::write_start_urls;
use crate::core::scanner::{CrawlScanner, IdentScanner, deadline, run_tool};

/// Headers a forward proxy commonly adds to what it relays.
const PROXY_HEADERS: &[&str] = &["via", "x-forwarded-for", "forwarded"];

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifierConfig {
    /// HTTPS URL of the echo endpoint; the plaintext variant is derived from it.
    pub echo_url: Option<String>,
    /// Page where the echo service lists the requests it received.
    pub admin_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("no echo endpoint configured (verifier.echo_url)")]
    MissingEchoUrl,

    #[error("invalid echo endpoint {url}: {reason}")]
    InvalidEchoUrl { url: String, reason: String },

    #[error("cannot build proxied HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// An outbound path under test. The string form is the `source` query tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumIter)]
pub enum ProbePath {
    #[strum(serialize = "http-client")]
    HttpClient,
    #[strum(serialize = "intrigue-ident")]
    IntrigueIdent,
    #[strum(serialize = "scrapy")]
    Scrapy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
    Http,
    Https,
}

/// A single planned request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub path: ProbePath,
    pub transport: Transport,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The direct client got an HTTP response.
    Responded { status: u16 },
    /// The subprocess ran to a zero exit status.
    Exited,
    /// The invocation did not complete; the reason is kept for the report.
    Failed(String),
}

/// What was observed for one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub probe: Probe,
    pub outcome: ProbeOutcome,
    /// Proxy headers visible in the echo response (direct client only).
    pub proxy_evidence: Vec<String>,
    /// User agent the echo endpoint says it received (direct client only).
    pub echoed_user_agent: Option<String>,
}

impl Observation {
    fn new(probe: Probe, outcome: ProbeOutcome) -> Self {
        Self {
            probe,
            outcome,
            proxy_evidence: Vec::new(),
            echoed_user_agent: None,
        }
    }

    pub fn ran(&self) -> bool {
        !matches!(self.outcome, ProbeOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub proxy: Option<String>,
    pub user_agent: String,
    pub observations: Vec<Observation>,
    pub admin_url: Option<String>,
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Proxy:      {}", self.proxy.as_deref().unwrap_or("(none)"))?;
        writeln!(f, "User agent: {}", self.user_agent)?;
        for obs in &self.observations {
            let outcome = match &obs.outcome {
                ProbeOutcome::Responded { status } => format!("HTTP {status}"),
                ProbeOutcome::Exited => "exit 0".to_string(),
                ProbeOutcome::Failed(reason) => format!("failed: {reason}"),
            };
            writeln!(
                f,
                "  [{:<14} {:<5}] {} -> {}",
                obs.probe.path, obs.probe.transport, obs.probe.url, outcome
            )?;
            if !obs.proxy_evidence.is_empty() {
                writeln!(f, "      proxy evidence: {}", obs.proxy_evidence.join(", "))?;
            }
            if let Some(ua) = &obs.echoed_user_agent {
                writeln!(f, "      echoed user agent: {ua}")?;
            }
        }
        match &self.admin_url {
            Some(admin) => write!(f, "Inspect received requests at {admin}"),
            None => write!(f, "Inspect the echo endpoint's request log to confirm."),
        }
    }
}

pub struct ProxyVerifier {
    config: VerifierConfig,
    ident: Arc<IdentScanner>,
    crawl: Arc<CrawlScanner>,
}

impl ProxyVerifier {
    pub fn new(config: VerifierConfig, ident: Arc<IdentScanner>, crawl: Arc<CrawlScanner>) -> Self {
        Self {
            config,
            ident,
            crawl,
        }
    }

    /// Every (path, transport) pair with its tagged URL, in execution order.
    pub fn plan(&self) -> Result<Vec<Probe>, VerifierError> {
        let raw = self
            .config
            .echo_url
            .as_deref()
            .ok_or(VerifierError::MissingEchoUrl)?;
        let invalid = |reason: String| VerifierError::InvalidEchoUrl {
            url: raw.to_string(),
            reason,
        };
        let base = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", base.scheme())));
        }

        let mut probes = Vec::new();
        for path in ProbePath::iter() {
            for transport in Transport::iter() {
                let mut url = base.clone();
                url.set_scheme(&transport.to_string())
                    .map_err(|()| invalid("cannot switch scheme".to_string()))?;
                url.query_pairs_mut().append_pair("source", path.as_ref());
                probes.push(Probe {
                    path,
                    transport,
                    url: url.to_string(),
                });
            }
        }
        Ok(probes)
    }

    /// Runs every planned probe. Failures are recorded, never fatal.
    pub async fn verify(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<VerificationReport, VerifierError> {
        let probes = self.plan()?;
        let client = ctx.proxy.http_client(&ctx.user_agent)?;
        info!(probes = probes.len(), proxy = ?ctx.proxy.https, "Starting proxy verification.");

        let mut observations = Vec::with_capacity(probes.len());
        for probe in probes {
            if cancel.is_cancelled() {
                warn!("Proxy verification cancelled.");
                break;
            }
            let path = probe.path;
            let observation = match path {
                ProbePath::HttpClient => self.probe_direct(&client, probe).await,
                ProbePath::IntrigueIdent => {
                    let invocation = self.ident.invocation_for_uri(&probe.url, ctx);
                    let result = run_tool(&invocation, deadline(self.timeout(self.ident.timeout_secs())), cancel).await;
                    Observation::new(probe, tool_outcome(result))
                }
                ProbePath::Scrapy => self.probe_crawl(probe, ctx, cancel).await,
            };
            info!(
                path = %observation.probe.path,
                transport = %observation.probe.transport,
                ran = observation.ran(),
                "Probe finished."
            );
            observations.push(observation);
        }

        Ok(VerificationReport {
            proxy: ctx.proxy.https.clone().or_else(|| ctx.proxy.http.clone()),
            user_agent: ctx.user_agent.clone(),
            observations,
            admin_url: self.config.admin_url.clone(),
        })
    }

    fn timeout(&self, tool_default: u64) -> u64 {
        self.config.timeout_secs.unwrap_or(tool_default)
    }

    async fn probe_direct(&self, client: &reqwest::Client, probe: Probe) -> Observation {
        let limit = deadline(self.timeout(30));
        let response = match tokio::time::timeout(limit, client.get(&probe.url).send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Observation::new(probe, ProbeOutcome::Failed(e.to_string())),
            Err(_) => {
                return Observation::new(
                    probe,
                    ProbeOutcome::Failed(format!("no response within {}s", limit.as_secs())),
                );
            }
        };

        let status = response.status().as_u16();
        let mut evidence = header_evidence(response.headers());
        let body = response.text().await.unwrap_or_default();
        let (echoed, echoed_ua) = inspect_echo(&body);
        evidence.extend(echoed);

        Observation {
            probe,
            outcome: ProbeOutcome::Responded { status },
            proxy_evidence: evidence,
            echoed_user_agent: echoed_ua,
        }
    }

    async fn probe_crawl(&self, probe: Probe, ctx: &RunContext, cancel: &CancellationToken) -> Observation {
        let start_urls = match write_start_urls(std::slice::from_ref(&probe.url)) {
            Ok(file) => file,
            Err(e) => {
                return Observation::new(probe, ProbeOutcome::Failed(format!("cannot write start URLs: {e}")));
            }
        };
        let invocation = self.crawl.invocation(start_urls.path(), ctx);
        let result = run_tool(&invocation, deadline(self.timeout(self.crawl.timeout_secs())), cancel).await;
        Observation::new(probe, tool_outcome(result))
    }
}

fn tool_outcome(result: Result<String, ScanError>) -> ProbeOutcome {
    match result {
        Ok(_) => ProbeOutcome::Exited,
        Err(e) => ProbeOutcome::Failed(e.to_string()),
    }
}

/// Proxy headers on the echo response itself.
fn header_evidence(headers: &HeaderMap) -> Vec<String> {
    PROXY_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| format!("response {name}: {v}"))
        })
        .collect()
}

/// Pulls proxy headers and the user agent out of an echo body.
///
/// Echo services report the request headers as a JSON object, either at the top
/// level under `headers` or nested in a request record. Header values may be
/// strings or lists of strings.
fn inspect_echo(body: &str) -> (Vec<String>, Option<String>) {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return (Vec::new(), None);
    };
    let Some(headers) = find_headers(&json) else {
        return (Vec::new(), None);
    };

    let lookup = |wanted: &str| -> Option<String> {
        headers.iter().find_map(|(k, v)| {
            if !k.eq_ignore_ascii_case(wanted) {
                return None;
            }
            match v {
                Value::String(s) => Some(s.clone()),
                Value::Array(items) => Some(
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", "),
                ),
                _ => None,
            }
        })
    };

    let evidence = PROXY_HEADERS
        .iter()
        .filter_map(|name| lookup(name).map(|v| format!("{name}: {v}")))
        .collect();
    (evidence, lookup("user-agent"))
}

fn find_headers(value: &Value) -> Option<&serde_json::Map<String, Value>> {
    let obj = value.as_object()?;
    if let Some(Value::Object(headers)) = obj.get("headers") {
        return Some(headers);
    }
    obj.values().find_map(find_headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ProxyConfig;
    use crate::core::scanner::crawl_scanner::CrawlConfig;
    use crate::core::scanner::ident_scanner::IdentConfig;

    fn verifier(echo_url: Option<&str>) -> ProxyVerifier {
        ProxyVerifier::new(
            VerifierConfig {
                echo_url: echo_url.map(str::to_string),
                admin_url: Some("https://echo.example/#!/admin".to_string()),
                timeout_secs: Some(5),
            },
            Arc::new(IdentScanner::new(IdentConfig {
                executable: "missing-intrigue-ident".to_string(),
                ..IdentConfig::default()
            })),
            Arc::new(CrawlScanner::new(CrawlConfig {
                executable: "missing-scrapy".to_string(),
                project_dir: std::env::temp_dir(),
                ..CrawlConfig::default()
            })),
        )
    }

    #[test]
    fn test_plan_covers_each_path_over_both_transports() {
        let probes = verifier(Some("https://echo.example/hook-1")).plan().unwrap();
        assert_eq!(probes.len(), 6);
        let urls: Vec<&str> = probes.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "http://echo.example/hook-1?source=http-client",
                "https://echo.example/hook-1?source=http-client",
                "http://echo.example/hook-1?source=intrigue-ident",
                "https://echo.example/hook-1?source=intrigue-ident",
                "http://echo.example/hook-1?source=scrapy",
                "https://echo.example/hook-1?source=scrapy",
            ]
        );
    }

    #[test]
    fn test_plan_requires_a_usable_echo_url() {
        assert!(matches!(verifier(None).plan(), Err(VerifierError::MissingEchoUrl)));
        assert!(matches!(
            verifier(Some("ftp://echo.example/")).plan(),
            Err(VerifierError::InvalidEchoUrl { .. })
        ));
        assert!(matches!(
            verifier(Some("not a url")).plan(),
            Err(VerifierError::InvalidEchoUrl { .. })
        ));
    }

    #[test]
    fn test_inspect_echo_reads_nested_headers() {
        let body = r#"{"request": {"method": "GET", "headers": {
            "Via": ["1.1 squid"], "X-Forwarded-For": "10.0.0.4", "user-agent": ["scan-warden/0.1"]}}}"#;
        let (evidence, ua) = inspect_echo(body);
        assert_eq!(evidence, vec!["via: 1.1 squid", "x-forwarded-for: 10.0.0.4"]);
        assert_eq!(ua.as_deref(), Some("scan-warden/0.1"));

        assert_eq!(inspect_echo("<html>ok</html>"), (Vec::new(), None));
    }

    #[tokio::test]
    async fn test_failed_probes_are_reported_not_fatal() {
        let ctx = RunContext::new("verify", ProxyConfig::default(), "scan-warden/test");
        // Port 1 on loopback refuses connections, so nothing leaves the host.
        let report = verifier(Some("https://127.0.0.1:1/hook"))
            .verify(&ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.observations.len(), 6);
        assert!(report.observations.iter().all(|o| !o.ran()));
        let text = report.to_string();
        assert!(text.contains("Proxy:      (none)"));
        assert!(text.contains("https://echo.example/#!/admin"));
    }

    #[tokio::test]
    async fn test_cancelled_verification_stops_early() {
        let ctx = RunContext::new("verify", ProxyConfig::default(), "ua");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = verifier(Some("https://echo.example/hook")).verify(&ctx, &cancel).await.unwrap();
        assert!(report.observations.is_empty());
    }
}
