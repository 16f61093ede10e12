// src/config.rs

//! Worker settings.
//!
//! Settings come from an optional TOML file and are then overlaid with the
//! process environment. The environment is consulted here and nowhere else;
//! everything downstream receives plain values.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::core::models::ProxyConfig;
use crate::core::proxy_verifier::VerifierConfig;
use crate::core::scanner::crawl_scanner::CrawlConfig;
use crate::core::scanner::dnstwist_scanner::DnstwistConfig;
use crate::core::scanner::ident_scanner::IdentConfig;
use crate::logging;

/// Proxy applied to both schemes, as set by the worker's container.
pub const GLOBAL_PROXY_ENV: &str = "GLOBAL_AGENT_HTTP_PROXY";
pub const DATABASE_ENV: &str = "SCAN_WARDEN_DB";

const PROXY_SCHEMES: &[&str] = &["http", "https", "socks5", "socks5h"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid proxy URL in {field}: {value} ({reason})")]
    InvalidProxy {
        field: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: logging::get_data_dir().join("scan-warden.db"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScannerSettings {
    pub dnstwist: DnstwistConfig,
    pub intrigue_ident: IdentConfig,
    pub webscraper: CrawlConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub proxy: ProxyConfig,
    pub scanners: ScannerSettings,
    pub verifier: VerifierConfig,
    /// Sent with every outbound probe so the traffic is attributable.
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            proxy: ProxyConfig::default(),
            scanners: ScannerSettings::default(),
            verifier: VerifierConfig::default(),
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or from `<config dir>/config.toml` when it
    /// exists, then applies environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let default_path = logging::get_config_dir().join("config.toml");
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None if default_path.exists() => Self::from_file(&default_path)?,
            None => {
                debug!("No config file, using defaults.");
                Self::default()
            }
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Loaded config file.");
        Ok(settings)
    }

    /// Overlays environment values read through `env`.
    ///
    /// `GLOBAL_AGENT_HTTP_PROXY` sets both schemes; the conventional
    /// `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` (either case) then win for
    /// their own scheme.
    pub fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| env(name).filter(|v| !v.trim().is_empty()))
        };

        if let Some(global) = var(&[GLOBAL_PROXY_ENV]) {
            self.proxy.http = Some(global.clone());
            self.proxy.https = Some(global);
        }
        if let Some(http) = var(&["HTTP_PROXY", "http_proxy"]) {
            self.proxy.http = Some(http);
        }
        if let Some(https) = var(&["HTTPS_PROXY", "https_proxy"]) {
            self.proxy.https = Some(https);
        }
        if let Some(no_proxy) = var(&["NO_PROXY", "no_proxy"]) {
            self.proxy.no_proxy = Some(no_proxy);
        }
        if let Some(db) = var(&[DATABASE_ENV]) {
            self.database.path = PathBuf::from(db);
        }
    }

    /// Proxy URLs must parse; they are still forwarded exactly as written.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("proxy.http", &self.proxy.http), ("proxy.https", &self.proxy.https)] {
            let Some(value) = value else { continue };
            let invalid = |reason: String| ConfigError::InvalidProxy {
                field,
                value: value.clone(),
                reason,
            };
            let url = Url::parse(value).map_err(|e| invalid(e.to_string()))?;
            if !PROXY_SCHEMES.contains(&url.scheme()) {
                return Err(invalid(format!("unsupported scheme {}", url.scheme())));
            }
        }
        Ok(())
    }
}
