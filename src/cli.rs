// src/cli.rs

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};

use crate::core::models::ScannerKind;

#[derive(Debug, Parser)]
#[command(name = "scan-warden")]
#[command(about = "Runs external security scanners for an organization and keeps their findings.")]
pub struct CommandLine {
    /// Config file (defaults to config.toml in the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan every domain of an organization
    Scan {
        /// Organization id
        #[arg(long = "org")]
        organization: String,
        /// Restrict the run to these scanners (repeatable)
        #[arg(long = "scanner", value_parser = parse_scanner)]
        scanners: Vec<ScannerKind>,
    },
    /// Send tagged probes through every outbound path to check proxy use
    VerifyProxy,
}

fn parse_scanner(value: &str) -> Result<ScannerKind, String> {
    ScannerKind::from_str(value)
        .map_err(|_| format!("unknown scanner '{value}' (dnstwist, intrigue-ident, webscraper)"))
}

impl CommandLine {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_accepts_repeated_scanners() {
        let cli = CommandLine::try_parse_from([
            "scan-warden", "scan", "--org", "org-1", "--scanner", "dnstwist", "--scanner", "webscraper",
        ])
        .unwrap();
        match cli.command {
            Commands::Scan { organization, scanners } => {
                assert_eq!(organization, "org-1");
                assert_eq!(scanners, vec![ScannerKind::Dnstwist, ScannerKind::Webscraper]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_scanner_is_rejected() {
        assert!(CommandLine::try_parse_from(["scan-warden", "scan", "--org", "o", "--scanner", "nmap"]).is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = CommandLine::try_parse_from(["scan-warden", "verify-proxy", "--config", "/etc/w.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/w.toml")));
        assert!(matches!(cli.command, Commands::VerifyProxy));
    }
}
