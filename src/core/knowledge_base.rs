// src/core/knowledge_base.rs

//! Static metadata for every scanner family.
//!
//! A vulnerability record's title, severity and description are not produced by
//! the tools themselves; they come from this table, keyed by [`ScannerKind`].

use std::fmt;

use crate::core::models::{ScannerKind, Severity};

/// Groups scanner families for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScannerCategory {
    /// Lookalike or typo-squatted domains.
    DomainIntegrity,
    /// Software exposed by a network endpoint.
    Exposure,
    /// Content discovered by crawling.
    Content,
}

impl fmt::Display for ScannerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScannerCategory::DomainIntegrity => write!(f, "Domain Integrity"),
            ScannerCategory::Exposure => write!(f, "Technology Exposure"),
            ScannerCategory::Content => write!(f, "Web Content"),
        }
    }
}

/// Everything a persisted record needs to know about the scanner that produced it.
pub struct ScannerProfile {
    pub kind: ScannerKind,
    /// Title of the vulnerability record.
    pub title: &'static str,
    pub category: ScannerCategory,
    pub severity: Severity,
    /// Description template; `{domain}` is replaced with the target name.
    pub description: &'static str,
}

impl ScannerProfile {
    pub fn describe(&self, domain: &str) -> String {
        self.description.replace("{domain}", domain)
    }
}

static DNSTWIST: ScannerProfile = ScannerProfile {
    kind: ScannerKind::Dnstwist,
    title: "DNS Twist Domains",
    category: ScannerCategory::DomainIntegrity,
    severity: Severity::Low,
    description: "Registered domains similar to {domain}.",
};

static INTRIGUE_IDENT: ScannerProfile = ScannerProfile {
    kind: ScannerKind::IntrigueIdent,
    title: "Detected Technologies",
    category: ScannerCategory::Exposure,
    severity: Severity::Low,
    description: "Software and technologies fingerprinted on {domain}.",
};

static WEBSCRAPER: ScannerProfile = ScannerProfile {
    kind: ScannerKind::Webscraper,
    title: "Web Crawl Artifacts",
    category: ScannerCategory::Content,
    severity: Severity::Low,
    description: "Resources and linked hosts discovered while crawling {domain}.",
};

/// Looks up the profile of a scanner family.
pub fn profile(kind: ScannerKind) -> &'static ScannerProfile {
    match kind {
        ScannerKind::Dnstwist => &DNSTWIST,
        ScannerKind::IntrigueIdent => &INTRIGUE_IDENT,
        ScannerKind::Webscraper => &WEBSCRAPER,
    }
}
