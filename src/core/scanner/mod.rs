// src/core/scanner/mod.rs

// Public interface of the `scanner` module: the adapter contract plus one
// adapter per external tool family.
pub mod crawl_scanner;
pub mod dnstwist_scanner;
pub mod ident_scanner;
pub mod process;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::error::ScanError;
use crate::core::models::{RunContext, ScanFinding, ScannerKind, Target};

pub use self::crawl_scanner::CrawlScanner;
pub use self::dnstwist_scanner::DnstwistScanner;
pub use self::ident_scanner::IdentScanner;
pub use self::process::{ToolInvocation, run_tool};

/// Default per-invocation deadline.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Uniform invocation contract for an external scanning tool.
///
/// An adapter runs its tool against exactly one target and normalizes the
/// output. Every error it returns is scoped to that target. Implementations
/// must forward `ctx.proxy` into the tool's execution environment.
#[async_trait]
pub trait ScannerAdapter: Send + Sync {
    /// The persisted `source` of records built from this adapter's findings.
    fn kind(&self) -> ScannerKind;

    async fn scan(
        &self,
        target: &Target,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScanFinding>, ScanError>;
}

/// Converts a configured timeout into a deadline, never shorter than a second.
pub(crate) fn deadline(timeout_secs: u64) -> Duration {
    Duration::from_secs(timeout_secs.max(1))
}
