// src/core/orchestrator.rs

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::core::error::{RunError, ScanError, StorageError};
use crate::core::models::{RunContext, ScanFinding, ScannerKind, Target};
use crate::core::reconciler::{Reconciliation, reconcile};
use crate::core::resolver::TargetResolver;
use crate::core::scanner::ScannerAdapter;
use crate::core::store::VulnerabilityStore;

/// What happened to one (target, scanner) pair during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Findings were reconciled and written to the given record.
    Stored { vulnerability_id: i64, findings: usize },
    /// The scanner found nothing; stored history was left alone.
    Empty,
    /// The scan failed for this target only.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetReport {
    pub target: String,
    pub source: ScannerKind,
    pub outcome: ScanOutcome,
}

/// Per-run tally returned to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub organization_id: String,
    pub run_at: DateTime<Utc>,
    pub targets: usize,
    pub reports: Vec<TargetReport>,
    /// Set when the run stopped early on cancellation.
    pub cancelled: bool,
}

impl RunSummary {
    fn new(ctx: &RunContext) -> Self {
        Self {
            organization_id: ctx.organization_id.clone(),
            run_at: ctx.run_at,
            targets: 0,
            reports: Vec::new(),
            cancelled: false,
        }
    }

    pub fn stored(&self) -> usize {
        self.count(|o| matches!(o, ScanOutcome::Stored { .. }))
    }

    pub fn empty(&self) -> usize {
        self.count(|o| matches!(o, ScanOutcome::Empty))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ScanOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&ScanOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "organization {}: {} targets, {} stored, {} empty, {} failed{}",
            self.organization_id,
            self.targets,
            self.stored(),
            self.empty(),
            self.failed(),
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}

/// Drives one scan run: resolve targets, then for each target run every
/// scanner in turn and reconcile its findings into the store.
pub struct Orchestrator {
    resolver: Arc<dyn TargetResolver>,
    scanners: Vec<Arc<dyn ScannerAdapter>>,
    store: Arc<dyn VulnerabilityStore>,
}

impl Orchestrator {
    pub fn new(
        resolver: Arc<dyn TargetResolver>,
        scanners: Vec<Arc<dyn ScannerAdapter>>,
        store: Arc<dyn VulnerabilityStore>,
    ) -> Self {
        Self {
            resolver,
            scanners,
            store,
        }
    }

    /// Executes a run for `ctx.organization_id`.
    ///
    /// A scan failure is recorded for its (target, source) pair only; the
    /// remaining scanners still run against that target.
    /// Resolution and storage failures end the run with an error.
    #[instrument(skip_all, fields(organization = %ctx.organization_id))]
    pub async fn run(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let targets = self.resolver.resolve(&ctx.organization_id).await?;
        info!(targets = targets.len(), scanners = self.scanners.len(), "Run started.");

        let mut summary = RunSummary::new(ctx);
        summary.targets = targets.len();

        'targets: for target in &targets {
            for scanner in &self.scanners {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    break 'targets;
                }

                let outcome = match scanner.scan(target, ctx, cancel).await {
                    Ok(findings) => self.persist(target, scanner.kind(), findings, ctx).await?,
                    Err(ScanError::Cancelled { tool }) => {
                        warn!(target = %target.name, tool = %tool, "Scan cancelled.");
                        summary.cancelled = true;
                        break 'targets;
                    }
                    Err(e) => {
                        error!(target = %target.name, source = %scanner.kind(), error = %e, "Scan failed, other scanners continue.");
                        ScanOutcome::Failed(e.to_string())
                    }
                };

                summary.reports.push(TargetReport {
                    target: target.name.clone(),
                    source: scanner.kind(),
                    outcome,
                });
            }
        }

        info!(%summary, "Run finished.");
        Ok(summary)
    }

    async fn persist(
        &self,
        target: &Target,
        source: ScannerKind,
        findings: Vec<ScanFinding>,
        ctx: &RunContext,
    ) -> Result<ScanOutcome, RunError> {
        let storage_error = |error: StorageError| RunError::Storage {
            target: target.name.clone(),
            source_kind: source,
            error,
        };

        if findings.is_empty() {
            info!(target = %target.name, source = %source, "No findings, record left untouched.");
            return Ok(ScanOutcome::Empty);
        }

        let store = Arc::clone(&self.store);
        let domain_id = target.domain_id;
        let prior = blocking(move || store.load_open(domain_id, source))
            .await
            .map_err(storage_error)?;

        let merged = match reconcile(prior.as_ref(), findings, ctx.run_at) {
            Reconciliation::Skip => return Ok(ScanOutcome::Empty),
            Reconciliation::Persist(merged) => merged,
        };

        let store = Arc::clone(&self.store);
        let owned_target = target.clone();
        let run_at = ctx.run_at;
        let count = merged.len();
        let record = blocking(move || store.upsert(&owned_target, source, &merged, run_at))
            .await
            .map_err(storage_error)?;

        info!(
            target = %target.name,
            source = %source,
            vulnerability = record.id,
            findings = count,
            "Findings stored."
        );
        Ok(ScanOutcome::Stored {
            vulnerability_id: record.id,
            findings: count,
        })
    }
}

/// Runs a synchronous store call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
}
