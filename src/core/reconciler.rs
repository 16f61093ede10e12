// src/core/reconciler.rs

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::models::{ScanFinding, Vulnerability};

/// Outcome of merging a fresh scan with stored history.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// The scan produced nothing; the stored record (if any) must stay untouched.
    Skip,
    /// The findings to persist, replacing the stored collection.
    Persist(Vec<ScanFinding>),
}

/// Merges `fresh` findings with the open record `prior`.
///
/// Keys already on record keep their stored first-observed timestamp; new keys
/// get `run_at`. Duplicate keys within `fresh` collapse to their first
/// occurrence, carrying the earliest timestamp among them. Keys missing from
/// `fresh` are dropped from the active set; the record itself is never closed.
pub fn reconcile(
    prior: Option<&Vulnerability>,
    fresh: Vec<ScanFinding>,
    run_at: DateTime<Utc>,
) -> Reconciliation {
    if fresh.is_empty() {
        return Reconciliation::Skip;
    }

    let history: HashMap<&str, DateTime<Utc>> = prior
        .map(|v| {
            v.findings
                .iter()
                .map(|f| (f.key.as_str(), f.first_observed))
                .collect()
        })
        .unwrap_or_default();

    let mut merged: Vec<ScanFinding> = Vec::with_capacity(fresh.len());
    let mut position: HashMap<String, usize> = HashMap::with_capacity(fresh.len());
    let mut carried = 0usize;

    for mut finding in fresh {
        finding.first_observed = match history.get(finding.key.as_str()) {
            Some(prior_seen) => {
                carried += 1;
                *prior_seen
            }
            None => run_at,
        };

        match position.get(&finding.key) {
            Some(&idx) => {
                let kept = &mut merged[idx];
                kept.first_observed = kept.first_observed.min(finding.first_observed);
            }
            None => {
                position.insert(finding.key.clone(), merged.len());
                merged.push(finding);
            }
        }
    }

    debug!(
        findings = merged.len(),
        carried_over = carried,
        had_history = prior.is_some(),
        "Reconciled scan findings."
    );
    Reconciliation::Persist(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{
        DomainPermutationFinding, FindingDetail, ScannerKind, Severity, VulnerabilityState,
    };
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn twist(domain: &str, seen: DateTime<Utc>) -> ScanFinding {
        ScanFinding::new(
            FindingDetail::DomainPermutation(DomainPermutationFinding {
                domain: domain.to_string(),
                fuzzer: "replacement".to_string(),
                registered: true,
                dns_a: Vec::new(),
                dns_aaaa: Vec::new(),
                dns_ns: Vec::new(),
                dns_mx: Vec::new(),
                extra: BTreeMap::new(),
            }),
            seen,
        )
    }

    fn record(findings: Vec<ScanFinding>) -> Vulnerability {
        Vulnerability {
            id: 1,
            domain_id: 1,
            source: ScannerKind::Dnstwist,
            title: "DNS Twist Domains".to_string(),
            state: VulnerabilityState::Open,
            severity: Severity::Low,
            needs_population: false,
            last_seen: day(1),
            description: "Registered domains similar to example.com.".to_string(),
            findings,
            created_at: day(1),
        }
    }

    fn persisted(r: Reconciliation) -> Vec<ScanFinding> {
        match r {
            Reconciliation::Persist(f) => f,
            Reconciliation::Skip => panic!("expected findings to persist"),
        }
    }

    #[test]
    fn test_empty_scan_is_skipped_with_or_without_history() {
        assert_eq!(reconcile(None, Vec::new(), day(2)), Reconciliation::Skip);
        let prior = record(vec![twist("examp1e.com", day(1))]);
        assert_eq!(reconcile(Some(&prior), Vec::new(), day(2)), Reconciliation::Skip);
    }

    #[test]
    fn test_new_keys_take_run_timestamp() {
        let merged = persisted(reconcile(None, vec![twist("examp1e.com", day(9))], day(5)));
        assert_eq!(merged[0].first_observed, day(5));
    }

    #[test]
    fn test_known_keys_keep_first_observed() {
        let prior = record(vec![twist("examp1e.com", day(1))]);
        let merged = persisted(reconcile(
            Some(&prior),
            vec![twist("examp1e.com", day(5)), twist("exampie.com", day(5))],
            day(5),
        ));

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].first_observed, day(1));
        assert_eq!(merged[1].first_observed, day(5));
    }

    #[test]
    fn test_absent_keys_are_dropped_from_active_set() {
        let prior = record(vec![twist("examp1e.com", day(1)), twist("exarnple.com", day(1))]);
        let merged = persisted(reconcile(Some(&prior), vec![twist("examp1e.com", day(3))], day(3)));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].key, "examp1e.com");
    }

    #[test]
    fn test_duplicates_collapse_to_earliest_in_first_position() {
        let prior = record(vec![twist("exampie.com", day(2))]);
        let merged = persisted(reconcile(
            Some(&prior),
            vec![
                twist("examp1e.com", day(4)),
                twist("exampie.com", day(4)),
                twist("EXAMP1E.com", day(4)),
            ],
            day(4),
        ));

        let keys: Vec<&str> = merged.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["examp1e.com", "exampie.com"]);
        assert_eq!(merged[1].first_observed, day(2));
    }

    #[test]
    fn test_reconciling_twice_is_stable() {
        let first = persisted(reconcile(None, vec![twist("examp1e.com", day(1))], day(1)));
        let prior = record(first.clone());
        let second = persisted(reconcile(Some(&prior), vec![twist("examp1e.com", day(1))], day(1)));
        assert_eq!(first, second);
    }
}
