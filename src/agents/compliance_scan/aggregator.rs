//! Result Aggregator
//!
//! Pure merge of per-target results into one [`AggregatedResult`]. Malformed
//! inputs are skipped and recorded; they never discard other targets' data.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

use super::types::{
    compliance_score, AggregatedResult, ScanError, ScanTarget, TargetMetadata, TargetScanResult,
    TargetSummary,
};

/// Aggregate, stamped with the current time
pub fn aggregate(
    targets: &[ScanTarget],
    results: &[TargetScanResult],
    discovery_degraded: bool,
) -> AggregatedResult {
    aggregate_at(targets, results, discovery_degraded, Utc::now())
}

/// Aggregate with an explicit timestamp
pub fn aggregate_at(
    targets: &[ScanTarget],
    results: &[TargetScanResult],
    discovery_degraded: bool,
    scanned_at: DateTime<Utc>,
) -> AggregatedResult {
    let mut metadata = TargetMetadata {
        discovery_degraded,
        ..Default::default()
    };

    // Unique target ids in input order
    let mut seen_targets = HashSet::new();
    let ordered: Vec<&str> = targets
        .iter()
        .filter(|t| seen_targets.insert(t.id.as_str()))
        .map(|t| t.id.as_str())
        .collect();
    metadata.total = ordered.len();

    // First result per known target; the rest are recorded
    let mut by_target: HashMap<&str, &TargetScanResult> = HashMap::new();
    for result in results {
        let id = result.target_id.as_str();
        if !seen_targets.contains(id) {
            record(&mut metadata, id, "result for a target that was not requested");
            continue;
        }
        if by_target.contains_key(id) {
            record(&mut metadata, id, "duplicate result ignored");
            continue;
        }
        by_target.insert(id, result);
    }

    let mut total_resources: u64 = 0;
    let mut compliant_resources: u64 = 0;
    let mut violations = Vec::new();
    let mut breakdown = BTreeMap::new();

    for id in ordered {
        let Some(result) = by_target.get(id) else {
            metadata.skipped.push(id.to_string());
            metadata
                .errors
                .entry(id.to_string())
                .or_insert_with(|| "no result produced".to_string());
            continue;
        };

        if !result.success {
            metadata.failed.push(id.to_string());
            metadata.errors.insert(
                id.to_string(),
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| "scan failed".to_string()),
            );
            continue;
        }

        if result.compliant_count > result.resource_count {
            metadata.skipped.push(id.to_string());
            record(
                &mut metadata,
                id,
                &format!(
                    "compliant_count {} exceeds resource_count {}",
                    result.compliant_count, result.resource_count
                ),
            );
            continue;
        }

        total_resources = total_resources.saturating_add(result.resource_count);
        compliant_resources = compliant_resources.saturating_add(result.compliant_count);
        violations.extend(result.violations.iter().cloned().map(|mut v| {
            v.target_id.get_or_insert_with(|| id.to_string());
            v
        }));

        breakdown.insert(
            id.to_string(),
            TargetSummary {
                resource_count: result.resource_count,
                compliant_count: result.compliant_count,
                violation_count: result.violations.len(),
                compliance_score: compliance_score(result.compliant_count, result.resource_count),
                duration_ms: result.duration_ms,
                role_used: result.role_used.clone(),
            },
        );
        metadata.successful.push(id.to_string());
    }

    AggregatedResult {
        compliance_score: compliance_score(compliant_resources, total_resources),
        total_resources,
        compliant_resources,
        violations,
        target_metadata: metadata,
        per_target_breakdown: breakdown,
        scanned_at,
    }
}

fn record(metadata: &mut TargetMetadata, target: &str, message: &str) {
    let error = ScanError::Aggregation {
        target: target.to_string(),
        message: message.to_string(),
    };
    warn!(target = %target, error = %error, "Skipping malformed scan result");
    metadata
        .errors
        .entry(target.to_string())
        .or_insert_with(|| error.to_string());
}
