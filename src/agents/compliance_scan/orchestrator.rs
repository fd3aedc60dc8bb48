//! Scan Orchestrator
//!
//! Runs one scan operation against every target with bounded concurrency.
//!
//! ## Per-target unit of work
//!
//! 1. wait for a semaphore permit
//! 2. resolve a pooled client (federating if credentials are cold)
//! 3. run the operation
//!
//! All three steps share one deadline measured from unit start. Any error,
//! including a timeout or a panicked task, becomes a failed
//! [`TargetScanResult`] for that target only. Results come back in input
//! order regardless of completion order.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use super::pool::{TargetClient, TargetClientPool};
use super::types::{
    ComplianceQuery, CredentialError, PartialComplianceResult, ScanError, ScanTarget,
    TargetScanResult,
};
use crate::config::ScanSettings;
use crate::tools::aws::AwsError;

/// The externally supplied, target-agnostic scan function
#[async_trait]
pub trait ScanOperation: Send + Sync {
    async fn scan(
        &self,
        client: &TargetClient,
        query: &ComplianceQuery,
    ) -> Result<PartialComplianceResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub max_concurrency: usize,
    pub per_target_timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions::from(&ScanSettings::default())
    }
}

impl From<&ScanSettings> for ScanOptions {
    fn from(settings: &ScanSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency,
            per_target_timeout: settings.per_target_timeout,
        }
    }
}

pub struct ScanOrchestrator {
    pool: Arc<TargetClientPool>,
}

impl ScanOrchestrator {
    pub fn new(pool: Arc<TargetClientPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<TargetClientPool> {
        &self.pool
    }

    /// Scan every target; one result per target, in input order
    pub async fn scan(
        &self,
        targets: &[ScanTarget],
        operation: Arc<dyn ScanOperation>,
        query: &ComplianceQuery,
        options: ScanOptions,
    ) -> Vec<TargetScanResult> {
        self.run(targets, operation, query, options, None).await
    }

    /// As [`scan`](Self::scan), with an enclosing deadline. Targets still
    /// running when it passes are cancelled and reported as timed out.
    pub async fn scan_with_deadline(
        &self,
        targets: &[ScanTarget],
        operation: Arc<dyn ScanOperation>,
        query: &ComplianceQuery,
        options: ScanOptions,
        overall: Duration,
    ) -> Vec<TargetScanResult> {
        self.run(targets, operation, query, options, Some(overall))
            .await
    }

    async fn run(
        &self,
        targets: &[ScanTarget],
        operation: Arc<dyn ScanOperation>,
        query: &ComplianceQuery,
        options: ScanOptions,
        overall: Option<Duration>,
    ) -> Vec<TargetScanResult> {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
        let query = Arc::new(query.clone());

        info!(
            targets = targets.len(),
            max_concurrency = options.max_concurrency,
            timeout_secs = options.per_target_timeout.as_secs(),
            "Starting multi-target scan"
        );

        let handles: Vec<JoinHandle<TargetScanResult>> = targets
            .iter()
            .cloned()
            .map(|target| {
                tokio::spawn(scan_target(
                    target,
                    self.pool.clone(),
                    operation.clone(),
                    query.clone(),
                    semaphore.clone(),
                    options.per_target_timeout,
                ))
            })
            .collect();

        let deadline = overall.map(|d| started + d);
        let results: Vec<TargetScanResult> = join_all(
            targets
                .iter()
                .zip(handles)
                .map(|(target, handle)| collect(target, handle, deadline, started)),
        )
        .await;

        let failed = results.iter().filter(|r| !r.success).count();
        info!(
            targets = results.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Multi-target scan finished"
        );
        results
    }
}

/// Await one unit, converting panics and the overall deadline into failures
async fn collect(
    target: &ScanTarget,
    mut handle: JoinHandle<TargetScanResult>,
    deadline: Option<Instant>,
    started: Instant,
) -> TargetScanResult {
    let joined = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                let error = ScanError::Timeout {
                    target: target.id.clone(),
                    budget_secs: deadline.duration_since(started).as_secs(),
                };
                warn!(target = %target.id, "Target cancelled by overall scan deadline");
                return TargetScanResult::failure(&target.id, &error, started.elapsed());
            }
        },
        None => handle.await,
    };

    joined.unwrap_or_else(|e| {
        let error = ScanError::Operation {
            target: target.id.clone(),
            message: format!("scan task aborted: {}", e),
        };
        warn!(target = %target.id, error = %error, "Scan task did not complete");
        TargetScanResult::failure(&target.id, &error, started.elapsed())
    })
}

/// Classify an operation failure. A credential error anywhere in the chain
/// keeps its kind and role.
pub fn operation_error(target: &str, error: &anyhow::Error) -> ScanError {
    let credential = error.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<CredentialError>() {
            return Some(e.clone());
        }
        match cause.downcast_ref::<AwsError>() {
            Some(AwsError::Credentials(e)) => Some(e.clone()),
            _ => None,
        }
    });

    match credential {
        Some(e) => ScanError::Credential(e),
        None => ScanError::Operation {
            target: target.to_string(),
            message: format!("{:#}", error),
        },
    }
}

async fn scan_target(
    target: ScanTarget,
    pool: Arc<TargetClientPool>,
    operation: Arc<dyn ScanOperation>,
    query: Arc<ComplianceQuery>,
    semaphore: Arc<Semaphore>,
    budget: Duration,
) -> TargetScanResult {
    let started = Instant::now();

    let unit = async {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|e| ScanError::Operation {
                target: target.id.clone(),
                message: format!("concurrency limiter closed: {}", e),
            })?;

        let client = pool.get_client(&target).await?;

        let partial = operation
            .scan(&client, &query)
            .await
            .map_err(|e| operation_error(&target.id, &e))?;

        Ok::<_, ScanError>((partial, client.role_reference()))
    };

    let outcome = match tokio::time::timeout(budget, unit).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ScanError::Timeout {
            target: target.id.clone(),
            budget_secs: budget.as_secs(),
        }),
    };

    let elapsed = started.elapsed();
    match outcome {
        Ok((partial, role_used)) => {
            info!(
                target = %target.id,
                resources = partial.resource_count,
                compliant = partial.compliant_count,
                duration_ms = elapsed.as_millis() as u64,
                "Target scanned"
            );
            TargetScanResult::success(&target.id, partial, elapsed, role_used)
        }
        Err(error) => {
            warn!(
                target = %target.id,
                kind = ?error.failure_kind(),
                error = %error,
                "Target scan failed"
            );
            TargetScanResult::failure(&target.id, &error, elapsed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::compliance_scan::testing::{
        missing_token_credentials, test_pool, test_pool_with_local, Behavior, MockFederation,
        MockScanOperation, LOCAL_ACCOUNT, LOCAL_REGION, MISSING_TOKEN_ROLE,
    };
    use crate::agents::compliance_scan::{FailureKind, RequiredTagsOperation, TagPolicy};
    use anyhow::Context;

    fn options(max_concurrency: usize, timeout_secs: u64) -> ScanOptions {
        ScanOptions {
            max_concurrency,
            per_target_timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn regions(names: &[&str]) -> Vec<ScanTarget> {
        names.iter().map(|r| ScanTarget::region(r)).collect()
    }

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let (pool, _) = test_pool(MockFederation::new());
        let orchestrator = ScanOrchestrator::new(pool);
        let targets = regions(&["us-west-2", "eu-west-1", "us-east-1", "ap-south-1"]);

        let operation = Arc::new(MockScanOperation::new());

        let results = orchestrator
            .scan(
                &targets,
                operation.clone(),
                &ComplianceQuery::default(),
                options(2, 60),
            )
            .await;

        let ids: Vec<&str> = results.iter().map(|r| r.target_id.as_str()).collect();
        assert_eq!(ids, vec!["us-west-2", "eu-west-1", "us-east-1", "ap-south-1"]);
        assert!(results.iter().all(|r| r.success));

        let mut seen = operation.seen();
        seen.sort();
        assert_eq!(
            seen,
            ["ap-south-1", "eu-west-1", "us-east-1", "us-west-2"]
                .iter()
                .map(|r| format!("{}/{}", LOCAL_ACCOUNT, r))
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let (pool, _) = test_pool(MockFederation::new());
        let orchestrator = ScanOrchestrator::new(pool);
        let operation = Arc::new(MockScanOperation::new().with_delay(Duration::from_secs(1)));
        let targets: Vec<ScanTarget> = (0..12)
            .map(|i| ScanTarget::region(&format!("test-region-{}", i)))
            .collect();

        for limit in [1, 3, 5] {
            let op = Arc::new(MockScanOperation::new().with_delay(Duration::from_secs(1)));
            let results = orchestrator
                .scan(&targets, op.clone(), &ComplianceQuery::default(), options(limit, 60))
                .await;
            assert_eq!(results.len(), 12);
            assert!(op.peak_in_flight() <= limit);
            assert_eq!(op.peak_in_flight(), limit);
        }

        let results = orchestrator
            .scan(&targets, operation.clone(), &ComplianceQuery::default(), options(20, 60))
            .await;
        assert!(results.iter().all(|r| r.success));
        assert_eq!(operation.peak_in_flight(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_timeout_does_not_affect_others() {
        let (pool, _) = test_pool(MockFederation::new());
        let orchestrator = ScanOrchestrator::new(pool);
        let operation = Arc::new(
            MockScanOperation::new()
                .with(
                    &format!("{}/us-east-1", LOCAL_ACCOUNT),
                    Behavior::Counts {
                        resources: 10,
                        compliant: 8,
                    },
                )
                .with(&format!("{}/eu-west-1", LOCAL_ACCOUNT), Behavior::Hang),
        );

        let results = orchestrator
            .scan(
                &regions(&["us-east-1", "eu-west-1"]),
                operation,
                &ComplianceQuery::default(),
                options(5, 30),
            )
            .await;

        assert!(results[0].success);
        assert_eq!(results[0].resource_count, 10);
        assert!(!results[1].success);
        assert_eq!(results[1].error_kind, Some(FailureKind::Timeout));
        assert!(results[1].error.as_deref().unwrap().contains("30s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_includes_semaphore_wait() {
        let (pool, _) = test_pool(MockFederation::new());
        let orchestrator = ScanOrchestrator::new(pool);
        // With one permit, the second target waits 40s and overruns its 30s budget
        let operation = Arc::new(MockScanOperation::new().with_delay(Duration::from_secs(40)));

        let results = orchestrator
            .scan(
                &regions(&["us-east-1", "eu-west-1"]),
                operation.clone(),
                &ComplianceQuery::default(),
                options(1, 30),
            )
            .await;

        assert!(results.iter().all(|r| r.error_kind == Some(FailureKind::Timeout)));

        let operation = Arc::new(MockScanOperation::new().with_delay(Duration::from_secs(20)));
        let results = orchestrator
            .scan(
                &regions(&["us-east-1", "eu-west-1"]),
                operation,
                &ComplianceQuery::default(),
                options(1, 30),
            )
            .await;
        assert!(results[0].success);
        assert_eq!(results[1].error_kind, Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn test_credential_failure_is_isolated() {
        let (pool, _) = test_pool(MockFederation::new().with_failing_account("444444444444"));
        let orchestrator = ScanOrchestrator::new(pool);
        let targets = vec![
            ScanTarget::account("111111111111"),
            ScanTarget::account("444444444444"),
            ScanTarget::region(LOCAL_REGION),
        ];

        let results = orchestrator
            .scan(
                &targets,
                Arc::new(MockScanOperation::new()),
                &ComplianceQuery::default(),
                options(5, 60),
            )
            .await;

        assert!(results[0].success);
        assert_eq!(
            results[0].role_used.as_deref(),
            Some("arn:aws:iam::111111111111:role/TagComplianceScanner")
        );
        assert!(!results[1].success);
        assert_eq!(results[1].error_kind, Some(FailureKind::Credential));
        assert_eq!(
            results[1].role_used.as_deref(),
            Some("arn:aws:iam::444444444444:role/TagComplianceScanner")
        );
        assert!(results[2].success);
        assert!(results[2].role_used.is_none());
    }

    #[tokio::test]
    async fn test_operation_error_is_classified() {
        let (pool, _) = test_pool(MockFederation::new());
        let orchestrator = ScanOrchestrator::new(pool);
        let operation = Arc::new(MockScanOperation::new().with(
            &format!("{}/us-east-1", LOCAL_ACCOUNT),
            Behavior::Fail("AccessDeniedException: tag:GetResources".to_string()),
        ));

        let results = orchestrator
            .scan(
                &regions(&["us-east-1", "us-west-2"]),
                operation,
                &ComplianceQuery::default(),
                options(5, 60),
            )
            .await;

        assert_eq!(results[0].error_kind, Some(FailureKind::Operation));
        assert!(results[0].error.as_deref().unwrap().contains("AccessDeniedException"));
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn test_signing_credential_failure_keeps_role() {
        let (pool, _) = test_pool_with_local(MockFederation::new(), missing_token_credentials());
        let orchestrator = ScanOrchestrator::new(pool);

        let results = orchestrator
            .scan(
                &regions(&[LOCAL_REGION]),
                Arc::new(RequiredTagsOperation::new(TagPolicy::default())),
                &ComplianceQuery::default(),
                options(5, 60),
            )
            .await;

        assert!(!results[0].success);
        assert_eq!(results[0].error_kind, Some(FailureKind::Credential));
        assert_eq!(results[0].role_used.as_deref(), Some(MISSING_TOKEN_ROLE));
        assert!(results[0].error.as_deref().unwrap().contains("token"));
    }

    #[test]
    fn test_operation_error_finds_nested_credential_error() {
        let credential = CredentialError {
            account: "111111111111".to_string(),
            role_reference: "arn:aws:iam::111111111111:role/Scanner".to_string(),
            message: "AccessDenied".to_string(),
        };

        let wrapped: Result<(), AwsError> = Err(AwsError::Credentials(credential.clone()));
        let err = wrapped.context("GetResources failed").unwrap_err();
        let classified = operation_error("111111111111/us-east-1", &err);
        assert_eq!(classified.failure_kind(), Some(FailureKind::Credential));
        assert_eq!(classified.role_reference(), Some(credential.role_reference.as_str()));

        let direct = anyhow::Error::new(credential).context("outer");
        assert_eq!(
            operation_error("x", &direct).failure_kind(),
            Some(FailureKind::Credential)
        );

        let plain = anyhow::anyhow!("AccessDeniedException");
        let classified = operation_error("x", &plain);
        assert_eq!(classified.failure_kind(), Some(FailureKind::Operation));
        assert!(classified.role_reference().is_none());
    }

    #[tokio::test]
    async fn test_violations_tagged_with_target() {
        let (pool, _) = test_pool(MockFederation::new());
        let orchestrator = ScanOrchestrator::new(pool);
        let operation = Arc::new(MockScanOperation::new().with(
            "111111111111/eu-west-1",
            Behavior::Counts {
                resources: 3,
                compliant: 1,
            },
        ));

        let results = orchestrator
            .scan(
                &[ScanTarget::account_region("111111111111", "eu-west-1")],
                operation,
                &ComplianceQuery::default(),
                options(5, 60),
            )
            .await;

        assert_eq!(results[0].violations.len(), 2);
        assert!(results[0]
            .violations
            .iter()
            .all(|v| v.target_id.as_deref() == Some("111111111111/eu-west-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_deadline_reports_unfinished_targets() {
        let (pool, _) = test_pool(MockFederation::new());
        let orchestrator = ScanOrchestrator::new(pool);
        let operation = Arc::new(
            MockScanOperation::new().with(&format!("{}/eu-west-1", LOCAL_ACCOUNT), Behavior::Hang),
        );

        let results = orchestrator
            .scan_with_deadline(
                &regions(&["us-east-1", "eu-west-1"]),
                operation,
                &ComplianceQuery::default(),
                options(5, 600),
                Duration::from_secs(45),
            )
            .await;

        assert!(results[0].success);
        assert_eq!(results[1].error_kind, Some(FailureKind::Timeout));
        assert!(results[1].error.as_deref().unwrap().contains("45s"));
    }

    #[tokio::test]
    async fn test_empty_target_list() {
        let (pool, _) = test_pool(MockFederation::new());
        let results = ScanOrchestrator::new(pool)
            .scan(
                &[],
                Arc::new(MockScanOperation::new()),
                &ComplianceQuery::default(),
                ScanOptions::default(),
            )
            .await;
        assert!(results.is_empty());
    }
}
