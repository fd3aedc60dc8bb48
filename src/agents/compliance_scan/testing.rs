//! Shared fakes for the scan subsystem's tests

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::discovery::RegionLister;
use super::identity::{CredentialProvider, Federation, WebIdentityCredentials};
use super::orchestrator::ScanOperation;
use super::pool::{LocalContext, TargetClient, TargetClientPool};
use super::types::{ComplianceQuery, Credential, PartialComplianceResult, Severity, Violation};
use crate::config::FederationSettings;
use crate::tools::aws::sts::AssumeRoleRequest;
use crate::tools::aws::{CredentialsSource, StaticCredentials};

pub const LOCAL_ACCOUNT: &str = "210987654321";
pub const LOCAL_REGION: &str = "us-east-1";

/// Federation that issues fake credentials and counts calls
pub struct MockFederation {
    calls: AtomicUsize,
    lifetime_secs: AtomicI64,
    delay: Duration,
    failing: HashSet<String>,
    blocked: Option<String>,
    gate: Semaphore,
}

impl MockFederation {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            lifetime_secs: AtomicI64::new(3600),
            delay: Duration::ZERO,
            failing: HashSet::new(),
            blocked: None,
            gate: Semaphore::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_failing_account(mut self, account: &str) -> Self {
        self.failing.insert(account.to_string());
        self
    }

    /// Calls for `account` hang until `release()`
    pub fn with_blocked_account(mut self, account: &str) -> Self {
        self.blocked = Some(account.to_string());
        self
    }

    pub fn release(&self) {
        self.gate.add_permits(64);
    }

    pub fn set_lifetime_secs(&self, secs: i64) {
        self.lifetime_secs.store(secs, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Federation for MockFederation {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<Credential> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.blocked.as_deref() == Some(request.account_id.as_str()) {
            let _permit = self.gate.acquire().await?;
        }
        if self.failing.contains(&request.account_id) {
            bail!("AccessDenied: not authorized to assume {}", request.role_arn);
        }

        let lifetime = self.lifetime_secs.load(Ordering::SeqCst);
        Ok(Credential {
            access_key: format!("ASIA{}", request.account_id),
            secret_key: "secret".to_string(),
            session_token: Some("token".to_string()),
            account_id: Some(request.account_id.clone()),
            role_reference: Some(request.role_arn.clone()),
            expiration: Some(Utc::now() + ChronoDuration::seconds(lifetime)),
        })
    }
}

pub fn local_context() -> LocalContext {
    LocalContext {
        account_id: LOCAL_ACCOUNT.to_string(),
        region: LOCAL_REGION.to_string(),
        credentials: Arc::new(StaticCredentials::new(Credential {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "local-secret".to_string(),
            session_token: None,
            account_id: Some(LOCAL_ACCOUNT.to_string()),
            role_reference: None,
            expiration: None,
        })),
    }
}

/// Pool over `federation`, pointing at an unroutable endpoint
pub fn test_pool(federation: MockFederation) -> (Arc<TargetClientPool>, Arc<MockFederation>) {
    test_pool_with_endpoint(federation, "http://127.0.0.1:9")
}

pub fn test_pool_with_endpoint(
    federation: MockFederation,
    endpoint: &str,
) -> (Arc<TargetClientPool>, Arc<MockFederation>) {
    build_pool(federation, local_context(), endpoint)
}

/// Pool whose local client signs with `credentials`
pub fn test_pool_with_local(
    federation: MockFederation,
    credentials: Arc<dyn CredentialsSource>,
) -> (Arc<TargetClientPool>, Arc<MockFederation>) {
    let local = LocalContext {
        credentials,
        ..local_context()
    };
    build_pool(federation, local, "http://127.0.0.1:9")
}

fn build_pool(
    federation: MockFederation,
    local: LocalContext,
    endpoint: &str,
) -> (Arc<TargetClientPool>, Arc<MockFederation>) {
    let federation = Arc::new(federation);
    let provider = Arc::new(CredentialProvider::new(
        federation.clone(),
        FederationSettings::default(),
    ));
    let pool = TargetClientPool::new(
        local,
        provider,
        reqwest::Client::new(),
        Some(endpoint.to_string()),
    );
    (Arc::new(pool), federation)
}

pub const MISSING_TOKEN_ROLE: &str = "arn:aws:iam::210987654321:role/ScannerWebIdentity";

/// Web identity credentials whose token file does not exist
pub fn missing_token_credentials() -> Arc<dyn CredentialsSource> {
    Arc::new(WebIdentityCredentials::new(
        reqwest::Client::new(),
        LOCAL_REGION,
        MISSING_TOKEN_ROLE,
        "/nonexistent/token",
    ))
}

/// Region lister returning a fixed answer
pub struct MockRegionLister {
    regions: Option<Vec<String>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockRegionLister {
    pub fn ok(regions: &[&str]) -> Self {
        Self {
            regions: Some(regions.iter().map(|r| r.to_string()).collect()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            regions: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegionLister for MockRegionLister {
    async fn list_regions(&self) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.regions {
            Some(regions) => Ok(regions.clone()),
            None => bail!("UnauthorizedOperation: ec2:DescribeRegions denied"),
        }
    }
}

/// How the fake operation behaves for one (account, region)
#[derive(Debug, Clone)]
pub enum Behavior {
    Counts { resources: u64, compliant: u64 },
    Fail(String),
    Hang,
}

/// Instrumented scan operation: records calls and peak concurrency
pub struct MockScanOperation {
    behaviors: HashMap<String, Behavior>,
    default: Behavior,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl MockScanOperation {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            default: Behavior::Counts {
                resources: 1,
                compliant: 1,
            },
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Keyed by `"<account>/<region>"` of the resolved client
    pub fn with(mut self, key: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(key.to_string(), behavior);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScanOperation for MockScanOperation {
    async fn scan(
        &self,
        client: &TargetClient,
        _query: &ComplianceQuery,
    ) -> Result<PartialComplianceResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let key = format!("{}/{}", client.account_id(), client.region());
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(key.clone());
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.behaviors.get(&key).unwrap_or(&self.default) {
            Behavior::Counts {
                resources,
                compliant,
            } => Ok(PartialComplianceResult {
                resource_count: *resources,
                compliant_count: *compliant,
                violations: (0..resources.saturating_sub(*compliant))
                    .map(|i| Violation {
                        resource_id: format!(
                            "arn:aws:ec2:{}:{}:instance/i-{}",
                            client.region(),
                            client.account_id(),
                            i
                        ),
                        resource_type: "ec2:instance".to_string(),
                        tag_name: "Owner".to_string(),
                        violation_type: "missing_required_tag".to_string(),
                        severity: Severity::Error,
                        target_id: None,
                    })
                    .collect(),
            }),
            Behavior::Fail(message) => bail!("{}", message),
            Behavior::Hang => std::future::pending().await,
        }
    }
}
