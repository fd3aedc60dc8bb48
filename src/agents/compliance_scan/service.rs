//! Compliance Scan Service
//!
//! [`ScanEngine`] owns every shared component (credential provider, client
//! pool, discovery, result cache) and wires them into one entry point,
//! `scan_compliance`. Nothing here is global; tests build their own engine.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::aggregator::aggregate;
use super::cache::{CacheBackend, CacheKey, InMemoryBackend, ResultCache};
use super::discovery::{DiscoveredTargets, Ec2RegionLister, TargetDiscovery};
use super::identity::{base_credentials_from_env, CredentialProvider, StsFederation};
use super::orchestrator::{operation_error, ScanOperation, ScanOptions, ScanOrchestrator};
use super::policy::{RequiredTagsOperation, TagPolicy};
use super::pool::{LocalContext, TargetClientPool};
use super::types::{
    compliance_score, ComplianceQuery, ScanError, ScanResponse, ScanTarget, SingleTargetResult,
    TargetKind,
};
use crate::config::{EngineConfig, ScanSettings};
use crate::tools::aws::{sts, AwsClient};

const SINGLE_MODE: &str = "single";
const AGGREGATED_MODE: &str = "aggregated";

/// Which targets a multi-target scan covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelection {
    Explicit(Vec<ScanTarget>),
    /// The operator-configured accounts and regions
    Configured,
    /// Enabled regions; `accounts` overrides the configured account list
    Discover { accounts: Vec<String> },
}

/// One `scan_compliance` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRequest {
    pub query: ComplianceQuery,
    pub force_refresh: bool,
    /// `None` scans only the local account/region, as a single target
    pub targets: Option<TargetSelection>,
}

/// The scan engine container
pub struct ScanEngine {
    provider: Arc<CredentialProvider>,
    pool: Arc<TargetClientPool>,
    discovery: Arc<TargetDiscovery>,
    cache: ResultCache,
    orchestrator: ScanOrchestrator,
    operation: Arc<dyn ScanOperation>,
    settings: ScanSettings,
}

impl ScanEngine {
    pub fn new(
        pool: Arc<TargetClientPool>,
        discovery: Arc<TargetDiscovery>,
        cache: ResultCache,
        operation: Arc<dyn ScanOperation>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            provider: pool.provider().clone(),
            orchestrator: ScanOrchestrator::new(pool.clone()),
            pool,
            discovery,
            cache,
            operation,
            settings,
        }
    }

    /// Build the production graph: STS federation, EC2 discovery, the
    /// required-tags operation and the configured cache backend.
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base = base_credentials_from_env(&http, &config.local_region)?;
        let account_id = match &config.local_account_id {
            Some(account) => account.clone(),
            None => {
                let bootstrap = AwsClient::new(http.clone(), "local", &config.local_region, base.clone())
                    .with_endpoint(config.endpoint_override.clone());
                match sts::get_caller_identity(&bootstrap).await {
                    Ok(identity) => {
                        info!(account = %identity.account, arn = %identity.arn, "Resolved local identity");
                        identity.account
                    }
                    Err(e) => {
                        warn!(error = %e, "GetCallerIdentity failed, local account id unknown");
                        "local".to_string()
                    }
                }
            }
        };

        let local = LocalContext {
            account_id: account_id.clone(),
            region: config.local_region.clone(),
            credentials: base.clone(),
        };

        let sts_client = AwsClient::new(http.clone(), &account_id, &config.local_region, base)
            .with_endpoint(config.endpoint_override.clone());
        let provider = Arc::new(CredentialProvider::new(
            Arc::new(StsFederation::new(sts_client)),
            config.federation.clone(),
        ));

        let pool = Arc::new(TargetClientPool::new(
            local,
            provider,
            http,
            config.endpoint_override.clone(),
        ));

        let lister = Arc::new(Ec2RegionLister::new(pool.local_client().aws().clone()));
        let discovery = Arc::new(TargetDiscovery::new(
            lister,
            config.targets.clone(),
            &account_id,
            &config.local_region,
            config.scan.discovery_ttl,
        ));

        let cache = ResultCache::new(cache_backend(config).await, config.scan.cache_ttl);
        let policy = TagPolicy::parse(&config.required_tags).context("Invalid required tags policy")?;
        info!(
            required_tags = policy.required_tags.len(),
            cache_enabled = cache.is_enabled(),
            "Scan engine initialized"
        );

        Ok(Self::new(
            pool,
            discovery,
            cache,
            Arc::new(RequiredTagsOperation::new(policy)),
            config.scan.clone(),
        ))
    }

    pub fn local(&self) -> &LocalContext {
        self.pool.local()
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn provider(&self) -> &Arc<CredentialProvider> {
        &self.provider
    }

    /// Scan, serving from cache unless `force_refresh` is set
    pub async fn scan_compliance(&self, request: ScanRequest) -> Result<ScanResponse, ScanError> {
        match &request.targets {
            None => self.scan_single(&request).await.map(ScanResponse::SingleTarget),
            Some(selection) => self
                .scan_targets(selection, &request)
                .await
                .map(ScanResponse::Aggregated),
        }
    }

    /// The local account/region only, without the orchestrator
    async fn scan_single(&self, request: &ScanRequest) -> Result<SingleTargetResult, ScanError> {
        let target = ScanTarget::region(&self.local().region);
        let key = CacheKey::builder()
            .scope(&self.local().account_id)
            .mode(SINGLE_MODE)
            .targets(std::slice::from_ref(&target))
            .query(&request.query)
            .build();

        if !request.force_refresh {
            if let Some(cached) = self.cache.get::<SingleTargetResult>(&key).await {
                return Ok(cached);
            }
        }

        let client = self.pool.local_client();
        let budget = self.settings.per_target_timeout;
        let partial = tokio::time::timeout(budget, self.operation.scan(&client, &request.query))
            .await
            .map_err(|_| ScanError::Timeout {
                target: target.id.clone(),
                budget_secs: budget.as_secs(),
            })?
            .map_err(|e| operation_error(&target.id, &e))?;

        if partial.compliant_count > partial.resource_count {
            return Err(ScanError::Aggregation {
                target: target.id.clone(),
                message: format!(
                    "compliant_count {} exceeds resource_count {}",
                    partial.compliant_count, partial.resource_count
                ),
            });
        }

        let result = SingleTargetResult {
            compliance_score: compliance_score(partial.compliant_count, partial.resource_count),
            total_resources: partial.resource_count,
            compliant_resources: partial.compliant_count,
            violations: partial.violations,
            scanned_at: Utc::now(),
        };
        self.cache.put(&key, &result, None).await;
        Ok(result)
    }

    async fn scan_targets(
        &self,
        selection: &TargetSelection,
        request: &ScanRequest,
    ) -> Result<super::types::AggregatedResult, ScanError> {
        let explicit = match selection {
            TargetSelection::Explicit(list) if list.is_empty() => {
                return Err(ScanError::InvalidRequest(
                    "target list is empty; omit targets to scan the local region".to_string(),
                ));
            }
            TargetSelection::Explicit(list) => Some(self.normalize(list)),
            _ => None,
        };

        let key = self.selection_key(selection, explicit.as_deref(), &request.query);
        if !request.force_refresh {
            if let Some(cached) = self.cache.get(&key).await {
                return Ok(cached);
            }
        }

        let (targets, degraded, discovery_error) = match (explicit, selection) {
            (Some(targets), _) => (targets, false, None),
            (None, TargetSelection::Discover { accounts }) => {
                let discovered = self.discovery.discover_targets(accounts).await;
                (discovered.targets, discovered.degraded, discovered.error)
            }
            (None, _) => {
                let listed = self.discovery.list_targets().await;
                (listed.targets, listed.degraded, listed.error)
            }
        };

        let results = self
            .orchestrator
            .scan(
                &targets,
                self.operation.clone(),
                &request.query,
                ScanOptions::from(&self.settings),
            )
            .await;
        let mut aggregated = aggregate(&targets, &results, degraded);
        aggregated.target_metadata.discovery_error = discovery_error;

        if degraded {
            warn!("Not caching a scan over the fallback region set");
        } else {
            self.cache.put(&key, &aggregated, None).await;
        }

        info!(
            targets = aggregated.target_metadata.total,
            failed = aggregated.target_metadata.failed.len(),
            score = aggregated.compliance_score,
            "Compliance scan aggregated"
        );
        Ok(aggregated)
    }

    /// Explicit lists key on the normalized targets. Configured and discovered
    /// selections key on what selects the targets, so a hit skips discovery.
    fn selection_key(
        &self,
        selection: &TargetSelection,
        explicit: Option<&[ScanTarget]>,
        query: &ComplianceQuery,
    ) -> CacheKey {
        let builder = CacheKey::builder()
            .scope(&self.local().account_id)
            .mode(AGGREGATED_MODE)
            .query(query);
        let settings = self.discovery.settings();

        let builder = match (explicit, selection) {
            (Some(targets), _) => builder.targets(targets),
            (None, TargetSelection::Discover { accounts }) => {
                let accounts: &[String] = if accounts.is_empty() {
                    &settings.accounts
                } else {
                    accounts
                };
                builder
                    .selector("selection", &["discover".to_string()])
                    .selector("accounts", accounts)
            }
            (None, _) => builder
                .selector("selection", &["configured".to_string()])
                .selector("accounts", &settings.accounts)
                .selector("regions", &settings.regions)
                .selector("discover_regions", &[settings.discover_regions.to_string()]),
        };
        builder.build()
    }

    /// Local-account targets collapse to region targets; duplicates dropped
    fn normalize(&self, targets: &[ScanTarget]) -> Vec<ScanTarget> {
        let local = self.local();
        let mut seen = HashSet::new();

        targets
            .iter()
            .map(|target| match (target.kind, target.account_region_parts()) {
                (TargetKind::Account, _) if target.id == local.account_id => {
                    ScanTarget::region(&local.region)
                }
                (TargetKind::AccountRegion, Some((account, region)))
                    if account == local.account_id =>
                {
                    ScanTarget::region(region)
                }
                _ => target.clone(),
            })
            .filter(|target| seen.insert(target.id.clone()))
            .collect()
    }

    pub async fn list_targets(&self) -> DiscoveredTargets {
        self.discovery.list_targets().await
    }

    /// Drop cached results under `prefix` (a querying account or a full key prefix)
    pub async fn invalidate_cache(&self, prefix: Option<&str>) -> usize {
        self.cache.invalidate(prefix).await
    }

    /// Forget pooled clients and credentials after a permission change
    pub async fn refresh_permissions(&self, account_id: Option<&str>) {
        self.pool.invalidate(account_id);
        if account_id.is_none() {
            self.discovery.invalidate().await;
        }
    }
}

async fn cache_backend(config: &EngineConfig) -> Option<Arc<dyn CacheBackend>> {
    if config.scan.cache_ttl.is_zero() {
        info!("Result cache disabled (ttl = 0)");
        return None;
    }

    if let Some(url) = &config.redis_url {
        #[cfg(feature = "redis-cache")]
        match super::cache::RedisBackend::connect(url).await {
            Ok(backend) => return Some(Arc::new(backend)),
            Err(e) => warn!(error = %e, "Redis unavailable, using in-memory result cache"),
        }

        #[cfg(not(feature = "redis-cache"))]
        warn!(url = %url, "Built without redis-cache, using in-memory result cache");
    }

    Some(Arc::new(InMemoryBackend::new()))
}
