//! Target Discovery
//!
//! Enumerates scan targets: enabled regions (configured, or listed via EC2
//! and cached for a short TTL) crossed with the operator-configured account
//! list. When region discovery fails a default region set is used and the
//! result is flagged as degraded.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::{ScanError, ScanTarget};
use crate::config::TargetSettings;
use crate::tools::aws::{ec2, AwsClient};

/// Used when the enablement API cannot be queried
pub const FALLBACK_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-southeast-1",
    "ap-northeast-1",
];

/// Lists the regions enabled for the local account
#[async_trait]
pub trait RegionLister: Send + Sync {
    async fn list_regions(&self) -> Result<Vec<String>>;
}

/// EC2 DescribeRegions against the local account
pub struct Ec2RegionLister {
    client: AwsClient,
}

impl Ec2RegionLister {
    pub fn new(client: AwsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RegionLister for Ec2RegionLister {
    async fn list_regions(&self) -> Result<Vec<String>> {
        Ok(ec2::describe_regions(&self.client).await?)
    }
}

/// Where the region list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    Configured,
    Discovered,
    Cache,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredTargets {
    pub targets: Vec<ScanTarget>,
    /// True when the fallback region set was used
    pub degraded: bool,
    pub source: DiscoverySource,
    /// Why region discovery fell back
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct CachedRegions {
    fetched_at: Instant,
    regions: Vec<String>,
}

pub struct TargetDiscovery {
    lister: Arc<dyn RegionLister>,
    settings: TargetSettings,
    local_account_id: String,
    local_region: String,
    ttl: Duration,
    cache: RwLock<Option<CachedRegions>>,
    refresh: Mutex<()>,
}

impl TargetDiscovery {
    pub fn new(
        lister: Arc<dyn RegionLister>,
        settings: TargetSettings,
        local_account_id: &str,
        local_region: &str,
        ttl: Duration,
    ) -> Self {
        Self {
            lister,
            settings,
            local_account_id: local_account_id.to_string(),
            local_region: local_region.to_string(),
            ttl,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &TargetSettings {
        &self.settings
    }

    /// Configured accounts x regions
    pub async fn list_targets(&self) -> DiscoveredTargets {
        let (regions, source, error) = if !self.settings.regions.is_empty() {
            (Some(self.settings.regions.clone()), DiscoverySource::Configured, None)
        } else if self.settings.discover_regions {
            let (regions, source, error) = self.discover_regions().await;
            (Some(regions), source, error)
        } else {
            (None, DiscoverySource::Configured, None)
        };

        self.finish(&self.settings.accounts, regions.as_deref(), source, error)
    }

    /// Every enabled region for `accounts` (the configured list when empty),
    /// regardless of any configured region list
    pub async fn discover_targets(&self, accounts: &[String]) -> DiscoveredTargets {
        let accounts = if accounts.is_empty() {
            self.settings.accounts.as_slice()
        } else {
            accounts
        };
        let (regions, source, error) = self.discover_regions().await;
        self.finish(accounts, Some(regions.as_slice()), source, error)
    }

    fn finish(
        &self,
        accounts: &[String],
        regions: Option<&[String]>,
        source: DiscoverySource,
        error: Option<ScanError>,
    ) -> DiscoveredTargets {
        let targets = self.build_targets(accounts, regions);
        let degraded = source == DiscoverySource::Fallback;
        info!(
            targets = targets.len(),
            source = ?source,
            degraded,
            "Scan targets listed"
        );

        DiscoveredTargets {
            targets,
            degraded,
            source,
            error: error.map(|e| e.to_string()),
        }
    }

    /// Enabled regions, from cache while within the TTL. Concurrent callers
    /// that miss the cache share one DescribeRegions call.
    pub async fn discover_regions(&self) -> (Vec<String>, DiscoverySource, Option<ScanError>) {
        if let Some(regions) = self.cached_regions().await {
            return (regions, DiscoverySource::Cache, None);
        }

        let _refresh = self.refresh.lock().await;
        if let Some(regions) = self.cached_regions().await {
            return (regions, DiscoverySource::Cache, None);
        }

        let failure = match self.lister.list_regions().await {
            Ok(regions) if !regions.is_empty() => {
                *self.cache.write().await = Some(CachedRegions {
                    fetched_at: Instant::now(),
                    regions: regions.clone(),
                });
                info!(regions = regions.len(), "Enabled regions discovered");
                return (regions, DiscoverySource::Discovered, None);
            }
            Ok(_) => ScanError::Discovery("no enabled regions returned".to_string()),
            Err(e) => ScanError::Discovery(format!("{:#}", e)),
        };

        warn!(error = %failure, "Using fallback region set; coverage may be incomplete");
        (fallback_regions(), DiscoverySource::Fallback, Some(failure))
    }

    async fn cached_regions(&self) -> Option<Vec<String>> {
        let cache = self.cache.read().await;
        let cached = cache.as_ref()?;
        if cached.fetched_at.elapsed() < self.ttl {
            debug!(regions = cached.regions.len(), "Region list served from cache");
            Some(cached.regions.clone())
        } else {
            None
        }
    }

    fn build_targets(&self, accounts: &[String], regions: Option<&[String]>) -> Vec<ScanTarget> {
        let mut seen = HashSet::new();

        let targets: Vec<ScanTarget> = match (accounts.is_empty(), regions) {
            (true, Some(regions)) => regions.iter().map(|r| ScanTarget::region(r)).collect(),
            (true, None) => vec![ScanTarget::region(&self.local_region)],
            (false, None) => accounts
                .iter()
                .map(|account| {
                    if *account == self.local_account_id {
                        ScanTarget::region(&self.local_region)
                    } else {
                        ScanTarget::account(account)
                    }
                })
                .collect(),
            (false, Some(regions)) => accounts
                .iter()
                .flat_map(|account| {
                    regions.iter().map(move |region| {
                        if *account == self.local_account_id {
                            ScanTarget::region(region)
                        } else {
                            ScanTarget::account_region(account, region)
                        }
                    })
                })
                .collect(),
        };

        targets
            .into_iter()
            .filter(|t| seen.insert(t.id.clone()))
            .collect()
    }

    /// Drop the cached region list
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}

fn fallback_regions() -> Vec<String> {
    FALLBACK_REGIONS.iter().map(|r| r.to_string()).collect()
}
