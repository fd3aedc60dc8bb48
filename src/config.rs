//! Engine Configuration
//!
//! Settings consumed by the scan engine. Numeric bounds are enforced both at
//! the CLI (clap value parsers) and in `validate()` for programmatic use.

use anyhow::{bail, Result};
use clap::Args;
use std::ops::RangeInclusive;
use std::time::Duration;

pub const MAX_CONCURRENCY_BOUNDS: RangeInclusive<usize> = 1..=20;
pub const PER_TARGET_TIMEOUT_BOUNDS_SECS: RangeInclusive<u64> = 30..=600;
pub const CACHE_TTL_BOUNDS_SECS: RangeInclusive<u64> = 0..=86_400;
pub const DISCOVERY_TTL_BOUNDS_SECS: RangeInclusive<u64> = 0..=86_400;
pub const SESSION_DURATION_BOUNDS_SECS: RangeInclusive<u64> = 900..=43_200;

pub const DEFAULT_ROLE_ARN_TEMPLATE: &str = "arn:aws:iam::{account_id}:role/{role_name}";
pub const DEFAULT_ROLE_NAME: &str = "TagComplianceScanner";

/// Fan-out and caching knobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    pub max_concurrency: usize,
    pub per_target_timeout: Duration,
    pub cache_ttl: Duration,
    pub discovery_ttl: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            per_target_timeout: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(300),
            discovery_ttl: Duration::from_secs(300),
        }
    }
}

impl ScanSettings {
    pub fn validate(&self) -> Result<()> {
        if !MAX_CONCURRENCY_BOUNDS.contains(&self.max_concurrency) {
            bail!(
                "max_concurrency {} outside {:?}",
                self.max_concurrency,
                MAX_CONCURRENCY_BOUNDS
            );
        }
        let timeout = self.per_target_timeout.as_secs();
        if !PER_TARGET_TIMEOUT_BOUNDS_SECS.contains(&timeout) {
            bail!(
                "per_target_timeout {}s outside {:?}",
                timeout,
                PER_TARGET_TIMEOUT_BOUNDS_SECS
            );
        }
        if !CACHE_TTL_BOUNDS_SECS.contains(&self.cache_ttl.as_secs()) {
            bail!("cache_ttl {}s outside {:?}", self.cache_ttl.as_secs(), CACHE_TTL_BOUNDS_SECS);
        }
        if !DISCOVERY_TTL_BOUNDS_SECS.contains(&self.discovery_ttl.as_secs()) {
            bail!(
                "discovery_ttl {}s outside {:?}",
                self.discovery_ttl.as_secs(),
                DISCOVERY_TTL_BOUNDS_SECS
            );
        }
        Ok(())
    }
}

/// How cross-account roles are assumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationSettings {
    pub role_name: String,
    /// `{account_id}` and `{role_name}` are substituted
    pub role_arn_template: String,
    pub external_id: Option<String>,
    pub session_duration: Duration,
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self {
            role_name: DEFAULT_ROLE_NAME.to_string(),
            role_arn_template: DEFAULT_ROLE_ARN_TEMPLATE.to_string(),
            external_id: None,
            session_duration: Duration::from_secs(3600),
        }
    }
}

impl FederationSettings {
    pub fn role_arn(&self, account_id: &str) -> String {
        self.role_arn_template
            .replace("{account_id}", account_id)
            .replace("{role_name}", &self.role_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.role_name.trim().is_empty() {
            bail!("role_name must not be empty");
        }
        if !self.role_arn_template.contains("{account_id}") {
            bail!(
                "role_arn_template '{}' must contain {{account_id}}",
                self.role_arn_template
            );
        }
        let secs = self.session_duration.as_secs();
        if !SESSION_DURATION_BOUNDS_SECS.contains(&secs) {
            bail!(
                "session_duration {}s outside {:?}",
                secs,
                SESSION_DURATION_BOUNDS_SECS
            );
        }
        Ok(())
    }
}

/// Which targets a discovery-driven scan covers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSettings {
    /// Operator-configured accounts (never discovered)
    pub accounts: Vec<String>,
    /// Explicit regions; when empty and `discover_regions` is set, regions come from EC2
    pub regions: Vec<String>,
    pub discover_regions: bool,
}

impl TargetSettings {
    /// Anything beyond the local region
    pub fn is_configured(&self) -> bool {
        !self.accounts.is_empty() || !self.regions.is_empty() || self.discover_regions
    }
}

/// Everything needed to build a `ScanEngine`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub local_region: String,
    /// Skip the GetCallerIdentity lookup at startup
    pub local_account_id: Option<String>,
    pub scan: ScanSettings,
    pub federation: FederationSettings,
    pub targets: TargetSettings,
    pub redis_url: Option<String>,
    /// Alternate AWS endpoint (e.g. a local emulator)
    pub endpoint_override: Option<String>,
    /// Required-tags policy, e.g. `Owner,CostCenter,Environment=prod|staging`
    pub required_tags: String,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.local_region.trim().is_empty() {
            bail!("local region must be set (AWS_REGION)");
        }
        self.scan.validate()?;
        self.federation.validate()?;
        Ok(())
    }
}

/// CLI / environment surface for [`EngineConfig`]
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Region of the engine's own account
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    pub region: String,

    /// Local account id (looked up via STS when omitted)
    #[arg(long, env = "COMPLIANCE_LOCAL_ACCOUNT_ID")]
    pub local_account_id: Option<String>,

    /// Accounts to scan via role assumption
    #[arg(long, env = "COMPLIANCE_TARGET_ACCOUNTS", value_delimiter = ',')]
    pub accounts: Vec<String>,

    /// Regions to scan; discovered from EC2 when omitted and discovery is on
    #[arg(long, env = "COMPLIANCE_TARGET_REGIONS", value_delimiter = ',')]
    pub regions: Vec<String>,

    /// Discover enabled regions via EC2 DescribeRegions
    #[arg(long, env = "COMPLIANCE_DISCOVER_REGIONS", default_value = "false")]
    pub discover_regions: bool,

    /// Role name assumed in each target account
    #[arg(long, env = "COMPLIANCE_ROLE_NAME", default_value = DEFAULT_ROLE_NAME)]
    pub role_name: String,

    /// Role ARN template
    #[arg(long, env = "COMPLIANCE_ROLE_ARN_TEMPLATE", default_value = DEFAULT_ROLE_ARN_TEMPLATE)]
    pub role_arn_template: String,

    /// External id passed to AssumeRole
    #[arg(long, env = "COMPLIANCE_EXTERNAL_ID")]
    pub external_id: Option<String>,

    /// Assumed-role session duration in seconds
    #[arg(
        long,
        env = "COMPLIANCE_SESSION_DURATION",
        default_value_t = 3600,
        value_parser = clap::value_parser!(u64).range(900..=43_200)
    )]
    pub session_duration: u64,

    /// Maximum targets scanned concurrently
    #[arg(
        long,
        env = "COMPLIANCE_MAX_CONCURRENCY",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=20)
    )]
    pub max_concurrency: u64,

    /// Per-target timeout in seconds
    #[arg(
        long,
        env = "COMPLIANCE_TARGET_TIMEOUT",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(30..=600)
    )]
    pub target_timeout: u64,

    /// Result cache TTL in seconds (0 disables caching)
    #[arg(
        long,
        env = "COMPLIANCE_CACHE_TTL",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(0..=86_400)
    )]
    pub cache_ttl: u64,

    /// Region discovery TTL in seconds
    #[arg(
        long,
        env = "COMPLIANCE_DISCOVERY_TTL",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(0..=86_400)
    )]
    pub discovery_ttl: u64,

    /// Redis URL for a shared result cache
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Alternate AWS endpoint base URL
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    /// Required tags policy
    #[arg(
        long,
        env = "COMPLIANCE_REQUIRED_TAGS",
        default_value = "Owner,CostCenter,Environment"
    )]
    pub required_tags: String,
}

impl EngineArgs {
    pub fn into_config(self) -> Result<EngineConfig> {
        let config = EngineConfig {
            local_region: self.region,
            local_account_id: self.local_account_id.filter(|a| !a.is_empty()),
            scan: ScanSettings {
                max_concurrency: self.max_concurrency as usize,
                per_target_timeout: Duration::from_secs(self.target_timeout),
                cache_ttl: Duration::from_secs(self.cache_ttl),
                discovery_ttl: Duration::from_secs(self.discovery_ttl),
            },
            federation: FederationSettings {
                role_name: self.role_name,
                role_arn_template: self.role_arn_template,
                external_id: self.external_id.filter(|e| !e.is_empty()),
                session_duration: Duration::from_secs(self.session_duration),
            },
            targets: TargetSettings {
                accounts: clean_list(self.accounts),
                regions: clean_list(self.regions),
                discover_regions: self.discover_regions,
            },
            redis_url: self.redis_url.filter(|u| !u.is_empty()),
            endpoint_override: self.endpoint_url.filter(|u| !u.is_empty()),
            required_tags: self.required_tags,
        };
        config.validate()?;
        Ok(config)
    }
}

fn clean_list(values: Vec<String>) -> Vec<String> {
    let mut cleaned: Vec<String> = values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    cleaned.dedup();
    cleaned
}
