//! Compliance Scan Types
//!
//! Core types shared by the credential provider, client pool, orchestrator,
//! aggregator and result cache.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use thiserror::Error;

/// Credentials are treated as expired this long before their real expiry.
pub const CREDENTIAL_EXPIRY_BUFFER_SECS: i64 = 300;

/// Kind of scan target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A region of the caller's own account
    Region,
    /// Another account, scanned in the local region
    Account,
    /// An explicit account x region pair, id `"<account>/<region>"`
    AccountRegion,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Region => write!(f, "region"),
            TargetKind::Account => write!(f, "account"),
            TargetKind::AccountRegion => write!(f, "account_region"),
        }
    }
}

/// Identity of one unit of scan work.
///
/// Equality and hashing use `id` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTarget {
    pub kind: TargetKind,
    pub id: String,
}

impl ScanTarget {
    pub fn region(region: &str) -> Self {
        Self {
            kind: TargetKind::Region,
            id: region.to_string(),
        }
    }

    pub fn account(account_id: &str) -> Self {
        Self {
            kind: TargetKind::Account,
            id: account_id.to_string(),
        }
    }

    pub fn account_region(account_id: &str, region: &str) -> Self {
        Self {
            kind: TargetKind::AccountRegion,
            id: format!("{}/{}", account_id, region),
        }
    }

    /// Split an `AccountRegion` id into `(account, region)`
    pub fn account_region_parts(&self) -> Option<(&str, &str)> {
        match self.kind {
            TargetKind::AccountRegion => self.id.split_once('/'),
            _ => None,
        }
    }
}

impl PartialEq for ScanTarget {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ScanTarget {}

impl Hash for ScanTarget {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Temporary (or static) AWS credentials.
///
/// Owned by the credential caches; never serialized.
#[derive(Clone)]
pub struct Credential {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
    pub account_id: Option<String>,
    /// Role ARN these credentials were obtained for, if federated
    pub role_reference: Option<String>,
    /// `None` for long-lived keys
    pub expiration: Option<DateTime<Utc>>,
}

impl Credential {
    /// Usable iff `now < expiration - buffer`
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiration {
            Some(expiration) => {
                now < expiration - ChronoDuration::seconds(CREDENTIAL_EXPIRY_BUFFER_SECS)
            }
            None => true,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("account_id", &self.account_id)
            .field("role_reference", &self.role_reference)
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Violation severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// Which violations a scan reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityFilter {
    #[default]
    All,
    ErrorsOnly,
    WarningsOnly,
}

impl SeverityFilter {
    pub fn includes(&self, severity: Severity) -> bool {
        match self {
            SeverityFilter::All => true,
            SeverityFilter::ErrorsOnly => severity == Severity::Error,
            SeverityFilter::WarningsOnly => severity == Severity::Warning,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityFilter::All => "all",
            SeverityFilter::ErrorsOnly => "errors_only",
            SeverityFilter::WarningsOnly => "warnings_only",
        }
    }
}

impl std::str::FromStr for SeverityFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(SeverityFilter::All),
            "errors_only" | "error" | "errors" => Ok(SeverityFilter::ErrorsOnly),
            "warnings_only" | "warning" | "warnings" => Ok(SeverityFilter::WarningsOnly),
            other => Err(format!("unknown severity filter '{}'", other)),
        }
    }
}

/// A single tag policy violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub resource_id: String,
    pub resource_type: String,
    pub tag_name: String,
    /// e.g. `missing_required_tag`, `invalid_value`
    pub violation_type: String,
    pub severity: Severity,
    /// Attached by the orchestrator / aggregator, never by the policy engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

/// Query parameters forwarded to the scan operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceQuery {
    /// Resource type filters, e.g. `ec2:instance`, `s3:bucket`
    pub resource_types: Vec<String>,
    /// Tag filters `key -> value` narrowing which resources are listed
    pub filters: BTreeMap<String, String>,
    pub severity: SeverityFilter,
}

/// What a scan operation returns for one target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialComplianceResult {
    pub resource_count: u64,
    pub compliant_count: u64,
    pub violations: Vec<Violation>,
}

/// Classification of a per-target failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Credential,
    Timeout,
    ClientConstruction,
    Operation,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Credential => write!(f, "credential"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::ClientConstruction => write!(f, "client_construction"),
            FailureKind::Operation => write!(f, "operation"),
        }
    }
}

/// Outcome of scanning one target. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetScanResult {
    pub target_id: String,
    pub success: bool,
    pub resource_count: u64,
    pub compliant_count: u64,
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_used: Option<String>,
}

impl TargetScanResult {
    pub fn success(
        target_id: &str,
        partial: PartialComplianceResult,
        duration: Duration,
        role_used: Option<String>,
    ) -> Self {
        let violations = partial
            .violations
            .into_iter()
            .map(|mut v| {
                v.target_id.get_or_insert_with(|| target_id.to_string());
                v
            })
            .collect();

        Self {
            target_id: target_id.to_string(),
            success: true,
            resource_count: partial.resource_count,
            compliant_count: partial.compliant_count,
            violations,
            error: None,
            error_kind: None,
            duration_ms: duration.as_millis() as u64,
            role_used,
        }
    }

    pub fn failure(target_id: &str, error: &ScanError, duration: Duration) -> Self {
        Self {
            target_id: target_id.to_string(),
            success: false,
            resource_count: 0,
            compliant_count: 0,
            violations: Vec::new(),
            error: Some(error.to_string()),
            error_kind: error.failure_kind(),
            duration_ms: duration.as_millis() as u64,
            role_used: error.role_reference().map(|r| r.to_string()),
        }
    }
}

/// Per-target summary in the aggregated breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub resource_count: u64,
    pub compliant_count: u64,
    pub violation_count: usize,
    pub compliance_score: f64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_used: Option<String>,
}

/// Which targets succeeded, failed, or were skipped
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetMetadata {
    pub total: usize,
    pub successful: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    /// Target enumeration fell back to a default set
    pub discovery_degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_error: Option<String>,
    /// Failure / skip reason per target id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}

/// Unified result over all scanned targets. Recomputed on every aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub compliance_score: f64,
    pub total_resources: u64,
    pub compliant_resources: u64,
    pub violations: Vec<Violation>,
    pub target_metadata: TargetMetadata,
    pub per_target_breakdown: BTreeMap<String, TargetSummary>,
    pub scanned_at: DateTime<Utc>,
}

/// Legacy single-target response shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleTargetResult {
    pub compliance_score: f64,
    pub total_resources: u64,
    pub compliant_resources: u64,
    pub violations: Vec<Violation>,
    pub scanned_at: DateTime<Utc>,
}

/// Response of `scan_compliance`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScanResponse {
    SingleTarget(SingleTargetResult),
    Aggregated(AggregatedResult),
}

/// `compliant / total`, 1.0 for an empty scan
pub fn compliance_score(compliant: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (compliant as f64 / total as f64).clamp(0.0, 1.0)
}

/// Federation failed for one account
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to obtain credentials for account {account} (role {role_reference}): {message}")]
pub struct CredentialError {
    pub account: String,
    pub role_reference: String,
    pub message: String,
}

/// Errors produced by the scan subsystem
#[derive(Debug, Clone, Error)]
pub enum ScanError {
    /// Federation failed for a target's account
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    /// A target exceeded its time budget
    #[error("timeout: target {target} exceeded its {budget_secs}s budget")]
    Timeout { target: String, budget_secs: u64 },

    /// The client pool could not build a client
    #[error("client construction failed for {target}: {message}")]
    ClientConstruction { target: String, message: String },

    /// The scan operation itself failed
    #[error("operation failed for {target}: {message}")]
    Operation { target: String, message: String },

    /// Target enumeration failed
    #[error("target discovery failed: {0}")]
    Discovery(String),

    /// A partial result was malformed and skipped
    #[error("malformed result for {target}: {message}")]
    Aggregation { target: String, message: String },

    /// Caller error at the service boundary
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ScanError {
    /// Per-target classification, `None` for request-level errors
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ScanError::Credential(_) => Some(FailureKind::Credential),
            ScanError::Timeout { .. } => Some(FailureKind::Timeout),
            ScanError::ClientConstruction { .. } => Some(FailureKind::ClientConstruction),
            ScanError::Operation { .. } => Some(FailureKind::Operation),
            _ => None,
        }
    }

    pub fn role_reference(&self) -> Option<&str> {
        match self {
            ScanError::Credential(e) => Some(&e.role_reference),
            _ => None,
        }
    }
}
