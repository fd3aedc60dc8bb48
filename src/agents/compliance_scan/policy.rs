//! Required-Tags Policy
//!
//! The scan operation used in production: list tagged resources for one
//! target and check each against a set of required tags. Knows nothing
//! about accounts, federation, or aggregation.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::orchestrator::ScanOperation;
use super::pool::TargetClient;
use super::types::{ComplianceQuery, PartialComplianceResult, Severity, Violation};
use crate::tools::aws::tagging::{self, TaggedResource};

pub const MISSING_REQUIRED_TAG: &str = "missing_required_tag";
pub const INVALID_VALUE: &str = "invalid_value";

/// One tag every matching resource must carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredTag {
    pub name: String,
    /// Empty means any non-empty value
    pub allowed_values: Vec<String>,
    /// Resource type prefixes (`ec2`, `ec2:instance`); empty means all
    pub applies_to: Vec<String>,
    pub severity: Severity,
}

impl RequiredTag {
    fn applies(&self, resource_type: &str) -> bool {
        self.applies_to.is_empty()
            || self.applies_to.iter().any(|prefix| {
                resource_type == prefix
                    || resource_type
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with(':'))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPolicy {
    pub required_tags: Vec<RequiredTag>,
}

impl TagPolicy {
    /// Parse a compact policy string.
    ///
    /// Entries are comma separated: `Name`, `Name=a|b` restricts values,
    /// `Name@ec2:instance+s3` limits resource types, and a trailing `?`
    /// makes the tag a warning instead of an error.
    pub fn parse(policy: &str) -> Result<Self> {
        let mut required_tags = Vec::new();

        for raw in policy.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (entry, severity) = match raw.strip_suffix('?') {
                Some(rest) => (rest, Severity::Warning),
                None => (raw, Severity::Error),
            };
            let (entry, applies_to) = match entry.split_once('@') {
                Some((entry, types)) => (
                    entry,
                    types
                        .split('+')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect(),
                ),
                None => (entry, Vec::new()),
            };
            let (name, allowed_values) = match entry.split_once('=') {
                Some((name, values)) => (
                    name.trim(),
                    values
                        .split('|')
                        .map(|v| v.trim().to_string())
                        .filter(|v| !v.is_empty())
                        .collect(),
                ),
                None => (entry.trim(), Vec::new()),
            };

            if name.is_empty() {
                bail!("policy entry '{}' has no tag name", raw);
            }
            if required_tags.iter().any(|t: &RequiredTag| t.name == name) {
                bail!("tag '{}' is required twice", name);
            }

            required_tags.push(RequiredTag {
                name: name.to_string(),
                allowed_values,
                applies_to,
                severity,
            });
        }

        Ok(Self { required_tags })
    }

    /// Every violation for one resource, regardless of severity filter
    pub fn evaluate(&self, resource: &TaggedResource) -> Vec<Violation> {
        self.required_tags
            .iter()
            .filter(|rule| rule.applies(&resource.resource_type))
            .filter_map(|rule| {
                let violation_type = match resource.tags.get(&rule.name) {
                    None => MISSING_REQUIRED_TAG,
                    Some(value) if value.trim().is_empty() => MISSING_REQUIRED_TAG,
                    Some(value)
                        if !rule.allowed_values.is_empty()
                            && !rule.allowed_values.contains(value) =>
                    {
                        INVALID_VALUE
                    }
                    Some(_) => return None,
                };
                Some(Violation {
                    resource_id: resource.arn.clone(),
                    resource_type: resource.resource_type.clone(),
                    tag_name: rule.name.clone(),
                    violation_type: violation_type.to_string(),
                    severity: rule.severity,
                    target_id: None,
                })
            })
            .collect()
    }

    /// Score a batch of resources against the policy
    pub fn check(&self, resources: &[TaggedResource], query: &ComplianceQuery) -> PartialComplianceResult {
        let mut result = PartialComplianceResult::default();

        for resource in resources {
            let violations = self.evaluate(resource);
            result.resource_count += 1;
            if violations.is_empty() {
                result.compliant_count += 1;
            }
            result.violations.extend(
                violations
                    .into_iter()
                    .filter(|v| query.severity.includes(v.severity)),
            );
        }
        result
    }
}

/// [`ScanOperation`] backed by the Resource Groups Tagging API
pub struct RequiredTagsOperation {
    policy: Arc<TagPolicy>,
}

impl RequiredTagsOperation {
    pub fn new(policy: TagPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &TagPolicy {
        &self.policy
    }
}

#[async_trait]
impl ScanOperation for RequiredTagsOperation {
    async fn scan(
        &self,
        client: &TargetClient,
        query: &ComplianceQuery,
    ) -> Result<PartialComplianceResult> {
        let resources = tagging::get_resources(client.aws(), &query.resource_types, &query.filters)
            .await
            .with_context(|| {
                format!(
                    "GetResources failed in {}/{}",
                    client.account_id(),
                    client.region()
                )
            })?;

        let result = self.policy.check(&resources, query);
        debug!(
            account = %client.account_id(),
            region = %client.region(),
            resources = result.resource_count,
            compliant = result.compliant_count,
            "Required tags checked"
        );
        Ok(result)
    }
}
