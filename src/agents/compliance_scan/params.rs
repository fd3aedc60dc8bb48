//! Inbound scan parameters
//!
//! Callers send loosely shaped JSON (`region` or `regions`, a scalar or a
//! list). Everything is normalized here, once, so the rest of the engine
//! only ever sees a [`ScanRequest`].

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::service::{ScanRequest, TargetSelection};
use super::types::{ComplianceQuery, ScanError, ScanTarget, SeverityFilter};

/// Region value that selects discovery instead of an explicit list
pub const ALL_REGIONS: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Regions,
    Accounts,
    Targets,
    ResourceTypes,
    Filters,
    Severity,
    ForceRefresh,
}

fn field_for(key: &str) -> Option<Field> {
    match key {
        "region" | "regions" => Some(Field::Regions),
        "account" | "accounts" | "account_ids" => Some(Field::Accounts),
        "target" | "targets" => Some(Field::Targets),
        "resource_type" | "resource_types" => Some(Field::ResourceTypes),
        "tag_filters" | "filters" => Some(Field::Filters),
        "severity" => Some(Field::Severity),
        "force_refresh" | "refresh" => Some(Field::ForceRefresh),
        _ => None,
    }
}

/// Normalized, validated parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanParams {
    /// `None` when no region key was sent
    pub regions: Option<Vec<String>>,
    pub accounts: Option<Vec<String>>,
    pub targets: Option<Vec<ScanTarget>>,
    pub resource_types: Vec<String>,
    pub filters: BTreeMap<String, String>,
    pub severity: SeverityFilter,
    pub force_refresh: bool,
}

impl ScanParams {
    pub fn from_value(value: &Value) -> Result<Self, ScanError> {
        let object = match value {
            Value::Object(object) => object,
            Value::Null => return Ok(Self::default()),
            other => return Err(invalid(format!("parameters must be an object, got {}", other))),
        };

        let mut params = Self::default();
        for (key, value) in object {
            let field = field_for(key).ok_or_else(|| invalid(format!("unknown parameter '{}'", key)))?;
            if value.is_null() {
                continue;
            }

            match field {
                Field::Regions => {
                    let regions = string_list(key, value)?;
                    for region in &regions {
                        validate_region(region)?;
                    }
                    params.regions.get_or_insert_with(Vec::new).extend(regions);
                }
                Field::Accounts => {
                    let accounts = string_list(key, value)?;
                    for account in &accounts {
                        validate_account(account)?;
                    }
                    params.accounts.get_or_insert_with(Vec::new).extend(accounts);
                }
                Field::Targets => {
                    let targets = string_list(key, value)?
                        .iter()
                        .map(|t| parse_target(t))
                        .collect::<Result<Vec<_>, _>>()?;
                    params.targets.get_or_insert_with(Vec::new).extend(targets);
                }
                Field::ResourceTypes => params.resource_types.extend(string_list(key, value)?),
                Field::Filters => params.filters.extend(filters(key, value)?),
                Field::Severity => {
                    let raw = value
                        .as_str()
                        .ok_or_else(|| invalid(format!("'{}' must be a string", key)))?;
                    params.severity = raw.parse().map_err(invalid)?;
                }
                Field::ForceRefresh => params.force_refresh = boolean(key, value)?,
            }
        }

        params.resource_types.sort();
        params.resource_types.dedup();
        Ok(params)
    }

    pub fn into_request(self) -> ScanRequest {
        let query = ComplianceQuery {
            resource_types: self.resource_types,
            filters: self.filters,
            severity: self.severity,
        };

        let discover = self
            .regions
            .as_ref()
            .is_some_and(|regions| regions.iter().any(|r| r == ALL_REGIONS));

        let targets = if discover {
            Some(TargetSelection::Discover {
                accounts: self.accounts.unwrap_or_default(),
            })
        } else if self.regions.is_none() && self.accounts.is_none() && self.targets.is_none() {
            None
        } else {
            let regions = self.regions.unwrap_or_default();
            let accounts = self.accounts.unwrap_or_default();

            let mut list: Vec<ScanTarget> = match (accounts.is_empty(), regions.is_empty()) {
                (true, _) => regions.iter().map(|r| ScanTarget::region(r)).collect(),
                (false, true) => accounts.iter().map(|a| ScanTarget::account(a)).collect(),
                (false, false) => accounts
                    .iter()
                    .flat_map(|a| regions.iter().map(move |r| ScanTarget::account_region(a, r)))
                    .collect(),
            };
            list.extend(self.targets.unwrap_or_default());

            let mut seen = std::collections::HashSet::new();
            list.retain(|t| seen.insert(t.id.clone()));
            Some(TargetSelection::Explicit(list))
        };

        ScanRequest {
            query,
            force_refresh: self.force_refresh,
            targets,
        }
    }
}

impl ScanRequest {
    /// Parse and normalize raw JSON parameters
    pub fn from_params(value: &Value) -> Result<Self, ScanError> {
        Ok(ScanParams::from_value(value)?.into_request())
    }
}

fn invalid(message: impl Into<String>) -> ScanError {
    ScanError::InvalidRequest(message.into())
}

/// A string (comma separated allowed) or an array of strings
fn string_list(key: &str, value: &Value) -> Result<Vec<String>, ScanError> {
    let items: Vec<String> = match value {
        Value::String(s) => s.split(',').map(|p| p.trim().to_string()).collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| invalid(format!("'{}' must contain only strings", key)))
            })
            .collect::<Result<_, _>>()?,
        _ => return Err(invalid(format!("'{}' must be a string or a list of strings", key))),
    };
    Ok(items.into_iter().filter(|s| !s.is_empty()).collect())
}

/// `{"Env": "prod"}` or `[{"key": "Env", "value": "prod"}]`
fn filters(key: &str, value: &Value) -> Result<BTreeMap<String, String>, ScanError> {
    let pair = |k: &str, v: &Value| -> Result<(String, String), ScanError> {
        let v = v
            .as_str()
            .ok_or_else(|| invalid(format!("'{}' value for '{}' must be a string", key, k)))?;
        Ok((k.to_string(), v.to_string()))
    };

    match value {
        Value::Object(map) => map.iter().map(|(k, v)| pair(k, v)).collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                let entry: &Map<String, Value> = item
                    .as_object()
                    .ok_or_else(|| invalid(format!("'{}' entries must be objects", key)))?;
                let name = entry
                    .get("key")
                    .or_else(|| entry.get("Key"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid(format!("'{}' entry is missing 'key'", key)))?;
                let value = entry
                    .get("value")
                    .or_else(|| entry.get("Value"))
                    .unwrap_or(&Value::Null);
                pair(name, value)
            })
            .collect(),
        _ => Err(invalid(format!("'{}' must be an object or a list", key))),
    }
}

fn boolean(key: &str, value: &Value) -> Result<bool, ScanError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(invalid(format!("'{}' must be a boolean", key))),
        },
        _ => Err(invalid(format!("'{}' must be a boolean", key))),
    }
}

pub fn validate_account(account: &str) -> Result<(), ScanError> {
    if account.len() == 12 && account.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(invalid(format!("'{}' is not a 12-digit AWS account id", account)))
    }
}

/// `us-east-1`, `eu-central-2`, `us-gov-west-1`, or `all`
pub fn validate_region(region: &str) -> Result<(), ScanError> {
    if region == ALL_REGIONS {
        return Ok(());
    }

    let parts: Vec<&str> = region.split('-').collect();
    let well_formed = parts.len() >= 3
        && parts[0].len() == 2
        && parts.iter().all(|p| {
            !p.is_empty() && p.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        })
        && parts[..parts.len() - 1]
            .iter()
            .all(|p| p.bytes().all(|b| b.is_ascii_lowercase()))
        && parts[parts.len() - 1].bytes().all(|b| b.is_ascii_digit());

    if well_formed {
        Ok(())
    } else {
        Err(invalid(format!("'{}' is not a valid AWS region", region)))
    }
}

/// `<account>/<region>`, a bare account id, or a bare region
fn parse_target(raw: &str) -> Result<ScanTarget, ScanError> {
    match raw.split_once('/') {
        Some((account, region)) => {
            validate_account(account)?;
            validate_region(region)?;
            if region == ALL_REGIONS {
                return Err(invalid("'all' is not allowed inside an explicit target"));
            }
            Ok(ScanTarget::account_region(account, region))
        }
        None if validate_account(raw).is_ok() => Ok(ScanTarget::account(raw)),
        None if raw != ALL_REGIONS && validate_region(raw).is_ok() => Ok(ScanTarget::region(raw)),
        None => Err(invalid(format!("'{}' is not a valid scan target", raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::compliance_scan::TargetKind;
    use serde_json::json;

    fn explicit(request: &ScanRequest) -> Vec<String> {
        match &request.targets {
            Some(TargetSelection::Explicit(targets)) => {
                targets.iter().map(|t| t.id.clone()).collect()
            }
            other => panic!("expected explicit targets, got {:?}", other),
        }
    }

    #[test]
    fn test_no_target_keys_is_legacy_single_target() {
        let request = ScanRequest::from_params(&json!({
            "resource_types": ["ec2:instance"],
            "severity": "errors_only"
        }))
        .unwrap();

        assert!(request.targets.is_none());
        assert_eq!(request.query.resource_types, vec!["ec2:instance"]);
        assert_eq!(request.query.severity, SeverityFilter::ErrorsOnly);
        assert!(!request.force_refresh);
    }

    #[test]
    fn test_null_params_are_empty() {
        let request = ScanRequest::from_params(&Value::Null).unwrap();
        assert!(request.targets.is_none());
    }

    #[test]
    fn test_synonyms_normalize_to_same_request() {
        let a = ScanRequest::from_params(&json!({
            "region": "us-east-1",
            "resource_type": "s3:bucket",
            "filters": {"Env": "prod"},
            "refresh": true
        }))
        .unwrap();
        let b = ScanRequest::from_params(&json!({
            "regions": ["us-east-1"],
            "resource_types": ["s3:bucket"],
            "tag_filters": [{"key": "Env", "value": "prod"}],
            "force_refresh": "true"
        }))
        .unwrap();

        assert_eq!(a, b);
        assert!(a.force_refresh);
    }

    #[test]
    fn test_accounts_cross_regions() {
        let request = ScanRequest::from_params(&json!({
            "account_ids": ["111111111111", "222222222222"],
            "regions": "us-east-1,eu-west-1"
        }))
        .unwrap();

        assert_eq!(
            explicit(&request),
            vec![
                "111111111111/us-east-1",
                "111111111111/eu-west-1",
                "222222222222/us-east-1",
                "222222222222/eu-west-1"
            ]
        );
    }

    #[test]
    fn test_accounts_only() {
        let request = ScanRequest::from_params(&json!({"account": "111111111111"})).unwrap();
        match request.targets {
            Some(TargetSelection::Explicit(targets)) => {
                assert_eq!(targets[0].kind, TargetKind::Account);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_explicit_targets_are_deduplicated() {
        let request = ScanRequest::from_params(&json!({
            "regions": ["us-east-1"],
            "targets": ["us-east-1", "111111111111/eu-west-1", "111111111111/eu-west-1"]
        }))
        .unwrap();
        assert_eq!(explicit(&request), vec!["us-east-1", "111111111111/eu-west-1"]);
    }

    #[test]
    fn test_all_regions_selects_discovery() {
        let request = ScanRequest::from_params(&json!({
            "regions": "all",
            "accounts": ["111111111111"]
        }))
        .unwrap();
        assert_eq!(
            request.targets,
            Some(TargetSelection::Discover {
                accounts: vec!["111111111111".to_string()]
            })
        );
    }

    #[test]
    fn test_empty_region_list_is_explicit_and_empty() {
        let request = ScanRequest::from_params(&json!({"regions": []})).unwrap();
        assert!(explicit(&request).is_empty());
    }

    #[test]
    fn test_rejects_invalid_values() {
        for params in [
            json!({"accounts": ["12345"]}),
            json!({"regions": ["US-EAST-1"]}),
            json!({"regions": ["useast1"]}),
            json!({"severity": "critical"}),
            json!({"targets": ["not a target"]}),
            json!({"targets": ["111111111111/all"]}),
            json!({"force_refresh": "maybe"}),
            json!({"regions": [1, 2]}),
            json!({"scope": "everything"}),
            json!(["us-east-1"]),
        ] {
            let err = ScanRequest::from_params(&params).unwrap_err();
            assert!(matches!(err, ScanError::InvalidRequest(_)), "{:?}", params);
        }
    }

    #[test]
    fn test_region_shapes() {
        for ok in ["us-east-1", "eu-central-2", "us-gov-west-1", "ap-southeast-4", "all"] {
            assert!(validate_region(ok).is_ok(), "{}", ok);
        }
        for bad in ["us-east", "u-east-1", "us-east-1a", "", "us--1"] {
            assert!(validate_region(bad).is_err(), "{}", bad);
        }
    }
}
