//! Resource Groups Tagging API

use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use super::client::{AwsClient, AwsError};

const GET_RESOURCES_TARGET: &str = "ResourceGroupsTaggingAPI_20170126.GetResources";

/// Hard stop for runaway pagination
const MAX_PAGES: usize = 1000;

/// A resource and its tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedResource {
    pub arn: String,
    /// `service:type`, e.g. `ec2:instance`
    pub resource_type: String,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetResourcesPage {
    #[serde(default)]
    pagination_token: Option<String>,
    #[serde(default)]
    resource_tag_mapping_list: Vec<ResourceTagMapping>,
}

#[derive(Debug, Deserialize)]
struct ResourceTagMapping {
    #[serde(rename = "ResourceARN")]
    resource_arn: String,
    #[serde(rename = "Tags", default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    #[serde(default)]
    value: String,
}

/// `arn:partition:service:region:account:resource` -> `service:type`
pub fn resource_type_from_arn(arn: &str) -> String {
    let mut parts = arn.splitn(6, ':');
    let service = parts.nth(2).unwrap_or("unknown");
    let resource = parts.nth(2).unwrap_or("");

    match resource.find(|c: char| c == '/' || c == ':') {
        Some(idx) => format!("{}:{}", service, &resource[..idx]),
        None if service == "s3" => "s3:bucket".to_string(),
        None => service.to_string(),
    }
}

fn parse_page(value: serde_json::Value) -> Result<(Vec<TaggedResource>, Option<String>), AwsError> {
    let page: GetResourcesPage =
        serde_json::from_value(value).map_err(|e| AwsError::parse("tagging", e))?;

    let resources = page
        .resource_tag_mapping_list
        .into_iter()
        .map(|mapping| TaggedResource {
            resource_type: resource_type_from_arn(&mapping.resource_arn),
            arn: mapping.resource_arn,
            tags: mapping.tags.into_iter().map(|t| (t.key, t.value)).collect(),
        })
        .collect();

    let next = page.pagination_token.filter(|t| !t.is_empty());
    Ok((resources, next))
}

/// GetResources, following pagination to the end
pub async fn get_resources(
    client: &AwsClient,
    resource_types: &[String],
    tag_filters: &BTreeMap<String, String>,
) -> Result<Vec<TaggedResource>, AwsError> {
    let filters: Vec<serde_json::Value> = tag_filters
        .iter()
        .map(|(key, value)| json!({ "Key": key, "Values": [value] }))
        .collect();

    let mut resources = Vec::new();
    let mut token: Option<String> = None;

    for _ in 0..MAX_PAGES {
        let mut body = json!({
            "ResourcesPerPage": 100,
            "ResourceTypeFilters": resource_types,
            "TagFilters": filters,
        });
        if let Some(t) = &token {
            body["PaginationToken"] = json!(t);
        }

        let response = client
            .post_json("tagging", GET_RESOURCES_TARGET, &body)
            .await?;
        let (page, next) = parse_page(response)?;
        resources.extend(page);

        match next {
            Some(next) => token = Some(next),
            None => return Ok(resources),
        }
    }

    Err(AwsError::parse(
        "tagging",
        format!("pagination did not terminate after {} pages", MAX_PAGES),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_from_arn() {
        assert_eq!(
            resource_type_from_arn("arn:aws:ec2:us-east-1:123456789012:instance/i-0abc"),
            "ec2:instance"
        );
        assert_eq!(resource_type_from_arn("arn:aws:s3:::my-bucket"), "s3:bucket");
        assert_eq!(
            resource_type_from_arn("arn:aws:rds:us-east-1:123456789012:db:prod-db"),
            "rds:db"
        );
        assert_eq!(
            resource_type_from_arn("arn:aws:sns:us-east-1:123456789012:alerts"),
            "sns"
        );
    }

    #[test]
    fn test_parse_page() {
        let value = json!({
            "PaginationToken": "next-page",
            "ResourceTagMappingList": [
                {
                    "ResourceARN": "arn:aws:ec2:us-east-1:123456789012:instance/i-1",
                    "Tags": [{"Key": "Owner", "Value": "platform"}]
                },
                {
                    "ResourceARN": "arn:aws:s3:::logs"
                }
            ]
        });

        let (resources, next) = parse_page(value).unwrap();
        assert_eq!(next.as_deref(), Some("next-page"));
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].tags.get("Owner"), Some(&"platform".to_string()));
        assert!(resources[1].tags.is_empty());
    }

    #[test]
    fn test_empty_token_ends_pagination() {
        let value = json!({ "PaginationToken": "", "ResourceTagMappingList": [] });
        let (_, next) = parse_page(value).unwrap();
        assert!(next.is_none());
    }
}
