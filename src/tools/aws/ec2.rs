//! EC2 region enablement

use serde::Deserialize;

use super::client::{AwsClient, AwsError};

const EC2_VERSION: &str = "2016-11-15";

#[derive(Debug, Deserialize)]
struct DescribeRegionsResponse {
    #[serde(rename = "regionInfo", default)]
    region_info: RegionInfo,
}

#[derive(Debug, Default, Deserialize)]
struct RegionInfo {
    #[serde(rename = "item", default)]
    items: Vec<RegionItem>,
}

#[derive(Debug, Deserialize)]
struct RegionItem {
    #[serde(rename = "regionName")]
    region_name: String,
    #[serde(rename = "optInStatus", default)]
    opt_in_status: Option<String>,
}

/// Enabled region names from a `DescribeRegionsResponse`
pub fn parse_enabled_regions(body: &str) -> Result<Vec<String>, AwsError> {
    let response: DescribeRegionsResponse =
        quick_xml::de::from_str(body).map_err(|e| AwsError::parse("ec2", e))?;

    let mut regions: Vec<String> = response
        .region_info
        .items
        .into_iter()
        .filter(|item| {
            !matches!(item.opt_in_status.as_deref(), Some("not-opted-in"))
        })
        .map(|item| item.region_name)
        .collect();
    regions.sort();
    regions.dedup();
    Ok(regions)
}

/// EC2 DescribeRegions (enabled regions only)
pub async fn describe_regions(client: &AwsClient) -> Result<Vec<String>, AwsError> {
    let body = client
        .post_query(
            "ec2",
            "DescribeRegions",
            EC2_VERSION,
            &[("AllRegions", "false".to_string())],
        )
        .await?;
    parse_enabled_regions(&body)
}
