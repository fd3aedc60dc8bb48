//! AWS STS
//!
//! Role assumption for cross-account scans, web-identity exchange for the
//! engine's own base credentials, and caller identity lookup.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use super::client::{extract_error, AwsClient, AwsError};
use crate::agents::compliance_scan::Credential;

const STS_VERSION: &str = "2011-06-15";

#[derive(Debug, Deserialize)]
struct AssumeRoleResponse {
    #[serde(rename = "AssumeRoleResult")]
    result: AssumeRoleResult,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleResult {
    #[serde(rename = "Credentials")]
    credentials: StsCredentials,
}

#[derive(Debug, Deserialize)]
struct AssumeRoleWithWebIdentityResponse {
    #[serde(rename = "AssumeRoleWithWebIdentityResult")]
    result: AssumeRoleResult,
}

#[derive(Debug, Deserialize)]
struct StsCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "SessionToken")]
    session_token: String,
    #[serde(rename = "Expiration")]
    expiration: String,
}

#[derive(Debug, Deserialize)]
struct GetCallerIdentityResponse {
    #[serde(rename = "GetCallerIdentityResult")]
    result: CallerIdentity,
}

/// Who the engine is running as
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CallerIdentity {
    #[serde(rename = "Account")]
    pub account: String,
    #[serde(rename = "Arn")]
    pub arn: String,
    #[serde(rename = "UserId")]
    pub user_id: String,
}

/// Parameters of one AssumeRole call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleRequest {
    pub account_id: String,
    pub role_arn: String,
    pub session_name: String,
    pub duration: Duration,
    pub external_id: Option<String>,
}

fn into_credential(
    creds: StsCredentials,
    account_id: Option<String>,
    role_arn: &str,
) -> Result<Credential, AwsError> {
    let expiration = DateTime::parse_from_rfc3339(&creds.expiration)
        .map_err(|e| AwsError::parse("sts", format!("bad Expiration '{}': {}", creds.expiration, e)))?
        .with_timezone(&Utc);

    Ok(Credential {
        access_key: creds.access_key_id,
        secret_key: creds.secret_access_key,
        session_token: Some(creds.session_token),
        account_id,
        role_reference: Some(role_arn.to_string()),
        expiration: Some(expiration),
    })
}

/// Parse an `AssumeRoleResponse` document
pub fn parse_assume_role(
    body: &str,
    account_id: &str,
    role_arn: &str,
) -> Result<Credential, AwsError> {
    let response: AssumeRoleResponse =
        quick_xml::de::from_str(body).map_err(|e| AwsError::parse("sts", e))?;
    into_credential(
        response.result.credentials,
        Some(account_id.to_string()),
        role_arn,
    )
}

/// STS AssumeRole, signed with the caller's base credentials
pub async fn assume_role(
    client: &AwsClient,
    request: &AssumeRoleRequest,
) -> Result<Credential, AwsError> {
    let mut params = vec![
        ("RoleArn", request.role_arn.clone()),
        ("RoleSessionName", request.session_name.clone()),
        ("DurationSeconds", request.duration.as_secs().to_string()),
    ];
    if let Some(external_id) = &request.external_id {
        params.push(("ExternalId", external_id.clone()));
    }

    let body = client
        .post_query("sts", "AssumeRole", STS_VERSION, &params)
        .await?;

    let credential = parse_assume_role(&body, &request.account_id, &request.role_arn)?;
    info!(
        account = %request.account_id,
        role = %request.role_arn,
        "Assumed role via STS"
    );
    Ok(credential)
}

/// STS AssumeRoleWithWebIdentity (IRSA / workload identity).
///
/// This call is unsigned: the OIDC token is the proof of identity.
pub async fn assume_role_with_web_identity(
    http: &Client,
    region: &str,
    role_arn: &str,
    session_name: &str,
    web_identity_token: &str,
) -> Result<Credential, AwsError> {
    let sts_url = format!(
        "https://sts.{}.amazonaws.com/?Action=AssumeRoleWithWebIdentity&Version={}&RoleArn={}&RoleSessionName={}&WebIdentityToken={}",
        region,
        STS_VERSION,
        urlencoding::encode(role_arn),
        urlencoding::encode(session_name),
        urlencoding::encode(web_identity_token)
    );

    let response = http.get(&sts_url).send().await.map_err(|source| AwsError::Http {
        service: "sts".to_string(),
        source,
    })?;

    let status = response.status();
    let body = response.text().await.map_err(|source| AwsError::Http {
        service: "sts".to_string(),
        source,
    })?;

    if !status.is_success() {
        let (code, message) = extract_error(&body);
        return Err(AwsError::Service {
            service: "sts".to_string(),
            status: status.as_u16(),
            code,
            message,
        });
    }

    let parsed: AssumeRoleWithWebIdentityResponse =
        quick_xml::de::from_str(&body).map_err(|e| AwsError::parse("sts", e))?;

    info!(role = %role_arn, "Base credentials obtained via web identity");
    into_credential(parsed.result.credentials, None, role_arn)
}

pub fn parse_caller_identity(body: &str) -> Result<CallerIdentity, AwsError> {
    let response: GetCallerIdentityResponse =
        quick_xml::de::from_str(body).map_err(|e| AwsError::parse("sts", e))?;
    Ok(response.result)
}

/// STS GetCallerIdentity
pub async fn get_caller_identity(client: &AwsClient) -> Result<CallerIdentity, AwsError> {
    let body = client
        .post_query("sts", "GetCallerIdentity", STS_VERSION, &[])
        .await?;
    parse_caller_identity(&body)
}
