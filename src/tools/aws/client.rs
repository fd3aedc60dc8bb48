//! Signed AWS API client
//!
//! One client is bound to one `(account, region)` and one credential source.
//! Credentials are pulled from the source on every request, so a long-lived
//! client always signs with whatever the source currently considers fresh.

use chrono::Utc;
use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::credentials::CredentialsSource;
use super::sigv4::{self, RequestParts, SigningError, SigningParams};
use crate::agents::compliance_scan::CredentialError;

/// Error codes AWS uses for rate limiting
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "TooManyRequestsException",
    "SlowDown",
];

/// Errors from AWS API calls
#[derive(Debug, Error)]
pub enum AwsError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("request signing failed: {0}")]
    Signing(#[from] SigningError),

    #[error("HTTP error calling {service}: {source}")]
    Http {
        service: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned {status} {code}: {message}")]
    Service {
        service: String,
        status: u16,
        code: String,
        message: String,
    },

    #[error("failed to parse {service} response: {message}")]
    Parse { service: String, message: String },
}

impl AwsError {
    pub fn is_throttling(&self) -> bool {
        match self {
            AwsError::Service { status, code, .. } => {
                *status == 429 || THROTTLING_CODES.contains(&code.as_str())
            }
            _ => false,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            AwsError::Service { status, .. } => self.is_throttling() || *status >= 500,
            AwsError::Http { source, .. } => source.is_timeout() || source.is_connect(),
            _ => false,
        }
    }

    pub fn parse(service: &str, message: impl fmt::Display) -> Self {
        AwsError::Parse {
            service: service.to_string(),
            message: message.to_string(),
        }
    }
}

/// Exponential backoff for throttled / transient failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Signed client for one account/region
#[derive(Clone)]
pub struct AwsClient {
    http: Client,
    region: String,
    account_id: String,
    credentials: Arc<dyn CredentialsSource>,
    retry: RetryPolicy,
    /// Base URL replacing `https://{service}.{region}.amazonaws.com`
    endpoint_override: Option<String>,
}

impl fmt::Debug for AwsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsClient")
            .field("region", &self.region)
            .field("account_id", &self.account_id)
            .field("retry", &self.retry)
            .field("endpoint_override", &self.endpoint_override)
            .finish()
    }
}

impl AwsClient {
    pub fn new(
        http: Client,
        account_id: &str,
        region: &str,
        credentials: Arc<dyn CredentialsSource>,
    ) -> Self {
        Self {
            http,
            region: region.to_string(),
            account_id: account_id.to_string(),
            credentials,
            retry: RetryPolicy::default(),
            endpoint_override: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint_override = endpoint.map(|e| e.trim_end_matches('/').to_string());
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn role_reference(&self) -> Option<String> {
        self.credentials.role_reference()
    }

    fn endpoint(&self, service: &str) -> String {
        match &self.endpoint_override {
            Some(base) => format!("{}/", base),
            None => format!("https://{}.{}.amazonaws.com/", service, self.region),
        }
    }

    /// AWS Query protocol: form-encoded POST, XML response body
    pub async fn post_query(
        &self,
        service: &str,
        action: &str,
        version: &str,
        params: &[(&str, String)],
    ) -> Result<String, AwsError> {
        let mut body = format!("Action={}&Version={}", action, version);
        for (key, value) in params {
            body.push('&');
            body.push_str(&urlencoding::encode(key));
            body.push('=');
            body.push_str(&urlencoding::encode(value));
        }

        self.send(
            service,
            "application/x-www-form-urlencoded; charset=utf-8",
            None,
            body.into_bytes(),
        )
        .await
    }

    /// AWS JSON 1.1 protocol with an `X-Amz-Target` header
    pub async fn post_json(
        &self,
        service: &str,
        target: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, AwsError> {
        let payload = serde_json::to_vec(body).map_err(|e| AwsError::parse(service, e))?;
        let text = self
            .send(service, "application/x-amz-json-1.1", Some(target), payload)
            .await?;
        serde_json::from_str(&text).map_err(|e| AwsError::parse(service, e))
    }

    async fn send(
        &self,
        service: &str,
        content_type: &str,
        amz_target: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<String, AwsError> {
        let url = self.endpoint(service);
        let host = reqwest::Url::parse(&url)
            .ok()
            .and_then(|u| {
                u.host_str().map(|h| match u.port() {
                    Some(port) => format!("{}:{}", h, port),
                    None => h.to_string(),
                })
            })
            .ok_or_else(|| AwsError::parse(service, format!("invalid endpoint {}", url)))?;

        let mut attempt = 0;
        loop {
            let result = self
                .send_once(service, &url, &host, content_type, amz_target, &payload)
                .await;

            match result {
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        service = %service,
                        region = %self.region,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying AWS call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send_once(
        &self,
        service: &str,
        url: &str,
        host: &str,
        content_type: &str,
        amz_target: Option<&str>,
        payload: &[u8],
    ) -> Result<String, AwsError> {
        let credential = self.credentials.credentials().await?;

        let mut headers = vec![
            ("host".to_string(), host.to_string()),
            ("content-type".to_string(), content_type.to_string()),
        ];
        if let Some(target) = amz_target {
            headers.push(("x-amz-target".to_string(), target.to_string()));
        }

        let signed = sigv4::sign(
            &RequestParts {
                method: "POST",
                path: "/",
                query: &[],
                headers: &headers,
                payload,
            },
            &SigningParams {
                access_key: &credential.access_key,
                secret_key: &credential.secret_key,
                session_token: credential.session_token.as_deref(),
                region: &self.region,
                service,
                time: Utc::now(),
            },
        )?;

        let mut request = self.http.post(url).body(payload.to_vec());
        for (name, value) in headers.iter().filter(|(name, _)| name != "host") {
            request = request.header(name.as_str(), value.as_str());
        }
        for (name, value) in signed.into_pairs() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|source| AwsError::Http {
            service: service.to_string(),
            source,
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|source| AwsError::Http {
            service: service.to_string(),
            source,
        })?;

        if status.is_success() {
            debug!(service = %service, region = %self.region, "AWS call succeeded");
            return Ok(body);
        }

        let (code, message) = extract_error(&body);
        Err(AwsError::Service {
            service: service.to_string(),
            status: status.as_u16(),
            code,
            message,
        })
    }
}

/// Extract the text between `<tag>` and `</tag>`
pub fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let start_tag = format!("<{}>", tag);
    let end_tag = format!("</{}>", tag);

    let start = xml.find(&start_tag)? + start_tag.len();
    let end = xml[start..].find(&end_tag)? + start;

    Some(xml[start..end].to_string())
}

/// `(code, message)` from an XML or JSON error body
pub fn extract_error(body: &str) -> (String, String) {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            let code = value["__type"]
                .as_str()
                .or_else(|| value["code"].as_str())
                .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
                .unwrap_or_else(|| "Unknown".to_string());
            let message = value["message"]
                .as_str()
                .or_else(|| value["Message"].as_str())
                .unwrap_or_default()
                .to_string();
            return (code, message);
        }
    }

    let code = extract_xml_value(body, "Code").unwrap_or_else(|| "Unknown".to_string());
    let message = extract_xml_value(body, "Message").unwrap_or_default();
    (code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::compliance_scan::Credential;
    use crate::tools::aws::StaticCredentials;
    use axum::{extract::State, http::StatusCode, routing::post, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn static_source() -> Arc<dyn CredentialsSource> {
        Arc::new(StaticCredentials::new(Credential {
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "secret".to_string(),
            session_token: None,
            account_id: None,
            role_reference: None,
            expiration: None,
        }))
    }

    #[test]
    fn test_extract_xml_value() {
        let xml = r#"<Response><AccessKeyId>AKIA123</AccessKeyId><SecretAccessKey>secret</SecretAccessKey></Response>"#;

        assert_eq!(
            extract_xml_value(xml, "AccessKeyId"),
            Some("AKIA123".to_string())
        );
        assert_eq!(extract_xml_value(xml, "NotFound"), None);
    }

    #[test]
    fn test_extract_error_xml() {
        let body = r#"<ErrorResponse><Error><Type>Sender</Type><Code>Throttling</Code><Message>Rate exceeded</Message></Error></ErrorResponse>"#;
        assert_eq!(
            extract_error(body),
            ("Throttling".to_string(), "Rate exceeded".to_string())
        );
    }

    #[test]
    fn test_extract_error_json() {
        let body = r#"{"__type":"com.amazonaws.tagging#ThrottledException","message":"slow down"}"#;
        assert_eq!(
            extract_error(body),
            ("ThrottledException".to_string(), "slow down".to_string())
        );
    }

    #[test]
    fn test_throttling_classification() {
        let throttled = AwsError::Service {
            service: "sts".to_string(),
            status: 400,
            code: "Throttling".to_string(),
            message: String::new(),
        };
        assert!(throttled.is_throttling());
        assert!(throttled.is_retryable());

        let denied = AwsError::Service {
            service: "sts".to_string(),
            status: 403,
            code: "AccessDenied".to_string(),
            message: String::new(),
        };
        assert!(!denied.is_throttling());
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    async fn throttle_then_ok(State(hits): State<Arc<AtomicUsize>>) -> (StatusCode, String) {
        let n = hits.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            (
                StatusCode::BAD_REQUEST,
                "<ErrorResponse><Error><Code>Throttling</Code><Message>Rate exceeded</Message></Error></ErrorResponse>".to_string(),
            )
        } else {
            (StatusCode::OK, "<Ok>done</Ok>".to_string())
        }
    }

    #[tokio::test]
    async fn test_retries_throttled_calls_until_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/", post(throttle_then_ok))
            .with_state(hits.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = AwsClient::new(Client::new(), "123456789012", "us-east-1", static_source())
            .with_endpoint(Some(format!("http://{}", addr)))
            .with_retry(RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            });

        let body = client
            .post_query("sts", "GetCallerIdentity", "2011-06-15", &[])
            .await
            .unwrap();
        assert_eq!(body, "<Ok>done</Ok>");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        async fn deny(State(hits): State<Arc<AtomicUsize>>) -> (StatusCode, String) {
            hits.fetch_add(1, Ordering::SeqCst);
            (
                StatusCode::FORBIDDEN,
                "<ErrorResponse><Error><Code>AccessDenied</Code><Message>nope</Message></Error></ErrorResponse>".to_string(),
            )
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route("/", post(deny)).with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = AwsClient::new(Client::new(), "123456789012", "us-east-1", static_source())
            .with_endpoint(Some(format!("http://{}", addr)));

        let err = client
            .post_query("sts", "GetCallerIdentity", "2011-06-15", &[])
            .await
            .unwrap_err();
        match err {
            AwsError::Service { status, code, .. } => {
                assert_eq!(status, 403);
                assert_eq!(code, "AccessDenied");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
