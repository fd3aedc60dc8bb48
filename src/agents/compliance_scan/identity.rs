//! Federated Identity
//!
//! Short-lived credentials for every target account, obtained by assuming a
//! role through STS with the engine's base credentials. Entries are cached
//! per (account, role) and refreshed single-flight: concurrent callers for
//! the same key share one federation call, other keys never wait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::env;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{Credential, CredentialError};
use crate::config::FederationSettings;
use crate::tools::aws::sts::{self, AssumeRoleRequest};
use crate::tools::aws::{AwsClient, CredentialsSource, StaticCredentials};

/// AWS caps RoleSessionName at 64 characters
const MAX_SESSION_NAME_LEN: usize = 64;

/// Account id used for the engine's own credentials in error reports
const LOCAL_ACCOUNT: &str = "local";

/// Exchanges base credentials for a role in another account
#[async_trait]
pub trait Federation: Send + Sync {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<Credential>;
}

/// STS-backed federation, signed with the engine's base credentials
pub struct StsFederation {
    client: AwsClient,
}

impl StsFederation {
    pub fn new(client: AwsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Federation for StsFederation {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<Credential> {
        sts::assume_role(&self.client, request)
            .await
            .with_context(|| format!("AssumeRole {} failed", request.role_arn))
    }
}

/// `tag-compliance-<uuid>`, within the STS length limit
pub fn session_name() -> String {
    let mut name = format!("tag-compliance-{}", Uuid::new_v4().simple());
    name.truncate(MAX_SESSION_NAME_LEN);
    name
}

/// One cached credential plus the lock that serializes its refresh
#[derive(Default)]
struct CredentialSlot {
    current: RwLock<Option<Arc<Credential>>>,
    refresh: Mutex<()>,
}

impl CredentialSlot {
    async fn fresh(&self) -> Option<Arc<Credential>> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|c| c.is_fresh())
            .cloned()
    }

    /// Fast path under the read lock; otherwise one caller refreshes while
    /// the rest wait on `refresh` and re-check.
    async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<Arc<Credential>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Credential, E>>,
    {
        if let Some(credential) = self.fresh().await {
            return Ok(credential);
        }

        let _guard = self.refresh.lock().await;
        if let Some(credential) = self.fresh().await {
            return Ok(credential);
        }

        let credential = Arc::new(refresh().await?);
        *self.current.write().await = Some(credential.clone());
        Ok(credential)
    }
}

/// Credential Provider
///
/// Hands out credentials for a target account, federating only when the
/// cached entry is missing or inside the expiry buffer.
pub struct CredentialProvider {
    federation: Arc<dyn Federation>,
    settings: FederationSettings,
    slots: DashMap<(String, String), Arc<CredentialSlot>>,
    federation_calls: AtomicUsize,
}

impl CredentialProvider {
    pub fn new(federation: Arc<dyn Federation>, settings: FederationSettings) -> Self {
        Self {
            federation,
            settings,
            slots: DashMap::new(),
            federation_calls: AtomicUsize::new(0),
        }
    }

    pub fn role_reference(&self, account_id: &str) -> String {
        self.settings.role_arn(account_id)
    }

    /// Credentials for `account_id`, from cache when still fresh
    pub async fn get_credentials(
        &self,
        account_id: &str,
    ) -> Result<Arc<Credential>, CredentialError> {
        let role_reference = self.role_reference(account_id);
        let slot = self
            .slots
            .entry((account_id.to_string(), role_reference.clone()))
            .or_default()
            .clone();

        slot.get_or_refresh(|| self.federate(account_id, &role_reference))
            .await
    }

    async fn federate(
        &self,
        account_id: &str,
        role_reference: &str,
    ) -> Result<Credential, CredentialError> {
        self.federation_calls.fetch_add(1, Ordering::SeqCst);

        let request = AssumeRoleRequest {
            account_id: account_id.to_string(),
            role_arn: role_reference.to_string(),
            session_name: session_name(),
            duration: self.settings.session_duration,
            external_id: self.settings.external_id.clone(),
        };

        match self.federation.assume_role(&request).await {
            Ok(credential) => {
                info!(
                    account = %account_id,
                    role = %role_reference,
                    expires = ?credential.expiration,
                    "Federated credentials cached"
                );
                Ok(credential)
            }
            Err(e) => {
                warn!(account = %account_id, role = %role_reference, error = %e, "Federation failed");
                Err(CredentialError {
                    account: account_id.to_string(),
                    role_reference: role_reference.to_string(),
                    message: format!("{:#}", e),
                })
            }
        }
    }

    /// Evict one account's entries, or everything
    pub fn clear(&self, account_id: Option<&str>) {
        match account_id {
            Some(account) => {
                self.slots.retain(|(cached, _), _| cached != account);
                debug!(account = %account, "Credential cache cleared for account");
            }
            None => {
                self.slots.clear();
                debug!("Credential cache cleared");
            }
        }
    }

    /// Number of federation calls made so far
    pub fn federation_calls(&self) -> usize {
        self.federation_calls.load(Ordering::SeqCst)
    }

    pub fn cached_accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.slots.iter().map(|e| e.key().0.clone()).collect();
        accounts.sort();
        accounts.dedup();
        accounts
    }
}

/// Signs requests for one federated account through the provider cache.
///
/// Pooled clients hold this rather than a credential, so a refreshed
/// credential is picked up on the next request.
pub struct FederatedCredentials {
    provider: Arc<CredentialProvider>,
    account_id: String,
}

impl FederatedCredentials {
    pub fn new(provider: Arc<CredentialProvider>, account_id: &str) -> Self {
        Self {
            provider,
            account_id: account_id.to_string(),
        }
    }
}

#[async_trait]
impl CredentialsSource for FederatedCredentials {
    async fn credentials(&self) -> Result<Arc<Credential>, CredentialError> {
        self.provider.get_credentials(&self.account_id).await
    }

    fn role_reference(&self) -> Option<String> {
        Some(self.provider.role_reference(&self.account_id))
    }
}

/// Base credentials via AssumeRoleWithWebIdentity (IRSA).
///
/// The token file is re-read on every refresh since the kubelet rotates it.
pub struct WebIdentityCredentials {
    http: reqwest::Client,
    region: String,
    role_arn: String,
    token_path: String,
    slot: CredentialSlot,
}

impl WebIdentityCredentials {
    pub fn new(http: reqwest::Client, region: &str, role_arn: &str, token_path: &str) -> Self {
        Self {
            http,
            region: region.to_string(),
            role_arn: role_arn.to_string(),
            token_path: token_path.to_string(),
            slot: CredentialSlot::default(),
        }
    }

    /// `AWS_ROLE_ARN` + `AWS_WEB_IDENTITY_TOKEN_FILE`, if both are set
    pub fn from_env(http: reqwest::Client, region: &str) -> Option<Self> {
        let role_arn = env::var("AWS_ROLE_ARN").ok().filter(|v| !v.is_empty())?;
        let token_path = env::var("AWS_WEB_IDENTITY_TOKEN_FILE")
            .ok()
            .filter(|v| !v.is_empty())?;
        Some(Self::new(http, region, &role_arn, &token_path))
    }

    fn error(&self, message: String) -> CredentialError {
        CredentialError {
            account: LOCAL_ACCOUNT.to_string(),
            role_reference: self.role_arn.clone(),
            message,
        }
    }

    async fn exchange(&self) -> Result<Credential, CredentialError> {
        let token = tokio::fs::read_to_string(&self.token_path)
            .await
            .map_err(|e| self.error(format!("failed to read token {}: {}", self.token_path, e)))?;

        sts::assume_role_with_web_identity(
            &self.http,
            &self.region,
            &self.role_arn,
            &session_name(),
            token.trim(),
        )
        .await
        .map_err(|e| self.error(e.to_string()))
    }
}

#[async_trait]
impl CredentialsSource for WebIdentityCredentials {
    async fn credentials(&self) -> Result<Arc<Credential>, CredentialError> {
        self.slot.get_or_refresh(|| self.exchange()).await
    }

    fn role_reference(&self) -> Option<String> {
        Some(self.role_arn.clone())
    }
}

/// The engine's own credentials: static environment keys, then web identity
pub fn base_credentials_from_env(
    http: &reqwest::Client,
    region: &str,
) -> Result<Arc<dyn CredentialsSource>> {
    if let Ok(static_creds) = StaticCredentials::from_env() {
        info!("Using static AWS credentials from environment");
        return Ok(Arc::new(static_creds));
    }

    if let Some(web_identity) = WebIdentityCredentials::from_env(http.clone(), region) {
        info!(role = %web_identity.role_arn, "Using web identity base credentials");
        return Ok(Arc::new(web_identity));
    }

    anyhow::bail!(
        "No AWS base credentials: set AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY or AWS_ROLE_ARN/AWS_WEB_IDENTITY_TOKEN_FILE"
    )
}
