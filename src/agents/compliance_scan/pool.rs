//! Target Client Pool
//!
//! One signed client per (account, region), built on first use and shared
//! read-only afterwards. The engine's own account/region is pre-registered
//! and never federates.

use dashmap::DashMap;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::identity::{CredentialProvider, FederatedCredentials};
use super::types::{ScanError, ScanTarget, TargetKind};
use crate::tools::aws::{AwsClient, CredentialsSource, RetryPolicy};

/// The caller's own account and region
#[derive(Clone)]
pub struct LocalContext {
    pub account_id: String,
    pub region: String,
    pub credentials: Arc<dyn CredentialsSource>,
}

impl std::fmt::Debug for LocalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalContext")
            .field("account_id", &self.account_id)
            .field("region", &self.region)
            .finish()
    }
}

/// A client bound to one (account, region). Immutable once built.
#[derive(Debug)]
pub struct TargetClient {
    account_id: String,
    region: String,
    federated: bool,
    aws: AwsClient,
}

impl TargetClient {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// False for the local account
    pub fn is_federated(&self) -> bool {
        self.federated
    }

    pub fn aws(&self) -> &AwsClient {
        &self.aws
    }

    pub fn role_reference(&self) -> Option<String> {
        if self.federated {
            self.aws.role_reference()
        } else {
            None
        }
    }
}

type ClientSlot = Arc<OnceCell<Arc<TargetClient>>>;

pub struct TargetClientPool {
    local: LocalContext,
    provider: Arc<CredentialProvider>,
    http: reqwest::Client,
    retry: RetryPolicy,
    endpoint_override: Option<String>,
    local_client: Arc<TargetClient>,
    clients: DashMap<(String, String), ClientSlot>,
}

impl TargetClientPool {
    pub fn new(
        local: LocalContext,
        provider: Arc<CredentialProvider>,
        http: reqwest::Client,
        endpoint_override: Option<String>,
    ) -> Self {
        let local_client = Arc::new(TargetClient {
            account_id: local.account_id.clone(),
            region: local.region.clone(),
            federated: false,
            aws: AwsClient::new(
                http.clone(),
                &local.account_id,
                &local.region,
                local.credentials.clone(),
            )
            .with_endpoint(endpoint_override.clone()),
        });

        info!(
            account = %local.account_id,
            region = %local.region,
            "Client pool initialized with local target"
        );

        Self {
            local,
            provider,
            http,
            retry: RetryPolicy::default(),
            endpoint_override,
            local_client,
            clients: DashMap::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.local_client = Arc::new(TargetClient {
            account_id: self.local.account_id.clone(),
            region: self.local.region.clone(),
            federated: false,
            aws: self.local_client.aws.clone().with_retry(retry),
        });
        self
    }

    pub fn local(&self) -> &LocalContext {
        &self.local
    }

    /// The pre-registered client for the local account/region
    pub fn local_client(&self) -> Arc<TargetClient> {
        self.local_client.clone()
    }

    pub fn provider(&self) -> &Arc<CredentialProvider> {
        &self.provider
    }

    /// `(account, region)` a target scans against
    pub fn resolve(&self, target: &ScanTarget) -> Result<(String, String), ScanError> {
        match target.kind {
            TargetKind::Region => Ok((self.local.account_id.clone(), target.id.clone())),
            TargetKind::Account => Ok((target.id.clone(), self.local.region.clone())),
            TargetKind::AccountRegion => target
                .account_region_parts()
                .map(|(account, region)| (account.to_string(), region.to_string()))
                .ok_or_else(|| ScanError::ClientConstruction {
                    target: target.id.clone(),
                    message: format!("'{}' is not of the form <account>/<region>", target.id),
                }),
        }
    }

    /// Pooled client for `target`, building it on first use
    pub async fn get_client(&self, target: &ScanTarget) -> Result<Arc<TargetClient>, ScanError> {
        let (account, region) = self.resolve(target)?;
        if account.is_empty() || region.is_empty() {
            return Err(ScanError::ClientConstruction {
                target: target.id.clone(),
                message: "empty account or region".to_string(),
            });
        }

        if account == self.local.account_id && region == self.local.region {
            return Ok(self.local_client.clone());
        }

        let slot = self
            .clients
            .entry((account.clone(), region.clone()))
            .or_default()
            .clone();

        let client = slot
            .get_or_try_init(|| self.build(&account, &region))
            .await?;
        Ok(client.clone())
    }

    async fn build(&self, account: &str, region: &str) -> Result<Arc<TargetClient>, ScanError> {
        let federated = account != self.local.account_id;

        let credentials: Arc<dyn CredentialsSource> = if federated {
            // Surface federation failures here rather than on first request
            self.provider.get_credentials(account).await?;
            Arc::new(FederatedCredentials::new(self.provider.clone(), account))
        } else {
            self.local.credentials.clone()
        };

        let aws = AwsClient::new(self.http.clone(), account, region, credentials)
            .with_retry(self.retry)
            .with_endpoint(self.endpoint_override.clone());

        debug!(account = %account, region = %region, federated, "Pooled client built");
        Ok(Arc::new(TargetClient {
            account_id: account.to_string(),
            region: region.to_string(),
            federated,
            aws,
        }))
    }

    /// Clients for a batch, collecting per-target errors
    pub async fn get_clients(
        &self,
        targets: &[ScanTarget],
    ) -> BTreeMap<String, Result<Arc<TargetClient>, ScanError>> {
        let resolved = join_all(targets.iter().map(|t| self.get_client(t))).await;
        targets
            .iter()
            .map(|t| t.id.clone())
            .zip(resolved)
            .collect()
    }

    /// Drop pooled clients (local pre-registration is kept) and the matching
    /// cached credentials.
    pub fn invalidate(&self, account_id: Option<&str>) {
        match account_id {
            Some(account) => self.clients.retain(|(cached, _), _| cached != account),
            None => self.clients.clear(),
        }
        self.provider.clear(account_id);
        info!(account = ?account_id, "Client pool invalidated");
    }

    /// Number of constructed pooled clients, excluding the local one
    pub fn len(&self) -> usize {
        self.clients.iter().filter(|e| e.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
