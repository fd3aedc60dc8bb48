//! Credential sources consumed by [`AwsClient`](super::AwsClient).

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::env;
use std::sync::Arc;

use crate::agents::compliance_scan::{Credential, CredentialError};

/// Anything that can hand out credentials for signing.
///
/// Called once per request, so implementations are expected to cache.
#[async_trait]
pub trait CredentialsSource: Send + Sync {
    async fn credentials(&self) -> Result<Arc<Credential>, CredentialError>;

    /// Role the credentials come from, if federated
    fn role_reference(&self) -> Option<String> {
        None
    }
}

/// Long-lived keys, typically from the environment
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credential: Arc<Credential>,
}

impl StaticCredentials {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential: Arc::new(credential),
        }
    }

    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`
    pub fn from_env() -> Result<Self> {
        let access_key = env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID not set")?;
        let secret_key =
            env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY not set")?;
        let session_token = env::var("AWS_SESSION_TOKEN").ok().filter(|t| !t.is_empty());

        Ok(Self::new(Credential {
            access_key,
            secret_key,
            session_token,
            account_id: None,
            role_reference: None,
            expiration: None,
        }))
    }
}

#[async_trait]
impl CredentialsSource for StaticCredentials {
    async fn credentials(&self) -> Result<Arc<Credential>, CredentialError> {
        Ok(self.credential.clone())
    }
}
