use std::sync::Arc;

use anyhow::{Context, Result};

use crate::providers::types::TransportError;
use crate::providers::Transport;
use crate::services::keyring::CredentialStore;

/// Credential intake: one verification round-trip against the backend
/// before a key is accepted, on entry and on stored-key reuse at startup.
pub struct AuthService {
    credentials: CredentialStore,
    transport: Arc<dyn Transport>,
}

impl AuthService {
    pub fn new(credentials: CredentialStore, transport: Arc<dyn Transport>) -> Self {
        Self {
            credentials,
            transport,
        }
    }

    pub async fn verify(&self, api_key: &str) -> Result<bool, TransportError> {
        self.transport.verify_credential(api_key).await
    }

    /// Verify a freshly entered key and keep it only if accepted. Returns
    /// whether the key was accepted.
    pub async fn store_verified(&self, api_key: &str) -> Result<bool> {
        let accepted = self
            .verify(api_key)
            .await
            .context("Failed to verify API key")?;
        if accepted {
            self.credentials.store(api_key).await?;
        }
        Ok(accepted)
    }

    /// Re-validate the stored key at startup. A key the backend no longer
    /// accepts is dropped so the user is asked to enter a new one.
    pub async fn restore(&self) -> Result<Option<String>> {
        let Some(api_key) = self.credentials.retrieve().await? else {
            return Ok(None);
        };
        match self.verify(&api_key).await {
            Ok(true) => Ok(Some(api_key)),
            Ok(false) => {
                tracing::warn!("Stored API key was rejected; discarding it");
                let _ = self.credentials.delete().await;
                Ok(None)
            }
            Err(e) => {
                // Can't reach the backend; keep the key and let the first
                // send surface the problem
                tracing::warn!("Could not verify stored API key: {}", e);
                Ok(Some(api_key))
            }
        }
    }

    pub async fn forget(&self) -> Result<()> {
        self.credentials.delete().await
    }
}
