use std::sync::Arc;

use anyhow::{Context, Result};
use oo7::Keyring;

use crate::config::APP_DIR;

const ATTR_APP: &str = "application";
const ATTR_PURPOSE: &str = "purpose";
const PURPOSE_API_KEY: &str = "api-key";

/// Stores the one API credential in the system keyring.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    keyring: Arc<Keyring>,
}

impl CredentialStore {
    pub async fn new() -> Result<Self> {
        let keyring = Keyring::new()
            .await
            .context("Failed to initialize keyring")?;
        Ok(Self {
            keyring: Arc::new(keyring),
        })
    }

    pub async fn store(&self, secret: &str) -> Result<()> {
        let attributes = Self::attributes();
        self.keyring
            .create_item(
                "Murmur API key",
                &attributes,
                secret,
                true, // replace if exists
            )
            .await
            .context("Failed to store API key in keyring")?;
        Ok(())
    }

    pub async fn retrieve(&self) -> Result<Option<String>> {
        let attributes = Self::attributes();
        let items = self
            .keyring
            .search_items(&attributes)
            .await
            .context("Failed to search keyring")?;

        let Some(item) = items.first() else {
            return Ok(None);
        };
        let secret = item.secret().await.context("Failed to read secret")?;
        let secret =
            String::from_utf8(secret.to_vec()).context("Stored API key is not valid UTF-8")?;
        Ok(Some(secret))
    }

    pub async fn delete(&self) -> Result<()> {
        self.keyring
            .delete(&Self::attributes())
            .await
            .context("Failed to delete API key from keyring")?;
        Ok(())
    }

    fn attributes() -> Vec<(&'static str, &'static str)> {
        vec![(ATTR_APP, APP_DIR), (ATTR_PURPOSE, PURPOSE_API_KEY)]
    }
}
