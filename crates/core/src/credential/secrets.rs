//! Secret management for configuration tooling
//!
//! Not used on the connection path; the resolver reads the same ids.

use std::sync::Arc;

use super::{CredentialStore, SecretKind};
use crate::types::SecretString;
use crate::{CoreError, Result};

/// Store/retrieve/delete/migrate secrets keyed by target name
#[derive(Clone)]
pub struct SecretManager {
    store: Arc<dyn CredentialStore>,
}

impl SecretManager {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.store.available() {
            Ok(())
        } else {
            Err(CoreError::Store("credential store is unavailable".to_string()))
        }
    }

    /// Store a secret, returning the id it was stored under
    pub async fn store(&self, target: &str, kind: SecretKind, secret: &SecretString) -> Result<String> {
        self.ensure_available()?;
        if secret.is_empty() {
            return Err(CoreError::Configuration(format!(
                "refusing to store an empty {} for {}",
                kind.as_str(),
                target
            )));
        }
        let id = kind.id_for(target);
        self.store.store(&id, secret).await?;
        tracing::info!("Stored {} for {} as {}", kind.as_str(), target, id);
        Ok(id)
    }

    pub async fn retrieve(&self, target: &str, kind: SecretKind) -> Result<SecretString> {
        self.ensure_available()?;
        self.store.retrieve(&kind.id_for(target)).await
    }

    pub async fn delete(&self, target: &str, kind: SecretKind) -> Result<()> {
        self.ensure_available()?;
        self.store.delete(&kind.id_for(target)).await
    }

    pub async fn has(&self, target: &str, kind: SecretKind) -> Result<bool> {
        match self.retrieve(target, kind).await {
            Ok(_) => Ok(true),
            Err(CoreError::SecretNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Move an inline password into the store
    ///
    /// Returns the reference the inventory should record instead of the
    /// plaintext. The stored value is read back before returning.
    pub async fn migrate(&self, target: &str, plaintext: &SecretString) -> Result<String> {
        let id = self.store(target, SecretKind::Password, plaintext).await?;
        let readback = self.store.retrieve(&id).await?;
        if readback != *plaintext {
            return Err(CoreError::Store(format!(
                "read-back of {} did not match the migrated password",
                id
            )));
        }
        tracing::info!("Migrated password for {} into the credential store", target);
        Ok(id)
    }

    /// All ids currently held by the backend
    pub async fn list(&self) -> Result<Vec<String>> {
        self.ensure_available()?;
        self.store.list().await
    }
}
