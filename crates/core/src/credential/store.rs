//! Credential store contract and an in-memory implementation
//!
//! Store ids are derived deterministically from the target name so entries
//! written by configuration tooling are found again on the connection path:
//!
//! - passwords: `password-<target>`
//! - other secrets: `<target>_<kind>` (e.g. `db1_passphrase`)

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::SecretString;
use crate::{CoreError, Result};

/// Kind of secret kept for a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKind {
    Password,
    Passphrase,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::Password => "password",
            SecretKind::Passphrase => "passphrase",
        }
    }

    /// Store id for this kind of secret belonging to `target`
    pub fn id_for(&self, target: &str) -> String {
        match self {
            SecretKind::Password => password_id(target),
            SecretKind::Passphrase => secret_id(target, self.as_str()),
        }
    }
}

/// `password-<target>`
pub fn password_id(target: &str) -> String {
    format!("password-{}", target)
}

/// `<target>_<kind>`
pub fn secret_id(target: &str, kind: &str) -> String {
    format!("{}_{}", target, kind)
}

/// Platform-agnostic secret storage
///
/// Implementations own their own concurrency safety. `retrieve` reports a
/// missing entry as [`CoreError::SecretNotFound`].
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn store(&self, id: &str, secret: &SecretString) -> Result<()>;

    async fn retrieve(&self, id: &str) -> Result<SecretString>;

    /// Idempotent: deleting a missing id succeeds
    async fn delete(&self, id: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<String>>;

    /// Whether the backend can be used at all on this machine
    fn available(&self) -> bool;
}

/// In-memory credential store for tests and ephemeral use
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    secrets: Arc<RwLock<HashMap<String, SecretString>>>,
    broken: Arc<AtomicBool>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a store error (simulates a locked keychain)
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            Err(CoreError::Store("credential store is locked".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn store(&self, id: &str, secret: &SecretString) -> Result<()> {
        self.check()?;
        self.secrets
            .write()
            .await
            .insert(id.to_string(), secret.clone());
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> Result<SecretString> {
        self.check()?;
        self.secrets
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::SecretNotFound(id.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.check()?;
        self.secrets.write().await.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.check()?;
        let mut ids: Vec<String> = self.secrets.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn available(&self) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_scheme() {
        assert_eq!(password_id("db1"), "password-db1");
        assert_eq!(secret_id("db1", "passphrase"), "db1_passphrase");
        assert_eq!(SecretKind::Password.id_for("web"), "password-web");
        assert_eq!(SecretKind::Passphrase.id_for("web"), "web_passphrase");
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryCredentialStore::new();
        store.store("password-db1", &"pw".into()).await.unwrap();
        assert_eq!(store.retrieve("password-db1").await.unwrap().expose(), "pw");
        assert_eq!(store.list().await.unwrap(), vec!["password-db1".to_string()]);

        store.delete("password-db1").await.unwrap();
        let err = store.retrieve("password-db1").await.unwrap_err();
        assert!(matches!(err, CoreError::SecretNotFound(_)));
        // Second delete is a no-op
        store.delete("password-db1").await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_store() {
        let store = MemoryCredentialStore::new();
        store.set_broken(true);
        assert!(!store.available());
        assert!(matches!(
            store.retrieve("x").await.unwrap_err(),
            CoreError::Store(_)
        ));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store1 = MemoryCredentialStore::new();
        let store2 = store1.clone();
        store1.store("a", &"1".into()).await.unwrap();
        assert!(store2.retrieve("a").await.is_ok());
    }
}
