//! File-backed credential store
//!
//! # Storage Location
//!
//! - **Linux**: `~/.local/share/sshmux/secrets.json`
//! - **macOS**: `~/Library/Application Support/sshmux/secrets.json`
//!
//! The file is a flat JSON object of id to secret, written with
//! permissions 0600 on Unix and replaced atomically on every change.

use async_trait::async_trait;
use sshmux_core::{CoreError, CredentialStore, Result, SecretString};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const SECRETS_FILE: &str = "secrets.json";

pub struct FileCredentialStore {
    file: Arc<SecretsFile>,
}

/// `secrets.json` under the platform data directory
pub fn default_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("sshmux").join(SECRETS_FILE))
}

impl FileCredentialStore {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Arc::new(SecretsFile {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    /// Run `f` on the blocking pool with the file lock held
    async fn with_file<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SecretsFile) -> Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let _guard = file.guard();
            f(&file)
        })
        .await
        .map_err(|e| CoreError::Store(format!("credential file task failed: {}", e)))?
    }
}

struct SecretsFile {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl SecretsFile {
    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read(&self.path)?;
        if raw.is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&raw)
            .map_err(|e| CoreError::Store(format!("{} is corrupt: {}", self.path.display(), e)))
    }

    fn save(&self, secrets: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(secrets)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perm = fs::metadata(&tmp)?.permissions();
            perm.set_mode(0o600); // rw-------
            fs::set_permissions(&tmp, perm)?;
        }

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn store(&self, id: &str, secret: &SecretString) -> Result<()> {
        let id = id.to_string();
        let secret = secret.clone();
        self.with_file(move |file| {
            let mut secrets = file.load()?;
            secrets.insert(id, secret.expose().to_string());
            file.save(&secrets)
        })
        .await
    }

    async fn retrieve(&self, id: &str) -> Result<SecretString> {
        let id = id.to_string();
        self.with_file(move |file| {
            file.load()?
                .remove(&id)
                .map(SecretString::from)
                .ok_or(CoreError::SecretNotFound(id))
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_file(move |file| {
            let mut secrets = file.load()?;
            if secrets.remove(&id).is_some() {
                file.save(&secrets)?;
            }
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.with_file(|file| Ok(file.load()?.into_keys().collect())).await
    }

    fn available(&self) -> bool {
        match self.file.path.parent() {
            Some(parent) => fs::create_dir_all(parent).is_ok(),
            None => false,
        }
    }
}
