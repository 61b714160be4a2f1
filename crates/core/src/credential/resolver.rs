//! Credential resolution: turns a target into ordered authentication methods
//!
//! Order of precedence per auth kind:
//!
//! - **password**: credential store (when the target carries a reference),
//!   then the interactive prompt
//! - **key**: the key file, with its passphrase resolved like a password;
//!   an agent method is appended when an agent is reachable
//! - **agent**: the agent only

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::{CredentialStore, Prompt, SecretKind};
use crate::probe::ProtocolClient;
use crate::types::{AuthKind, SecretString, Target};
use crate::{CoreError, Result};

/// Negotiable credential for one handshake
///
/// Produced per attempt and never persisted.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password(SecretString),
    PublicKey {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
    Agent,
}

impl AuthMethod {
    pub fn password(secret: SecretString) -> Self {
        AuthMethod::Password(secret)
    }

    pub fn key(path: impl Into<PathBuf>, passphrase: Option<SecretString>) -> Self {
        AuthMethod::PublicKey {
            path: path.into(),
            passphrase,
        }
    }

    /// Short name for logs and error messages
    pub fn label(&self) -> &'static str {
        match self {
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::Agent => "agent",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(***)"),
            AuthMethod::PublicKey { path, passphrase } => f
                .debug_struct("PublicKey")
                .field("path", path)
                .field("passphrase", &passphrase.is_some())
                .finish(),
            AuthMethod::Agent => f.write_str("Agent"),
        }
    }
}

/// Resolves the authentication methods for a target
///
/// The store and prompt are chosen once at construction.
pub struct CredentialResolver {
    client: Arc<dyn ProtocolClient>,
    store: Option<Arc<dyn CredentialStore>>,
    prompt: Option<Arc<dyn Prompt>>,
}

impl CredentialResolver {
    pub fn new(client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            client,
            store: None,
            prompt: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn Prompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn has_prompt(&self) -> bool {
        self.prompt.is_some()
    }

    /// Ordered methods to offer for `target`
    ///
    /// # Errors
    /// - `Configuration` when a key target has no key path
    /// - `Credential` when neither store nor prompt produced a password, or no agent is reachable for an agent target
    /// - `UserCancelled` when the prompt was dismissed
    pub async fn resolve(&self, target: &Target) -> Result<Vec<AuthMethod>> {
        let mut methods = Vec::with_capacity(2);

        match target.auth_kind {
            AuthKind::Password => {
                methods.push(AuthMethod::Password(self.resolve_password(target).await?));
            }
            AuthKind::Key => {
                let path = target
                    .key_path
                    .as_ref()
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or_else(|| {
                        CoreError::Configuration(format!(
                            "target '{}' uses key authentication but has no key path",
                            target.name
                        ))
                    })?;

                let passphrase = if target.passphrase_protected {
                    self.resolve_passphrase(target).await?
                } else {
                    None
                };
                methods.push(AuthMethod::key(path.clone(), passphrase));

                match self.client.agent_auth_method().await {
                    Some(agent) => methods.push(agent),
                    None => tracing::debug!("No SSH agent reachable, offering key only for {}", target.name),
                }
            }
            AuthKind::Agent => {
                let agent = self.client.agent_auth_method().await.ok_or_else(|| {
                    CoreError::credential(&target.name, "SSH agent is not reachable")
                })?;
                methods.push(agent);
            }
        }

        tracing::debug!(
            "Resolved {} auth method(s) for {}: {:?}",
            methods.len(),
            target.name,
            methods.iter().map(AuthMethod::label).collect::<Vec<_>>()
        );
        Ok(methods)
    }

    async fn resolve_password(&self, target: &Target) -> Result<SecretString> {
        let mut store_error = None;

        if let Some(reference) = target.credential_ref.as_deref().filter(|r| !r.is_empty()) {
            match self.fetch(reference).await {
                Ok(secret) => return Ok(secret),
                Err(e) => {
                    tracing::warn!("Credential store lookup for {} failed: {}", target.name, e);
                    store_error = Some(e);
                }
            }
        }

        let text = format!("Password for {}: ", target.destination());
        match self.ask(&text).await? {
            Some(secret) => Ok(secret),
            None => Err(CoreError::credential(
                &target.name,
                match store_error {
                    Some(e) => format!("credential store failed ({}) and no prompt is configured", e),
                    None => "no stored password and no prompt is configured".to_string(),
                },
            )),
        }
    }

    /// `None` lets the handshake ask for the passphrase itself
    async fn resolve_passphrase(&self, target: &Target) -> Result<Option<SecretString>> {
        if self.store.is_some() {
            let id = SecretKind::Passphrase.id_for(&target.name);
            match self.fetch(&id).await {
                Ok(secret) => return Ok(Some(secret)),
                Err(e) => tracing::debug!("No stored passphrase for {}: {}", target.name, e),
            }
        }

        let text = format!("Passphrase for key of {}: ", target.name);
        self.ask(&text).await
    }

    async fn fetch(&self, id: &str) -> Result<SecretString> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| CoreError::Store("no credential store configured".to_string()))?;
        if !store.available() {
            return Err(CoreError::Store("credential store is unavailable".to_string()));
        }
        store.retrieve(id).await
    }

    /// `Ok(None)` when no prompt is configured
    async fn ask(&self, text: &str) -> Result<Option<SecretString>> {
        match &self.prompt {
            None => Ok(None),
            Some(prompt) => match prompt.prompt(text).await {
                Ok(secret) => Ok(Some(secret)),
                Err(e) => {
                    tracing::debug!("Prompt dismissed: {}", e);
                    Err(CoreError::UserCancelled)
                }
            },
        }
    }
}
