//! Remote host targets and their authentication configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::CoreError;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How a target authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Password,
    Key,
    Agent,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::Password => "password",
            AuthKind::Key => "key",
            AuthKind::Agent => "agent",
        }
    }
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AuthKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "password" => Ok(AuthKind::Password),
            "key" => Ok(AuthKind::Key),
            "agent" => Ok(AuthKind::Agent),
            other => Err(CoreError::Configuration(format!(
                "unsupported auth kind '{}'",
                other
            ))),
        }
    }
}

/// A named remote host plus its authentication configuration
///
/// Immutable for the duration of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(rename = "auth")]
    pub auth_kind: AuthKind,
    /// Credential-store id holding the password; `None` means plaintext/interactive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub passphrase_protected: bool,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl Target {
    /// Create a target using agent authentication on the default port
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            auth_kind: AuthKind::Agent,
            credential_ref: None,
            key_path: None,
            passphrase_protected: false,
        }
    }

    /// Switch to key authentication
    pub fn with_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth_kind = AuthKind::Key;
        self.key_path = Some(path.into());
        self
    }

    /// Switch to password authentication, optionally backed by the credential store
    pub fn with_password(mut self, credential_ref: Option<String>) -> Self {
        self.auth_kind = AuthKind::Password;
        self.credential_ref = credential_ref;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_passphrase(mut self) -> Self {
        self.passphrase_protected = true;
        self
    }

    /// Password stored in the credential store rather than typed at connect time
    pub fn is_store_backed(&self) -> bool {
        self.auth_kind == AuthKind::Password
            && self.credential_ref.as_deref().is_some_and(|r| !r.is_empty())
    }

    /// Password target without a store reference
    pub fn is_plaintext_password(&self) -> bool {
        self.auth_kind == AuthKind::Password && !self.is_store_backed()
    }

    /// `user@host` destination string
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}
