//! Credential storage, prompting and resolution

mod prompt;
mod resolver;
mod secrets;
mod store;

pub use prompt::{Prompt, StaticPrompt};
pub use resolver::{AuthMethod, CredentialResolver};
pub use secrets::SecretManager;
pub use store::{password_id, secret_id, CredentialStore, MemoryCredentialStore, SecretKind};
