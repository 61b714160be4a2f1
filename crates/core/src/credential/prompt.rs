//! Interactive secret prompt contract

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::types::SecretString;
use crate::{CoreError, Result};

/// Asks the user for a secret
///
/// Any error is treated by callers as the user cancelling.
#[async_trait]
pub trait Prompt: Send + Sync {
    async fn prompt(&self, text: &str) -> Result<SecretString>;
}

/// Prompt with a fixed answer, counting how often it was asked
#[derive(Clone)]
pub struct StaticPrompt {
    answer: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl StaticPrompt {
    /// Always answers `answer`
    pub fn answering(answer: impl Into<String>) -> Self {
        Self {
            answer: Some(answer.into()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always behaves as if the user pressed Ctrl+C
    pub fn cancelling() -> Self {
        Self {
            answer: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prompt for StaticPrompt {
    async fn prompt(&self, _text: &str) -> Result<SecretString> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.answer {
            Some(answer) => Ok(SecretString::new(answer.clone())),
            None => Err(CoreError::UserCancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_prompt_counts_calls() {
        let prompt = StaticPrompt::answering("pw");
        assert_eq!(prompt.prompt("Password: ").await.unwrap().expose(), "pw");
        assert_eq!(prompt.prompt("Password: ").await.unwrap().expose(), "pw");
        assert_eq!(prompt.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelling_prompt() {
        let prompt = StaticPrompt::cancelling();
        assert!(matches!(
            prompt.prompt("Password: ").await,
            Err(CoreError::UserCancelled)
        ));
        assert_eq!(prompt.calls(), 1);
    }
}
