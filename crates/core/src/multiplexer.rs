//! Terminal multiplexer contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::launcher::LaunchCommand;
use crate::{CoreError, Result};

/// What the multiplexer reports about one live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub created: Option<DateTime<Utc>>,
    pub window_count: u32,
}

/// One window to open in a new session
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSpec {
    pub title: String,
    pub command: LaunchCommand,
}

/// Creates, lists and attaches multiplexer sessions
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Create session `name` with `windows`, or attach to it if it already exists
    ///
    /// Returns `(session_id, was_existing)`.
    async fn create_or_attach(&self, name: &str, windows: &[WindowSpec]) -> Result<(String, bool)>;

    async fn list_sessions(&self) -> Result<Vec<String>>;

    async fn session_info(&self, name: &str) -> Result<SessionInfo>;

    /// Hand the current terminal over to session `name`
    async fn attach(&self, name: &str) -> Result<()>;

    async fn available(&self) -> bool;
}

#[derive(Debug, Clone)]
struct MockSession {
    created: DateTime<Utc>,
    windows: Vec<WindowSpec>,
    window_count: Option<u32>,
}

#[derive(Default)]
struct MockMuxState {
    sessions: BTreeMap<String, MockSession>,
    unavailable: bool,
    fail_create: bool,
    fail_list: bool,
    creates: usize,
    attaches: Vec<String>,
}

/// In-memory multiplexer for tests
#[derive(Clone, Default)]
pub struct MockMultiplexer {
    state: Arc<Mutex<MockMuxState>>,
}

impl MockMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockMuxState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add a live session as if created outside this process
    pub fn insert_session(&self, name: &str, window_count: u32) {
        self.state().sessions.insert(
            name.to_string(),
            MockSession {
                created: Utc::now(),
                windows: Vec::new(),
                window_count: Some(window_count),
            },
        );
    }

    /// Simulate the session exiting
    pub fn kill_session(&self, name: &str) {
        self.state().sessions.remove(name);
    }

    pub fn set_window_count(&self, name: &str, count: u32) {
        if let Some(session) = self.state().sessions.get_mut(name) {
            session.window_count = Some(count);
        }
    }

    pub fn set_available(&self, available: bool) {
        self.state().unavailable = !available;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.state().fail_list = fail;
    }

    /// Number of sessions actually created (attaches excluded)
    pub fn create_count(&self) -> usize {
        self.state().creates
    }

    pub fn windows(&self, name: &str) -> Vec<WindowSpec> {
        self.state()
            .sessions
            .get(name)
            .map(|s| s.windows.clone())
            .unwrap_or_default()
    }

    pub fn attached(&self) -> Vec<String> {
        self.state().attaches.clone()
    }
}

#[async_trait]
impl Multiplexer for MockMultiplexer {
    async fn create_or_attach(&self, name: &str, windows: &[WindowSpec]) -> Result<(String, bool)> {
        let mut state = self.state();
        if state.sessions.contains_key(name) {
            return Ok((name.to_string(), true));
        }
        if state.fail_create {
            return Err(CoreError::Multiplexer(format!("failed to create session {}", name)));
        }
        state.creates += 1;
        state.sessions.insert(
            name.to_string(),
            MockSession {
                created: Utc::now(),
                windows: windows.to_vec(),
                window_count: None,
            },
        );
        Ok((name.to_string(), false))
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let state = self.state();
        if state.fail_list {
            return Err(CoreError::Multiplexer("server not responding".to_string()));
        }
        Ok(state.sessions.keys().cloned().collect())
    }

    async fn session_info(&self, name: &str) -> Result<SessionInfo> {
        let state = self.state();
        let session = state
            .sessions
            .get(name)
            .ok_or_else(|| CoreError::Multiplexer(format!("can't find session: {}", name)))?;
        Ok(SessionInfo {
            created: Some(session.created),
            window_count: session
                .window_count
                .unwrap_or(session.windows.len().max(1) as u32),
        })
    }

    async fn attach(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if !state.sessions.contains_key(name) {
            return Err(CoreError::Multiplexer(format!("can't find session: {}", name)));
        }
        state.attaches.push(name.to_string());
        Ok(())
    }

    async fn available(&self) -> bool {
        !self.state().unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(title: &str) -> WindowSpec {
        WindowSpec {
            title: title.to_string(),
            command: LaunchCommand::new("ssh", vec![format!("ops@{}", title)]),
        }
    }

    #[tokio::test]
    async fn test_mock_create_then_attach() {
        let mux = MockMultiplexer::new();
        let (id, existing) = mux.create_or_attach("db1", &[window("db1")]).await.unwrap();
        assert_eq!(id, "db1");
        assert!(!existing);

        let (id, existing) = mux.create_or_attach("db1", &[window("db1")]).await.unwrap();
        assert_eq!(id, "db1");
        assert!(existing);
        assert_eq!(mux.create_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_info_and_kill() {
        let mux = MockMultiplexer::new();
        mux.create_or_attach("web", &[window("web1"), window("web2")])
            .await
            .unwrap();
        assert_eq!(mux.session_info("web").await.unwrap().window_count, 2);

        mux.set_window_count("web", 0);
        assert_eq!(mux.session_info("web").await.unwrap().window_count, 0);

        mux.kill_session("web");
        assert!(mux.list_sessions().await.unwrap().is_empty());
        assert!(mux.session_info("web").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_attach_requires_session() {
        let mux = MockMultiplexer::new();
        assert!(mux.attach("nope").await.is_err());
        mux.insert_session("s1", 1);
        mux.attach("s1").await.unwrap();
        assert_eq!(mux.attached(), vec!["s1".to_string()]);
    }
}
