//! Connection manager: wires resolver, prober, launcher, history and monitor

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::credential::{CredentialResolver, CredentialStore, Prompt};
use crate::history::{begin_attempt, finish_attempt, HistoryRecorder};
use crate::launcher::{LaunchOptions, LaunchOutcome, SessionLauncher};
use crate::monitor::{HealthMonitor, MonitorConfig};
use crate::multiplexer::Multiplexer;
use crate::probe::{ProbeConfig, Prober, ProtocolClient};
use crate::types::{
    AttemptFilter, AttemptOutcome, AttemptStats, ConnectionAttempt, HealthObservation, Target,
};
use crate::Result;

/// Tunables for every component the manager owns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagerConfig {
    pub probe: ProbeConfig,
    pub monitor: MonitorConfig,
    pub launch: LaunchOptions,
}

pub struct ManagerBuilder {
    client: Arc<dyn ProtocolClient>,
    mux: Arc<dyn Multiplexer>,
    history: Arc<dyn HistoryRecorder>,
    store: Option<Arc<dyn CredentialStore>>,
    prompt: Option<Arc<dyn Prompt>>,
    config: ManagerConfig,
}

impl ManagerBuilder {
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn prompt(mut self, prompt: Arc<dyn Prompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ConnectionManager {
        let mut resolver = CredentialResolver::new(Arc::clone(&self.client));
        if let Some(store) = self.store {
            resolver = resolver.with_store(store);
        }
        if let Some(prompt) = self.prompt {
            resolver = resolver.with_prompt(prompt);
        }
        let resolver = Arc::new(resolver);
        let prober = Arc::new(Prober::new(self.client, self.config.probe));

        let launcher = SessionLauncher::new(
            Arc::clone(&resolver),
            Arc::clone(&prober),
            Arc::clone(&self.mux),
            Arc::clone(&self.history),
            self.config.launch,
        );
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&self.mux),
            Arc::clone(&self.history),
            self.config.monitor,
        ));

        ConnectionManager {
            resolver,
            prober,
            launcher,
            monitor,
            mux: self.mux,
            history: self.history,
        }
    }
}

/// Entry point used by the command line
pub struct ConnectionManager {
    resolver: Arc<CredentialResolver>,
    prober: Arc<Prober>,
    launcher: SessionLauncher,
    monitor: Arc<HealthMonitor>,
    mux: Arc<dyn Multiplexer>,
    history: Arc<dyn HistoryRecorder>,
}

impl ConnectionManager {
    pub fn builder(
        client: Arc<dyn ProtocolClient>,
        mux: Arc<dyn Multiplexer>,
        history: Arc<dyn HistoryRecorder>,
    ) -> ManagerBuilder {
        ManagerBuilder {
            client,
            mux,
            history,
            store: None,
            prompt: None,
            config: ManagerConfig::default(),
        }
    }

    /// Launch a single target and start tracking its session
    pub async fn connect(&self, target: &Target) -> Result<LaunchOutcome> {
        let outcome = self.launcher.launch_single(target).await?;
        self.track(&outcome, &target.name).await;
        Ok(outcome)
    }

    /// Launch a group session and start tracking it
    pub async fn connect_group(&self, group: &str, targets: &[Target]) -> Result<LaunchOutcome> {
        let outcome = self.launcher.launch_group(group, targets).await?;
        self.track(&outcome, group).await;
        Ok(outcome)
    }

    async fn track(&self, outcome: &LaunchOutcome, target_name: &str) {
        // Attaching keeps an existing record's failure streak
        if outcome.was_existing && self.monitor.is_tracked(&outcome.session_id).await {
            return;
        }
        self.monitor.add_session(&outcome.session_id, target_name).await;
    }

    /// Explicit connection test with the long deadline
    ///
    /// Always probes, including plaintext-password targets, and is recorded
    /// like any other attempt. Returns the method that authenticated.
    pub async fn test_connection(&self, target: &Target) -> Result<&'static str> {
        let id = begin_attempt(self.history.as_ref(), &ConnectionAttempt::single(target)).await;
        tracing::info!("Testing connection to {}", target.destination());

        let result = match self.resolver.resolve(target).await {
            Ok(methods) => self.prober.test(target, &methods).await,
            Err(e) => Err(e),
        };

        let outcome = match &result {
            Ok(method) => {
                tracing::info!("Connection to {} verified via {}", target.name, method);
                AttemptOutcome::verified()
            }
            Err(e) => {
                tracing::error!("Connection test for {} failed: {}", target.name, e);
                AttemptOutcome::failure(e)
            }
        };
        finish_attempt(self.history.as_ref(), id, outcome).await;
        result
    }

    pub async fn attach(&self, session_id: &str) -> Result<()> {
        self.mux.attach(session_id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        self.mux.list_sessions().await
    }

    pub async fn history(&self, filter: &AttemptFilter) -> Result<Vec<ConnectionAttempt>> {
        self.history.query(filter).await
    }

    pub async fn stats(&self, target: Option<&str>, group: Option<&str>) -> Result<AttemptStats> {
        self.history.stats(target, group).await
    }

    pub async fn health_history(&self, session_id: &str, limit: usize) -> Result<Vec<HealthObservation>> {
        self.history.health_history(session_id, limit).await
    }

    pub async fn purge_history(&self, older_than: Duration) -> Result<usize> {
        let removed = self.history.purge_older_than(older_than).await?;
        tracing::info!("Purged {} history row(s) older than {:?}", removed, older_than);
        Ok(removed)
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn start_monitor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.monitor.start(cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{MemoryCredentialStore, StaticPrompt};
    use crate::history::MemoryHistory;
    use crate::multiplexer::MockMultiplexer;
    use crate::probe::MockProtocolClient;
    use crate::types::{AttemptStatus, HealthStatus};
    use crate::{CoreError, ErrorKind};
    use chrono::Utc;

    struct Harness {
        client: MockProtocolClient,
        mux: MockMultiplexer,
        history: Arc<MemoryHistory>,
        manager: ConnectionManager,
    }

    fn harness() -> Harness {
        let client = MockProtocolClient::new();
        let mux = MockMultiplexer::new();
        let history = Arc::new(MemoryHistory::new());
        let manager = ConnectionManager::builder(
            Arc::new(client.clone()),
            Arc::new(mux.clone()),
            history.clone(),
        )
        .store(Arc::new(MemoryCredentialStore::new()))
        .prompt(Arc::new(StaticPrompt::answering("typed")))
        .config(ManagerConfig {
            probe: ProbeConfig {
                default_timeout: Duration::from_millis(200),
                test_timeout: Duration::from_secs(1),
            },
            ..Default::default()
        })
        .build();

        Harness {
            client,
            mux,
            history,
            manager,
        }
    }

    // Key target with a reachable host: connect, attach on reconnect, track
    #[tokio::test]
    async fn test_single_key_target_connects_and_is_tracked() {
        let h = harness();
        let target = Target::new("db1", "10.0.0.5", "ops").with_key("/keys/id");

        let outcome = h.manager.connect(&target).await.unwrap();
        assert_eq!(outcome.session_id, "db1");
        assert!(!outcome.was_existing);

        let attempts = h.history.attempts().await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Success);
        assert_eq!(attempts[0].session_id.as_deref(), Some("db1"));

        let tracked = h.manager.monitor().get_active_sessions().await;
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].target_name, "db1");

        let again = h.manager.connect(&target).await.unwrap();
        assert_eq!(again.session_id, "db1");
        assert!(again.was_existing);
        assert_eq!(h.mux.create_count(), 1);
    }

    // One unreachable member blocks the whole group
    #[tokio::test]
    async fn test_group_with_unreachable_member() {
        let h = harness();
        h.client.set_unreachable("10.0.1.2");
        let members = vec![
            Target::new("web1", "10.0.1.1", "ops").with_key("/keys/id"),
            Target::new("web2", "10.0.1.2", "ops").with_key("/keys/id"),
            Target::new("web3", "10.0.1.3", "ops").with_key("/keys/id"),
        ];

        let err = h.manager.connect_group("web", &members).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        match &err {
            CoreError::GroupConnectivity { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].target, "web2");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(h.mux.create_count(), 0);
        assert!(h.manager.monitor().get_active_sessions().await.is_empty());

        let attempts = h.history.attempts().await;
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert!(attempts[0].error_message.as_deref().unwrap_or("").contains("web2"));
    }

    // A session that exits is evicted with one terminal observation
    #[tokio::test]
    async fn test_monitor_evicts_exited_session() {
        let h = harness();
        let target = Target::new("db1", "10.0.0.5", "ops").with_key("/keys/id");
        h.manager.connect(&target).await.unwrap();
        h.mux.kill_session("db1");

        let report = h.manager.monitor().tick().await.unwrap();
        assert_eq!(report.evicted, vec!["db1".to_string()]);
        assert!(h.manager.monitor().get_active_sessions().await.is_empty());

        let observations = h.history.observations().await;
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].status, HealthStatus::Failed);
        assert_eq!(observations[0].error_message.as_deref(), Some(crate::monitor::SESSION_GONE));
    }

    // Retention keeps only what is newer than the window
    #[tokio::test]
    async fn test_purge_retention_window() {
        let h = harness();
        let target = Target::new("db1", "10.0.0.5", "ops");
        for age_days in [100, 95, 10] {
            let mut attempt = ConnectionAttempt::single(&target);
            attempt.start_time = Utc::now() - chrono::Duration::days(age_days);
            h.history.record(&attempt).await.unwrap();
        }

        let removed = h
            .manager
            .purge_history(Duration::from_secs(90 * 24 * 3600))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let remaining = h.manager.history(&AttemptFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn test_connection_test_probes_plaintext_and_records() {
        let h = harness();
        let target = Target::new("db1", "10.0.0.5", "ops").with_password(None);

        let method = h.manager.test_connection(&target).await.unwrap();
        assert_eq!(method, "password");
        assert_eq!(h.client.probe_count(), 1);

        let attempts = h.history.attempts().await;
        assert_eq!(attempts[0].status, AttemptStatus::Success);
        assert!(attempts[0].session_id.is_none());
    }

    #[tokio::test]
    async fn test_connection_test_failure_recorded() {
        let h = harness();
        h.client.set_unreachable("10.0.0.5");
        let target = Target::new("db1", "10.0.0.5", "ops").with_key("/keys/id");

        assert!(h.manager.test_connection(&target).await.is_err());
        assert_eq!(h.history.attempts().await[0].status, AttemptStatus::Failed);
        assert_eq!(h.mux.create_count(), 0);
    }

    #[tokio::test]
    async fn test_stats_after_connects() {
        let h = harness();
        let target = Target::new("db1", "10.0.0.5", "ops").with_key("/keys/id");
        h.manager.connect(&target).await.unwrap();
        h.client.set_unreachable("10.0.0.5");
        h.mux.kill_session("db1");
        assert!(h.manager.connect(&target).await.is_err());

        let stats = h.manager.stats(Some("db1"), None).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn test_attach_delegates_to_multiplexer() {
        let h = harness();
        h.mux.insert_session("s1", 1);
        h.manager.attach("s1").await.unwrap();
        assert_eq!(h.mux.attached(), vec!["s1".to_string()]);
        assert_eq!(h.manager.list_sessions().await.unwrap(), vec!["s1".to_string()]);
    }
}
