//! Session launching for single targets and groups
//!
//! Every launch is bracketed by a history attempt: recorded before any
//! work, finished on every exit path. Recorder failures are logged and
//! never abort a launch.

mod command;

pub use command::{build_command, LaunchCommand, LaunchOptions, PASSWORD_ENV};

use std::sync::Arc;

use crate::credential::{AuthMethod, CredentialResolver};
use crate::error::MemberFailure;
use crate::history::{begin_attempt, finish_attempt, HistoryRecorder};
use crate::multiplexer::{Multiplexer, WindowSpec};
use crate::probe::{ProbeOutcome, Prober};
use crate::types::{AttemptOutcome, ConnectionAttempt, Target};
use crate::{CoreError, Result};

/// Identity of the session a launch ended in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub session_id: String,
    /// The session already existed and was attached rather than created
    pub was_existing: bool,
}

pub struct SessionLauncher {
    resolver: Arc<CredentialResolver>,
    prober: Arc<Prober>,
    mux: Arc<dyn Multiplexer>,
    history: Arc<dyn HistoryRecorder>,
    options: LaunchOptions,
}

impl SessionLauncher {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        prober: Arc<Prober>,
        mux: Arc<dyn Multiplexer>,
        history: Arc<dyn HistoryRecorder>,
        options: LaunchOptions,
    ) -> Self {
        Self {
            resolver,
            prober,
            mux,
            history,
            options,
        }
    }

    /// Launch (or attach to) the session named after `target`
    pub async fn launch_single(&self, target: &Target) -> Result<LaunchOutcome> {
        let id = begin_attempt(self.history.as_ref(), &ConnectionAttempt::single(target)).await;
        tracing::info!("Connecting to {} ({})", target.name, target.destination());

        let result = match self.prepare(target).await {
            Ok(window) => self.create(&target.name, &[window]).await,
            Err(e) => Err(e),
        };

        self.conclude(id, &target.name, &result).await;
        result
    }

    /// Launch one session named `group` with a window per member
    ///
    /// Every member is validated before anything is created; if any fails,
    /// all failures are reported together and no session is created.
    pub async fn launch_group(&self, group: &str, targets: &[Target]) -> Result<LaunchOutcome> {
        let id = begin_attempt(self.history.as_ref(), &ConnectionAttempt::group(group, targets)).await;
        tracing::info!("Connecting to group {} ({} members)", group, targets.len());

        let result = self.launch_group_inner(group, targets).await;

        self.conclude(id, group, &result).await;
        result
    }

    async fn launch_group_inner(&self, group: &str, targets: &[Target]) -> Result<LaunchOutcome> {
        if targets.is_empty() {
            return Err(CoreError::Configuration(format!("group '{}' has no members", group)));
        }

        let mut windows = Vec::with_capacity(targets.len());
        let mut failures = Vec::new();
        for target in targets {
            match self.prepare(target).await {
                Ok(window) => windows.push(window),
                Err(CoreError::UserCancelled) => return Err(CoreError::UserCancelled),
                Err(e) => {
                    tracing::warn!("Group {} member {} failed: {}", group, target.name, e);
                    failures.push(MemberFailure {
                        target: target.name.clone(),
                        cause: e.to_string(),
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(CoreError::GroupConnectivity {
                group: group.to_string(),
                failures,
            });
        }

        self.create(group, &windows).await
    }

    /// Resolve, validate and build the window for one target
    async fn prepare(&self, target: &Target) -> Result<WindowSpec> {
        let command = if target.is_plaintext_password() {
            // The client prompts in its own window
            self.prober.validate(target, &[]).await?;
            build_command(target, None, &self.options)
        } else {
            let methods = self.resolver.resolve(target).await?;
            if let ProbeOutcome::Verified(method) = self.prober.validate(target, &methods).await? {
                tracing::debug!("{} verified via {}", target.name, method);
            }
            let password = methods.iter().find_map(|m| match m {
                AuthMethod::Password(secret) => Some(secret),
                _ => None,
            });
            build_command(target, password, &self.options)
        };

        Ok(WindowSpec {
            title: target.name.clone(),
            command,
        })
    }

    async fn create(&self, name: &str, windows: &[WindowSpec]) -> Result<LaunchOutcome> {
        if !self.mux.available().await {
            return Err(CoreError::launch(name, "terminal multiplexer is not available"));
        }

        let (session_id, was_existing) = self
            .mux
            .create_or_attach(name, windows)
            .await
            .map_err(|e| match e {
                CoreError::Launch { .. } => e,
                other => CoreError::launch(name, other.to_string()),
            })?;

        if was_existing {
            tracing::info!("Session {} already exists, attaching", session_id);
        } else {
            tracing::info!("Created session {} with {} window(s)", session_id, windows.len());
        }

        Ok(LaunchOutcome {
            session_id,
            was_existing,
        })
    }

    async fn conclude(&self, id: Option<i64>, name: &str, result: &Result<LaunchOutcome>) {
        let outcome = match result {
            Ok(launched) => AttemptOutcome::success(&launched.session_id),
            Err(e) => {
                tracing::error!("Launch of {} failed: {}", name, e);
                AttemptOutcome::failure(e)
            }
        };
        finish_attempt(self.history.as_ref(), id, outcome).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialStore, MemoryCredentialStore, StaticPrompt};
    use crate::history::MemoryHistory;
    use crate::multiplexer::MockMultiplexer;
    use crate::probe::{MockProtocolClient, ProbeConfig};
    use crate::types::{AttemptKind, AttemptStatus};
    use crate::ErrorKind;
    use std::time::Duration;

    struct Fixture {
        client: MockProtocolClient,
        mux: MockMultiplexer,
        history: Arc<MemoryHistory>,
        store: MemoryCredentialStore,
        prompt: StaticPrompt,
        launcher: SessionLauncher,
    }

    fn fixture() -> Fixture {
        let client = MockProtocolClient::new();
        let mux = MockMultiplexer::new();
        let history = Arc::new(MemoryHistory::new());
        let store = MemoryCredentialStore::new();
        let prompt = StaticPrompt::answering("typed");

        let resolver = CredentialResolver::new(Arc::new(client.clone()))
            .with_store(Arc::new(store.clone()))
            .with_prompt(Arc::new(prompt.clone()));
        let prober = Prober::new(
            Arc::new(client.clone()),
            ProbeConfig {
                default_timeout: Duration::from_millis(200),
                test_timeout: Duration::from_secs(1),
            },
        );
        let launcher = SessionLauncher::new(
            Arc::new(resolver),
            Arc::new(prober),
            Arc::new(mux.clone()),
            history.clone(),
            LaunchOptions::default(),
        );

        Fixture {
            client,
            mux,
            history,
            store,
            prompt,
            launcher,
        }
    }

    fn key_target(name: &str, host: &str) -> Target {
        Target::new(name, host, "ops").with_key("/keys/id")
    }

    #[tokio::test]
    async fn test_launch_single_creates_then_attaches() {
        let f = fixture();
        f.client.set_delay(Duration::from_millis(2));
        let target = key_target("db1", "10.0.0.5");

        let first = f.launcher.launch_single(&target).await.unwrap();
        assert_eq!(first.session_id, "db1");
        assert!(!first.was_existing);

        let second = f.launcher.launch_single(&target).await.unwrap();
        assert_eq!(second.session_id, "db1");
        assert!(second.was_existing);
        assert_eq!(f.mux.create_count(), 1);

        let attempts = f.history.attempts().await;
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.status == AttemptStatus::Success));
        assert_eq!(attempts[0].session_id.as_deref(), Some("db1"));
        for attempt in &attempts {
            let end_time = attempt.end_time.unwrap();
            assert!(end_time > attempt.start_time);
            assert!(attempt.duration >= Duration::from_millis(2));
            assert!(attempt.error_message.is_none());
        }
    }

    #[tokio::test]
    async fn test_failed_probe_records_failure_and_creates_nothing() {
        let f = fixture();
        f.client.set_unreachable("10.0.0.5");

        let err = f.launcher.launch_single(&key_target("db1", "10.0.0.5")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert_eq!(f.mux.create_count(), 0);

        let attempts = f.history.attempts().await;
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert!(attempts[0].error_message.is_some());
    }

    #[tokio::test]
    async fn test_probe_timeout_recorded_as_timeout() {
        let f = fixture();
        f.client.set_delay(Duration::from_secs(2));

        let err = f.launcher.launch_single(&key_target("db1", "10.0.0.5")).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(f.history.attempts().await[0].status, AttemptStatus::Timeout);
    }

    #[tokio::test]
    async fn test_cancelled_prompt_recorded_as_cancelled() {
        let client = MockProtocolClient::new();
        let history = Arc::new(MemoryHistory::new());
        let resolver = CredentialResolver::new(Arc::new(client.clone()))
            .with_prompt(Arc::new(StaticPrompt::cancelling()));
        let launcher = SessionLauncher::new(
            Arc::new(resolver),
            Arc::new(Prober::new(Arc::new(client), ProbeConfig::default())),
            Arc::new(MockMultiplexer::new()),
            history.clone(),
            LaunchOptions::default(),
        );

        let target = key_target("db1", "10.0.0.5").with_passphrase();
        let err = launcher.launch_single(&target).await.unwrap_err();
        assert!(matches!(err, CoreError::UserCancelled));
        assert_eq!(history.attempts().await[0].status, AttemptStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_plaintext_password_skips_probe_and_prompt() {
        let f = fixture();
        f.client.set_unreachable("10.0.0.5");
        let target = Target::new("db1", "10.0.0.5", "ops").with_password(None);

        let outcome = f.launcher.launch_single(&target).await.unwrap();
        assert_eq!(outcome.session_id, "db1");
        assert_eq!(f.client.probe_count(), 0);
        assert_eq!(f.prompt.calls(), 0);

        let windows = f.mux.windows("db1");
        assert_eq!(windows[0].command.program, "ssh");
        assert!(windows[0].command.env.is_empty());
    }

    #[tokio::test]
    async fn test_store_backed_password_is_probed_and_fed_via_env() {
        let f = fixture();
        f.store.store("password-db1", &"s3cret".into()).await.unwrap();
        let target = Target::new("db1", "10.0.0.5", "ops").with_password(Some("password-db1".into()));

        f.launcher.launch_single(&target).await.unwrap();
        assert_eq!(f.client.probe_count(), 1);

        let command = &f.mux.windows("db1")[0].command;
        assert_eq!(command.program, "sshpass");
        assert_eq!(command.env[0].1.expose(), "s3cret");
    }

    #[tokio::test]
    async fn test_multiplexer_failure_is_launch_error() {
        let f = fixture();
        f.mux.set_fail_create(true);

        let err = f.launcher.launch_single(&key_target("db1", "10.0.0.5")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Launch);
        assert_eq!(f.history.attempts().await[0].status, AttemptStatus::Failed);
    }

    #[tokio::test]
    async fn test_multiplexer_unavailable() {
        let f = fixture();
        f.mux.set_available(false);
        let err = f.launcher.launch_single(&key_target("db1", "10.0.0.5")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Launch);
    }

    #[tokio::test]
    async fn test_recorder_failure_does_not_block_launch() {
        let f = fixture();
        f.history.set_failing(true).await;

        let outcome = f.launcher.launch_single(&key_target("db1", "10.0.0.5")).await.unwrap();
        assert_eq!(outcome.session_id, "db1");
        assert_eq!(f.mux.create_count(), 1);
    }

    #[tokio::test]
    async fn test_group_all_reachable_one_window_each() {
        let f = fixture();
        let members = vec![key_target("web1", "10.0.1.1"), key_target("web2", "10.0.1.2")];

        let outcome = f.launcher.launch_group("web", &members).await.unwrap();
        assert_eq!(outcome.session_id, "web");

        let titles: Vec<String> = f.mux.windows("web").into_iter().map(|w| w.title).collect();
        assert_eq!(titles, vec!["web1", "web2"]);

        let attempt = &f.history.attempts().await[0];
        assert_eq!(attempt.kind, AttemptKind::Group);
        assert_eq!(attempt.group_name.as_deref(), Some("web"));
        assert_eq!(attempt.host, "10.0.1.1,10.0.1.2");
        assert_eq!(attempt.status, AttemptStatus::Success);
    }

    #[tokio::test]
    async fn test_group_partial_failure_creates_nothing() {
        let f = fixture();
        f.client.set_unreachable("10.0.1.2");
        f.client.set_unreachable("10.0.1.3");
        let members = vec![
            key_target("web1", "10.0.1.1"),
            key_target("web2", "10.0.1.2"),
            key_target("web3", "10.0.1.3"),
        ];

        let err = f.launcher.launch_group("web", &members).await.unwrap_err();
        match &err {
            CoreError::GroupConnectivity { group, failures } => {
                assert_eq!(group, "web");
                let names: Vec<&str> = failures.iter().map(|m| m.target.as_str()).collect();
                assert_eq!(names, vec!["web2", "web3"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(f.mux.create_count(), 0);
        assert_eq!(f.history.attempts().await[0].status, AttemptStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_group_is_configuration_error() {
        let f = fixture();
        let err = f.launcher.launch_group("empty", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(f.mux.create_count(), 0);
    }
}
