//! Connectivity probing with a hard per-probe deadline
//!
//! A probe opens a transport, authenticates, and tears everything down again.
//! It never leaves a session behind for reuse.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::credential::AuthMethod;
use crate::types::Target;
use crate::{CoreError, Result};

/// Network/protocol collaborator performing the actual handshake
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Connect and authenticate with one method within `deadline`
    ///
    /// Implementations must close the transport on every exit path.
    async fn probe(
        &self,
        host: &str,
        port: u16,
        user: &str,
        method: &AuthMethod,
        deadline: Duration,
    ) -> Result<()>;

    /// Agent-backed method, or `None` when no agent is reachable
    async fn agent_auth_method(&self) -> Option<AuthMethod>;
}

/// Probe deadlines
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// Deadline for probes on the connect path
    pub default_timeout: Duration,
    /// Deadline for explicit user-invoked tests
    pub test_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            test_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of opportunistic validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Authenticated with the named method
    Verified(&'static str),
    /// Not probed; counts as success without verification
    Skipped,
}

/// Tries auth methods in order until one authenticates
pub struct Prober {
    client: Arc<dyn ProtocolClient>,
    config: ProbeConfig,
}

impl Prober {
    pub fn new(client: Arc<dyn ProtocolClient>, config: ProbeConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe `target` with `methods` in order, stopping at the first success
    ///
    /// Returns the label of the method that authenticated.
    pub async fn probe(
        &self,
        target: &Target,
        methods: &[AuthMethod],
        deadline: Duration,
    ) -> Result<&'static str> {
        if methods.is_empty() {
            return Err(CoreError::Connectivity {
                target: target.name.clone(),
                causes: vec!["no authentication methods to offer".to_string()],
            });
        }

        let started = Instant::now();
        let attempt = async {
            let mut causes = Vec::with_capacity(methods.len());
            for method in methods {
                let remaining = deadline.saturating_sub(started.elapsed());
                match self
                    .client
                    .probe(&target.host, target.port, &target.username, method, remaining)
                    .await
                {
                    Ok(()) => {
                        tracing::debug!(
                            "Probe of {} succeeded with {} in {:?}",
                            target.name,
                            method.label(),
                            started.elapsed()
                        );
                        return Ok(method.label());
                    }
                    Err(e) => {
                        tracing::debug!("Probe of {} with {} failed: {}", target.name, method.label(), e);
                        causes.push(format!("{}: {}", method.label(), e));
                    }
                }
            }
            Err(CoreError::Connectivity {
                target: target.name.clone(),
                causes,
            })
        };

        match tokio::time::timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Probe of {} timed out after {:?}", target.name, deadline);
                Err(CoreError::ProbeTimeout {
                    target: target.name.clone(),
                    timeout: deadline,
                })
            }
        }
    }

    /// Opportunistic check used on the connect path
    ///
    /// Plaintext-password targets are not probed so automated flows never
    /// prompt; store-backed passwords are always probed.
    pub async fn validate(&self, target: &Target, methods: &[AuthMethod]) -> Result<ProbeOutcome> {
        if target.is_plaintext_password() {
            tracing::debug!("Skipping probe of plaintext-password target {}", target.name);
            return Ok(ProbeOutcome::Skipped);
        }
        self.probe(target, methods, self.config.default_timeout)
            .await
            .map(ProbeOutcome::Verified)
    }

    /// Explicit user-invoked test with the long deadline; always probes
    pub async fn test(&self, target: &Target, methods: &[AuthMethod]) -> Result<&'static str> {
        self.probe(target, methods, self.config.test_timeout).await
    }
}

#[derive(Default)]
struct MockClientState {
    unreachable: HashSet<String>,
    rejected: HashSet<(String, &'static str)>,
    agent: bool,
    delay: Option<Duration>,
    probes: Vec<(String, &'static str)>,
}

/// Scriptable protocol client for tests
///
/// Every host is reachable and every method accepted unless configured otherwise.
#[derive(Clone, Default)]
pub struct MockProtocolClient {
    state: Arc<Mutex<MockClientState>>,
}

impl MockProtocolClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockClientState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_unreachable(&self, host: &str) {
        self.state().unreachable.insert(host.to_string());
    }

    pub fn set_reachable(&self, host: &str) {
        self.state().unreachable.remove(host);
    }

    /// Reject one method label (`password`, `publickey`, `agent`) for a host
    pub fn reject_method(&self, host: &str, label: &'static str) {
        self.state().rejected.insert((host.to_string(), label));
    }

    pub fn set_agent_available(&self, available: bool) {
        self.state().agent = available;
    }

    /// Make every probe take at least `delay`
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    /// `(host, method label)` for every probe made so far
    pub fn probes(&self) -> Vec<(String, &'static str)> {
        self.state().probes.clone()
    }

    pub fn probe_count(&self) -> usize {
        self.state().probes.len()
    }
}

#[async_trait]
impl ProtocolClient for MockProtocolClient {
    async fn probe(
        &self,
        host: &str,
        port: u16,
        _user: &str,
        method: &AuthMethod,
        _deadline: Duration,
    ) -> Result<()> {
        let (delay, unreachable, rejected) = {
            let mut state = self.state();
            state.probes.push((host.to_string(), method.label()));
            (
                state.delay,
                state.unreachable.contains(host),
                state.rejected.contains(&(host.to_string(), method.label())),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(CoreError::Protocol(format!(
                "connect to {}:{} failed: connection refused",
                host, port
            )));
        }
        if rejected {
            return Err(CoreError::Protocol("authentication rejected".to_string()));
        }
        Ok(())
    }

    async fn agent_auth_method(&self) -> Option<AuthMethod> {
        if self.state().agent {
            Some(AuthMethod::Agent)
        } else {
            None
        }
    }
}
