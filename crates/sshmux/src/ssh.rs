//! SSH handshake probes over libssh2
//!
//! Each probe opens its own TCP stream and session, authenticates once and
//! disconnects. libssh2 is blocking, so probes run on the blocking pool.

use async_trait::async_trait;
use ssh2::Session;
use sshmux_core::{AuthMethod, CoreError, ProtocolClient, Result};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// [`ProtocolClient`] backed by `ssh2`
#[derive(Debug, Clone, Default)]
pub struct Ssh2Client;

impl Ssh2Client {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProtocolClient for Ssh2Client {
    async fn probe(
        &self,
        host: &str,
        port: u16,
        user: &str,
        method: &AuthMethod,
        deadline: Duration,
    ) -> Result<()> {
        let host = host.to_string();
        let user = user.to_string();
        let method = method.clone();

        tokio::task::spawn_blocking(move || probe_blocking(&host, port, &user, &method, deadline))
            .await
            .map_err(|e| CoreError::Protocol(format!("probe task failed: {e}")))?
    }

    async fn agent_auth_method(&self) -> Option<AuthMethod> {
        let reachable = tokio::task::spawn_blocking(agent_has_identities)
            .await
            .unwrap_or(false);
        reachable.then_some(AuthMethod::Agent)
    }
}

/// Disconnects the session on every exit path
struct Disconnect(Session);

impl Drop for Disconnect {
    fn drop(&mut self) {
        let _ = self.0.disconnect(None, "probe complete", None);
    }
}

fn probe_blocking(host: &str, port: u16, user: &str, method: &AuthMethod, deadline: Duration) -> Result<()> {
    let started = Instant::now();
    let remaining = || deadline.saturating_sub(started.elapsed());
    if deadline.is_zero() {
        return Err(CoreError::Protocol("probe deadline already exhausted".to_string()));
    }

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| CoreError::Protocol(format!("resolve {}:{} failed: {}", host, port, e)))?
        .next()
        .ok_or_else(|| CoreError::Protocol(format!("no address for {}:{}", host, port)))?;

    let tcp = TcpStream::connect_timeout(&addr, remaining())
        .map_err(|e| CoreError::Protocol(format!("connect to {}:{} failed: {}", host, port, e)))?;
    tcp.set_read_timeout(Some(remaining().max(Duration::from_millis(1)))).ok();
    tcp.set_write_timeout(Some(remaining().max(Duration::from_millis(1)))).ok();

    let mut sess = Session::new().map_err(|e| CoreError::Protocol(format!("SSH session init failed: {e}")))?;
    sess.set_timeout(remaining().as_millis().clamp(1, u32::MAX as u128) as u32);
    sess.set_tcp_stream(tcp);
    sess.handshake()
        .map_err(|e| CoreError::Protocol(format!("SSH handshake failed: {e}")))?;
    let sess = Disconnect(sess);

    let auth = match method {
        AuthMethod::Password(secret) => sess.0.userauth_password(user, secret.expose()),
        AuthMethod::PublicKey { path, passphrase } => {
            sess.0
                .userauth_pubkey_file(user, None, path, passphrase.as_ref().map(|p| p.expose()))
        }
        AuthMethod::Agent => sess.0.userauth_agent(user),
    };
    auth.map_err(|e| CoreError::Protocol(format!("SSH authentication failed: {e}")))?;

    if !sess.0.authenticated() {
        return Err(CoreError::Protocol("SSH authentication failed".to_string()));
    }
    tracing::trace!("Probe {}@{}:{} authenticated via {}", user, host, port, method.label());
    Ok(())
}

fn agent_has_identities() -> bool {
    if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        return false;
    }
    let Ok(sess) = Session::new() else {
        return false;
    };
    let Ok(mut agent) = sess.agent() else {
        return false;
    };
    if agent.connect().is_err() {
        return false;
    }
    let has_identities = agent.list_identities().is_ok()
        && agent.identities().map(|ids| !ids.is_empty()).unwrap_or(false);
    let _ = agent.disconnect();
    has_identities
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_refused_connection_is_protocol_error() {
        let port = closed_port();
        let err = Ssh2Client::new()
            .probe("127.0.0.1", port, "ops", &AuthMethod::Agent, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
        assert!(err.to_string().contains("connect to 127.0.0.1"));
    }

    #[tokio::test]
    async fn test_zero_deadline_fails_fast() {
        let err = Ssh2Client::new()
            .probe("127.0.0.1", 22, "ops", &AuthMethod::Agent, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }

    #[tokio::test]
    async fn test_silent_server_fails_within_deadline() {
        // Accepts TCP but never speaks SSH
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let started = Instant::now();
        let result = Ssh2Client::new()
            .probe("127.0.0.1", port, "ops", &AuthMethod::Agent, Duration::from_millis(300))
            .await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(listener);
    }
}
