//! tmux-backed [`Multiplexer`]
//!
//! Every operation shells out to the `tmux` client. Session names are
//! sanitized the way tmux itself would (`.` and `:` become `_`) so the
//! returned session id is the name tmux actually uses.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sshmux_core::{CoreError, Multiplexer, Result, SessionInfo, WindowSpec};
use std::process::{Output, Stdio};
use tokio::process::Command;

const SESSION_FORMAT: &str = "#{session_name}\t#{session_created}\t#{session_windows}";

pub struct TmuxMultiplexer {
    program: String,
}

impl TmuxMultiplexer {
    pub fn new() -> Self {
        Self::with_program("tmux")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<Output> {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CoreError::Multiplexer(format!("failed to run {}: {}", self.program, e)))
    }

    async fn run_checked(&self, args: &[String]) -> Result<String> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(CoreError::Multiplexer(format!(
                "{} {} failed: {}",
                self.program,
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn has_session(&self, name: &str) -> Result<bool> {
        let output = self
            .run(&["has-session".to_string(), "-t".to_string(), exact(name)])
            .await?;
        Ok(output.status.success())
    }

    /// Every live session with its info, in tmux order
    async fn sessions(&self) -> Result<Vec<(String, SessionInfo)>> {
        let output = self
            .run(&["list-sessions".to_string(), "-F".to_string(), SESSION_FORMAT.to_string()])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_no_server(&stderr) {
                return Ok(Vec::new());
            }
            return Err(CoreError::Multiplexer(format!(
                "list-sessions failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_session_line)
            .collect())
    }
}

impl Default for TmuxMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn create_or_attach(&self, name: &str, windows: &[WindowSpec]) -> Result<(String, bool)> {
        let session = session_name(name);
        if self.has_session(&session).await? {
            tracing::debug!("tmux session {} exists", session);
            return Ok((session, true));
        }

        let (first, rest) = windows
            .split_first()
            .ok_or_else(|| CoreError::launch(&session, "no windows to open"))?;

        self.run_checked(&new_session_args(&session, first)).await?;
        for window in rest {
            if let Err(e) = self.run_checked(&new_window_args(&session, window)).await {
                // Leave nothing half-built behind
                let _ = self
                    .run(&["kill-session".to_string(), "-t".to_string(), exact(&session)])
                    .await;
                return Err(e);
            }
        }

        tracing::debug!("tmux session {} created with {} window(s)", session, windows.len());
        Ok((session, false))
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self.sessions().await?.into_iter().map(|(name, _)| name).collect())
    }

    async fn session_info(&self, name: &str) -> Result<SessionInfo> {
        self.sessions()
            .await?
            .into_iter()
            .find(|(session, _)| session == name)
            .map(|(_, info)| info)
            .ok_or_else(|| CoreError::Multiplexer(format!("can't find session: {}", name)))
    }

    async fn attach(&self, name: &str) -> Result<()> {
        let verb = if std::env::var_os("TMUX").is_some() {
            "switch-client"
        } else {
            "attach-session"
        };
        let status = Command::new(&self.program)
            .args([verb, "-t", exact(name).as_str()])
            .status()
            .await
            .map_err(|e| CoreError::Multiplexer(format!("failed to run {}: {}", self.program, e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(CoreError::Multiplexer(format!("{} to {} exited with {}", verb, name, status)))
        }
    }

    async fn available(&self) -> bool {
        match self.run(&["-V".to_string()]).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                tracing::debug!("{} unavailable: {}", self.program, e);
                false
            }
        }
    }
}

/// Name tmux will actually give a session called `name`
pub fn session_name(name: &str) -> String {
    name.replace(['.', ':'], "_")
}

/// Exact-match session target
fn exact(name: &str) -> String {
    format!("={}", name)
}

fn env_args(window: &WindowSpec) -> Vec<String> {
    window
        .command
        .env
        .iter()
        .flat_map(|(key, value)| ["-e".to_string(), format!("{}={}", key, value.expose())])
        .collect()
}

fn new_session_args(session: &str, window: &WindowSpec) -> Vec<String> {
    let mut args = vec![
        "new-session".to_string(),
        "-d".to_string(),
        "-s".to_string(),
        session.to_string(),
        "-n".to_string(),
        window.title.clone(),
    ];
    args.extend(env_args(window));
    args.push(window.command.to_shell_string());
    args
}

fn new_window_args(session: &str, window: &WindowSpec) -> Vec<String> {
    let mut args = vec![
        "new-window".to_string(),
        "-t".to_string(),
        format!("{}:", exact(session)),
        "-n".to_string(),
        window.title.clone(),
    ];
    args.extend(env_args(window));
    args.push(window.command.to_shell_string());
    args
}

fn parse_session_line(line: &str) -> Option<(String, SessionInfo)> {
    let mut parts = line.split('\t');
    let name = parts.next()?.to_string();
    let created = parts
        .next()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    let window_count = parts.next()?.trim().parse().ok()?;
    Some((name, SessionInfo { created, window_count }))
}

/// tmux answered that no server (and so no session) exists
///
/// A socket that is missing or refuses connections means no server; any
/// other connect error leaves the live set unknown.
fn is_no_server(stderr: &str) -> bool {
    if stderr.contains("no server running") || stderr.contains("no sessions") {
        return true;
    }
    stderr.contains("error connecting to")
        && (stderr.contains("(No such file or directory)") || stderr.contains("(Connection refused)"))
}
