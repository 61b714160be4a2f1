//! Client command construction for multiplexer windows

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use crate::types::{AuthKind, SecretString, Target, DEFAULT_SSH_PORT};

/// Environment variable `sshpass -e` reads the password from
pub const PASSWORD_ENV: &str = "SSHPASS";

/// How launched client commands are built
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOptions {
    pub ssh_program: String,
    /// `ServerAliveInterval`; zero disables keepalives
    pub keepalive_interval: Duration,
    pub keepalive_count_max: u32,
    /// Non-interactive password feeder used for store-backed passwords
    pub password_helper: String,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            keepalive_interval: Duration::from_secs(30),
            keepalive_count_max: 3,
            password_helper: "sshpass".to_string(),
        }
    }
}

/// A program, its arguments and secret environment
///
/// Secrets travel in `env` only, never in `args`.
#[derive(Clone, PartialEq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, SecretString)>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: SecretString) -> Self {
        self.env.push((key.into(), value));
        self
    }

    /// Program and arguments quoted for `sh -c`
    pub fn to_shell_string(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| shell_escape::escape(Cow::Borrowed(part.as_str())))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field(
                "env",
                &self.env.iter().map(|(k, _)| (k.as_str(), "***")).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Build the client command for `target`
///
/// With a `password` for a store-backed target the client runs under the
/// password helper; otherwise the client prompts interactively.
pub fn build_command(target: &Target, password: Option<&SecretString>, options: &LaunchOptions) -> LaunchCommand {
    let mut args = Vec::new();

    if target.port != DEFAULT_SSH_PORT {
        args.push("-p".to_string());
        args.push(target.port.to_string());
    }

    if target.auth_kind == AuthKind::Key {
        if let Some(path) = &target.key_path {
            args.push("-i".to_string());
            args.push(path.display().to_string());
        }
    }

    let interval = options.keepalive_interval.as_secs();
    if interval > 0 {
        args.push("-o".to_string());
        args.push(format!("ServerAliveInterval={}", interval));
        args.push("-o".to_string());
        args.push(format!("ServerAliveCountMax={}", options.keepalive_count_max));
    }

    args.push(target.destination());

    match password {
        Some(secret) if target.is_store_backed() => {
            let mut helper_args = vec!["-e".to_string(), options.ssh_program.clone()];
            helper_args.extend(args);
            LaunchCommand::new(&options.password_helper, helper_args).with_env(PASSWORD_ENV, secret.clone())
        }
        _ => LaunchCommand::new(&options.ssh_program, args),
    }
}
