//! sshmux core - connection orchestration and session health
//!
//! This crate provides:
//! - Domain types (targets, attempts, health records)
//! - Credential resolution against a store and an interactive prompt
//! - Connectivity probing with hard deadlines
//! - Session launching into a terminal multiplexer
//! - History recording contract and periodic health monitoring
//!
//! Network, multiplexer, prompt and persistence collaborators are traits;
//! the binary crate provides the real implementations.

pub mod credential;
pub mod error;
pub mod history;
pub mod launcher;
pub mod manager;
pub mod monitor;
pub mod multiplexer;
pub mod probe;
pub mod types;

// Re-export common types
pub use credential::{
    AuthMethod, CredentialResolver, CredentialStore, MemoryCredentialStore, Prompt, SecretKind,
    SecretManager, StaticPrompt,
};
pub use error::{CoreError, ErrorKind, MemberFailure, Result};
pub use history::{HistoryRecorder, MemoryHistory};
pub use launcher::{LaunchCommand, LaunchOptions, LaunchOutcome, SessionLauncher};
pub use manager::{ConnectionManager, ManagerConfig};
pub use monitor::{HealthMonitor, MonitorConfig, TickReport};
pub use multiplexer::{MockMultiplexer, Multiplexer, SessionInfo, WindowSpec};
pub use probe::{MockProtocolClient, ProbeConfig, ProbeOutcome, Prober, ProtocolClient};
pub use types::{
    AttemptFilter, AttemptKind, AttemptOutcome, AttemptStats, AttemptStatus, AuthKind,
    ConnectionAttempt, HealthObservation, HealthStatus, HealthSummary, SecretString, SessionRecord,
    Target,
};

/// Default retention window for history rows, in days
pub const DEFAULT_RETENTION_DAYS: u64 = 90;
