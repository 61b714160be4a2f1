//! Domain types for connection orchestration

mod attempt;
mod health;
mod secret;
mod target;

pub use attempt::{
    AttemptFilter, AttemptKind, AttemptOutcome, AttemptStats, AttemptStatus, ConnectionAttempt,
};
pub use health::{HealthObservation, HealthStatus, HealthSummary, SessionRecord};
pub use secret::SecretString;
pub use target::{AuthKind, Target, DEFAULT_SSH_PORT};
