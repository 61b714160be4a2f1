//! Session health tracking types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::CoreError;

/// Health of a tracked multiplexer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Failed,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(HealthStatus::Unknown),
            "healthy" => Ok(HealthStatus::Healthy),
            "degraded" => Ok(HealthStatus::Degraded),
            "failed" => Ok(HealthStatus::Failed),
            other => Err(CoreError::Recorder(format!("unknown health status '{}'", other))),
        }
    }
}

/// In-memory record of one tracked session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub target_name: String,
    pub start_time: DateTime<Utc>,
    pub last_check_time: DateTime<Utc>,
    pub last_status: HealthStatus,
    pub consecutive_failures: u32,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, target_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            target_name: target_name.into(),
            start_time: now,
            last_check_time: now,
            last_status: HealthStatus::Unknown,
            consecutive_failures: 0,
        }
    }
}

/// Append-only result of one poll of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthObservation {
    pub session_id: String,
    pub target_name: String,
    pub check_time: DateTime<Utc>,
    pub status: HealthStatus,
    pub response_time: Duration,
    pub error_message: Option<String>,
}

/// Count of tracked sessions per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub unknown: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub failed: usize,
}

impl HealthSummary {
    pub fn add(&mut self, status: HealthStatus) {
        match status {
            HealthStatus::Unknown => self.unknown += 1,
            HealthStatus::Healthy => self.healthy += 1,
            HealthStatus::Degraded => self.degraded += 1,
            HealthStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.unknown + self.healthy + self.degraded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_unknown() {
        let record = SessionRecord::new("s1", "db1");
        assert_eq!(record.last_status, HealthStatus::Unknown);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.start_time, record.last_check_time);
    }

    #[test]
    fn test_status_parse() {
        for status in [
            HealthStatus::Unknown,
            HealthStatus::Healthy,
            HealthStatus::Degraded,
            HealthStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<HealthStatus>().unwrap(), status);
        }
        assert!("dead".parse::<HealthStatus>().is_err());
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = HealthSummary::default();
        summary.add(HealthStatus::Healthy);
        summary.add(HealthStatus::Healthy);
        summary.add(HealthStatus::Degraded);
        assert_eq!(summary.healthy, 2);
        assert_eq!(summary.degraded, 1);
        assert_eq!(summary.total(), 3);
    }
}
