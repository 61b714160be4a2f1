//! Connection attempt records and derived statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::Target;
use crate::CoreError;

/// Whether an attempt targeted one host or a named group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptKind {
    Single,
    Group,
}

impl AttemptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptKind::Single => "single",
            AttemptKind::Group => "group",
        }
    }
}

impl FromStr for AttemptKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(AttemptKind::Single),
            "group" => Ok(AttemptKind::Group),
            other => Err(CoreError::Recorder(format!("unknown attempt kind '{}'", other))),
        }
    }
}

/// Lifecycle status of an attempt
///
/// `Attempting` is the only non-terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Attempting,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Attempting => "attempting",
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Timeout => "timeout",
            AttemptStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::Attempting)
    }

    /// Terminal status for an attempt that ended with `err`
    pub fn from_error(err: &CoreError) -> Self {
        if err.is_timeout() {
            AttemptStatus::Timeout
        } else if matches!(err, CoreError::UserCancelled) {
            AttemptStatus::Cancelled
        } else {
            AttemptStatus::Failed
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attempting" => Ok(AttemptStatus::Attempting),
            "success" => Ok(AttemptStatus::Success),
            "failed" => Ok(AttemptStatus::Failed),
            "timeout" => Ok(AttemptStatus::Timeout),
            "cancelled" => Ok(AttemptStatus::Cancelled),
            other => Err(CoreError::Recorder(format!("unknown attempt status '{}'", other))),
        }
    }
}

/// One connection attempt, owned by the history recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionAttempt {
    /// Assigned by the recorder; 0 until recorded
    pub id: i64,
    pub target_name: String,
    pub group_name: Option<String>,
    pub host: String,
    pub user: String,
    pub port: u16,
    pub kind: AttemptKind,
    pub status: AttemptStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub error_message: Option<String>,
    pub session_id: Option<String>,
}

impl ConnectionAttempt {
    /// New single-host attempt in `attempting` state
    pub fn single(target: &Target) -> Self {
        Self {
            id: 0,
            target_name: target.name.clone(),
            group_name: None,
            host: target.host.clone(),
            user: target.username.clone(),
            port: target.port,
            kind: AttemptKind::Single,
            status: AttemptStatus::Attempting,
            start_time: Utc::now(),
            end_time: None,
            duration: Duration::ZERO,
            error_message: None,
            session_id: None,
        }
    }

    /// New group attempt; host and user list every member
    pub fn group(group_name: &str, targets: &[Target]) -> Self {
        let hosts: Vec<&str> = targets.iter().map(|t| t.host.as_str()).collect();
        let mut users: Vec<&str> = targets.iter().map(|t| t.username.as_str()).collect();
        users.dedup();
        Self {
            id: 0,
            target_name: group_name.to_string(),
            group_name: Some(group_name.to_string()),
            host: hosts.join(","),
            user: users.join(","),
            port: targets.first().map(|t| t.port).unwrap_or(super::DEFAULT_SSH_PORT),
            kind: AttemptKind::Group,
            status: AttemptStatus::Attempting,
            start_time: Utc::now(),
            end_time: None,
            duration: Duration::ZERO,
            error_message: None,
            session_id: None,
        }
    }

    /// Apply a terminal outcome; duration is derived from the timestamps
    pub fn complete(&mut self, outcome: &AttemptOutcome) {
        self.status = outcome.status;
        self.end_time = Some(outcome.end_time);
        self.duration = (outcome.end_time - self.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.error_message = outcome.error_message.clone();
        if outcome.session_id.is_some() {
            self.session_id = outcome.session_id.clone();
        }
    }
}

/// Terminal update applied to a recorded attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub end_time: DateTime<Utc>,
    pub status: AttemptStatus,
    pub error_message: Option<String>,
    pub session_id: Option<String>,
}

impl AttemptOutcome {
    pub fn success(session_id: impl Into<String>) -> Self {
        Self {
            end_time: Utc::now(),
            status: AttemptStatus::Success,
            error_message: None,
            session_id: Some(session_id.into()),
        }
    }

    /// Success with no session attached (explicit connection tests)
    pub fn verified() -> Self {
        Self {
            end_time: Utc::now(),
            status: AttemptStatus::Success,
            error_message: None,
            session_id: None,
        }
    }

    pub fn failure(err: &CoreError) -> Self {
        Self {
            end_time: Utc::now(),
            status: AttemptStatus::from_error(err),
            error_message: Some(err.to_string()),
            session_id: None,
        }
    }
}

/// Query over recorded attempts; `None` fields do not filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptFilter {
    pub target: Option<String>,
    pub group: Option<String>,
    pub status: Option<AttemptStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AttemptFilter {
    pub fn matches(&self, attempt: &ConnectionAttempt) -> bool {
        self.target.as_deref().map_or(true, |t| attempt.target_name == t)
            && self
                .group
                .as_deref()
                .map_or(true, |g| attempt.group_name.as_deref() == Some(g))
            && self.status.map_or(true, |s| attempt.status == s)
            && self.since.map_or(true, |s| attempt.start_time >= s)
    }
}

/// Aggregate over the attempts of one target or group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptStats {
    pub total: u64,
    pub succeeded: u64,
    pub success_rate: f64,
    pub avg_duration: Duration,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl AttemptStats {
    /// Fold a set of attempts; attempts still in flight count towards `total` only
    pub fn from_attempts<'a>(attempts: impl IntoIterator<Item = &'a ConnectionAttempt>) -> Self {
        let mut total = 0u64;
        let mut succeeded = 0u64;
        let mut finished = 0u32;
        let mut duration_sum = Duration::ZERO;
        let mut first: Option<DateTime<Utc>> = None;
        let mut last: Option<DateTime<Utc>> = None;

        for attempt in attempts {
            total += 1;
            if attempt.status == AttemptStatus::Success {
                succeeded += 1;
            }
            if attempt.status.is_terminal() {
                finished += 1;
                duration_sum += attempt.duration;
            }
            first = Some(first.map_or(attempt.start_time, |f| f.min(attempt.start_time)));
            last = Some(last.map_or(attempt.start_time, |l| l.max(attempt.start_time)));
        }

        Self {
            total,
            succeeded,
            success_rate: if total == 0 {
                0.0
            } else {
                succeeded as f64 / total as f64
            },
            avg_duration: if finished == 0 {
                Duration::ZERO
            } else {
                duration_sum / finished
            },
            first,
            last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(status: AttemptStatus, secs: u64) -> ConnectionAttempt {
        let target = Target::new("db1", "10.0.0.5", "ops");
        let mut a = ConnectionAttempt::single(&target);
        a.status = status;
        a.duration = Duration::from_secs(secs);
        a
    }

    #[test]
    fn test_status_from_error() {
        let timeout = CoreError::ProbeTimeout {
            target: "db1".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(AttemptStatus::from_error(&timeout), AttemptStatus::Timeout);
        assert_eq!(
            AttemptStatus::from_error(&CoreError::UserCancelled),
            AttemptStatus::Cancelled
        );
        assert_eq!(
            AttemptStatus::from_error(&CoreError::Configuration("x".into())),
            AttemptStatus::Failed
        );
    }

    #[test]
    fn test_complete_sets_duration() {
        let mut a = attempt(AttemptStatus::Attempting, 0);
        let mut outcome = AttemptOutcome::success("db1");
        outcome.end_time = a.start_time + chrono::Duration::milliseconds(1500);
        a.complete(&outcome);
        assert_eq!(a.status, AttemptStatus::Success);
        assert_eq!(a.duration, Duration::from_millis(1500));
        assert_eq!(a.session_id.as_deref(), Some("db1"));
    }

    #[test]
    fn test_group_attempt_lists_members() {
        let targets = vec![
            Target::new("web1", "10.0.0.1", "ops"),
            Target::new("web2", "10.0.0.2", "ops"),
        ];
        let a = ConnectionAttempt::group("web", &targets);
        assert_eq!(a.kind, AttemptKind::Group);
        assert_eq!(a.group_name.as_deref(), Some("web"));
        assert_eq!(a.host, "10.0.0.1,10.0.0.2");
        assert_eq!(a.user, "ops");
    }

    #[test]
    fn test_stats_fold() {
        let attempts = vec![
            attempt(AttemptStatus::Success, 2),
            attempt(AttemptStatus::Failed, 4),
            attempt(AttemptStatus::Attempting, 0),
        ];
        let stats = AttemptStats::from_attempts(&attempts);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.succeeded, 1);
        assert!((stats.success_rate - 1.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(stats.avg_duration, Duration::from_secs(3));
        assert!(stats.first.is_some());
    }

    #[test]
    fn test_empty_stats() {
        let stats = AttemptStats::from_attempts(&Vec::<ConnectionAttempt>::new());
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.last.is_none());
    }

    #[test]
    fn test_filter_matches() {
        let a = attempt(AttemptStatus::Failed, 1);
        let filter = AttemptFilter {
            target: Some("db1".into()),
            status: Some(AttemptStatus::Failed),
            ..Default::default()
        };
        assert!(filter.matches(&a));
        let group_filter = AttemptFilter {
            group: Some("web".into()),
            ..Default::default()
        };
        assert!(!group_filter.matches(&a));
    }
}
