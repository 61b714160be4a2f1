//! History recorder contract
//!
//! Attempts are recorded at the start of an orchestration and finished
//! exactly once. Health observations are append-only.

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::types::{AttemptFilter, AttemptOutcome, AttemptStats, ConnectionAttempt, HealthObservation};
use crate::{CoreError, Result};

/// Persistence for attempts and health observations
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    /// Persist a new attempt and return its id
    async fn record(&self, attempt: &ConnectionAttempt) -> Result<i64>;

    /// Apply the terminal outcome to attempt `id`
    ///
    /// Fails if the attempt is unknown or already finished.
    async fn finish(&self, id: i64, outcome: &AttemptOutcome) -> Result<()>;

    /// Matching attempts, newest first
    async fn query(&self, filter: &AttemptFilter) -> Result<Vec<ConnectionAttempt>>;

    async fn stats(&self, target: Option<&str>, group: Option<&str>) -> Result<AttemptStats>;

    async fn record_health(&self, observation: &HealthObservation) -> Result<()>;

    /// Latest observations for one session, newest first
    async fn health_history(&self, session_id: &str, limit: usize) -> Result<Vec<HealthObservation>>;

    /// Delete attempts and observations older than `age`; returns rows removed
    async fn purge_older_than(&self, age: Duration) -> Result<usize>;
}

/// Record an attempt, logging instead of failing
///
/// Returns `None` when the recorder rejected it; the attempt then goes unfinished.
pub(crate) async fn begin_attempt(history: &dyn HistoryRecorder, attempt: &ConnectionAttempt) -> Option<i64> {
    match history.record(attempt).await {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::warn!("Failed to record attempt for {}: {}", attempt.target_name, e);
            None
        }
    }
}

pub(crate) async fn finish_attempt(history: &dyn HistoryRecorder, id: Option<i64>, outcome: AttemptOutcome) {
    let Some(id) = id else { return };
    if let Err(e) = history.finish(id, &outcome).await {
        tracing::warn!("Failed to finish attempt {}: {}", id, e);
    }
}

/// Oldest timestamp kept by a purge of rows older than `age`
pub fn cutoff(age: Duration) -> Result<chrono::DateTime<Utc>> {
    let age = chrono::Duration::from_std(age)
        .map_err(|e| CoreError::Configuration(format!("retention window out of range: {}", e)))?;
    Utc::now()
        .checked_sub_signed(age)
        .ok_or_else(|| CoreError::Configuration("retention window out of range".to_string()))
}

#[derive(Default)]
struct MemoryHistoryState {
    attempts: Vec<ConnectionAttempt>,
    observations: Vec<HealthObservation>,
    next_id: i64,
    failing: bool,
}

/// In-memory recorder for tests
#[derive(Default)]
pub struct MemoryHistory {
    state: Mutex<MemoryHistoryState>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with a recorder error
    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    pub async fn attempts(&self) -> Vec<ConnectionAttempt> {
        self.state.lock().await.attempts.clone()
    }

    pub async fn observations(&self) -> Vec<HealthObservation> {
        self.state.lock().await.observations.clone()
    }

    fn check_writable(state: &MemoryHistoryState) -> Result<()> {
        if state.failing {
            Err(CoreError::Recorder("history store is read-only".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl HistoryRecorder for MemoryHistory {
    async fn record(&self, attempt: &ConnectionAttempt) -> Result<i64> {
        let mut state = self.state.lock().await;
        Self::check_writable(&state)?;
        state.next_id += 1;
        let mut stored = attempt.clone();
        stored.id = state.next_id;
        state.attempts.push(stored);
        Ok(state.next_id)
    }

    async fn finish(&self, id: i64, outcome: &AttemptOutcome) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::check_writable(&state)?;
        if !outcome.status.is_terminal() {
            return Err(CoreError::Recorder(format!(
                "cannot finish attempt {} with non-terminal status {}",
                id, outcome.status
            )));
        }
        let attempt = state
            .attempts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| CoreError::Recorder(format!("attempt {} not found", id)))?;
        if attempt.status.is_terminal() {
            return Err(CoreError::Recorder(format!(
                "attempt {} already finished as {}",
                id, attempt.status
            )));
        }
        attempt.complete(outcome);
        Ok(())
    }

    async fn query(&self, filter: &AttemptFilter) -> Result<Vec<ConnectionAttempt>> {
        let state = self.state.lock().await;
        let mut rows: Vec<ConnectionAttempt> = state
            .attempts
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn stats(&self, target: Option<&str>, group: Option<&str>) -> Result<AttemptStats> {
        let filter = AttemptFilter {
            target: target.map(str::to_string),
            group: group.map(str::to_string),
            ..Default::default()
        };
        let state = self.state.lock().await;
        Ok(AttemptStats::from_attempts(
            state.attempts.iter().filter(|a| filter.matches(a)),
        ))
    }

    async fn record_health(&self, observation: &HealthObservation) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::check_writable(&state)?;
        state.observations.push(observation.clone());
        Ok(())
    }

    async fn health_history(&self, session_id: &str, limit: usize) -> Result<Vec<HealthObservation>> {
        let state = self.state.lock().await;
        Ok(state
            .observations
            .iter()
            .rev()
            .filter(|o| o.session_id == session_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn purge_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = cutoff(age)?;
        let mut state = self.state.lock().await;
        Self::check_writable(&state)?;
        let before = state.attempts.len() + state.observations.len();
        state.attempts.retain(|a| a.start_time >= cutoff);
        state.observations.retain(|o| o.check_time >= cutoff);
        Ok(before - state.attempts.len() - state.observations.len())
    }
}
