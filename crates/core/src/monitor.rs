//! Periodic health monitoring of live multiplexer sessions
//!
//! The tracked set is shared between the monitor task and callers adding or
//! removing sessions. Multiplexer calls are made without holding the lock.

use chrono::Utc;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::history::HistoryRecorder;
use crate::multiplexer::Multiplexer;
use crate::types::{HealthObservation, HealthStatus, HealthSummary, SessionRecord};
use crate::{CoreError, Result};

/// Error recorded when a tracked session disappears
pub const SESSION_GONE: &str = "session no longer exists";

/// Monitor cadence and failure policy
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Consecutive failed probes before a session is reported `failed`
    pub failure_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_threshold: 3,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub evicted: Vec<String>,
}

pub struct HealthMonitor {
    mux: Arc<dyn Multiplexer>,
    history: Arc<dyn HistoryRecorder>,
    config: MonitorConfig,
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    stop_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl HealthMonitor {
    pub fn new(mux: Arc<dyn Multiplexer>, history: Arc<dyn HistoryRecorder>, config: MonitorConfig) -> Self {
        Self {
            mux,
            history,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            stop_tx: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Spawn the monitor task
    ///
    /// Runs a discovery pass, then ticks every `interval` until [`stop`](Self::stop)
    /// is called or `cancel` fires. Ticks never overlap.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, mut stop_rx) = oneshot::channel();
        if let Some(previous) = self.stop_slot().replace(tx) {
            let _ = previous.send(());
        }

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            match monitor.discover().await {
                Ok(n) => tracing::info!("Health monitor started, discovered {} session(s)", n),
                Err(e) => tracing::warn!("Session discovery failed: {}", e),
            }

            let period = monitor.config.interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.tick().await {
                            tracing::warn!("Health check tick failed: {}", e);
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("Health monitor stopped");
                        break;
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("Health monitor cancelled");
                        break;
                    }
                }
            }
        })
    }

    /// Signal the running task to exit after its current tick
    pub fn stop(&self) -> bool {
        match self.stop_slot().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    fn stop_slot(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.stop_tx.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start tracking a session; re-adding resets its record
    pub async fn add_session(&self, session_id: &str, target_name: &str) {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), SessionRecord::new(session_id, target_name));
        tracing::debug!("Tracking session {} for {}", session_id, target_name);
    }

    /// Stop tracking a session; no-op if it is not tracked
    pub async fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// Copies of every tracked record, ordered by session id
    pub async fn get_active_sessions(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self.sessions.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        records
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn is_tracked(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        for record in self.sessions.read().await.values() {
            summary.add(record.last_status);
        }
        summary
    }

    /// Track every live session not already tracked
    ///
    /// Discovered sessions use their own name as the target name.
    pub async fn discover(&self) -> Result<usize> {
        let names = self
            .mux
            .list_sessions()
            .await
            .map_err(|e| CoreError::MonitorTick(format!("listing sessions failed: {}", e)))?;

        let mut added = 0;
        for name in names {
            if self.is_tracked(&name).await {
                continue;
            }
            let created = match self.mux.session_info(&name).await {
                Ok(info) => info.created,
                Err(e) => {
                    tracing::debug!("No info for discovered session {}: {}", name, e);
                    None
                }
            };

            let mut record = SessionRecord::new(&name, &name);
            if let Some(created) = created {
                record.start_time = created;
            }
            if let Entry::Vacant(slot) = self.sessions.write().await.entry(name) {
                tracing::debug!("Discovered session {}", slot.key());
                slot.insert(record);
                added += 1;
            }
        }
        Ok(added)
    }

    /// One health check pass over every tracked session
    pub async fn tick(&self) -> Result<TickReport> {
        let live: HashSet<String> = self
            .mux
            .list_sessions()
            .await
            .map_err(|e| CoreError::MonitorTick(format!("listing sessions failed: {}", e)))?
            .into_iter()
            .collect();

        let (evicted, tracked) = {
            let mut sessions = self.sessions.write().await;
            let gone: Vec<String> = sessions.keys().filter(|id| !live.contains(*id)).cloned().collect();
            let evicted: Vec<SessionRecord> = gone.iter().filter_map(|id| sessions.remove(id)).collect();
            let tracked: Vec<String> = sessions.keys().cloned().collect();
            (evicted, tracked)
        };

        let mut report = TickReport::default();

        for record in evicted {
            tracing::info!("Session {} ({}) no longer exists", record.session_id, record.target_name);
            self.emit(&HealthObservation {
                check_time: Utc::now().max(record.last_check_time),
                status: HealthStatus::Failed,
                response_time: Duration::ZERO,
                error_message: Some(SESSION_GONE.to_string()),
                session_id: record.session_id.clone(),
                target_name: record.target_name,
            })
            .await;
            report.evicted.push(record.session_id);
        }

        for session_id in tracked {
            let started = Instant::now();
            let probe = self.mux.session_info(&session_id).await;
            let response_time = started.elapsed();

            let error = match probe {
                Ok(info) if info.window_count > 0 => None,
                Ok(_) => Some("session has no windows".to_string()),
                Err(e) => Some(e.to_string()),
            };

            let (observation, previous) = {
                let mut sessions = self.sessions.write().await;
                // Removed by a caller while we were probing
                let Some(record) = sessions.get_mut(&session_id) else {
                    continue;
                };
                let previous = record.last_status;
                if error.is_none() {
                    record.consecutive_failures = 0;
                    record.last_status = HealthStatus::Healthy;
                } else {
                    record.consecutive_failures += 1;
                    record.last_status = if record.consecutive_failures >= self.config.failure_threshold {
                        HealthStatus::Failed
                    } else {
                        HealthStatus::Degraded
                    };
                }
                record.last_check_time = Utc::now().max(record.last_check_time);

                (
                    HealthObservation {
                        session_id: session_id.clone(),
                        target_name: record.target_name.clone(),
                        check_time: record.last_check_time,
                        status: record.last_status,
                        response_time,
                        error_message: error,
                    },
                    previous,
                )
            };

            if observation.status != previous {
                match observation.status {
                    HealthStatus::Healthy => tracing::info!("Session {} is healthy", session_id),
                    status => tracing::warn!(
                        "Session {} is {}: {}",
                        session_id,
                        status,
                        observation.error_message.as_deref().unwrap_or("")
                    ),
                }
            }

            self.emit(&observation).await;
            report.checked += 1;
        }

        Ok(report)
    }

    async fn emit(&self, observation: &HealthObservation) {
        if let Err(e) = self.history.record_health(observation).await {
            tracing::warn!(
                "Failed to record health observation for {}: {}",
                observation.session_id,
                e
            );
        }
    }
}
