//! Periodic scan that turns due schedules into sessions and ends sessions
//! whose window has closed.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerSection;
use crate::events::{EventKind, EventRecorder, EventScope};
use crate::runner::{mark_session_stopped, RunnerError, RunnerHandle};
use crate::service::{
    JobService, RunNowOptions, ServiceError, EXCEEDS_ASSET_DURATION, OPEN_ENDED_REQUIRES_LOOP,
};
use crate::status::reconcile_job_status;
use crate::store::{Schedule, SqliteStore, StoreError};
use crate::time::to_db_timestamp;

pub const SCHEDULE_END: &str = "schedule_end";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<String>,
    pub blocked: Vec<String>,
    pub expired: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    store: SqliteStore,
    service: JobService,
    recorder: EventRecorder,
    runner: Option<RunnerHandle>,
    config: SchedulerSection,
}

impl Scheduler {
    pub fn new(
        store: SqliteStore,
        service: JobService,
        recorder: EventRecorder,
        runner: Option<RunnerHandle>,
        config: SchedulerSection,
    ) -> Self {
        Self {
            store,
            service,
            recorder,
            runner,
            config,
        }
    }

    /// Ticks until `shutdown` fires or its sender is dropped.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(target: "scheduler", poll = ?self.config.poll_interval(), "scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report != TickReport::default() => {
                            debug!(target: "scheduler", fired = report.fired.len(), blocked = report.blocked.len(), expired = report.expired.len(), "tick");
                        }
                        Ok(_) => {}
                        Err(err) => error!(target: "scheduler", error = %err, "scheduler tick failed"),
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        info!(target: "scheduler", "scheduler stopped");
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        let mut report = TickReport::default();
        for schedule in self.store.list_due_schedules(now)? {
            match self.fire(&schedule) {
                Ok(true) => report.fired.push(schedule.id),
                Ok(false) => report.blocked.push(schedule.id),
                Err(err) => {
                    error!(target: "scheduler", schedule_id = %schedule.id, error = %err, "failed to fire schedule");
                    self.blocked(&schedule, &err.to_string());
                    report.blocked.push(schedule.id);
                }
            }
        }
        report.expired = self.stop_expired(now).await?;
        Ok(report)
    }

    /// Creates the session for a due schedule. Returns `false` when blocked.
    fn fire(&self, schedule: &Schedule) -> SchedulerResult<bool> {
        let Some(job) = self.store.find_job(&schedule.job_id)? else {
            return Ok(false);
        };
        if let Some(reason) = job.invalid_reason.as_deref() {
            self.blocked(schedule, &format!("Job invalid: {reason}"));
            return Ok(false);
        }
        let options = RunNowOptions {
            start_at_override: Some(schedule.start_at),
            end_at: schedule.end_at.map(to_db_timestamp),
            duration_minutes: None,
            timezone: Some(schedule.timezone.clone()),
            schedule_id: Some(schedule.id.clone()),
        };
        match self.service.run_now(&job.id, options) {
            Ok(session) => {
                info!(target: "scheduler", schedule_id = %schedule.id, job_id = %job.id, session_id = %session.id, "schedule fired");
                reconcile_job_status(&self.store, &job.id)?;
                Ok(true)
            }
            // Timing rejections already invalidated the job and recorded the block.
            Err(ServiceError::Validation(reason))
                if reason == OPEN_ENDED_REQUIRES_LOOP || reason == EXCEEDS_ASSET_DURATION =>
            {
                warn!(target: "scheduler", schedule_id = %schedule.id, reason = %reason, "schedule blocked");
                Ok(false)
            }
            Err(err) => {
                self.blocked(schedule, &err.to_string());
                Ok(false)
            }
        }
    }

    fn blocked(&self, schedule: &Schedule, reason: &str) {
        warn!(target: "scheduler", schedule_id = %schedule.id, job_id = %schedule.job_id, reason, "schedule blocked");
        self.recorder.record(
            EventKind::SessionBlocked,
            reason,
            EventScope::job(&schedule.job_id).with_schedule(Some(&schedule.id)),
            None,
        );
    }

    async fn stop_expired(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<String>> {
        let mut expired = Vec::new();
        for session in self.store.find_running_sessions()? {
            if !session.window_closed(now) {
                continue;
            }
            match &self.runner {
                Some(runner) => {
                    runner.stop_job(&session.job_id, SCHEDULE_END).await?;
                }
                None => mark_session_stopped(&self.store, &self.recorder, &session, SCHEDULE_END)?,
            }
            reconcile_job_status(&self.store, &session.job_id)?;
            expired.push(session.id);
        }
        Ok(expired)
    }
}
