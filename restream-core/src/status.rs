use chrono::Utc;

use crate::store::{JobStatus, SqliteStore, StoreResult};

/// Facts the derived job status is computed from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFacts {
    pub invalid: bool,
    pub has_running_session: bool,
    pub has_upcoming_schedule: bool,
    pub has_history: bool,
}

/// First match wins: invalid, running, planned, stopped, idle.
pub fn derive_job_status(facts: JobFacts) -> JobStatus {
    if facts.invalid {
        JobStatus::Invalid
    } else if facts.has_running_session {
        JobStatus::Running
    } else if facts.has_upcoming_schedule {
        JobStatus::Planned
    } else if facts.has_history {
        JobStatus::Stopped
    } else {
        JobStatus::Idle
    }
}

/// Recomputes and persists the job's status. Returns `None` when the job no
/// longer exists. `invalid_reason` is never touched here.
pub fn reconcile_job_status(store: &SqliteStore, job_id: &str) -> StoreResult<Option<JobStatus>> {
    let Some(job) = store.find_job(job_id)? else {
        return Ok(None);
    };
    let invalid = job.invalid_reason.is_some();
    let facts = JobFacts {
        invalid,
        has_running_session: !invalid && store.find_running_session_by_job(job_id)?.is_some(),
        has_upcoming_schedule: !invalid
            && store
                .find_next_enabled_schedule(job_id, Utc::now())?
                .is_some(),
        has_history: !invalid && store.job_has_history(job_id)?,
    };
    let status = derive_job_status(facts);
    if status != job.status {
        store.update_job_status(job_id, status)?;
    }
    Ok(Some(status))
}
