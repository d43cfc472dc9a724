use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use uuid::Uuid;

use crate::sqlite::configure_connection;
use crate::time::{now_db_timestamp, to_db_timestamp};

use super::models::{
    Asset, Destination, Event, Job, JobStatus, NewAsset, NewDestination, NewEvent, NewJob,
    NewPreset, NewSchedule, NewSession, Preset, Schedule, Session, SessionStatus,
};
use super::{StoreError, StoreResult};

/// Stop reason written when the runner itself shuts down.
pub const SHUTDOWN_STOP_REASON: &str = "shutdown";

const RESTREAM_SCHEMA: &str = include_str!("../../../sql/restream.sql");

const ACTIVE_SESSION_FOR_SCHEDULE: &str = "EXISTS (
    SELECT 1 FROM sessions
    WHERE sessions.schedule_id = schedules.id
      AND sessions.status IN ('pending', 'running')
)";

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn opt_timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(to_db_timestamp)
}

#[derive(Debug, Clone)]
pub struct SqliteStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        Ok(SqliteStore { path, flags })
    }
}

/// Single source of truth for assets, jobs, schedules, sessions and events.
/// Every call opens its own connection, so the store is cheap to clone and
/// safe to share between the runner, the scheduler and CLI invocations.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteStore {
    pub fn builder() -> SqliteStoreBuilder {
        SqliteStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(RESTREAM_SCHEMA)?;
        Ok(())
    }

    // Assets ---------------------------------------------------------------

    pub fn create_asset(&self, asset: &NewAsset) -> StoreResult<Asset> {
        let conn = self.open()?;
        let id = new_id();
        let kind = if asset.kind.is_empty() {
            "video"
        } else {
            asset.kind.as_str()
        };
        conn.execute(
            "INSERT INTO assets (id, kind, filename, path, size_bytes, status, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'ready', ?6, ?7)",
            params![
                &id,
                kind,
                &asset.filename,
                &asset.path,
                asset.size_bytes,
                &asset.metadata_json,
                now_db_timestamp(),
            ],
        )?;
        self.find_asset(&id)?.ok_or(StoreError::NotFound {
            entity: "asset",
            id,
        })
    }

    pub fn find_asset(&self, id: &str) -> StoreResult<Option<Asset>> {
        let conn = self.open()?;
        let asset = conn
            .query_row("SELECT * FROM assets WHERE id = ?1", params![id], |row| {
                Asset::from_row(row)
            })
            .optional()?;
        Ok(asset)
    }

    pub fn list_assets(&self) -> StoreResult<Vec<Asset>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM assets ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], Asset::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn delete_asset(&self, id: &str) -> StoreResult<bool> {
        let conn = self.open()?;
        Ok(conn.execute("DELETE FROM assets WHERE id = ?1", params![id])? > 0)
    }

    // Destinations ---------------------------------------------------------

    pub fn create_destination(&self, destination: &NewDestination) -> StoreResult<Destination> {
        let conn = self.open()?;
        let id = new_id();
        conn.execute(
            "INSERT INTO destinations (id, name, platform, stream_url, stream_key_enc, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &id,
                &destination.name,
                destination.platform.as_deref().unwrap_or("youtube"),
                &destination.stream_url,
                &destination.stream_key_enc,
                now_db_timestamp(),
            ],
        )?;
        self.find_destination(&id)?.ok_or(StoreError::NotFound {
            entity: "destination",
            id,
        })
    }

    pub fn find_destination(&self, id: &str) -> StoreResult<Option<Destination>> {
        let conn = self.open()?;
        let destination = conn
            .query_row(
                "SELECT * FROM destinations WHERE id = ?1",
                params![id],
                Destination::from_row,
            )
            .optional()?;
        Ok(destination)
    }

    pub fn list_destinations(&self) -> StoreResult<Vec<Destination>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM destinations ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], Destination::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn delete_destination(&self, id: &str) -> StoreResult<bool> {
        let conn = self.open()?;
        Ok(conn.execute("DELETE FROM destinations WHERE id = ?1", params![id])? > 0)
    }

    // Presets --------------------------------------------------------------

    pub fn create_preset(&self, preset: &NewPreset) -> StoreResult<Preset> {
        let conn = self.open()?;
        let id = new_id();
        conn.execute(
            "INSERT INTO presets (id, name, video_codec, audio_codec, remux_enabled, force_encode, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &id,
                &preset.name,
                &preset.video_codec,
                &preset.audio_codec,
                preset.remux_enabled as i64,
                preset.force_encode as i64,
                now_db_timestamp(),
            ],
        )?;
        self.find_preset(&id)?.ok_or(StoreError::NotFound {
            entity: "preset",
            id,
        })
    }

    pub fn find_preset(&self, id: &str) -> StoreResult<Option<Preset>> {
        let conn = self.open()?;
        let preset = conn
            .query_row(
                "SELECT * FROM presets WHERE id = ?1",
                params![id],
                Preset::from_row,
            )
            .optional()?;
        Ok(preset)
    }

    pub fn list_presets(&self) -> StoreResult<Vec<Preset>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM presets ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], Preset::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn delete_preset(&self, id: &str) -> StoreResult<bool> {
        let conn = self.open()?;
        Ok(conn.execute("DELETE FROM presets WHERE id = ?1", params![id])? > 0)
    }

    // Jobs -----------------------------------------------------------------

    pub fn create_job(&self, job: &NewJob) -> StoreResult<Job> {
        let conn = self.open()?;
        let id = new_id();
        let now = now_db_timestamp();
        conn.execute(
            "INSERT INTO jobs (
                id, name, video_asset_id, destination_id, preset_id, loop_enabled,
                crossfade_seconds, status, invalid_reason, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'idle', NULL, ?8, ?8)",
            params![
                &id,
                &job.name,
                &job.video_asset_id,
                &job.destination_id,
                &job.preset_id,
                job.loop_enabled as i64,
                job.crossfade_seconds,
                now,
            ],
        )?;
        self.find_job(&id)?
            .ok_or(StoreError::NotFound { entity: "job", id })
    }

    pub fn find_job(&self, id: &str) -> StoreResult<Option<Job>> {
        let conn = self.open()?;
        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], Job::from_row)
            .optional()?;
        Ok(job)
    }

    pub fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], Job::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Writes every mutable column of the job and bumps `updated_at`.
    pub fn update_job(&self, job: &Job) -> StoreResult<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE jobs SET
                name = ?2,
                video_asset_id = ?3,
                destination_id = ?4,
                preset_id = ?5,
                loop_enabled = ?6,
                crossfade_seconds = ?7,
                status = ?8,
                invalid_reason = ?9,
                updated_at = ?10
             WHERE id = ?1",
            params![
                &job.id,
                &job.name,
                &job.video_asset_id,
                &job.destination_id,
                &job.preset_id,
                job.loop_enabled as i64,
                job.crossfade_seconds,
                job.status.as_str(),
                &job.invalid_reason,
                now_db_timestamp(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "job",
                id: job.id.clone(),
            });
        }
        Ok(())
    }

    /// Sets the derived status only; `invalid_reason` is left as it is.
    pub fn update_job_status(&self, id: &str, status: JobStatus) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now_db_timestamp()],
        )?;
        Ok(())
    }

    pub fn mark_job_invalid(&self, id: &str, reason: &str) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE jobs SET status = 'invalid', invalid_reason = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, reason, now_db_timestamp()],
        )?;
        Ok(())
    }

    pub fn jobs_by_asset(&self, asset_id: &str) -> StoreResult<Vec<Job>> {
        self.jobs_where("video_asset_id", asset_id)
    }

    pub fn jobs_by_destination(&self, destination_id: &str) -> StoreResult<Vec<Job>> {
        self.jobs_where("destination_id", destination_id)
    }

    pub fn jobs_by_preset(&self, preset_id: &str) -> StoreResult<Vec<Job>> {
        self.jobs_where("preset_id", preset_id)
    }

    fn jobs_where(&self, column: &'static str, value: &str) -> StoreResult<Vec<Job>> {
        let conn = self.open()?;
        let sql = format!("SELECT * FROM jobs WHERE {column} = ?1 ORDER BY created_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![value], Job::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn count_jobs_by_status(&self) -> StoreResult<HashMap<JobStatus, i64>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut counts = HashMap::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            if let Ok(status) = status.parse::<JobStatus>() {
                counts.insert(status, count);
            }
        }
        Ok(counts)
    }

    // Schedules ------------------------------------------------------------

    pub fn create_schedule(&self, schedule: &NewSchedule) -> StoreResult<Schedule> {
        let conn = self.open()?;
        let id = new_id();
        conn.execute(
            "INSERT INTO schedules (id, job_id, start_at, end_at, timezone, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &id,
                &schedule.job_id,
                to_db_timestamp(schedule.start_at),
                opt_timestamp(schedule.end_at),
                &schedule.timezone,
                schedule.enabled as i64,
                now_db_timestamp(),
            ],
        )?;
        self.find_schedule(&id)?.ok_or(StoreError::NotFound {
            entity: "schedule",
            id,
        })
    }

    pub fn find_schedule(&self, id: &str) -> StoreResult<Option<Schedule>> {
        let conn = self.open()?;
        let schedule = conn
            .query_row(
                "SELECT * FROM schedules WHERE id = ?1",
                params![id],
                Schedule::from_row,
            )
            .optional()?;
        Ok(schedule)
    }

    pub fn list_schedules(&self) -> StoreResult<Vec<Schedule>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM schedules ORDER BY start_at DESC")?;
        let rows = stmt.query_map([], Schedule::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn list_schedules_for_job(&self, job_id: &str) -> StoreResult<Vec<Schedule>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM schedules WHERE job_id = ?1 ORDER BY start_at DESC")?;
        let rows = stmt.query_map(params![job_id], Schedule::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn update_schedule(&self, schedule: &Schedule) -> StoreResult<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE schedules SET start_at = ?2, end_at = ?3, timezone = ?4, enabled = ?5
             WHERE id = ?1",
            params![
                &schedule.id,
                to_db_timestamp(schedule.start_at),
                opt_timestamp(schedule.end_at),
                &schedule.timezone,
                schedule.enabled as i64,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "schedule",
                id: schedule.id.clone(),
            });
        }
        Ok(())
    }

    pub fn set_schedule_enabled(&self, id: &str, enabled: bool) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE schedules SET enabled = ?2 WHERE id = ?1",
            params![id, enabled as i64],
        )?;
        Ok(())
    }

    pub fn delete_schedule(&self, id: &str) -> StoreResult<bool> {
        let conn = self.open()?;
        Ok(conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])? > 0)
    }

    /// Earliest enabled schedule of the job that starts after `now` and has
    /// no outstanding session.
    pub fn find_next_enabled_schedule(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Schedule>> {
        let conn = self.open()?;
        let sql = format!(
            "SELECT * FROM schedules
             WHERE job_id = ?1 AND enabled = 1 AND start_at > ?2
               AND NOT {ACTIVE_SESSION_FOR_SCHEDULE}
             ORDER BY start_at ASC
             LIMIT 1"
        );
        let schedule = conn
            .query_row(
                &sql,
                params![job_id, to_db_timestamp(now)],
                Schedule::from_row,
            )
            .optional()?;
        Ok(schedule)
    }

    /// Enabled schedules whose start has passed and that have no pending or
    /// running session. Computed with an anti-join on every call. A schedule
    /// whose window has closed, or whose session already stopped, is spent.
    /// A session stopped by runner shutdown does not spend its schedule.
    pub fn list_due_schedules(&self, now: DateTime<Utc>) -> StoreResult<Vec<Schedule>> {
        let conn = self.open()?;
        let sql = format!(
            "SELECT * FROM schedules
             WHERE enabled = 1 AND start_at <= ?1
               AND (end_at IS NULL OR end_at > ?1)
               AND NOT {ACTIVE_SESSION_FOR_SCHEDULE}
               AND NOT EXISTS (
                   SELECT 1 FROM sessions
                   WHERE sessions.schedule_id = schedules.id
                     AND sessions.status = 'stopped'
                     AND COALESCE(sessions.stop_reason, '') <> ?2
               )
             ORDER BY start_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![to_db_timestamp(now), SHUTDOWN_STOP_REASON],
            Schedule::from_row,
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // Sessions -------------------------------------------------------------

    pub fn create_session(&self, session: &NewSession) -> StoreResult<Session> {
        let conn = self.open()?;
        let id = new_id();
        conn.execute(
            "INSERT INTO sessions (
                id, job_id, schedule_id, status, started_at, target_end_at, restart_count, created_at
            ) VALUES (?1, ?2, ?3, 'pending', ?4, ?5, 0, ?6)",
            params![
                &id,
                &session.job_id,
                &session.schedule_id,
                opt_timestamp(session.started_at),
                opt_timestamp(session.target_end_at),
                now_db_timestamp(),
            ],
        )?;
        self.find_session(&id)?.ok_or(StoreError::NotFound {
            entity: "session",
            id,
        })
    }

    pub fn find_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let conn = self.open()?;
        let session = conn
            .query_row(
                "SELECT * FROM sessions WHERE id = ?1",
                params![id],
                Session::from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn list_sessions_for_job(&self, job_id: &str) -> StoreResult<Vec<Session>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM sessions WHERE job_id = ?1 ORDER BY created_at DESC")?;
        let rows = stmt.query_map(params![job_id], Session::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn find_running_session_by_job(&self, job_id: &str) -> StoreResult<Option<Session>> {
        let conn = self.open()?;
        let session = conn
            .query_row(
                "SELECT * FROM sessions WHERE job_id = ?1 AND status = 'running'
                 ORDER BY created_at DESC LIMIT 1",
                params![job_id],
                Session::from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn find_pending_sessions(&self) -> StoreResult<Vec<Session>> {
        self.sessions_with_status(SessionStatus::Pending)
    }

    pub fn find_running_sessions(&self) -> StoreResult<Vec<Session>> {
        self.sessions_with_status(SessionStatus::Running)
    }

    fn sessions_with_status(&self, status: SessionStatus) -> StoreResult<Vec<Session>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM sessions WHERE status = ?1 ORDER BY created_at ASC")?;
        let rows = stmt.query_map(params![status.as_str()], Session::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Writes a status transition. Terminal statuses stamp `ended_at`.
    /// `error` is replaced, so a clean stop clears the message a previous
    /// retry left behind; `stop_reason` is only overwritten when provided.
    pub fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        error: Option<&str>,
        stop_reason: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.open()?;
        let ended_at = status.terminal().then(now_db_timestamp);
        conn.execute(
            "UPDATE sessions SET
                status = ?2,
                error = ?3,
                stop_reason = COALESCE(?4, stop_reason),
                ended_at = COALESCE(?5, ended_at)
             WHERE id = ?1",
            params![id, status.as_str(), error, stop_reason, ended_at],
        )?;
        Ok(())
    }

    /// Puts a failed attempt back in the queue and counts the restart.
    pub fn requeue_session(&self, id: &str, error: &str) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE sessions SET status = 'pending', error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    pub fn increment_restart_count(&self, id: &str) -> StoreResult<u32> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "UPDATE sessions SET restart_count = restart_count + 1 WHERE id = ?1
             RETURNING restart_count",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u32)
    }

    /// Unconditional form of [`SqliteStore::claim_running`].
    pub fn mark_session_running(
        &self,
        id: &str,
        started_at: DateTime<Utc>,
        log_path: &str,
    ) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE sessions SET status = 'running', started_at = ?2, log_path = ?3 WHERE id = ?1",
            params![id, to_db_timestamp(started_at), log_path],
        )?;
        Ok(())
    }

    /// Moves a pending session to running unless another session of the same
    /// job already runs. Returns `false` when the claim was refused.
    pub fn claim_running(
        &self,
        id: &str,
        started_at: DateTime<Utc>,
        log_path: &str,
    ) -> StoreResult<bool> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE sessions SET
                status = 'running',
                started_at = ?2,
                log_path = ?3
             WHERE id = ?1
               AND status = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM sessions AS other
                   WHERE other.job_id = sessions.job_id
                     AND other.status = 'running'
                     AND other.id <> sessions.id
               )",
            params![id, to_db_timestamp(started_at), log_path],
        )?;
        Ok(changed == 1)
    }

    /// Returns sessions left `running` by a previous runner process to
    /// `pending`, recording `reason` as their error.
    pub fn requeue_orphaned_sessions(&self, reason: &str) -> StoreResult<Vec<Session>> {
        let orphans = self.find_running_sessions()?;
        let conn = self.open()?;
        for session in &orphans {
            conn.execute(
                "UPDATE sessions SET status = 'pending', error = ?2
                 WHERE id = ?1 AND status = 'running'",
                params![&session.id, reason],
            )?;
        }
        Ok(orphans)
    }

    /// True when the job has any session row, whatever its status.
    pub fn job_has_history(&self, job_id: &str) -> StoreResult<bool> {
        let conn = self.open()?;
        let exists: i64 = conn.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM sessions WHERE job_id = ?1
            )",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    // Events ---------------------------------------------------------------

    pub fn insert_event(&self, event: &NewEvent) -> StoreResult<Event> {
        let conn = self.open()?;
        let id = new_id();
        let metadata = event
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO events (id, event_type, message, job_id, session_id, schedule_id, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &id,
                &event.event_type,
                &event.message,
                &event.job_id,
                &event.session_id,
                &event.schedule_id,
                metadata,
                now_db_timestamp(),
            ],
        )?;
        let stored = conn.query_row(
            "SELECT * FROM events WHERE id = ?1",
            params![&id],
            Event::from_row,
        )?;
        Ok(stored)
    }

    pub fn list_recent_events(&self, limit: usize) -> StoreResult<Vec<Event>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM events ORDER BY created_at DESC, rowid DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], Event::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn list_events_for_session(&self, session_id: &str) -> StoreResult<Vec<Event>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM events WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![session_id], Event::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn list_events_for_job(&self, job_id: &str) -> StoreResult<Vec<Event>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM events WHERE job_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![job_id], Event::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::builder()
            .path(dir.path().join("db/restream.sqlite"))
            .build()
            .unwrap();
        store.initialize().unwrap();
        (dir, store)
    }

    fn seed_job(store: &SqliteStore) -> Job {
        let asset = store
            .create_asset(&NewAsset {
                filename: "clip.mp4".into(),
                path: "/media/clip.mp4".into(),
                ..NewAsset::default()
            })
            .unwrap();
        let destination = store
            .create_destination(&NewDestination {
                name: "main".into(),
                stream_url: "rtmp://live.example.com/app".into(),
                stream_key_enc: "ciphertext".into(),
                ..NewDestination::default()
            })
            .unwrap();
        store
            .create_job(&NewJob {
                name: "loop".into(),
                video_asset_id: asset.id,
                destination_id: destination.id,
                loop_enabled: true,
                ..NewJob::default()
            })
            .unwrap()
    }

    #[test]
    fn claim_refuses_second_running_session() {
        let (_dir, store) = store();
        let job = seed_job(&store);
        let first = store
            .create_session(&NewSession {
                job_id: job.id.clone(),
                ..NewSession::default()
            })
            .unwrap();
        let second = store
            .create_session(&NewSession {
                job_id: job.id.clone(),
                ..NewSession::default()
            })
            .unwrap();

        assert!(store.claim_running(&first.id, Utc::now(), "/tmp/a.log").unwrap());
        assert!(!store.claim_running(&second.id, Utc::now(), "/tmp/b.log").unwrap());
        assert!(!store.claim_running(&first.id, Utc::now(), "/tmp/a.log").unwrap());

        let claimed = store.find_session(&first.id).unwrap().unwrap();
        assert_eq!(claimed.status, SessionStatus::Running);
        assert!(claimed.started_at.is_some());
        assert_eq!(claimed.log_path.as_deref(), Some("/tmp/a.log"));
    }

    #[test]
    fn due_schedules_use_anti_join() {
        let (_dir, store) = store();
        let job = seed_job(&store);
        let now = Utc::now();
        let schedule = store
            .create_schedule(&NewSchedule {
                job_id: job.id.clone(),
                start_at: now - Duration::minutes(1),
                end_at: Some(now + Duration::hours(1)),
                timezone: "UTC".into(),
                enabled: true,
            })
            .unwrap();

        assert_eq!(store.list_due_schedules(now).unwrap().len(), 1);

        let session = store
            .create_session(&NewSession {
                job_id: job.id.clone(),
                schedule_id: Some(schedule.id.clone()),
                ..NewSession::default()
            })
            .unwrap();
        assert!(store.list_due_schedules(now).unwrap().is_empty());

        store
            .update_session_status(&session.id, SessionStatus::Failed, Some("boom"), None)
            .unwrap();
        assert_eq!(store.list_due_schedules(now).unwrap().len(), 1);

        let rerun = store
            .create_session(&NewSession {
                job_id: job.id.clone(),
                schedule_id: Some(schedule.id.clone()),
                ..NewSession::default()
            })
            .unwrap();
        store
            .update_session_status(
                &rerun.id,
                SessionStatus::Stopped,
                None,
                Some(SHUTDOWN_STOP_REASON),
            )
            .unwrap();
        assert_eq!(store.list_due_schedules(now).unwrap().len(), 1);

        let last = store
            .create_session(&NewSession {
                job_id: job.id.clone(),
                schedule_id: Some(schedule.id.clone()),
                ..NewSession::default()
            })
            .unwrap();
        store
            .update_session_status(&last.id, SessionStatus::Stopped, None, Some("schedule_end"))
            .unwrap();
        assert!(store.list_due_schedules(now).unwrap().is_empty());
        assert!(store
            .list_due_schedules(now + Duration::hours(2))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn terminal_status_stamps_ended_at() {
        let (_dir, store) = store();
        let job = seed_job(&store);
        let session = store
            .create_session(&NewSession {
                job_id: job.id.clone(),
                ..NewSession::default()
            })
            .unwrap();

        store
            .update_session_status(&session.id, SessionStatus::Stopped, None, Some("user"))
            .unwrap();
        let stopped = store.find_session(&session.id).unwrap().unwrap();
        assert!(stopped.ended_at.is_some());
        assert_eq!(stopped.stop_reason.as_deref(), Some("user"));
        assert!(store.job_has_history(&job.id).unwrap());
    }

    #[test]
    fn clean_stop_clears_previous_retry_error() {
        let (_dir, store) = store();
        let job = seed_job(&store);
        let session = store
            .create_session(&NewSession {
                job_id: job.id.clone(),
                ..NewSession::default()
            })
            .unwrap();
        store
            .requeue_session(&session.id, "FFmpeg exited with code 1")
            .unwrap();
        store
            .mark_session_running(&session.id, Utc::now(), "/tmp/s.log")
            .unwrap();

        store
            .update_session_status(&session.id, SessionStatus::Stopped, None, Some("natural_end"))
            .unwrap();
        let stopped = store.find_session(&session.id).unwrap().unwrap();
        assert_eq!(stopped.error, None);
        assert_eq!(stopped.stop_reason.as_deref(), Some("natural_end"));
    }

    #[test]
    fn orphaned_sessions_are_requeued() {
        let (_dir, store) = store();
        let job = seed_job(&store);
        let session = store
            .create_session(&NewSession {
                job_id: job.id.clone(),
                ..NewSession::default()
            })
            .unwrap();
        assert!(store.claim_running(&session.id, Utc::now(), "/tmp/s.log").unwrap());
        assert_eq!(store.increment_restart_count(&session.id).unwrap(), 1);

        let orphans = store.requeue_orphaned_sessions("Runner restarted").unwrap();
        assert_eq!(orphans.len(), 1);
        let requeued = store.find_session(&session.id).unwrap().unwrap();
        assert_eq!(requeued.status, SessionStatus::Pending);
        assert_eq!(requeued.error.as_deref(), Some("Runner restarted"));
        assert_eq!(requeued.restart_count, 1);
    }

    #[test]
    fn events_keep_metadata() {
        let (_dir, store) = store();
        let event = store
            .insert_event(&NewEvent {
                event_type: "retry_scheduled".into(),
                message: "Retry scheduled".into(),
                session_id: Some("s1".into()),
                metadata: Some(serde_json::json!({"delay_seconds": 5, "attempt": 1})),
                ..NewEvent::default()
            })
            .unwrap();
        assert_eq!(event.metadata.unwrap()["delay_seconds"], 5);
        assert_eq!(store.list_recent_events(10).unwrap().len(), 1);
        assert_eq!(store.list_events_for_session("s1").unwrap().len(), 1);
    }
}
