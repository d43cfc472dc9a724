//! Job and schedule service: validation, run-now session creation and the
//! cascade that invalidates jobs when something they reference is removed.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::config::SettingsSection;
use crate::events::{EventKind, EventRecorder, EventScope};
use crate::runner::{mark_session_stopped, RunnerError, RunnerHandle};
use crate::secrets::{SecretCodec, SecretError};
use crate::status::reconcile_job_status;
use crate::store::{
    Asset, Destination, Job, JobStatus, NewAsset, NewDestination, NewJob, NewPreset,
    NewSchedule, NewSession, Preset, Schedule, Session, SqliteStore, StoreError,
};
use crate::time::{normalize_zone, parse_in_zone, to_db_timestamp};

pub const END_NOT_IN_FUTURE: &str = "End time must be in the future";
pub const OPEN_ENDED_REQUIRES_LOOP: &str = "Open-ended sessions require loop to be enabled";
pub const EXCEEDS_ASSET_DURATION: &str = "Schedule exceeds asset duration and loop is disabled";
pub const INVALID_DURATION: &str = "Invalid duration_minutes";
pub const START_NOT_IN_FUTURE: &str = "Start must be in the future";
pub const END_BEFORE_START: &str = "End must be after start";
pub const STARTS_TOO_SOON: &str =
    "Schedule starts within 1 minute. Disable and recreate or use Run now.";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

fn validation(message: impl Into<String>) -> ServiceError {
    ServiceError::Validation(message.into())
}

fn valid_codec(codec: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").ok())
        .as_ref()
        .map(|pattern| pattern.is_match(codec))
        .unwrap_or(false)
}

fn not_found(entity: &'static str, id: &str) -> ServiceError {
    ServiceError::NotFound {
        entity,
        id: id.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobInput {
    pub name: String,
    pub video_asset_id: String,
    pub destination_id: String,
    pub preset_id: Option<String>,
    pub loop_enabled: bool,
    pub crossfade_seconds: Option<f64>,
}

/// Partial job update. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub name: Option<String>,
    pub video_asset_id: Option<String>,
    pub destination_id: Option<String>,
    pub preset_id: Option<Option<String>>,
    pub loop_enabled: Option<bool>,
    pub crossfade_seconds: Option<Option<f64>>,
    pub invalid_reason: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct RunNowOptions {
    pub start_at_override: Option<DateTime<Utc>>,
    /// ISO-8601; read as wall-clock time in the zone when it has no offset.
    pub end_at: Option<String>,
    pub duration_minutes: Option<i64>,
    pub timezone: Option<String>,
    pub schedule_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScheduleInput {
    pub job_id: String,
    pub start_at: String,
    pub end_at: Option<String>,
    pub timezone: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulePatch {
    pub start_at: Option<String>,
    pub end_at: Option<Option<String>>,
    pub timezone: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleOutcome {
    pub schedule: Schedule,
    /// Set when the schedule was stored but its job was invalidated.
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub next_schedule: Option<Schedule>,
    pub current_session: Option<Session>,
}

#[derive(Clone, Default)]
pub struct DestinationInput {
    pub name: String,
    pub platform: Option<String>,
    pub stream_url: String,
    pub stream_key: String,
}

#[derive(Debug, Clone)]
pub struct JobService {
    store: SqliteStore,
    recorder: EventRecorder,
    settings: SettingsSection,
    codec: SecretCodec,
    runner: Option<RunnerHandle>,
}

impl JobService {
    pub fn new(
        store: SqliteStore,
        recorder: EventRecorder,
        settings: SettingsSection,
        codec: SecretCodec,
        runner: Option<RunnerHandle>,
    ) -> Self {
        Self {
            store,
            recorder,
            settings,
            codec,
            runner,
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    fn zone(&self, requested: Option<&str>) -> Tz {
        normalize_zone(requested, &self.settings.timezone)
    }

    fn load_job(&self, job_id: &str) -> ServiceResult<Job> {
        self.store
            .find_job(job_id)?
            .ok_or_else(|| not_found("job", job_id))
    }

    /// Marks the job invalid with `reason`, records the block and fails.
    fn reject<T>(
        &self,
        job_id: &str,
        schedule_id: Option<&str>,
        reason: &str,
    ) -> ServiceResult<T> {
        self.store.mark_job_invalid(job_id, reason)?;
        self.recorder.record(
            EventKind::SessionBlocked,
            reason,
            EventScope::job(job_id).with_schedule(schedule_id),
            None,
        );
        Err(validation(reason))
    }

    /// A job invalidated by a timing rule becomes valid again once a window
    /// that satisfies the rules is accepted. Dependency problems stay.
    fn clear_timing_invalidation(&self, job: &Job) -> ServiceResult<()> {
        let timing = matches!(
            job.invalid_reason.as_deref(),
            Some(OPEN_ENDED_REQUIRES_LOOP) | Some(EXCEEDS_ASSET_DURATION)
        );
        if timing {
            let mut cleared = job.clone();
            cleared.invalid_reason = None;
            self.store.update_job(&cleared)?;
        }
        Ok(())
    }

    fn exceeds_asset(
        job: &Job,
        asset: &Asset,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> bool {
        let (Some(end), Some(asset_duration)) = (end, asset.duration_seconds()) else {
            return false;
        };
        let window = (end - start).num_milliseconds() as f64 / 1000.0;
        !job.loop_enabled && window > asset_duration
    }

    fn parse_instant(value: &str, zone: Tz, field: &str) -> ServiceResult<DateTime<Utc>> {
        parse_in_zone(value, zone).ok_or_else(|| validation(format!("Invalid {field}")))
    }

    // Assets, destinations, presets ----------------------------------------

    pub fn add_asset(&self, asset: NewAsset) -> ServiceResult<Asset> {
        if asset.filename.trim().is_empty() || asset.path.trim().is_empty() {
            return Err(validation("Asset filename and path are required"));
        }
        let asset = self.store.create_asset(&asset)?;
        self.recorder.record(
            EventKind::AssetCreated,
            format!("Asset {} added", asset.filename),
            EventScope::default(),
            Some(json!({ "asset_id": asset.id })),
        );
        Ok(asset)
    }

    pub fn remove_asset(&self, asset_id: &str) -> ServiceResult<Vec<Job>> {
        let asset = self
            .store
            .find_asset(asset_id)?
            .ok_or_else(|| not_found("asset", asset_id))?;
        let impacted = self.on_asset_removed(&asset)?;
        self.recorder.record(
            EventKind::AssetDeleted,
            format!(
                "Asset {} deleted (impacted {} jobs)",
                asset.filename,
                impacted.len()
            ),
            EventScope::default(),
            Some(json!({ "asset_id": asset.id, "impacted_jobs": impacted.len() })),
        );
        Ok(impacted)
    }

    pub fn add_destination(&self, input: DestinationInput) -> ServiceResult<Destination> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(validation("Name is required"));
        }
        let platform = input
            .platform
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("youtube");
        if !platform.eq_ignore_ascii_case("youtube") {
            return Err(validation("Only youtube platform is supported"));
        }
        let stream_url = input.stream_url.trim();
        let ingest = Url::parse(stream_url)
            .ok()
            .filter(|url| matches!(url.scheme(), "rtmp" | "rtmps") && url.has_host());
        if ingest.is_none() {
            return Err(validation("stream_url must start with rtmp:// or rtmps://"));
        }
        let stream_key = input.stream_key.trim();
        if stream_key.chars().any(char::is_whitespace) {
            return Err(validation("stream_key cannot contain whitespace"));
        }
        let destination = self.store.create_destination(&NewDestination {
            name: name.to_string(),
            platform: Some(platform.to_ascii_lowercase()),
            stream_url: stream_url.to_string(),
            stream_key_enc: self.codec.encrypt(stream_key)?,
        })?;
        self.recorder.record(
            EventKind::DestinationCreated,
            format!("Destination {} created", destination.name),
            EventScope::default(),
            Some(json!({ "platform": destination.platform })),
        );
        Ok(destination)
    }

    pub fn remove_destination(&self, destination_id: &str) -> ServiceResult<Vec<Job>> {
        let destination = self
            .store
            .find_destination(destination_id)?
            .ok_or_else(|| not_found("destination", destination_id))?;
        let impacted = self.on_destination_removed(&destination)?;
        self.recorder.record(
            EventKind::DestinationDeleted,
            format!("Destination {} deleted", destination.name),
            EventScope::default(),
            Some(json!({ "platform": destination.platform, "impacted_jobs": impacted.len() })),
        );
        Ok(impacted)
    }

    pub fn add_preset(&self, preset: NewPreset) -> ServiceResult<Preset> {
        if preset.name.trim().is_empty() {
            return Err(validation("Name is required"));
        }
        for codec in [&preset.video_codec, &preset.audio_codec].into_iter().flatten() {
            if !valid_codec(codec) {
                return Err(validation(
                    "Codec strings must be alphanumeric with optional - _ . characters",
                ));
            }
        }
        let preset = NewPreset {
            name: preset.name.trim().to_string(),
            remux_enabled: preset.remux_enabled && !preset.force_encode,
            ..preset
        };
        let preset = self.store.create_preset(&preset)?;
        self.recorder.record(
            EventKind::PresetCreated,
            format!("Preset {} created", preset.name),
            EventScope::default(),
            Some(json!({
                "force_encode": preset.force_encode,
                "remux_enabled": preset.remux_enabled,
            })),
        );
        Ok(preset)
    }

    pub fn remove_preset(&self, preset_id: &str) -> ServiceResult<Vec<Job>> {
        let preset = self
            .store
            .find_preset(preset_id)?
            .ok_or_else(|| not_found("preset", preset_id))?;
        let impacted = self.on_preset_removed(&preset)?;
        let suffix = if impacted.is_empty() {
            String::new()
        } else {
            format!(" (impacted {} jobs)", impacted.len())
        };
        self.recorder.record(
            EventKind::PresetDeleted,
            format!("Preset {} deleted{suffix}", preset.name),
            EventScope::default(),
            None,
        );
        Ok(impacted)
    }

    // Delete cascade --------------------------------------------------------

    pub fn on_asset_removed(&self, asset: &Asset) -> ServiceResult<Vec<Job>> {
        let impacted = self.store.jobs_by_asset(&asset.id)?;
        self.store.delete_asset(&asset.id)?;
        let reason = format!(
            "Asset removed: {}. Please reassign an asset.",
            asset.filename
        );
        self.invalidate_jobs(&impacted, &reason)?;
        Ok(impacted)
    }

    pub fn on_destination_removed(&self, destination: &Destination) -> ServiceResult<Vec<Job>> {
        let impacted = self.store.jobs_by_destination(&destination.id)?;
        self.store.delete_destination(&destination.id)?;
        let reason = format!(
            "Destination removed: {}. Please choose another destination.",
            destination.name
        );
        self.invalidate_jobs(&impacted, &reason)?;
        Ok(impacted)
    }

    pub fn on_preset_removed(&self, preset: &Preset) -> ServiceResult<Vec<Job>> {
        let impacted = self.store.jobs_by_preset(&preset.id)?;
        self.store.delete_preset(&preset.id)?;
        let reason = format!(
            "Preset removed: {}. Please choose another preset.",
            preset.name
        );
        self.invalidate_jobs(&impacted, &reason)?;
        Ok(impacted)
    }

    /// Jobs are never deleted when a dependency goes away; they are parked
    /// as invalid until the operator repairs them.
    pub fn invalidate_jobs(&self, jobs: &[Job], reason: &str) -> ServiceResult<()> {
        for job in jobs {
            self.store.mark_job_invalid(&job.id, reason)?;
            self.recorder.record(
                EventKind::JobInvalidated,
                reason,
                EventScope::job(&job.id),
                None,
            );
            info!(job_id = %job.id, reason, "job invalidated");
        }
        Ok(())
    }

    // Jobs -----------------------------------------------------------------

    fn check_references(
        &self,
        asset_id: &str,
        destination_id: &str,
        preset_id: Option<&str>,
    ) -> ServiceResult<()> {
        if self.store.find_asset(asset_id)?.is_none() {
            return Err(validation("Asset not found"));
        }
        if self.store.find_destination(destination_id)?.is_none() {
            return Err(validation("Destination not found"));
        }
        if let Some(preset_id) = preset_id {
            if self.store.find_preset(preset_id)?.is_none() {
                return Err(validation("Preset not found"));
            }
        }
        Ok(())
    }

    fn check_crossfade(crossfade: Option<f64>) -> ServiceResult<()> {
        match crossfade {
            Some(value) if !value.is_finite() || value < 0.0 => {
                Err(validation("crossfade_seconds must be a positive number"))
            }
            _ => Ok(()),
        }
    }

    pub fn create_job(&self, input: JobInput) -> ServiceResult<Job> {
        if input.name.trim().is_empty() {
            return Err(validation("Name is required"));
        }
        self.check_references(
            &input.video_asset_id,
            &input.destination_id,
            input.preset_id.as_deref(),
        )?;
        Self::check_crossfade(input.crossfade_seconds)?;
        let job = self.store.create_job(&NewJob {
            name: input.name.trim().to_string(),
            video_asset_id: input.video_asset_id,
            destination_id: input.destination_id,
            preset_id: input.preset_id,
            loop_enabled: input.loop_enabled,
            crossfade_seconds: if input.loop_enabled {
                input.crossfade_seconds
            } else {
                None
            },
        })?;
        self.recorder.record(
            EventKind::JobCreated,
            format!("Job {} created", job.name),
            EventScope::job(&job.id),
            None,
        );
        reconcile_job_status(&self.store, &job.id)?;
        self.load_job(&job.id)
    }

    pub fn update_job(&self, job_id: &str, patch: JobPatch) -> ServiceResult<Job> {
        let mut job = self.load_job(job_id)?;
        let references_changed = patch.video_asset_id.is_some()
            || patch.destination_id.is_some()
            || matches!(patch.preset_id, Some(Some(_)));

        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(validation("Name is required"));
            }
            job.name = name.trim().to_string();
        }
        if let Some(asset_id) = patch.video_asset_id {
            job.video_asset_id = asset_id;
        }
        if let Some(destination_id) = patch.destination_id {
            job.destination_id = destination_id;
        }
        if let Some(preset_id) = patch.preset_id {
            job.preset_id = preset_id;
        }
        if let Some(loop_enabled) = patch.loop_enabled {
            job.loop_enabled = loop_enabled;
        }
        if let Some(crossfade) = patch.crossfade_seconds {
            Self::check_crossfade(crossfade)?;
            job.crossfade_seconds = crossfade;
        }
        if !job.loop_enabled {
            job.crossfade_seconds = None;
        }
        if references_changed {
            self.check_references(
                &job.video_asset_id,
                &job.destination_id,
                job.preset_id.as_deref(),
            )?;
        }
        if let Some(reason) = patch.invalid_reason {
            job.invalid_reason = reason.filter(|value| !value.trim().is_empty());
        }
        if job.invalid_reason.is_some() {
            job.status = JobStatus::Invalid;
        }

        self.store.update_job(&job)?;
        self.recorder.record(
            EventKind::JobUpdated,
            format!("Job {} updated", job.name),
            EventScope::job(&job.id),
            None,
        );
        reconcile_job_status(&self.store, &job.id)?;
        self.load_job(&job.id)
    }

    pub fn job_view(&self, job_id: &str) -> ServiceResult<JobView> {
        let job = self.load_job(job_id)?;
        Ok(JobView {
            next_schedule: self.store.find_next_enabled_schedule(job_id, Utc::now())?,
            current_session: self.store.find_running_session_by_job(job_id)?,
            job,
        })
    }

    // Sessions -------------------------------------------------------------

    /// Creates a pending session for the job; the runner picks it up on its
    /// next tick.
    pub fn run_now(&self, job_id: &str, options: RunNowOptions) -> ServiceResult<Session> {
        let job = self.load_job(job_id)?;
        let asset = self
            .store
            .find_asset(&job.video_asset_id)?
            .ok_or_else(|| validation("Asset not found for job"))?;
        let schedule_id = options.schedule_id.as_deref();
        let zone = self.zone(options.timezone.as_deref());
        let start = options.start_at_override.unwrap_or_else(Utc::now);

        let target_end = match (&options.end_at, options.duration_minutes) {
            (Some(end_at), _) => Some(Self::parse_instant(end_at, zone, "end_at")?),
            (None, Some(minutes)) => Some(
                Duration::try_minutes(minutes)
                    .and_then(|span| start.checked_add_signed(span))
                    .ok_or_else(|| validation(INVALID_DURATION))?,
            ),
            (None, None) => None,
        };
        if matches!(target_end, Some(end) if end <= start) {
            return Err(validation(END_NOT_IN_FUTURE));
        }
        if target_end.is_none() && !job.loop_enabled {
            return self.reject(&job.id, schedule_id, OPEN_ENDED_REQUIRES_LOOP);
        }
        if Self::exceeds_asset(&job, &asset, start, target_end) {
            return self.reject(&job.id, schedule_id, EXCEEDS_ASSET_DURATION);
        }

        let session = self.store.create_session(&NewSession {
            job_id: job.id.clone(),
            schedule_id: options.schedule_id.clone(),
            started_at: Some(start),
            target_end_at: target_end,
        })?;
        self.clear_timing_invalidation(&job)?;
        self.store.update_job_status(&job.id, JobStatus::Running)?;
        let mode = if schedule_id.is_some() {
            "schedule"
        } else {
            "run_now"
        };
        self.recorder.record(
            EventKind::SessionCreated,
            format!("Session created via {}", mode.replace('_', " ")),
            EventScope::session(&job.id, &session.id).with_schedule(schedule_id),
            Some(json!({
                "mode": mode,
                "duration_minutes": options.duration_minutes,
                "end_at": target_end.map(|end| end.with_timezone(&zone).to_rfc3339()),
            })),
        );
        info!(job_id = %job.id, session_id = %session.id, mode, "session created");
        if let Some(runner) = &self.runner {
            runner.wake();
        }
        Ok(session)
    }

    /// Stops the job's running session. Returns `None` when nothing runs.
    pub async fn stop_session(&self, job_id: &str, reason: &str) -> ServiceResult<Option<Session>> {
        let Some(session) = self.store.find_running_session_by_job(job_id)? else {
            return Ok(None);
        };
        match &self.runner {
            Some(runner) => {
                runner.stop_job(job_id, reason).await?;
            }
            None => mark_session_stopped(&self.store, &self.recorder, &session, reason)?,
        }
        reconcile_job_status(&self.store, job_id)?;
        Ok(Some(session))
    }

    pub async fn stop_all(&self) -> ServiceResult<Vec<Session>> {
        let mut stopped = Vec::new();
        for session in self.store.find_running_sessions()? {
            if let Some(session) = self.stop_session(&session.job_id, "stop_all").await? {
                stopped.push(session);
            }
        }
        Ok(stopped)
    }

    // Schedules ------------------------------------------------------------

    pub fn create_schedule(&self, input: ScheduleInput) -> ServiceResult<ScheduleOutcome> {
        let job = self.load_job(&input.job_id)?;
        let asset = self
            .store
            .find_asset(&job.video_asset_id)?
            .ok_or_else(|| validation("Asset not found for job"))?;
        let zone = self.zone(input.timezone.as_deref());
        let start = Self::parse_instant(&input.start_at, zone, "start_at")?;
        if start <= Utc::now() {
            return Err(validation(START_NOT_IN_FUTURE));
        }
        let end = input
            .end_at
            .as_deref()
            .map(|value| Self::parse_instant(value, zone, "end_at"))
            .transpose()?;
        if matches!(end, Some(end) if end <= start) {
            return Err(validation(END_BEFORE_START));
        }
        if end.is_none() && !job.loop_enabled {
            return self.reject(&job.id, None, OPEN_ENDED_REQUIRES_LOOP);
        }
        let warning = Self::exceeds_asset(&job, &asset, start, end)
            .then(|| EXCEEDS_ASSET_DURATION.to_string());

        let schedule = self.store.create_schedule(&NewSchedule {
            job_id: job.id.clone(),
            start_at: start,
            end_at: end,
            timezone: zone.name().to_string(),
            enabled: input.enabled,
        })?;
        self.recorder.record(
            EventKind::ScheduleCreated,
            "Schedule created",
            EventScope::job(&job.id).with_schedule(Some(&schedule.id)),
            Some(json!({
                "start_at": to_db_timestamp(schedule.start_at),
                "end_at": schedule.end_at.map(to_db_timestamp),
                "timezone": schedule.timezone,
            })),
        );
        self.settle_schedule(&job, &schedule, warning.as_deref())?;
        Ok(ScheduleOutcome { schedule, warning })
    }

    pub fn update_schedule(
        &self,
        schedule_id: &str,
        patch: SchedulePatch,
    ) -> ServiceResult<ScheduleOutcome> {
        let mut schedule = self
            .store
            .find_schedule(schedule_id)?
            .ok_or_else(|| not_found("schedule", schedule_id))?;
        let job = self.load_job(&schedule.job_id)?;
        let zone = self.zone(patch.timezone.as_deref().or(Some(schedule.timezone.as_str())));
        let start = match &patch.start_at {
            Some(value) => Self::parse_instant(value, zone, "start_at")?,
            None => schedule.start_at,
        };
        if start - Utc::now() <= Duration::minutes(1) {
            return Err(validation(STARTS_TOO_SOON));
        }
        let end = match &patch.end_at {
            Some(Some(value)) => Some(Self::parse_instant(value, zone, "end_at")?),
            Some(None) => None,
            None => schedule.end_at,
        };
        if matches!(end, Some(end) if end <= start) {
            return Err(validation(END_BEFORE_START));
        }
        if end.is_none() && !job.loop_enabled {
            return self.reject(&job.id, Some(&schedule.id), OPEN_ENDED_REQUIRES_LOOP);
        }
        let warning = match self.store.find_asset(&job.video_asset_id)? {
            Some(asset) => Self::exceeds_asset(&job, &asset, start, end)
                .then(|| EXCEEDS_ASSET_DURATION.to_string()),
            None => None,
        };

        schedule.start_at = start;
        schedule.end_at = end;
        schedule.timezone = zone.name().to_string();
        if let Some(enabled) = patch.enabled {
            schedule.enabled = enabled;
        }
        self.store.update_schedule(&schedule)?;
        self.recorder.record(
            EventKind::ScheduleUpdated,
            "Schedule updated",
            EventScope::job(&job.id).with_schedule(Some(&schedule.id)),
            Some(json!({
                "start_at": to_db_timestamp(schedule.start_at),
                "end_at": schedule.end_at.map(to_db_timestamp),
                "timezone": schedule.timezone,
            })),
        );
        self.settle_schedule(&job, &schedule, warning.as_deref())?;
        Ok(ScheduleOutcome { schedule, warning })
    }

    fn settle_schedule(
        &self,
        job: &Job,
        schedule: &Schedule,
        warning: Option<&str>,
    ) -> ServiceResult<()> {
        match warning {
            Some(reason) => {
                self.store.mark_job_invalid(&job.id, reason)?;
                self.recorder.record(
                    EventKind::SessionBlocked,
                    reason,
                    EventScope::job(&job.id).with_schedule(Some(&schedule.id)),
                    None,
                );
            }
            None => {
                if schedule.enabled {
                    self.clear_timing_invalidation(job)?;
                }
                reconcile_job_status(&self.store, &job.id)?;
            }
        }
        Ok(())
    }

    pub fn disable_schedule(&self, schedule_id: &str) -> ServiceResult<Schedule> {
        let mut schedule = self
            .store
            .find_schedule(schedule_id)?
            .ok_or_else(|| not_found("schedule", schedule_id))?;
        self.store.set_schedule_enabled(schedule_id, false)?;
        schedule.enabled = false;
        self.recorder.record(
            EventKind::ScheduleDisabled,
            "Schedule disabled",
            EventScope::job(&schedule.job_id).with_schedule(Some(&schedule.id)),
            None,
        );
        reconcile_job_status(&self.store, &schedule.job_id)?;
        Ok(schedule)
    }

    pub fn delete_schedule(&self, schedule_id: &str) -> ServiceResult<Schedule> {
        let schedule = self
            .store
            .find_schedule(schedule_id)?
            .ok_or_else(|| not_found("schedule", schedule_id))?;
        self.store.delete_schedule(schedule_id)?;
        self.recorder.record(
            EventKind::ScheduleDeleted,
            "Schedule deleted",
            EventScope::job(&schedule.job_id).with_schedule(Some(&schedule.id)),
            None,
        );
        reconcile_job_status(&self.store, &schedule.job_id)?;
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationsSection;
    use crate::store::SessionStatus;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        service: JobService,
        asset_id: String,
        destination_id: String,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("restream.sqlite")).unwrap();
        store.initialize().unwrap();
        let recorder = EventRecorder::new(store.clone(), NotificationsSection::default(), None);
        let service = JobService::new(
            store,
            recorder,
            SettingsSection::default(),
            SecretCodec::from_install_secret("test-secret"),
            None,
        );
        let asset = service
            .add_asset(NewAsset {
                kind: "video".into(),
                filename: "clip.mp4".into(),
                path: "/media/clip.mp4".into(),
                size_bytes: 1024,
                metadata_json: Some(r#"{"duration_sec": 600}"#.into()),
            })
            .unwrap();
        let destination = service
            .add_destination(DestinationInput {
                name: "main".into(),
                platform: None,
                stream_url: "rtmp://a.rtmp.youtube.com/live2".into(),
                stream_key: " abcd-efgh ".into(),
            })
            .unwrap();
        Fixture {
            _dir: dir,
            service,
            asset_id: asset.id,
            destination_id: destination.id,
        }
    }

    impl Fixture {
        fn job(&self, loop_enabled: bool) -> Job {
            self.service
                .create_job(JobInput {
                    name: "evening loop".into(),
                    video_asset_id: self.asset_id.clone(),
                    destination_id: self.destination_id.clone(),
                    loop_enabled,
                    crossfade_seconds: Some(2.0),
                    ..JobInput::default()
                })
                .unwrap()
        }

        fn event_types(&self, job_id: &str) -> Vec<String> {
            self.service
                .store()
                .list_events_for_job(job_id)
                .unwrap()
                .into_iter()
                .map(|event| event.event_type)
                .collect()
        }
    }

    fn message(err: ServiceError) -> String {
        match err {
            ServiceError::Validation(message) => message,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn destination_key_is_trimmed_and_encrypted() {
        let fixture = fixture();
        let destination = fixture
            .service
            .store()
            .find_destination(&fixture.destination_id)
            .unwrap()
            .unwrap();
        assert_eq!(destination.platform, "youtube");
        assert_ne!(destination.stream_key_enc, "abcd-efgh");
        let codec = SecretCodec::from_install_secret("test-secret");
        assert_eq!(codec.decrypt(&destination.stream_key_enc).unwrap(), "abcd-efgh");
    }

    #[test]
    fn destination_validation_messages() {
        let fixture = fixture();
        let base = DestinationInput {
            name: "backup".into(),
            platform: None,
            stream_url: "rtmps://host/app".into(),
            stream_key: "key".into(),
        };
        let bad_url = DestinationInput {
            stream_url: "http://host/app".into(),
            ..base.clone()
        };
        assert_eq!(
            message(fixture.service.add_destination(bad_url).unwrap_err()),
            "stream_url must start with rtmp:// or rtmps://"
        );
        let bad_key = DestinationInput {
            stream_key: "two words".into(),
            ..base.clone()
        };
        assert_eq!(
            message(fixture.service.add_destination(bad_key).unwrap_err()),
            "stream_key cannot contain whitespace"
        );
        let twitch = DestinationInput {
            platform: Some("twitch".into()),
            ..base.clone()
        };
        assert!(fixture.service.add_destination(twitch).is_err());
        assert!(fixture.service.add_destination(base).is_ok());
    }

    #[test]
    fn preset_codecs_are_restricted() {
        let fixture = fixture();
        let err = fixture
            .service
            .add_preset(NewPreset {
                name: "bad".into(),
                video_codec: Some("libx264; rm -rf".into()),
                ..NewPreset::default()
            })
            .unwrap_err();
        assert_eq!(
            message(err),
            "Codec strings must be alphanumeric with optional - _ . characters"
        );
        let preset = fixture
            .service
            .add_preset(NewPreset {
                name: "hevc".into(),
                video_codec: Some("libx265".into()),
                audio_codec: Some("aac".into()),
                remux_enabled: true,
                force_encode: true,
            })
            .unwrap();
        assert!(!preset.remux_enabled);
    }

    #[test]
    fn run_now_with_duration_sets_target_end() {
        let fixture = fixture();
        let job = fixture.job(true);
        let session = fixture
            .service
            .run_now(
                &job.id,
                RunNowOptions {
                    duration_minutes: Some(1),
                    ..RunNowOptions::default()
                },
            )
            .unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        let window = session.target_end_at.unwrap() - session.started_at.unwrap();
        assert_eq!(window, Duration::seconds(60));
        let job = fixture.service.store().find_job(&job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(fixture
            .event_types(&job.id)
            .contains(&"session_created".to_string()));
    }

    #[test]
    fn run_now_rejects_out_of_range_duration() {
        let fixture = fixture();
        let job = fixture.job(true);
        for minutes in [i64::MAX / 2, i64::MAX, i64::MIN] {
            let err = fixture
                .service
                .run_now(
                    &job.id,
                    RunNowOptions {
                        duration_minutes: Some(minutes),
                        ..RunNowOptions::default()
                    },
                )
                .unwrap_err();
            assert_eq!(message(err), INVALID_DURATION);
        }
        let store = fixture.service.store();
        assert!(store.list_sessions_for_job(&job.id).unwrap().is_empty());
        assert_ne!(
            store.find_job(&job.id).unwrap().unwrap().status,
            JobStatus::Invalid
        );
    }

    #[test]
    fn open_ended_run_now_requires_loop() {
        let fixture = fixture();
        let job = fixture.job(false);
        let err = fixture
            .service
            .run_now(&job.id, RunNowOptions::default())
            .unwrap_err();
        assert_eq!(message(err), OPEN_ENDED_REQUIRES_LOOP);
        let store = fixture.service.store();
        let job = store.find_job(&job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Invalid);
        assert_eq!(job.invalid_reason.as_deref(), Some(OPEN_ENDED_REQUIRES_LOOP));
        assert!(store.list_sessions_for_job(&job.id).unwrap().is_empty());
        assert!(fixture
            .event_types(&job.id)
            .contains(&"session_blocked".to_string()));

        // A valid window lifts the timing invalidation again.
        fixture
            .service
            .run_now(
                &job.id,
                RunNowOptions {
                    duration_minutes: Some(5),
                    ..RunNowOptions::default()
                },
            )
            .unwrap();
        let job = store.find_job(&job.id).unwrap().unwrap();
        assert_eq!(job.invalid_reason, None);
    }

    #[test]
    fn run_now_rejects_window_longer_than_asset_without_loop() {
        let fixture = fixture();
        let job = fixture.job(false);
        let err = fixture
            .service
            .run_now(
                &job.id,
                RunNowOptions {
                    duration_minutes: Some(11),
                    ..RunNowOptions::default()
                },
            )
            .unwrap_err();
        assert_eq!(message(err), EXCEEDS_ASSET_DURATION);

        let err = fixture
            .service
            .run_now(
                &job.id,
                RunNowOptions {
                    duration_minutes: Some(0),
                    ..RunNowOptions::default()
                },
            )
            .unwrap_err();
        assert_eq!(message(err), END_NOT_IN_FUTURE);
    }

    #[test]
    fn schedule_validation_and_warning() {
        let fixture = fixture();
        let job = fixture.job(false);
        let past = (Utc::now() - Duration::minutes(5)).to_rfc3339();
        let err = fixture
            .service
            .create_schedule(ScheduleInput {
                job_id: job.id.clone(),
                start_at: past,
                end_at: None,
                timezone: None,
                enabled: true,
            })
            .unwrap_err();
        assert_eq!(message(err), START_NOT_IN_FUTURE);

        let start = Utc::now() + Duration::hours(1);
        let outcome = fixture
            .service
            .create_schedule(ScheduleInput {
                job_id: job.id.clone(),
                start_at: start.to_rfc3339(),
                end_at: Some((start + Duration::hours(1)).to_rfc3339()),
                timezone: Some("Europe/Lisbon".into()),
                enabled: true,
            })
            .unwrap();
        assert_eq!(outcome.warning.as_deref(), Some(EXCEEDS_ASSET_DURATION));
        assert_eq!(outcome.schedule.timezone, "Europe/Lisbon");
        let stored = fixture.service.store().find_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Invalid);
    }

    #[test]
    fn schedule_marks_job_planned_and_guards_imminent_edits() {
        let fixture = fixture();
        let job = fixture.job(true);
        let start = Utc::now() + Duration::hours(2);
        let outcome = fixture
            .service
            .create_schedule(ScheduleInput {
                job_id: job.id.clone(),
                start_at: start.to_rfc3339(),
                end_at: None,
                timezone: None,
                enabled: true,
            })
            .unwrap();
        assert!(outcome.warning.is_none());
        let store = fixture.service.store();
        assert_eq!(
            store.find_job(&job.id).unwrap().unwrap().status,
            JobStatus::Planned
        );

        let err = fixture
            .service
            .update_schedule(
                &outcome.schedule.id,
                SchedulePatch {
                    start_at: Some((Utc::now() + Duration::seconds(30)).to_rfc3339()),
                    ..SchedulePatch::default()
                },
            )
            .unwrap_err();
        assert_eq!(message(err), STARTS_TOO_SOON);

        fixture
            .service
            .disable_schedule(&outcome.schedule.id)
            .unwrap();
        assert_eq!(
            store.find_job(&job.id).unwrap().unwrap().status,
            JobStatus::Idle
        );
    }

    #[test]
    fn removing_dependencies_invalidates_jobs() {
        let fixture = fixture();
        let job = fixture.job(true);
        let impacted = fixture.service.remove_asset(&fixture.asset_id).unwrap();
        assert_eq!(impacted.len(), 1);
        let stored = fixture.service.store().find_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Invalid);
        assert_eq!(
            stored.invalid_reason.as_deref(),
            Some("Asset removed: clip.mp4. Please reassign an asset.")
        );
        assert!(fixture
            .event_types(&job.id)
            .contains(&"job_invalidated".to_string()));

        // Dependency loss is not cleared by an unrelated edit.
        let updated = fixture
            .service
            .update_job(
                &job.id,
                JobPatch {
                    name: Some("renamed".into()),
                    ..JobPatch::default()
                },
            )
            .unwrap();
        assert_eq!(updated.status, JobStatus::Invalid);
    }

    #[tokio::test]
    async fn stop_without_runner_marks_session_stopped() {
        let fixture = fixture();
        let job = fixture.job(true);
        let session = fixture
            .service
            .run_now(&job.id, RunNowOptions::default())
            .unwrap();
        let store = fixture.service.store();
        store
            .mark_session_running(&session.id, Utc::now(), "/tmp/session.log")
            .unwrap();

        let stopped = fixture.service.stop_all().await.unwrap();
        assert_eq!(stopped.len(), 1);
        let session = store.find_session(&session.id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);
        assert_eq!(session.stop_reason.as_deref(), Some("stop_all"));
        assert_eq!(
            store.find_job(&job.id).unwrap().unwrap().status,
            JobStatus::Stopped
        );
    }
}
