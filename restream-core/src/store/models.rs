use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time::parse_db_timestamp;

fn timestamp(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    Ok(raw.as_deref().and_then(parse_db_timestamp))
}

fn required_timestamp(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    Ok(timestamp(row, column)?.unwrap_or_else(Utc::now))
}

fn flag(row: &Row<'_>, column: &str) -> rusqlite::Result<bool> {
    Ok(row.get::<_, Option<i64>>(column)?.unwrap_or(0) != 0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub id: String,
    pub kind: String,
    pub filename: String,
    pub path: String,
    pub size_bytes: i64,
    pub status: String,
    pub metadata_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            filename: row.get("filename")?,
            path: row.get("path")?,
            size_bytes: row.get::<_, Option<i64>>("size_bytes")?.unwrap_or(0),
            status: row.get("status")?,
            metadata_json: row.get("metadata_json")?,
            created_at: required_timestamp(row, "created_at")?,
        })
    }

    /// Probe duration in seconds. Looks at `duration_sec`, then `duration`,
    /// then `format.duration`; probe tools emit both numbers and strings.
    pub fn duration_seconds(&self) -> Option<f64> {
        let metadata: Value = serde_json::from_str(self.metadata_json.as_deref()?).ok()?;
        let found = [
            metadata.get("duration_sec"),
            metadata.get("duration"),
            metadata.get("format").and_then(|format| format.get("duration")),
        ]
        .into_iter()
        .flatten()
        .find_map(numeric)
        .filter(|value| value.is_finite() && *value > 0.0);
        found
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewAsset {
    pub kind: String,
    pub filename: String,
    pub path: String,
    pub size_bytes: i64,
    pub metadata_json: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Destination {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub stream_url: String,
    #[serde(skip_serializing)]
    pub stream_key_enc: String,
    pub created_at: DateTime<Utc>,
}

impl Destination {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            platform: row.get("platform")?,
            stream_url: row.get("stream_url")?,
            stream_key_enc: row.get("stream_key_enc")?,
            created_at: required_timestamp(row, "created_at")?,
        })
    }

    pub fn has_rtmp_scheme(&self) -> bool {
        let url = self.stream_url.trim().to_ascii_lowercase();
        url.starts_with("rtmp://") || url.starts_with("rtmps://")
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewDestination {
    pub name: String,
    pub platform: Option<String>,
    pub stream_url: String,
    pub stream_key_enc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preset {
    pub id: String,
    pub name: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub remux_enabled: bool,
    pub force_encode: bool,
    pub created_at: DateTime<Utc>,
}

impl Preset {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            video_codec: row.get("video_codec")?,
            audio_codec: row.get("audio_codec")?,
            remux_enabled: flag(row, "remux_enabled")?,
            force_encode: flag(row, "force_encode")?,
            created_at: required_timestamp(row, "created_at")?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewPreset {
    pub name: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub remux_enabled: bool,
    pub force_encode: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Planned,
    Running,
    Stopped,
    Invalid,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Idle,
        JobStatus::Planned,
        JobStatus::Running,
        JobStatus::Stopped,
        JobStatus::Invalid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Planned => "planned",
            JobStatus::Running => "running",
            JobStatus::Stopped => "stopped",
            JobStatus::Invalid => "invalid",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobStatus::Idle),
            "planned" => Ok(JobStatus::Planned),
            "running" => Ok(JobStatus::Running),
            "stopped" => Ok(JobStatus::Stopped),
            "invalid" => Ok(JobStatus::Invalid),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub video_asset_id: String,
    pub destination_id: String,
    pub preset_id: Option<String>,
    pub loop_enabled: bool,
    pub crossfade_seconds: Option<f64>,
    pub status: JobStatus,
    pub invalid_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            video_asset_id: row.get("video_asset_id")?,
            destination_id: row.get("destination_id")?,
            preset_id: row.get("preset_id")?,
            loop_enabled: flag(row, "loop_enabled")?,
            crossfade_seconds: row.get("crossfade_seconds")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(JobStatus::Idle),
            invalid_reason: row.get("invalid_reason")?,
            created_at: required_timestamp(row, "created_at")?,
            updated_at: required_timestamp(row, "updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub name: String,
    pub video_asset_id: String,
    pub destination_id: String,
    pub preset_id: Option<String>,
    pub loop_enabled: bool,
    pub crossfade_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub id: String,
    pub job_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            start_at: required_timestamp(row, "start_at")?,
            end_at: timestamp(row, "end_at")?,
            timezone: row.get("timezone")?,
            enabled: flag(row, "enabled")?,
            created_at: required_timestamp(row, "created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub job_id: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "stopped" => Ok(SessionStatus::Stopped),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub job_id: String,
    pub schedule_id: Option<String>,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub target_end_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub restart_count: u32,
    pub log_path: Option<String>,
    pub stop_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            schedule_id: row.get("schedule_id")?,
            status: row
                .get::<_, String>("status")?
                .parse()
                .unwrap_or(SessionStatus::Failed),
            started_at: timestamp(row, "started_at")?,
            ended_at: timestamp(row, "ended_at")?,
            target_end_at: timestamp(row, "target_end_at")?,
            error: row.get("error")?,
            restart_count: row
                .get::<_, Option<i64>>("restart_count")?
                .unwrap_or(0)
                .max(0) as u32,
            log_path: row.get("log_path")?,
            stop_reason: row.get("stop_reason")?,
            created_at: required_timestamp(row, "created_at")?,
        })
    }

    pub fn is_open_ended(&self) -> bool {
        self.target_end_at.is_none()
    }

    pub fn window_closed(&self, now: DateTime<Utc>) -> bool {
        self.target_end_at.map(|end| end <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub job_id: String,
    pub schedule_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub target_end_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub event_type: String,
    pub message: String,
    pub job_id: Option<String>,
    pub session_id: Option<String>,
    pub schedule_id: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let metadata: Option<String> = row.get("metadata_json")?;
        Ok(Self {
            id: row.get("id")?,
            event_type: row.get("event_type")?,
            message: row.get("message")?,
            job_id: row.get("job_id")?,
            session_id: row.get("session_id")?,
            schedule_id: row.get("schedule_id")?,
            metadata: metadata.and_then(|raw| serde_json::from_str(&raw).ok()),
            created_at: required_timestamp(row, "created_at")?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub event_type: String,
    pub message: String,
    pub job_id: Option<String>,
    pub session_id: Option<String>,
    pub schedule_id: Option<String>,
    pub metadata: Option<Value>,
}
