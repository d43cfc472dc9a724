use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::events::NotificationKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RestreamConfig {
    pub paths: PathsSection,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub encoder: EncoderSection,
    #[serde(default)]
    pub settings: SettingsSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub notifications: NotificationsSection,
}

impl RestreamConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.data_dir).join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.database)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.logs_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub data_dir: String,
    pub database: String,
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    pub poll_interval_seconds: u64,
    pub min_free_disk_mb: u64,
    pub open_ended_retry_minutes: i64,
    pub stop_grace_seconds: u64,
    pub backoff_seconds: Vec<u64>,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 3,
            min_free_disk_mb: 100,
            open_ended_retry_minutes: 30,
            stop_grace_seconds: 5,
            backoff_seconds: vec![5, 10, 20, 40, 60, 120],
        }
    }
}

impl RunnerSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub poll_interval_seconds: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 10,
        }
    }
}

impl SchedulerSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    pub ffmpeg: String,
    pub log_level: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub transcode_preset: String,
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            log_level: "warning".to_string(),
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            transcode_preset: "veryfast".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettingsSection {
    pub timezone: String,
}

impl Default for SettingsSection {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub install_secret_env: String,
    pub install_secret: Option<String>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            install_secret_env: "RESTREAM_INSTALL_SECRET".to_string(),
            install_secret: None,
        }
    }
}

impl SecuritySection {
    /// The environment variable wins over the file value.
    pub fn resolve_install_secret(&self) -> Option<String> {
        std::env::var(&self.install_secret_env)
            .ok()
            .filter(|value| !value.is_empty())
            .or_else(|| self.install_secret.clone())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotificationsSection {
    pub enabled: bool,
    pub events: Vec<NotificationKind>,
}

impl NotificationsSection {
    pub fn wants(&self, kind: NotificationKind) -> bool {
        self.enabled && self.events.contains(&kind)
    }
}

pub fn load_restream_config<P: AsRef<Path>>(path: P) -> Result<RestreamConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
