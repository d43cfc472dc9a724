//! Encoder collaborators: launch-argument builder, process spawner and the
//! free-disk probe consulted before every launch.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::EncoderSection;
use crate::store::{Asset, Destination, Job, Preset};

/// Spawns the encoder with stdout and stderr appended to `log`.
pub trait EncoderSpawner: Send + Sync {
    fn spawn(&self, program: &Path, args: &[String], log: File) -> std::io::Result<Child>;
}

#[derive(Debug, Default)]
pub struct SystemEncoderSpawner;

impl EncoderSpawner for SystemEncoderSpawner {
    fn spawn(&self, program: &Path, args: &[String], log: File) -> std::io::Result<Child> {
        let stderr = log.try_clone()?;
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
    }
}

/// Free space in megabytes on the volume holding the media, `None` when it
/// cannot be determined.
pub trait DiskProbe: Send + Sync {
    fn free_megabytes(&self) -> Option<u64>;
}

#[derive(Debug, Clone)]
pub struct Fs2DiskProbe {
    path: PathBuf,
}

impl Fs2DiskProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DiskProbe for Fs2DiskProbe {
    fn free_megabytes(&self) -> Option<u64> {
        fs2::available_space(&self.path)
            .ok()
            .map(|bytes| bytes / (1024 * 1024))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub target_url: String,
    /// Target with the stream key replaced by `***`, safe to log.
    pub masked_target: String,
}

/// Prefix of `url` up to and including the `/` before a trailing `key`
/// segment.
fn key_segment_prefix<'a>(url: &'a str, key: &str) -> Option<&'a str> {
    if key.is_empty() {
        return None;
    }
    url.strip_suffix(key)
        .filter(|prefix| prefix.ends_with('/') && !prefix.ends_with("//"))
}

/// Joins the ingest URL and the stream key unless the URL already ends with
/// the key as its last path segment.
pub fn build_target_url(stream_url: &str, stream_key: &str) -> String {
    let key = stream_key.strip_prefix('/').unwrap_or(stream_key);
    if key.is_empty() || key_segment_prefix(stream_url, key).is_some() {
        return stream_url.to_string();
    }
    let base = stream_url.strip_suffix('/').unwrap_or(stream_url);
    format!("{base}/{key}")
}

/// Replaces the trailing key segment with `***`. Other occurrences of the
/// key text, for example inside the host, are left alone.
pub fn mask_target(target: &str, stream_key: &str) -> String {
    let key = stream_key.strip_prefix('/').unwrap_or(stream_key);
    match key_segment_prefix(target, key) {
        Some(prefix) => format!("{prefix}***"),
        None => target.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FadeFilters {
    video: String,
    audio: String,
}

/// Fade in at the start and out at the end of every loop iteration. Needs a
/// looping job, a known asset duration and room for both fades.
fn crossfade_filters(job: &Job, asset_duration: Option<f64>) -> Option<FadeFilters> {
    if !job.loop_enabled {
        return None;
    }
    let fade = job.crossfade_seconds.filter(|value| *value > 0.0)?;
    let duration = asset_duration?;
    if fade * 2.0 >= duration {
        return None;
    }
    let fade_out = duration - fade;
    Some(FadeFilters {
        video: format!("fade=t=in:st=0:d={fade},fade=t=out:st={fade_out}:d={fade}"),
        audio: format!("afade=t=in:st=0:d={fade},afade=t=out:st={fade_out}:d={fade}"),
    })
}

pub fn build_launch_args(
    config: &EncoderSection,
    job: &Job,
    asset: &Asset,
    destination: &Destination,
    stream_key: &str,
    preset: Option<&Preset>,
) -> LaunchPlan {
    let target_url = build_target_url(&destination.stream_url, stream_key);
    let masked_target = mask_target(&target_url, stream_key);
    let filters = crossfade_filters(job, asset.duration_seconds());

    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        config.log_level.clone(),
        "-nostdin".into(),
        "-re".into(),
    ];
    if job.loop_enabled {
        args.extend(["-stream_loop".into(), "-1".into()]);
    }
    args.extend(["-i".into(), asset.path.clone()]);

    let audio_codec = preset
        .and_then(|preset| preset.audio_codec.clone())
        .unwrap_or_else(|| config.audio_codec.clone());
    let force_encode = preset.map(|preset| preset.force_encode).unwrap_or(false);
    // Filters cannot run on a stream copy, so a crossfade implies encoding video.
    if force_encode || filters.is_some() {
        let video_codec = preset
            .and_then(|preset| preset.video_codec.clone())
            .unwrap_or_else(|| config.video_codec.clone());
        args.extend([
            "-c:v".into(),
            video_codec,
            "-preset".into(),
            config.transcode_preset.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ]);
    } else {
        args.extend(["-c:v".into(), "copy".into()]);
    }
    args.extend([
        "-c:a".into(),
        audio_codec,
        "-b:a".into(),
        config.audio_bitrate.clone(),
    ]);

    if let Some(filters) = filters {
        args.extend(["-vf".into(), filters.video, "-af".into(), filters.audio]);
    }

    args.extend(["-f".into(), "flv".into(), target_url.clone()]);

    LaunchPlan {
        program: PathBuf::from(&config.ffmpeg),
        args,
        target_url,
        masked_target,
    }
}
