#![allow(dead_code)]

use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use restream_core::{
    load_restream_config, DiskProbe, EncoderSpawner, EventRecorder, JobService, NewAsset,
    NewDestination, NewJob, NotificationsSection, RestreamConfig, Runner, RunnerHandle,
    SecretCodec, SessionStatus, SqliteStore,
};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

pub const SECRET: &str = "integration-secret";

/// Runs a shell snippet in place of the encoder and remembers the arguments
/// it was asked to launch with.
pub struct ScriptSpawner {
    script: String,
    spawns: AtomicUsize,
    args: Mutex<Vec<Vec<String>>>,
}

impl ScriptSpawner {
    pub fn new(script: &str) -> Arc<Self> {
        Arc::new(Self {
            script: script.to_string(),
            spawns: AtomicUsize::new(0),
            args: Mutex::new(Vec::new()),
        })
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn last_args(&self) -> Option<Vec<String>> {
        self.args.lock().unwrap().last().cloned()
    }
}

impl EncoderSpawner for ScriptSpawner {
    fn spawn(&self, _program: &Path, args: &[String], log: File) -> std::io::Result<Child> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.args.lock().unwrap().push(args.to_vec());
        let stderr = log.try_clone()?;
        Command::new("sh")
            .arg("-c")
            .arg(&self.script)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
    }
}

pub struct FixedDisk(pub Option<u64>);

impl DiskProbe for FixedDisk {
    fn free_megabytes(&self) -> Option<u64> {
        self.0
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: RestreamConfig,
    pub store: SqliteStore,
    pub recorder: EventRecorder,
    pub codec: SecretCodec,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("restream.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
[paths]
data_dir = "{}"
database = "data/restream.sqlite"
logs_dir = "logs"

[runner]
poll_interval_seconds = 1
stop_grace_seconds = 1
backoff_seconds = [1]
"#,
                dir.path().display()
            ),
        )
        .unwrap();
        let config = load_restream_config(&config_path).unwrap();
        let store = SqliteStore::builder()
            .path(config.database_path())
            .create_if_missing(true)
            .build()
            .unwrap();
        store.initialize().unwrap();
        let recorder = EventRecorder::new(store.clone(), NotificationsSection::default(), None);
        Self {
            dir,
            config,
            store,
            recorder,
            codec: SecretCodec::from_install_secret(SECRET),
        }
    }

    pub fn service(&self, runner: Option<RunnerHandle>) -> JobService {
        JobService::new(
            self.store.clone(),
            self.recorder.clone(),
            self.config.settings.clone(),
            self.codec.clone(),
            runner,
        )
    }

    pub fn start_runner(
        &self,
        spawner: Arc<ScriptSpawner>,
        disk: Option<u64>,
    ) -> (RunnerHandle, JoinHandle<()>) {
        let runner = Runner::new(
            self.store.clone(),
            self.config.clone(),
            self.recorder.clone(),
            self.codec.clone(),
            Some(spawner as Arc<dyn EncoderSpawner>),
            Some(Arc::new(FixedDisk(disk)) as Arc<dyn DiskProbe>),
        );
        let handle = runner.handle();
        let task = tokio::spawn(runner.run());
        (handle, task)
    }

    /// Seeds an asset, a destination and a job; returns the job id.
    pub fn seed_job(&self, stream_url: &str, loop_enabled: bool, metadata: Option<&str>) -> String {
        let key = self.codec.encrypt("live-key").unwrap();
        self.seed_job_with_key(stream_url, loop_enabled, metadata, key)
    }

    pub fn seed_job_with_key(
        &self,
        stream_url: &str,
        loop_enabled: bool,
        metadata: Option<&str>,
        stream_key_enc: String,
    ) -> String {
        let asset = self
            .store
            .create_asset(&NewAsset {
                kind: "video".into(),
                filename: "clip.mp4".into(),
                path: self.dir.path().join("clip.mp4").display().to_string(),
                size_bytes: 4096,
                metadata_json: metadata.map(str::to_string),
            })
            .unwrap();
        let destination = self
            .store
            .create_destination(&NewDestination {
                name: "main".into(),
                platform: None,
                stream_url: stream_url.into(),
                stream_key_enc,
            })
            .unwrap();
        self.store
            .create_job(&NewJob {
                name: "evening".into(),
                video_asset_id: asset.id,
                destination_id: destination.id,
                preset_id: None,
                loop_enabled,
                crossfade_seconds: loop_enabled.then_some(2.0),
            })
            .unwrap()
            .id
    }
}

/// Waits for the session row to reach `status`.
pub async fn wait_for_session(store: &SqliteStore, id: &str, status: SessionStatus) -> bool {
    wait_until(|| {
        store
            .find_session(id)
            .unwrap()
            .map(|row| row.status == status)
            .unwrap_or(false)
    })
    .await
}

/// Polls `check` until it holds or ten seconds pass.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
