use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::info;

use restream_core::{
    load_restream_config, Asset, Destination, DestinationInput, Event, EventRecorder, Job,
    JobInput, JobPatch, JobService, JobStatus, JobView, LogNotifier, NewAsset, NewPreset,
    Notifier, Preset, RestreamConfig, RunNowOptions, Runner, RunnerHandle, Schedule,
    ScheduleInput, ScheduleOutcome, SchedulePatch, Scheduler, SecretCodec, Session,
    SqliteStore,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] restream_core::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] restream_core::StoreError),
    #[error("{0}")]
    Service(#[from] restream_core::ServiceError),
    #[error("runner error: {0}")]
    Runner(#[from] restream_core::RunnerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("install secret missing: set {0} or security.install_secret")]
    MissingSecret(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotFound(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Restream session runner and control interface", long_about = None)]
pub struct Cli {
    /// Path to restream.toml
    #[arg(long, default_value = "configs/restream.toml")]
    pub config: PathBuf,
    /// Alternative database path (overrides paths.database)
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the runner and the scheduler until Ctrl-C
    Serve,
    /// Job counts by status and running sessions
    Status,
    /// Recent events
    Events(EventsArgs),
    /// Stops every running session
    StopAll,
    #[command(subcommand)]
    Job(JobCommands),
    #[command(subcommand)]
    Schedule(ScheduleCommands),
    #[command(subcommand)]
    Session(SessionCommands),
    #[command(subcommand)]
    Asset(AssetCommands),
    #[command(subcommand)]
    Destination(DestinationCommands),
    #[command(subcommand)]
    Preset(PresetCommands),
}

#[derive(Args, Debug)]
pub struct EventsArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
    /// Only events of this job
    #[arg(long)]
    pub job: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    List,
    Create(JobCreateArgs),
    Update(JobUpdateArgs),
    Show { id: String },
    /// Creates a pending session right away
    RunNow(RunNowArgs),
    /// Stops the job's running session
    Stop { id: String },
}

#[derive(Args, Debug)]
pub struct JobCreateArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub asset: String,
    #[arg(long)]
    pub destination: String,
    #[arg(long)]
    pub preset: Option<String>,
    #[arg(long = "loop", default_value_t = false)]
    pub loop_enabled: bool,
    #[arg(long)]
    pub crossfade: Option<f64>,
}

#[derive(Args, Debug, Default)]
pub struct JobUpdateArgs {
    pub id: String,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub asset: Option<String>,
    #[arg(long)]
    pub destination: Option<String>,
    #[arg(long, conflicts_with = "clear_preset")]
    pub preset: Option<String>,
    #[arg(long)]
    pub clear_preset: bool,
    #[arg(long = "loop")]
    pub loop_enabled: Option<bool>,
    #[arg(long, conflicts_with = "clear_crossfade")]
    pub crossfade: Option<f64>,
    #[arg(long)]
    pub clear_crossfade: bool,
    /// Marks the job valid again after its dependencies were repaired
    #[arg(long)]
    pub clear_invalid: bool,
}

#[derive(Args, Debug, Default)]
pub struct RunNowArgs {
    pub id: String,
    #[arg(long, conflicts_with = "end_at")]
    pub duration_minutes: Option<i64>,
    /// ISO-8601 end time; read in --timezone when it carries no offset
    #[arg(long)]
    pub end_at: Option<String>,
    #[arg(long)]
    pub timezone: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommands {
    List {
        #[arg(long)]
        job: Option<String>,
    },
    Create(ScheduleCreateArgs),
    Update(ScheduleUpdateArgs),
    Disable { id: String },
    Delete { id: String },
}

#[derive(Args, Debug)]
pub struct ScheduleCreateArgs {
    #[arg(long)]
    pub job: String,
    #[arg(long)]
    pub start_at: String,
    #[arg(long)]
    pub end_at: Option<String>,
    #[arg(long)]
    pub timezone: Option<String>,
    #[arg(long, default_value_t = false)]
    pub disabled: bool,
}

#[derive(Args, Debug, Default)]
pub struct ScheduleUpdateArgs {
    pub id: String,
    #[arg(long)]
    pub start_at: Option<String>,
    #[arg(long, conflicts_with = "clear_end")]
    pub end_at: Option<String>,
    #[arg(long)]
    pub clear_end: bool,
    #[arg(long)]
    pub timezone: Option<String>,
    #[arg(long)]
    pub enabled: Option<bool>,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Running sessions, or every session of --job
    List {
        #[arg(long)]
        job: Option<String>,
    },
    /// Last lines of the session's encoder log
    Log(SessionLogArgs),
}

#[derive(Args, Debug)]
pub struct SessionLogArgs {
    pub id: String,
    #[arg(long, default_value_t = 200)]
    pub lines: usize,
}

#[derive(Subcommand, Debug)]
pub enum AssetCommands {
    Add(AssetAddArgs),
    Remove { id: String },
}

#[derive(Args, Debug)]
pub struct AssetAddArgs {
    #[arg(long)]
    pub path: PathBuf,
    #[arg(long, default_value = "video")]
    pub kind: String,
    /// Known duration, used by the loop/duration checks
    #[arg(long)]
    pub duration_sec: Option<f64>,
}

#[derive(Subcommand, Debug)]
pub enum DestinationCommands {
    Add(DestinationAddArgs),
    Remove { id: String },
}

#[derive(Args, Debug)]
pub struct DestinationAddArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub platform: Option<String>,
    #[arg(long)]
    pub stream_url: String,
    #[arg(long, env = "RESTREAM_STREAM_KEY", hide_env_values = true)]
    pub stream_key: String,
}

#[derive(Subcommand, Debug)]
pub enum PresetCommands {
    Add(PresetAddArgs),
    Remove { id: String },
}

#[derive(Args, Debug)]
pub struct PresetAddArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub video_codec: Option<String>,
    #[arg(long)]
    pub audio_codec: Option<String>,
    #[arg(long, default_value_t = false)]
    pub no_remux: bool,
    #[arg(long, default_value_t = false)]
    pub force_encode: bool,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;
    let format = cli.format;

    match &cli.command {
        Commands::Serve => context.serve().await?,
        Commands::Status => render(&context.status()?, format)?,
        Commands::Events(args) => render(&context.events(args)?, format)?,
        Commands::StopAll => render(&context.stop_all().await?, format)?,
        Commands::Job(command) => match command {
            JobCommands::List => render(&context.job_list()?, format)?,
            JobCommands::Create(args) => render(&context.job_create(args)?, format)?,
            JobCommands::Update(args) => render(&context.job_update(args)?, format)?,
            JobCommands::Show { id } => render(&context.service()?.job_view(id)?, format)?,
            JobCommands::RunNow(args) => render(&context.run_now(args)?, format)?,
            JobCommands::Stop { id } => render(&context.job_stop(id).await?, format)?,
        },
        Commands::Schedule(command) => match command {
            ScheduleCommands::List { job } => {
                render(&context.schedule_list(job.as_deref())?, format)?
            }
            ScheduleCommands::Create(args) => render(&context.schedule_create(args)?, format)?,
            ScheduleCommands::Update(args) => render(&context.schedule_update(args)?, format)?,
            ScheduleCommands::Disable { id } => {
                render(&context.service()?.disable_schedule(id)?, format)?
            }
            ScheduleCommands::Delete { id } => {
                render(&context.service()?.delete_schedule(id)?, format)?
            }
        },
        Commands::Session(command) => match command {
            SessionCommands::List { job } => {
                render(&context.session_list(job.as_deref())?, format)?
            }
            SessionCommands::Log(args) => render(&context.session_log(args)?, format)?,
        },
        Commands::Asset(command) => match command {
            AssetCommands::Add(args) => render(&context.asset_add(args)?, format)?,
            AssetCommands::Remove { id } => {
                let impacted = context.service()?.remove_asset(id)?;
                render(&Removal::new("asset", id, impacted), format)?
            }
        },
        Commands::Destination(command) => match command {
            DestinationCommands::Add(args) => render(&context.destination_add(args)?, format)?,
            DestinationCommands::Remove { id } => {
                let impacted = context.service()?.remove_destination(id)?;
                render(&Removal::new("destination", id, impacted), format)?
            }
        },
        Commands::Preset(command) => match command {
            PresetCommands::Add(args) => render(&context.preset_add(args)?, format)?,
            PresetCommands::Remove { id } => {
                let impacted = context.service()?.remove_preset(id)?;
                render(&Removal::new("preset", id, impacted), format)?
            }
        },
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: RestreamConfig,
    store: SqliteStore,
    recorder: EventRecorder,
    codec: Option<SecretCodec>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_restream_config(&cli.config)?;
        if let Some(database) = &cli.database {
            config.paths.database = database.display().to_string();
        }
        let store = SqliteStore::builder()
            .path(config.database_path())
            .create_if_missing(true)
            .build()?;
        store.initialize()?;

        let notifier: Option<Arc<dyn Notifier>> = config
            .notifications
            .enabled
            .then(|| Arc::new(LogNotifier) as Arc<dyn Notifier>);
        let recorder = EventRecorder::new(store.clone(), config.notifications.clone(), notifier);
        let codec = config
            .security
            .resolve_install_secret()
            .map(|secret| SecretCodec::from_install_secret(&secret));

        Ok(Self {
            config,
            store,
            recorder,
            codec,
        })
    }

    fn codec(&self) -> Result<SecretCodec> {
        self.codec
            .clone()
            .ok_or_else(|| AppError::MissingSecret(self.config.security.install_secret_env.clone()))
    }

    fn service(&self) -> Result<JobService> {
        self.service_with(None)
    }

    fn service_with(&self, runner: Option<RunnerHandle>) -> Result<JobService> {
        Ok(JobService::new(
            self.store.clone(),
            self.recorder.clone(),
            self.config.settings.clone(),
            self.codec()?,
            runner,
        ))
    }

    async fn serve(&self) -> Result<()> {
        let runner = Runner::new(
            self.store.clone(),
            self.config.clone(),
            self.recorder.clone(),
            self.codec()?,
            None,
            None,
        );
        let handle = runner.handle();
        let runner_task = tokio::spawn(runner.run());

        let scheduler = Scheduler::new(
            self.store.clone(),
            self.service_with(Some(handle.clone()))?,
            self.recorder.clone(),
            Some(handle.clone()),
            self.config.scheduler.clone(),
        );
        let (stop_scheduler, scheduler_stopped) = oneshot::channel();
        let scheduler_task = tokio::spawn(scheduler.run(scheduler_stopped));

        info!(database = %self.store.path().display(), "restream serving");
        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");

        let _ = stop_scheduler.send(());
        let _ = scheduler_task.await;
        handle.shutdown().await?;
        let _ = runner_task.await;
        Ok(())
    }

    fn status(&self) -> Result<StatusReport> {
        let counts = self.store.count_jobs_by_status()?;
        let jobs = JobStatus::ALL
            .iter()
            .map(|status| (status.to_string(), counts.get(status).copied().unwrap_or(0)))
            .collect();
        let running = self
            .store
            .find_running_sessions()?
            .into_iter()
            .map(|session| session.job_id)
            .collect();
        Ok(StatusReport {
            database: self.store.path().to_path_buf(),
            jobs,
            pending_sessions: self.store.find_pending_sessions()?.len(),
            running_jobs: running,
        })
    }

    fn events(&self, args: &EventsArgs) -> Result<EventList> {
        let mut rows = match &args.job {
            Some(job_id) => self.store.list_events_for_job(job_id)?,
            None => self.store.list_recent_events(args.limit)?,
        };
        if args.job.is_some() {
            let skip = rows.len().saturating_sub(args.limit);
            rows.drain(..skip);
        }
        Ok(EventList { rows })
    }

    async fn stop_all(&self) -> Result<StopReport> {
        let stopped = self.service()?.stop_all().await?;
        Ok(StopReport {
            stopped: stopped.into_iter().map(|session| session.id).collect(),
        })
    }

    async fn job_stop(&self, job_id: &str) -> Result<StopReport> {
        let stopped = self.service()?.stop_session(job_id, "user_stop").await?;
        Ok(StopReport {
            stopped: stopped.into_iter().map(|session| session.id).collect(),
        })
    }

    fn job_list(&self) -> Result<JobList> {
        Ok(JobList {
            rows: self.store.list_jobs()?,
        })
    }

    fn schedule_list(&self, job_id: Option<&str>) -> Result<ScheduleList> {
        let rows = match job_id {
            Some(job_id) => self.store.list_schedules_for_job(job_id)?,
            None => self.store.list_schedules()?,
        };
        Ok(ScheduleList { rows })
    }

    fn session_list(&self, job_id: Option<&str>) -> Result<SessionList> {
        let rows = match job_id {
            Some(job_id) => self.store.list_sessions_for_job(job_id)?,
            None => self.store.find_running_sessions()?,
        };
        Ok(SessionList { rows })
    }

    /// Tails the encoder log. Sessions that never recorded a path fall back
    /// to the runner's naming scheme.
    fn session_log(&self, args: &SessionLogArgs) -> Result<SessionLog> {
        let session = self
            .store
            .find_session(&args.id)?
            .ok_or_else(|| AppError::NotFound(format!("Session not found: {}", args.id)))?;
        let log_path = session.log_path.map(PathBuf::from).unwrap_or_else(|| {
            self.config
                .logs_dir()
                .join("ffmpeg")
                .join(format!("session_{}.log", session.id))
        });
        if !log_path.exists() {
            return Err(AppError::NotFound(format!(
                "Log not found: {}",
                log_path.display()
            )));
        }
        let content = std::fs::read_to_string(&log_path)?;
        let all: Vec<&str> = content.lines().collect();
        let skip = all.len().saturating_sub(args.lines);
        Ok(SessionLog {
            session_id: session.id,
            log_path,
            lines: all[skip..].iter().map(|line| line.to_string()).collect(),
        })
    }

    fn job_create(&self, args: &JobCreateArgs) -> Result<Job> {
        Ok(self.service()?.create_job(JobInput {
            name: args.name.clone(),
            video_asset_id: args.asset.clone(),
            destination_id: args.destination.clone(),
            preset_id: args.preset.clone(),
            loop_enabled: args.loop_enabled,
            crossfade_seconds: args.crossfade,
        })?)
    }

    fn job_update(&self, args: &JobUpdateArgs) -> Result<Job> {
        let preset_id = if args.clear_preset {
            Some(None)
        } else {
            args.preset.clone().map(Some)
        };
        let crossfade_seconds = if args.clear_crossfade {
            Some(None)
        } else {
            args.crossfade.map(Some)
        };
        let patch = JobPatch {
            name: args.name.clone(),
            video_asset_id: args.asset.clone(),
            destination_id: args.destination.clone(),
            preset_id,
            loop_enabled: args.loop_enabled,
            crossfade_seconds,
            invalid_reason: args.clear_invalid.then_some(None),
        };
        Ok(self.service()?.update_job(&args.id, patch)?)
    }

    fn run_now(&self, args: &RunNowArgs) -> Result<Session> {
        Ok(self.service()?.run_now(
            &args.id,
            RunNowOptions {
                end_at: args.end_at.clone(),
                duration_minutes: args.duration_minutes,
                timezone: args.timezone.clone(),
                ..RunNowOptions::default()
            },
        )?)
    }

    fn schedule_create(&self, args: &ScheduleCreateArgs) -> Result<ScheduleOutcome> {
        Ok(self.service()?.create_schedule(ScheduleInput {
            job_id: args.job.clone(),
            start_at: args.start_at.clone(),
            end_at: args.end_at.clone(),
            timezone: args.timezone.clone(),
            enabled: !args.disabled,
        })?)
    }

    fn schedule_update(&self, args: &ScheduleUpdateArgs) -> Result<ScheduleOutcome> {
        let end_at = if args.clear_end {
            Some(None)
        } else {
            args.end_at.clone().map(Some)
        };
        Ok(self.service()?.update_schedule(
            &args.id,
            SchedulePatch {
                start_at: args.start_at.clone(),
                end_at,
                timezone: args.timezone.clone(),
                enabled: args.enabled,
            },
        )?)
    }

    fn asset_add(&self, args: &AssetAddArgs) -> Result<Asset> {
        let filename = args
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| {
                AppError::InvalidArgument(format!("{} has no file name", args.path.display()))
            })?;
        let size_bytes = std::fs::metadata(&args.path)
            .map(|meta| meta.len() as i64)
            .unwrap_or(0);
        let metadata_json = args
            .duration_sec
            .map(|duration| json!({ "duration_sec": duration }).to_string());
        Ok(self.service()?.add_asset(NewAsset {
            kind: args.kind.clone(),
            filename,
            path: absolute(&args.path).display().to_string(),
            size_bytes,
            metadata_json,
        })?)
    }

    fn destination_add(&self, args: &DestinationAddArgs) -> Result<Destination> {
        Ok(self.service()?.add_destination(DestinationInput {
            name: args.name.clone(),
            platform: args.platform.clone(),
            stream_url: args.stream_url.clone(),
            stream_key: args.stream_key.clone(),
        })?)
    }

    fn preset_add(&self, args: &PresetAddArgs) -> Result<Preset> {
        Ok(self.service()?.add_preset(NewPreset {
            name: args.name.clone(),
            video_codec: args.video_codec.clone(),
            audio_codec: args.audio_codec.clone(),
            remux_enabled: !args.no_remux,
            force_encode: args.force_encode,
        })?)
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub database: PathBuf,
    pub jobs: BTreeMap<String, i64>,
    pub pending_sessions: usize,
    pub running_jobs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EventList {
    pub rows: Vec<Event>,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub rows: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct ScheduleList {
    pub rows: Vec<Schedule>,
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub rows: Vec<Session>,
}

#[derive(Debug, Serialize)]
pub struct SessionLog {
    pub session_id: String,
    pub log_path: PathBuf,
    pub lines: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StopReport {
    pub stopped: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct Removal {
    pub entity: &'static str,
    pub id: String,
    pub impacted_jobs: Vec<String>,
}

impl Removal {
    fn new(entity: &'static str, id: &str, impacted: Vec<Job>) -> Self {
        Self {
            entity,
            id: id.to_string(),
            impacted_jobs: impacted.into_iter().map(|job| job.id).collect(),
        }
    }
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("Database: {}", self.database.display())];
        lines.push("Jobs:".to_string());
        for (status, count) in &self.jobs {
            lines.push(format!("  - {status}: {count}"));
        }
        lines.push(format!("Pending sessions: {}", self.pending_sessions));
        if self.running_jobs.is_empty() {
            lines.push("Running: none".to_string());
        } else {
            lines.push(format!("Running: {}", self.running_jobs.join(", ")));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for EventList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No events".to_string();
        }
        self.rows
            .iter()
            .map(|event| {
                format!(
                    "{} {} job={} session={} | {}",
                    event.created_at.format("%Y-%m-%d %H:%M:%S"),
                    event.event_type,
                    event.job_id.as_deref().unwrap_or("-"),
                    event.session_id.as_deref().unwrap_or("-"),
                    event.message
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn display_rows<T: DisplayFallback>(rows: &[T], empty: &str) -> String {
    if rows.is_empty() {
        return empty.to_string();
    }
    rows.iter()
        .map(DisplayFallback::display)
        .collect::<Vec<_>>()
        .join("\n")
}

impl DisplayFallback for JobList {
    fn display(&self) -> String {
        display_rows(&self.rows, "No jobs")
    }
}

impl DisplayFallback for ScheduleList {
    fn display(&self) -> String {
        display_rows(&self.rows, "No schedules")
    }
}

impl DisplayFallback for SessionList {
    fn display(&self) -> String {
        display_rows(&self.rows, "No sessions")
    }
}

impl DisplayFallback for SessionLog {
    fn display(&self) -> String {
        self.lines.join("\n")
    }
}

impl DisplayFallback for StopReport {
    fn display(&self) -> String {
        if self.stopped.is_empty() {
            "No running session".to_string()
        } else {
            format!("Stopped: {}", self.stopped.join(", "))
        }
    }
}

impl DisplayFallback for Removal {
    fn display(&self) -> String {
        format!(
            "Removed {} {} (impacted {} jobs)",
            self.entity,
            self.id,
            self.impacted_jobs.len()
        )
    }
}

impl DisplayFallback for Job {
    fn display(&self) -> String {
        let mut line = format!(
            "{} | {} | status={} | loop={} | crossfade={}",
            self.id,
            self.name,
            self.status,
            self.loop_enabled,
            or_dash(self.crossfade_seconds)
        );
        if let Some(reason) = &self.invalid_reason {
            line.push_str(&format!("\n  invalid: {reason}"));
        }
        line
    }
}

impl DisplayFallback for JobView {
    fn display(&self) -> String {
        let mut lines = vec![self.job.display()];
        if let Some(schedule) = &self.next_schedule {
            lines.push(format!("  next: {}", schedule.display()));
        }
        if let Some(session) = &self.current_session {
            lines.push(format!("  running: {}", session.display()));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for Session {
    fn display(&self) -> String {
        format!(
            "{} | job={} | status={} | until={} | restarts={}",
            self.id,
            self.job_id,
            self.status.as_str(),
            or_dash(self.target_end_at.map(|end| end.to_rfc3339())),
            self.restart_count
        )
    }
}

impl DisplayFallback for Schedule {
    fn display(&self) -> String {
        format!(
            "{} | job={} | {} -> {} ({}) | enabled={}",
            self.id,
            self.job_id,
            self.start_at.to_rfc3339(),
            or_dash(self.end_at.map(|end| end.to_rfc3339())),
            self.timezone,
            self.enabled
        )
    }
}

impl DisplayFallback for ScheduleOutcome {
    fn display(&self) -> String {
        match &self.warning {
            Some(warning) => format!("{}\n  warning: {warning}", self.schedule.display()),
            None => self.schedule.display(),
        }
    }
}

impl DisplayFallback for Asset {
    fn display(&self) -> String {
        format!(
            "{} | {} | {} | duration={}",
            self.id,
            self.filename,
            self.path,
            or_dash(self.duration_seconds())
        )
    }
}

impl DisplayFallback for Destination {
    fn display(&self) -> String {
        format!(
            "{} | {} | {} | {}",
            self.id, self.name, self.platform, self.stream_url
        )
    }
}

impl DisplayFallback for Preset {
    fn display(&self) -> String {
        format!(
            "{} | {} | video={} | audio={} | remux={} | force_encode={}",
            self.id,
            self.name,
            or_dash(self.video_codec.as_deref()),
            or_dash(self.audio_codec.as_deref()),
            self.remux_enabled,
            self.force_encode
        )
    }
}
