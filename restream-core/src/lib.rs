pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod runner;
pub mod scheduler;
pub mod secrets;
pub mod service;
pub mod sqlite;
pub mod status;
pub mod store;
pub mod time;

pub use config::{
    load_restream_config, EncoderSection, NotificationsSection, PathsSection, RestreamConfig,
    RunnerSection, SchedulerSection, SecuritySection, SettingsSection,
};
pub use encoder::{
    build_launch_args, build_target_url, mask_target, DiskProbe, EncoderSpawner, Fs2DiskProbe,
    LaunchPlan, SystemEncoderSpawner,
};
pub use error::{ConfigError, Result};
pub use events::{
    EventKind, EventRecorder, EventScope, LogNotifier, NotificationKind, Notifier,
};
pub use runner::{
    mark_session_stopped, ProcessExit, Runner, RunnerError, RunnerHandle, RunnerResult,
    StopOutcome, RUNNER_RESTARTED,
};
pub use scheduler::{Scheduler, SchedulerError, SchedulerResult, TickReport, SCHEDULE_END};
pub use secrets::{SecretCodec, SecretError, SecretResult};
pub use service::{
    DestinationInput, JobInput, JobPatch, JobService, JobView, RunNowOptions, ScheduleInput,
    ScheduleOutcome, SchedulePatch, ServiceError, ServiceResult,
};
pub use status::{derive_job_status, reconcile_job_status, JobFacts};
pub use store::{
    Asset, Destination, Event, Job, JobStatus, NewAsset, NewDestination, NewEvent, NewJob,
    NewPreset, NewSchedule, NewSession, Preset, Schedule, Session, SessionStatus, SqliteStore,
    SqliteStoreBuilder, StoreError, StoreResult, SHUTDOWN_STOP_REASON,
};
