pub mod error;
pub mod models;
pub mod repository;

pub use error::{StoreError, StoreResult};
pub use models::{
    Asset, Destination, Event, Job, JobStatus, NewAsset, NewDestination, NewEvent, NewJob,
    NewPreset, NewSchedule, NewSession, Preset, Schedule, Session, SessionStatus,
};
pub use repository::{SqliteStore, SqliteStoreBuilder, SHUTDOWN_STOP_REASON};
