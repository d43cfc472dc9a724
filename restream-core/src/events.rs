//! Append-only event log plus the notification side channel.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::NotificationsSection;
use crate::store::{Event, NewEvent, SqliteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobCreated,
    JobUpdated,
    JobInvalidated,
    AssetCreated,
    AssetDeleted,
    DestinationCreated,
    DestinationDeleted,
    PresetCreated,
    PresetDeleted,
    ScheduleCreated,
    ScheduleUpdated,
    ScheduleDisabled,
    ScheduleDeleted,
    SessionCreated,
    SessionBlocked,
    SessionStopped,
    SessionFailed,
    FfmpegStarted,
    FfmpegExit,
    RetryScheduled,
    RetryGaveUp,
    NotificationFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobCreated => "job_created",
            EventKind::JobUpdated => "job_updated",
            EventKind::JobInvalidated => "job_invalidated",
            EventKind::AssetCreated => "asset_created",
            EventKind::AssetDeleted => "asset_deleted",
            EventKind::DestinationCreated => "destination_created",
            EventKind::DestinationDeleted => "destination_deleted",
            EventKind::PresetCreated => "preset_created",
            EventKind::PresetDeleted => "preset_deleted",
            EventKind::ScheduleCreated => "schedule_created",
            EventKind::ScheduleUpdated => "schedule_updated",
            EventKind::ScheduleDisabled => "schedule_disabled",
            EventKind::ScheduleDeleted => "schedule_deleted",
            EventKind::SessionCreated => "session_created",
            EventKind::SessionBlocked => "session_blocked",
            EventKind::SessionStopped => "session_stopped",
            EventKind::SessionFailed => "session_failed",
            EventKind::FfmpegStarted => "ffmpeg_started",
            EventKind::FfmpegExit => "ffmpeg_exit",
            EventKind::RetryScheduled => "retry_scheduled",
            EventKind::RetryGaveUp => "retry_gave_up",
            EventKind::NotificationFailed => "notification_failed",
        }
    }

    /// Which notification, if any, this event raises. Every kind is listed so
    /// adding a variant forces a decision here.
    pub fn notification(&self) -> Option<NotificationKind> {
        match self {
            EventKind::FfmpegStarted => Some(NotificationKind::StreamStart),
            EventKind::SessionStopped => Some(NotificationKind::StreamStop),
            EventKind::SessionFailed => Some(NotificationKind::StreamFail),
            EventKind::RetryGaveUp => Some(NotificationKind::RetryGaveUp),
            EventKind::JobCreated
            | EventKind::JobUpdated
            | EventKind::JobInvalidated
            | EventKind::AssetCreated
            | EventKind::AssetDeleted
            | EventKind::DestinationCreated
            | EventKind::DestinationDeleted
            | EventKind::PresetCreated
            | EventKind::PresetDeleted
            | EventKind::ScheduleCreated
            | EventKind::ScheduleUpdated
            | EventKind::ScheduleDisabled
            | EventKind::ScheduleDeleted
            | EventKind::SessionCreated
            | EventKind::SessionBlocked
            | EventKind::FfmpegExit
            | EventKind::RetryScheduled
            | EventKind::NotificationFailed => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    StreamStart,
    StreamStop,
    StreamFail,
    RetryGaveUp,
}

impl NotificationKind {
    pub fn label(&self) -> &'static str {
        match self {
            NotificationKind::StreamStart => "Stream started",
            NotificationKind::StreamStop => "Stream stopped",
            NotificationKind::StreamFail => "Stream failed",
            NotificationKind::RetryGaveUp => "Retry gave up",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: NotificationKind, event: &Event) -> Result<(), String>;
}

/// Writes notifications to the log. Used when no delivery channel is wired.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, kind: NotificationKind, event: &Event) -> Result<(), String> {
        info!(
            target: "notifications",
            kind = kind.label(),
            job_id = event.job_id.as_deref().unwrap_or("-"),
            session_id = event.session_id.as_deref().unwrap_or("-"),
            "{}",
            event.message
        );
        Ok(())
    }
}

/// Identifiers an event is attached to.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventScope<'a> {
    pub job_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub schedule_id: Option<&'a str>,
}

impl<'a> EventScope<'a> {
    pub fn job(job_id: &'a str) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::default()
        }
    }

    pub fn session(job_id: &'a str, session_id: &'a str) -> Self {
        Self {
            job_id: Some(job_id),
            session_id: Some(session_id),
            schedule_id: None,
        }
    }

    pub fn with_schedule(mut self, schedule_id: Option<&'a str>) -> Self {
        self.schedule_id = schedule_id;
        self
    }
}

#[derive(Clone)]
pub struct EventRecorder {
    store: SqliteStore,
    notifications: NotificationsSection,
    notifier: Option<Arc<dyn Notifier>>,
}

impl fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecorder")
            .field("store", &self.store)
            .field("notifications", &self.notifications)
            .finish()
    }
}

impl EventRecorder {
    pub fn new(
        store: SqliteStore,
        notifications: NotificationsSection,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            store,
            notifications,
            notifier,
        }
    }

    /// Appends the event. Storage failures are logged and swallowed.
    pub fn record(
        &self,
        kind: EventKind,
        message: impl Into<String>,
        scope: EventScope<'_>,
        metadata: Option<Value>,
    ) -> Option<Event> {
        let message = message.into();
        debug!(event = kind.as_str(), job_id = ?scope.job_id, session_id = ?scope.session_id, "{message}");
        let new_event = NewEvent {
            event_type: kind.as_str().to_string(),
            message,
            job_id: scope.job_id.map(str::to_string),
            session_id: scope.session_id.map(str::to_string),
            schedule_id: scope.schedule_id.map(str::to_string),
            metadata,
        };
        let event = match self.store.insert_event(&new_event) {
            Ok(event) => event,
            Err(err) => {
                warn!(event = kind.as_str(), error = %err, "failed to record event");
                return None;
            }
        };
        if let Some(notification) = kind.notification() {
            self.dispatch(notification, &event);
        }
        Some(event)
    }

    fn dispatch(&self, kind: NotificationKind, event: &Event) {
        if !self.notifications.wants(kind) {
            return;
        }
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(kind = kind.label(), "no runtime available, notification skipped");
            return;
        };
        let store = self.store.clone();
        let event = event.clone();
        runtime.spawn(async move {
            if let Err(err) = notifier.notify(kind, &event).await {
                warn!(kind = kind.label(), error = %err, "notification delivery failed");
                let failure = NewEvent {
                    event_type: EventKind::NotificationFailed.as_str().to_string(),
                    message: err,
                    job_id: event.job_id.clone(),
                    session_id: event.session_id.clone(),
                    schedule_id: event.schedule_id.clone(),
                    metadata: Some(serde_json::json!({ "notification": kind })),
                };
                if let Err(err) = store.insert_event(&failure) {
                    warn!(error = %err, "failed to record notification failure");
                }
            }
        });
    }
}
