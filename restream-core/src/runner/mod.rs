//! Session runner: launches the encoder for pending sessions, supervises the
//! processes and turns every exit into a session transition.
//!
//! All runner state lives in [`Runner`], which is moved into its own task by
//! [`Runner::run`]. Other components talk to it through a [`RunnerHandle`];
//! process watchers report exits over the same channel, so every mutation of
//! the running table and the retry tracker happens on one task.

mod retry;

pub use retry::{within_retry_window, RetryState, RetryTracker};

use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::RestreamConfig;
use crate::encoder::{
    build_launch_args, DiskProbe, EncoderSpawner, Fs2DiskProbe, SystemEncoderSpawner,
};
use crate::events::{EventKind, EventRecorder, EventScope};
use crate::secrets::SecretCodec;
use crate::status::reconcile_job_status;
use crate::store::{
    Job, Session, SessionStatus, SqliteStore, StoreError, SHUTDOWN_STOP_REASON,
};

pub const RUNNER_RESTARTED: &str = "Runner restarted";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runner is not running")]
    Closed,
}

pub type RunnerResult<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// SIGTERM sent; the session transitions when the process exits.
    PendingKill,
    /// No live process; the session was marked stopped directly.
    Stopped,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub spawn_error: Option<String>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
            spawn_error: None,
        }
    }

    fn signal_name(&self) -> Option<&'static str> {
        self.signal
            .and_then(|raw| Signal::try_from(raw).ok())
            .map(|signal| signal.as_str())
    }

    pub fn message(&self) -> String {
        if let Some(err) = &self.spawn_error {
            return format!("FFmpeg failed to start: {err}");
        }
        let code = self
            .code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "none".to_string());
        match (self.signal_name(), self.signal) {
            (Some(name), _) => format!("FFmpeg exited with code {code} signal {name}"),
            (None, Some(raw)) => format!("FFmpeg exited with code {code} signal {raw}"),
            (None, None) => format!("FFmpeg exited with code {code}"),
        }
    }
}

#[derive(Debug)]
enum RunnerMessage {
    Tick,
    Exited {
        session_id: String,
        exit: ProcessExit,
    },
    Escalate {
        session_id: String,
    },
    StopSession {
        session_id: String,
        reason: String,
        reply: oneshot::Sender<StopOutcome>,
    },
    StopJob {
        job_id: String,
        reason: String,
        reply: oneshot::Sender<StopOutcome>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone)]
pub struct RunnerHandle {
    tx: mpsc::UnboundedSender<RunnerMessage>,
}

impl RunnerHandle {
    /// Asks for an immediate tick instead of waiting for the next period.
    pub fn wake(&self) {
        let _ = self.tx.send(RunnerMessage::Tick);
    }

    pub async fn stop_session(&self, session_id: &str, reason: &str) -> RunnerResult<StopOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RunnerMessage::StopSession {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
                reply,
            })
            .map_err(|_| RunnerError::Closed)?;
        rx.await.map_err(|_| RunnerError::Closed)
    }

    pub async fn stop_job(&self, job_id: &str, reason: &str) -> RunnerResult<StopOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RunnerMessage::StopJob {
                job_id: job_id.to_string(),
                reason: reason.to_string(),
                reply,
            })
            .map_err(|_| RunnerError::Closed)?;
        rx.await.map_err(|_| RunnerError::Closed)
    }

    /// Stops every live process with reason `shutdown` and resolves once
    /// their exits have been recorded. Schedules whose window is still open
    /// fire again when the daemon comes back.
    pub async fn shutdown(&self) -> RunnerResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RunnerMessage::Shutdown { reply })
            .map_err(|_| RunnerError::Closed)?;
        rx.await.map_err(|_| RunnerError::Closed)
    }
}

#[derive(Debug)]
struct RunningProcess {
    pid: Option<u32>,
    session: Session,
    job: Job,
    log_path: PathBuf,
    stop_requested: bool,
    stop_reason: Option<String>,
    kill_tx: Option<oneshot::Sender<()>>,
    kill_timer: Option<JoinHandle<()>>,
}

impl RunningProcess {
    fn hard_kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}

pub struct Runner {
    store: SqliteStore,
    config: RestreamConfig,
    recorder: EventRecorder,
    codec: SecretCodec,
    spawner: Arc<dyn EncoderSpawner>,
    disk_probe: Arc<dyn DiskProbe>,
    running: HashMap<String, RunningProcess>,
    retry: RetryTracker,
    tx: mpsc::UnboundedSender<RunnerMessage>,
    rx: mpsc::UnboundedReceiver<RunnerMessage>,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("store", &self.store)
            .field("running", &self.running.keys().collect::<Vec<_>>())
            .field("retry", &self.retry)
            .finish()
    }
}

impl Runner {
    pub fn new(
        store: SqliteStore,
        config: RestreamConfig,
        recorder: EventRecorder,
        codec: SecretCodec,
        spawner: Option<Arc<dyn EncoderSpawner>>,
        disk_probe: Option<Arc<dyn DiskProbe>>,
    ) -> Self {
        let spawner = spawner.unwrap_or_else(|| Arc::new(SystemEncoderSpawner));
        let disk_probe = disk_probe
            .unwrap_or_else(|| Arc::new(Fs2DiskProbe::new(config.paths.data_dir.clone())));
        let retry = RetryTracker::new(config.runner.backoff_seconds.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store,
            config,
            recorder,
            codec,
            spawner,
            disk_probe,
            running: HashMap::new(),
            retry,
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Drives the runner until [`RunnerHandle::shutdown`] completes.
    pub async fn run(mut self) {
        self.recover_orphans();
        let mut ticker = interval(self.config.runner.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown: Option<oneshot::Sender<()>> = None;
        info!(target: "runner", poll = ?self.config.runner.poll_interval(), "runner started");

        loop {
            tokio::select! {
                _ = ticker.tick(), if shutdown.is_none() => self.tick(Utc::now()),
                Some(message) = self.rx.recv() => {
                    if let Some(reply) = self.handle_message(message) {
                        shutdown = Some(reply);
                    }
                }
            }
            if shutdown.is_some() && self.running.is_empty() {
                if let Some(reply) = shutdown.take() {
                    let _ = reply.send(());
                }
                break;
            }
        }
        info!(target: "runner", "runner stopped");
    }

    fn handle_message(&mut self, message: RunnerMessage) -> Option<oneshot::Sender<()>> {
        let now = Utc::now();
        match message {
            RunnerMessage::Tick => self.tick(now),
            RunnerMessage::Exited { session_id, exit } => self.handle_exit(&session_id, exit, now),
            RunnerMessage::Escalate { session_id } => {
                if let Some(entry) = self.running.get_mut(&session_id) {
                    warn!(target: "runner", session_id = %session_id, "encoder ignored SIGTERM, killing");
                    entry.hard_kill();
                }
            }
            RunnerMessage::StopSession {
                session_id,
                reason,
                reply,
            } => {
                let outcome = self.stop_by_session_id(&session_id, &reason);
                let _ = reply.send(outcome);
            }
            RunnerMessage::StopJob {
                job_id,
                reason,
                reply,
            } => {
                let outcome = self.stop_by_job_id(&job_id, &reason);
                let _ = reply.send(outcome);
            }
            RunnerMessage::Shutdown { reply } => {
                let ids: Vec<String> = self.running.keys().cloned().collect();
                for session_id in ids {
                    self.stop_by_session_id(&session_id, SHUTDOWN_STOP_REASON);
                }
                return Some(reply);
            }
        }
        None
    }

    /// Sessions left `running` by a previous process have nobody supervising
    /// them; they go back to the queue.
    pub(crate) fn recover_orphans(&mut self) {
        match self.store.requeue_orphaned_sessions(RUNNER_RESTARTED) {
            Ok(orphans) => {
                for session in orphans {
                    info!(target: "runner", session_id = %session.id, job_id = %session.job_id, "requeued orphaned session");
                }
            }
            Err(err) => error!(target: "runner", error = %err, "failed to requeue orphaned sessions"),
        }
    }

    pub(crate) fn tick(&mut self, now: DateTime<Utc>) {
        if let Err(err) = self.start_pending_sessions(now) {
            error!(target: "runner", error = %err, "failed to start pending sessions");
        }
        self.stop_expired_sessions(now);
        if let Err(err) = self.reap_terminated_sessions() {
            error!(target: "runner", error = %err, "failed to reap stopped sessions");
        }
    }

    fn start_pending_sessions(&mut self, now: DateTime<Utc>) -> RunnerResult<()> {
        for session in self.store.find_pending_sessions()? {
            if self.running.contains_key(&session.id) {
                continue;
            }
            if self.retry.seed(&session, now) || !self.retry.ready(&session.id, now) {
                continue;
            }
            if let Err(err) = self.launch(&session, now) {
                error!(target: "runner", session_id = %session.id, error = %err, "launch failed");
            }
        }
        Ok(())
    }

    fn stop_expired_sessions(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .running
            .values()
            .filter(|entry| !entry.stop_requested && entry.session.window_closed(now))
            .map(|entry| entry.session.id.clone())
            .collect();
        for session_id in expired {
            info!(target: "runner", session_id = %session_id, "session window ended");
            self.stop_by_session_id(&session_id, "schedule_end");
        }
    }

    fn reap_terminated_sessions(&mut self) -> RunnerResult<()> {
        let tracked: Vec<String> = self
            .running
            .values()
            .filter(|entry| !entry.stop_requested)
            .map(|entry| entry.session.id.clone())
            .collect();
        for session_id in tracked {
            let reason = match self.store.find_session(&session_id)? {
                Some(session) if session.status.terminal() => session
                    .stop_reason
                    .unwrap_or_else(|| "stopped".to_string()),
                Some(_) => continue,
                None => "session_removed".to_string(),
            };
            info!(target: "runner", session_id = %session_id, reason = %reason, "session ended outside the runner");
            self.stop_by_session_id(&session_id, &reason);
        }
        Ok(())
    }

    fn fail_session(&self, session: &Session, error: &str) -> RunnerResult<()> {
        self.store
            .update_session_status(&session.id, SessionStatus::Failed, Some(error), None)?;
        self.recorder.record(
            EventKind::SessionFailed,
            error,
            EventScope::session(&session.job_id, &session.id),
            None,
        );
        reconcile_job_status(&self.store, &session.job_id)?;
        Ok(())
    }

    fn block(
        &mut self,
        session: &Session,
        error: &str,
        event_message: &str,
        invalidate_job: Option<&str>,
        reconcile: bool,
    ) -> RunnerResult<()> {
        warn!(target: "runner", session_id = %session.id, job_id = %session.job_id, reason = error, "launch blocked");
        self.retry.clear(&session.id);
        self.recorder.record(
            EventKind::SessionBlocked,
            event_message,
            EventScope::session(&session.job_id, &session.id),
            None,
        );
        if let Some(reason) = invalidate_job {
            self.store.mark_job_invalid(&session.job_id, reason)?;
        }
        if reconcile {
            self.fail_session(session, error)
        } else {
            self.store
                .update_session_status(&session.id, SessionStatus::Failed, Some(error), None)?;
            self.recorder.record(
                EventKind::SessionFailed,
                error,
                EventScope::session(&session.job_id, &session.id),
                None,
            );
            Ok(())
        }
    }

    fn launch(&mut self, session: &Session, now: DateTime<Utc>) -> RunnerResult<()> {
        let Some(job) = self.store.find_job(&session.job_id)? else {
            return self.block(
                session,
                "Job missing for session",
                "Job missing for session",
                None,
                false,
            );
        };
        let Some(asset) = self.store.find_asset(&job.video_asset_id)? else {
            return self.block(
                session,
                "Asset missing for session",
                "Asset missing",
                Some("Asset missing"),
                true,
            );
        };
        let Some(destination) = self.store.find_destination(&job.destination_id)? else {
            return self.block(
                session,
                "Destination missing",
                "Destination missing",
                Some("Destination missing"),
                true,
            );
        };
        if !destination.has_rtmp_scheme() {
            return self.block(
                session,
                "Destination URL invalid",
                "Destination URL must start with rtmp:// or rtmps://",
                Some("Destination URL invalid"),
                true,
            );
        }
        let stream_key = match self.codec.decrypt(&destination.stream_key_enc) {
            Ok(key) => key,
            Err(err) => {
                debug!(target: "runner", destination_id = %destination.id, error = %err, "stream key decryption failed");
                return self.block(
                    session,
                    "Stream key could not be decrypted",
                    "Stream key could not be decrypted",
                    Some("Stream key could not be decrypted"),
                    true,
                );
            }
        };
        if let Some(other) = self.store.find_running_session_by_job(&job.id)? {
            if other.id != session.id {
                return self.block(
                    session,
                    "Concurrent session blocked",
                    "Another session already running for this job",
                    None,
                    false,
                );
            }
        }
        if session.window_closed(now) {
            return self.block(
                session,
                "Session window closed",
                "Session window already closed",
                None,
                true,
            );
        }
        if let Some(free_mb) = self.disk_probe.free_megabytes() {
            if free_mb < self.config.runner.min_free_disk_mb {
                return self.block(
                    session,
                    "Low disk",
                    &format!("Insufficient disk space: {free_mb} MB free"),
                    None,
                    true,
                );
            }
        }

        let preset = match &job.preset_id {
            Some(preset_id) => self.store.find_preset(preset_id)?,
            None => None,
        };
        let plan = build_launch_args(
            &self.config.encoder,
            &job,
            &asset,
            &destination,
            &stream_key,
            preset.as_ref(),
        );

        let log_dir = self.config.logs_dir().join("ffmpeg");
        std::fs::create_dir_all(&log_dir)?;
        let log_path = log_dir.join(format!("session_{}.log", session.id));
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let log_path_str = log_path.to_string_lossy().to_string();
        if !self.store.claim_running(&session.id, now, &log_path_str)? {
            let current = self.store.find_session(&session.id)?;
            if matches!(current, Some(ref row) if row.status == SessionStatus::Pending) {
                return self.block(
                    session,
                    "Concurrent session blocked",
                    "Another session already running for this job",
                    None,
                    false,
                );
            }
            debug!(target: "runner", session_id = %session.id, "session no longer pending, skipping launch");
            return Ok(());
        }
        let mut claimed = session.clone();
        claimed.status = SessionStatus::Running;
        claimed.started_at = Some(now);
        claimed.log_path = Some(log_path_str);

        let mut child = match self.spawner.spawn(&plan.program, &plan.args, log_file) {
            Ok(child) => child,
            Err(err) => {
                error!(target: "runner", session_id = %session.id, program = %plan.program.display(), error = %err, "failed to spawn encoder");
                self.handle_exit(
                    &session.id,
                    ProcessExit {
                        code: None,
                        signal: None,
                        spawn_error: Some(err.to_string()),
                    },
                    now,
                );
                return Ok(());
            }
        };

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let tx = self.tx.clone();
        let watched_id = session.id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => ProcessExit {
                    code: status.code(),
                    signal: status.signal(),
                    spawn_error: None,
                },
                Err(err) => ProcessExit {
                    code: None,
                    signal: None,
                    spawn_error: Some(err.to_string()),
                },
            };
            let _ = tx.send(RunnerMessage::Exited {
                session_id: watched_id,
                exit,
            });
        });

        info!(
            target: "runner",
            session_id = %session.id,
            job_id = %job.id,
            pid = ?pid,
            target_url = %plan.masked_target,
            "encoder started"
        );
        self.recorder.record(
            EventKind::FfmpegStarted,
            format!("FFmpeg started for job {}", job.name),
            EventScope::session(&job.id, &session.id),
            Some(json!({
                "target": plan.masked_target,
                "loop_enabled": job.loop_enabled,
                "preset": preset.as_ref().map(|preset| preset.name.clone()),
            })),
        );
        self.running.insert(
            session.id.clone(),
            RunningProcess {
                pid,
                session: claimed,
                job,
                log_path,
                stop_requested: false,
                stop_reason: None,
                kill_tx: Some(kill_tx),
                kill_timer: None,
            },
        );
        self.retry.clear(&session.id);
        if let Err(err) = reconcile_job_status(&self.store, &session.job_id) {
            warn!(target: "runner", job_id = %session.job_id, error = %err, "failed to reconcile job");
        }
        Ok(())
    }

    fn stop_by_job_id(&mut self, job_id: &str, reason: &str) -> StopOutcome {
        let tracked = self
            .running
            .values()
            .find(|entry| entry.job.id == job_id)
            .map(|entry| entry.session.id.clone());
        if let Some(session_id) = tracked {
            return self.stop_by_session_id(&session_id, reason);
        }
        match self.store.find_running_session_by_job(job_id) {
            Ok(Some(session)) => self.stop_untracked(&session, reason),
            Ok(None) => StopOutcome::NotFound,
            Err(err) => {
                error!(target: "runner", job_id = %job_id, error = %err, "failed to look up running session");
                StopOutcome::NotFound
            }
        }
    }

    fn stop_by_session_id(&mut self, session_id: &str, reason: &str) -> StopOutcome {
        if let Some(entry) = self.running.get_mut(session_id) {
            if entry.stop_requested {
                return StopOutcome::PendingKill;
            }
            entry.stop_requested = true;
            entry.stop_reason = Some(reason.to_string());
            match entry.pid {
                Some(pid) => {
                    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        debug!(target: "runner", session_id = %session_id, error = %err, "SIGTERM failed");
                    }
                }
                None => entry.hard_kill(),
            }
            let tx = self.tx.clone();
            let grace = self.config.runner.stop_grace();
            let escalate_id = session_id.to_string();
            entry.kill_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = tx.send(RunnerMessage::Escalate {
                    session_id: escalate_id,
                });
            }));
            info!(target: "runner", session_id = %session_id, reason = %reason, "stopping encoder");
            return StopOutcome::PendingKill;
        }
        match self.store.find_session(session_id) {
            Ok(Some(session)) => self.stop_untracked(&session, reason),
            Ok(None) => StopOutcome::NotFound,
            Err(err) => {
                error!(target: "runner", session_id = %session_id, error = %err, "failed to load session");
                StopOutcome::NotFound
            }
        }
    }

    fn stop_untracked(&mut self, session: &Session, reason: &str) -> StopOutcome {
        if let Err(err) = mark_session_stopped(&self.store, &self.recorder, session, reason) {
            error!(target: "runner", session_id = %session.id, error = %err, "failed to stop session");
        }
        self.retry.clear(&session.id);
        self.running.remove(&session.id);
        StopOutcome::Stopped
    }

    pub(crate) fn handle_exit(&mut self, session_id: &str, exit: ProcessExit, now: DateTime<Utc>) {
        if let Err(err) = self.resolve_exit(session_id, exit, now) {
            error!(target: "runner", session_id = %session_id, error = %err, "failed to record encoder exit");
        }
    }

    fn resolve_exit(
        &mut self,
        session_id: &str,
        exit: ProcessExit,
        now: DateTime<Utc>,
    ) -> RunnerResult<()> {
        let entry = self.running.remove(session_id);
        if let Some(timer) = entry.as_ref().and_then(|entry| entry.kill_timer.as_ref()) {
            timer.abort();
        }
        let Some(session) = self.store.find_session(session_id)? else {
            self.retry.clear(session_id);
            return Ok(());
        };
        let scope = EventScope::session(&session.job_id, &session.id);
        let message = exit.message();
        info!(
            target: "runner",
            session_id = %session_id,
            code = ?exit.code,
            signal = ?exit.signal,
            log = ?entry.as_ref().map(|entry| entry.log_path.display().to_string()),
            "encoder exited"
        );
        self.recorder.record(
            EventKind::FfmpegExit,
            message.clone(),
            scope,
            Some(json!({ "code": exit.code, "signal": exit.signal_name().map(str::to_string).or(exit.signal.map(|raw| raw.to_string())) })),
        );

        if let Some(entry) = entry.filter(|entry| entry.stop_requested) {
            let reason = entry.stop_reason.as_deref().unwrap_or("stopped");
            mark_session_stopped(&self.store, &self.recorder, &session, reason)?;
            self.retry.clear(session_id);
            return Ok(());
        }

        if exit.code == Some(0) && exit.spawn_error.is_none() {
            self.store.update_session_status(
                session_id,
                SessionStatus::Stopped,
                None,
                Some("natural_end"),
            )?;
            self.recorder
                .record(EventKind::SessionStopped, "Session completed", scope, None);
            reconcile_job_status(&self.store, &session.job_id)?;
            self.retry.clear(session_id);
            return Ok(());
        }

        if !within_retry_window(&session, now, self.config.runner.open_ended_retry_minutes) {
            warn!(target: "runner", session_id = %session_id, "retry window closed, giving up");
            self.recorder.record(
                EventKind::RetryGaveUp,
                "Retry window closed, giving up",
                scope,
                None,
            );
            self.fail_session(&session, &message)?;
            self.retry.clear(session_id);
            return Ok(());
        }

        let (delay, attempt) = self
            .retry
            .record_failure(session_id, session.restart_count, now);
        self.store.requeue_session(session_id, &message)?;
        self.store.increment_restart_count(session_id)?;
        info!(target: "runner", session_id = %session_id, delay_seconds = delay.num_seconds(), attempt, "retry scheduled");
        self.recorder.record(
            EventKind::RetryScheduled,
            format!("Retrying in {} seconds", delay.num_seconds()),
            scope,
            Some(json!({ "delay_seconds": delay.num_seconds(), "attempt": attempt })),
        );
        Ok(())
    }
}

/// Synchronous stop for a session with no live process.
pub fn mark_session_stopped(
    store: &SqliteStore,
    recorder: &EventRecorder,
    session: &Session,
    reason: &str,
) -> Result<(), StoreError> {
    store.update_session_status(&session.id, SessionStatus::Stopped, None, Some(reason))?;
    recorder.record(
        EventKind::SessionStopped,
        format!("Session stopped ({reason})"),
        EventScope::session(&session.job_id, &session.id),
        None,
    );
    reconcile_job_status(store, &session.job_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationsSection;
    use crate::store::{NewAsset, NewDestination, NewJob, NewSession};
    use chrono::Duration;
    use tempfile::TempDir;

    struct FixedDisk(Option<u64>);

    impl DiskProbe for FixedDisk {
        fn free_megabytes(&self) -> Option<u64> {
            self.0
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: SqliteStore,
        runner: Runner,
        job_id: String,
    }

    fn fixture(loop_enabled: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        let config: RestreamConfig = toml::from_str(&format!(
            "[paths]\ndata_dir = \"{data_dir}\"\ndatabase = \"restream.sqlite\"\nlogs_dir = \"logs\"\n"
        ))
        .unwrap();
        let store = SqliteStore::new(config.database_path()).unwrap();
        store.initialize().unwrap();
        let codec = SecretCodec::from_install_secret("test-secret");
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
                stream_key_enc: codec.encrypt("key").unwrap(),
                ..NewDestination::default()
            })
            .unwrap();
        let job = store
            .create_job(&NewJob {
                name: "job".into(),
                video_asset_id: asset.id,
                destination_id: destination.id,
                loop_enabled,
                ..NewJob::default()
            })
            .unwrap();
        let recorder = EventRecorder::new(store.clone(), NotificationsSection::default(), None);
        let runner = Runner::new(
            store.clone(),
            config,
            recorder,
            codec,
            None,
            Some(Arc::new(FixedDisk(Some(10_000)))),
        );
        Fixture {
            _dir: dir,
            store,
            runner,
            job_id: job.id,
        }
    }

    fn running_session(
        store: &SqliteStore,
        job_id: &str,
        started_at: DateTime<Utc>,
        target_end_at: Option<DateTime<Utc>>,
    ) -> Session {
        let session = store
            .create_session(&NewSession {
                job_id: job_id.to_string(),
                started_at: Some(started_at),
                target_end_at,
                ..NewSession::default()
            })
            .unwrap();
        store
            .mark_session_running(&session.id, started_at, "/tmp/session.log")
            .unwrap();
        session
    }

    #[test]
    fn backoff_follows_restart_count() {
        let mut fx = fixture(true);
        let now = Utc::now();
        let session = running_session(
            &fx.store,
            &fx.job_id,
            now,
            Some(now + Duration::hours(2)),
        );

        for (index, expected) in [5, 10, 20, 40, 60, 120, 120].iter().enumerate() {
            fx.runner
                .handle_exit(&session.id, ProcessExit::code(1), now);
            let row = fx.store.find_session(&session.id).unwrap().unwrap();
            assert_eq!(row.status, SessionStatus::Pending);
            assert_eq!(row.restart_count as usize, index + 1);
            assert_eq!(row.error.as_deref(), Some("FFmpeg exited with code 1"));
            let state = fx.runner.retry.get(&session.id).unwrap();
            assert_eq!(state.next_attempt, now + Duration::seconds(*expected));
            assert_eq!(state.count as usize, index + 1);
        }

        let scheduled: Vec<i64> = fx
            .store
            .list_events_for_session(&session.id)
            .unwrap()
            .into_iter()
            .filter(|event| event.event_type == "retry_scheduled")
            .map(|event| event.metadata.unwrap()["delay_seconds"].as_i64().unwrap())
            .collect();
        assert_eq!(scheduled, vec![5, 10, 20, 40, 60, 120, 120]);
    }

    #[test]
    fn open_ended_session_gives_up_after_window() {
        let mut fx = fixture(true);
        let now = Utc::now();
        let session = running_session(&fx.store, &fx.job_id, now - Duration::minutes(31), None);

        fx.runner
            .handle_exit(&session.id, ProcessExit::code(1), now);

        let row = fx.store.find_session(&session.id).unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Failed);
        assert_eq!(row.restart_count, 0);
        assert_eq!(row.error.as_deref(), Some("FFmpeg exited with code 1"));
        assert!(row.ended_at.is_some());
        let kinds: Vec<String> = fx
            .store
            .list_events_for_session(&session.id)
            .unwrap()
            .into_iter()
            .map(|event| event.event_type)
            .collect();
        assert!(kinds.contains(&"retry_gave_up".to_string()));
        assert!(kinds.contains(&"session_failed".to_string()));
        assert!(fx.runner.retry.get(&session.id).is_none());
    }

    #[test]
    fn clean_exit_is_natural_end() {
        let mut fx = fixture(true);
        let now = Utc::now();
        let session = running_session(
            &fx.store,
            &fx.job_id,
            now,
            Some(now + Duration::minutes(1)),
        );
        fx.runner
            .handle_exit(&session.id, ProcessExit::code(0), now);

        let row = fx.store.find_session(&session.id).unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Stopped);
        assert_eq!(row.stop_reason.as_deref(), Some("natural_end"));
        let job = fx.store.find_job(&fx.job_id).unwrap().unwrap();
        assert_eq!(job.status, crate::store::JobStatus::Stopped);
    }

    #[test]
    fn restarted_runner_requeues_and_waits_out_backoff() {
        let mut fx = fixture(true);
        let now = Utc::now();
        let session = running_session(
            &fx.store,
            &fx.job_id,
            now,
            Some(now + Duration::hours(1)),
        );
        fx.store.increment_restart_count(&session.id).unwrap();
        fx.store.increment_restart_count(&session.id).unwrap();

        fx.runner.recover_orphans();
        let row = fx.store.find_session(&session.id).unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Pending);
        assert_eq!(row.error.as_deref(), Some(RUNNER_RESTARTED));

        fx.runner.tick(now);
        let row = fx.store.find_session(&session.id).unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Pending);
        assert_eq!(
            fx.runner.retry.get(&session.id).unwrap().next_attempt,
            now + Duration::seconds(10)
        );
    }

    #[test]
    fn blocked_launch_drops_retry_state() {
        let mut fx = fixture(true);
        let now = Utc::now();
        let session = running_session(
            &fx.store,
            &fx.job_id,
            now,
            Some(now + Duration::hours(2)),
        );
        fx.runner
            .handle_exit(&session.id, ProcessExit::code(1), now);
        assert!(fx.runner.retry.get(&session.id).is_some());

        fx.runner.disk_probe = Arc::new(FixedDisk(Some(1)));
        fx.runner.tick(now + Duration::minutes(1));

        let row = fx.store.find_session(&session.id).unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("Low disk"));
        assert!(fx.runner.retry.get(&session.id).is_none());
    }

    #[test]
    fn exit_messages_name_the_signal() {
        let exit = ProcessExit {
            code: None,
            signal: Some(9),
            spawn_error: None,
        };
        assert_eq!(exit.message(), "FFmpeg exited with code none signal SIGKILL");
        assert_eq!(ProcessExit::code(1).message(), "FFmpeg exited with code 1");
    }
}
