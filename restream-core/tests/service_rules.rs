mod common;

use chrono::{Duration, Utc};
use common::Harness;
use restream_core::{
    DestinationInput, JobInput, JobPatch, JobStatus, NewSchedule, RunNowOptions, ServiceError,
    SessionStatus, SqliteStore,
};

#[test]
fn open_ended_run_now_on_non_looping_job_is_rejected() {
    let harness = Harness::new();
    let job_id = harness.seed_job("rtmp://live.example.com/app", false, None);
    let service = harness.service(None);

    let err = service
        .run_now(&job_id, RunNowOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Validation(ref reason) if reason == "Open-ended sessions require loop to be enabled"
    ));
    let job = harness.store.find_job(&job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Invalid);
    assert!(harness.store.list_sessions_for_job(&job_id).unwrap().is_empty());
}

#[test]
fn run_now_reads_naive_end_in_requested_zone() {
    let harness = Harness::new();
    let job_id = harness.seed_job("rtmp://live.example.com/app", true, None);
    let service = harness.service(None);

    let end_utc = (Utc::now() + Duration::hours(3)).naive_utc();
    let end_tokyo = end_utc + Duration::hours(9);
    let session = service
        .run_now(
            &job_id,
            RunNowOptions {
                end_at: Some(end_tokyo.format("%Y-%m-%dT%H:%M:%S").to_string()),
                timezone: Some("Asia/Tokyo".into()),
                ..RunNowOptions::default()
            },
        )
        .unwrap();
    let target = session.target_end_at.unwrap().naive_utc();
    assert!((target - end_utc).num_seconds().abs() <= 1);
}

#[test]
fn due_schedules_survive_a_store_reopen() {
    let harness = Harness::new();
    let job_id = harness.seed_job("rtmp://live.example.com/app", true, None);
    let now = Utc::now();
    let schedule = harness
        .store
        .create_schedule(&NewSchedule {
            job_id: job_id.clone(),
            start_at: now - Duration::minutes(1),
            end_at: None,
            timezone: "UTC".into(),
            enabled: true,
        })
        .unwrap();
    let service = harness.service(None);
    service
        .run_now(
            &job_id,
            RunNowOptions {
                schedule_id: Some(schedule.id.clone()),
                start_at_override: Some(schedule.start_at),
                ..RunNowOptions::default()
            },
        )
        .unwrap();

    // A fresh handle on the same file sees the pending session.
    let reopened = SqliteStore::new(harness.store.path()).unwrap();
    assert!(reopened.list_due_schedules(now).unwrap().is_empty());

    let session = reopened.list_sessions_for_job(&job_id).unwrap().remove(0);
    reopened
        .update_session_status(&session.id, SessionStatus::Failed, Some("boom"), None)
        .unwrap();
    let due = reopened.list_due_schedules(now).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, schedule.id);
}

#[test]
fn destination_removal_invalidates_and_repair_needs_explicit_clear() {
    let harness = Harness::new();
    let job_id = harness.seed_job("rtmp://live.example.com/app", true, None);
    let service = harness.service(None);
    let job = harness.store.find_job(&job_id).unwrap().unwrap();

    let impacted = service.remove_destination(&job.destination_id).unwrap();
    assert_eq!(impacted.len(), 1);
    let job = harness.store.find_job(&job_id).unwrap().unwrap();
    assert_eq!(
        job.invalid_reason.as_deref(),
        Some("Destination removed: main. Please choose another destination.")
    );

    let replacement = service
        .add_destination(DestinationInput {
            name: "backup".into(),
            platform: Some("youtube".into()),
            stream_url: "rtmps://b.rtmp.youtube.com/live2".into(),
            stream_key: "abcd".into(),
        })
        .unwrap();
    let repaired = service
        .update_job(
            &job_id,
            JobPatch {
                destination_id: Some(replacement.id.clone()),
                ..JobPatch::default()
            },
        )
        .unwrap();
    assert_eq!(repaired.status, JobStatus::Invalid);

    let repaired = service
        .update_job(
            &job_id,
            JobPatch {
                invalid_reason: Some(None),
                ..JobPatch::default()
            },
        )
        .unwrap();
    assert_eq!(repaired.status, JobStatus::Idle);
    assert_eq!(repaired.destination_id, replacement.id);
}

#[test]
fn job_creation_checks_references() {
    let harness = Harness::new();
    let service = harness.service(None);
    let err = service
        .create_job(JobInput {
            name: "orphan".into(),
            video_asset_id: "missing".into(),
            destination_id: "missing".into(),
            ..JobInput::default()
        })
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(ref reason) if reason == "Asset not found"));
}
