use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::store::Session;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    pub count: u32,
    pub next_attempt: DateTime<Utc>,
    pub first_failure_at: DateTime<Utc>,
}

/// In-memory backoff bookkeeping keyed by session id. The persisted
/// `restart_count` is the backoff index, so a restarted runner resumes the
/// sequence instead of starting over.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    backoff_seconds: Vec<u64>,
    entries: HashMap<String, RetryState>,
}

impl RetryTracker {
    pub fn new(backoff_seconds: Vec<u64>) -> Self {
        let backoff_seconds = if backoff_seconds.is_empty() {
            vec![5]
        } else {
            backoff_seconds
        };
        Self {
            backoff_seconds,
            entries: HashMap::new(),
        }
    }

    /// Delay before attempt `index + 1`; the last step repeats forever.
    pub fn delay_for(&self, index: u32) -> Duration {
        let last = self.backoff_seconds.len() - 1;
        let seconds = self.backoff_seconds[(index as usize).min(last)];
        Duration::seconds(seconds as i64)
    }

    /// Records an abnormal exit. Returns the delay applied and the new count.
    pub fn record_failure(
        &mut self,
        session_id: &str,
        restart_count: u32,
        now: DateTime<Utc>,
    ) -> (Duration, u32) {
        let delay = self.delay_for(restart_count);
        let first_failure_at = self
            .entries
            .get(session_id)
            .map(|state| state.first_failure_at)
            .unwrap_or(now);
        let count = restart_count + 1;
        self.entries.insert(
            session_id.to_string(),
            RetryState {
                count,
                next_attempt: now + delay,
                first_failure_at,
            },
        );
        (delay, count)
    }

    /// Rebuilds the entry for a pending session this process has never seen
    /// fail. Returns `true` when the session has to wait.
    pub fn seed(&mut self, session: &Session, now: DateTime<Utc>) -> bool {
        if session.restart_count == 0 || self.entries.contains_key(&session.id) {
            return false;
        }
        let delay = self.delay_for(session.restart_count - 1);
        self.entries.insert(
            session.id.clone(),
            RetryState {
                count: session.restart_count,
                next_attempt: now + delay,
                first_failure_at: now,
            },
        );
        true
    }

    pub fn ready(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(session_id)
            .map(|state| now >= state.next_attempt)
            .unwrap_or(true)
    }

    pub fn get(&self, session_id: &str) -> Option<&RetryState> {
        self.entries.get(session_id)
    }

    pub fn clear(&mut self, session_id: &str) {
        self.entries.remove(session_id);
    }
}

/// Finite sessions retry until their deadline; open-ended ones for
/// `open_ended_minutes` after the last launch.
pub fn within_retry_window(
    session: &Session,
    now: DateTime<Utc>,
    open_ended_minutes: i64,
) -> bool {
    match session.target_end_at {
        Some(end) => now < end,
        None => {
            let started = session.started_at.unwrap_or(now);
            now - started < Duration::minutes(open_ended_minutes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStatus;

    fn session(restart_count: u32) -> Session {
        Session {
            id: "s1".into(),
            job_id: "j1".into(),
            schedule_id: None,
            status: SessionStatus::Pending,
            started_at: None,
            ended_at: None,
            target_end_at: None,
            error: None,
            restart_count,
            log_path: None,
            stop_reason: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn backoff_caps_at_last_step() {
        let tracker = RetryTracker::new(vec![5, 10, 20, 40, 60, 120]);
        let delays: Vec<i64> = (0..8).map(|i| tracker.delay_for(i).num_seconds()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 120, 120, 120]);
    }

    #[test]
    fn failures_push_next_attempt() {
        let now = Utc::now();
        let mut tracker = RetryTracker::new(vec![5, 10]);
        let (delay, count) = tracker.record_failure("s1", 0, now);
        assert_eq!((delay.num_seconds(), count), (5, 1));
        assert!(!tracker.ready("s1", now + Duration::seconds(4)));
        assert!(tracker.ready("s1", now + Duration::seconds(5)));

        let (delay, count) = tracker.record_failure("s1", 1, now);
        assert_eq!((delay.num_seconds(), count), (10, 2));
        assert_eq!(tracker.get("s1").unwrap().first_failure_at, now);

        tracker.clear("s1");
        assert!(tracker.ready("s1", now));
    }

    #[test]
    fn seeding_resumes_from_restart_count() {
        let now = Utc::now();
        let mut tracker = RetryTracker::new(vec![5, 10, 20]);
        assert!(!tracker.seed(&session(0), now));
        assert!(tracker.seed(&session(2), now));
        assert_eq!(
            tracker.get("s1").unwrap().next_attempt,
            now + Duration::seconds(10)
        );
        assert!(!tracker.seed(&session(2), now));
    }

    #[test]
    fn open_ended_window_counts_from_start() {
        let now = Utc::now();
        let mut open = session(0);
        open.started_at = Some(now - Duration::minutes(31));
        assert!(!within_retry_window(&open, now, 30));
        open.started_at = Some(now - Duration::minutes(29));
        assert!(within_retry_window(&open, now, 30));
        open.started_at = None;
        assert!(within_retry_window(&open, now, 30));

        let mut finite = session(0);
        finite.target_end_at = Some(now);
        assert!(!within_retry_window(&finite, now, 30));
        finite.target_end_at = Some(now + Duration::seconds(1));
        assert!(within_retry_window(&finite, now, 30));
    }
}
