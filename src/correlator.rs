use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Duration, NaiveDateTime};

use crate::event::{Event, EventKind};
use crate::notice::{self, FinalStatus, LifecycleNotice};

/// How often (in handled events) the retention sweep runs.
const EVICTION_SWEEP_EVERY: u64 = 1000;

const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Correlator state for one logical job (one numeric id).
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub user: String,
    pub group: String,
    pub job_name: String,
    pub start_time: NaiveDateTime,
    pub is_array: bool,
    /// Exit status of a plain (non-array) job, once its End record arrives.
    pub exit_code: Option<i64>,
    /// Known array members by index; `None` until that member's End arrives.
    pub array_members: BTreeMap<String, Option<i64>>,
    /// Set when the completion notice fires; guards exactly-once emission.
    pub notified: bool,
    last_seen: NaiveDateTime,
}

/// The stateful core: consumes decoded events in arrival order, maintains
/// per-job lifecycle state, and produces at most one notice per transition.
///
/// The record map is owned exclusively by the single consumer task, so no
/// locking is involved anywhere in here.
pub struct Correlator {
    jobs: HashMap<String, JobRecord>,
    /// Ids skipped by the user/group allow-lists; kept so their later
    /// events log at debug rather than warn.
    ignored: HashMap<String, NaiveDateTime>,
    users: Option<HashSet<String>>,
    groups: Option<HashSet<String>>,
    /// Suppress notices for events at or before this instant (startup
    /// replay filter). State still mutates.
    ignore_before: Option<NaiveDateTime>,
    retention: Duration,
    handled: u64,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            ignored: HashMap::new(),
            users: None,
            groups: None,
            ignore_before: None,
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
            handled: 0,
        }
    }

    /// Restrict tracking to these users. Absence means "all users".
    pub fn with_allowed_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.users = Some(users.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict tracking to these groups. Absence means "all groups".
    pub fn with_allowed_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    /// Suppress notices for events timestamped at or before `threshold`.
    pub fn with_ignore_before(mut self, threshold: NaiveDateTime) -> Self {
        self.ignore_before = Some(threshold);
        self
    }

    /// Drop records untouched for this long (event-timestamp driven).
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn record(&self, numeric_id: &str) -> Option<&JobRecord> {
        self.jobs.get(numeric_id)
    }

    /// Feed one event through the state machine. Returns the lifecycle
    /// notice the event triggered, if any. Anomalous events are logged and
    /// ignored; nothing in here is fatal.
    pub fn handle_event(&mut self, event: Event) -> Option<LifecycleNotice> {
        self.handled += 1;
        if self.handled % EVICTION_SWEEP_EVERY == 0 {
            self.evict(event.timestamp);
        }

        match event.kind {
            EventKind::Start {
                ref user,
                ref group,
                ref job_name,
            } => self.on_start(&event, user, group, job_name),
            EventKind::End { exit_status } => {
                self.on_end(&event, exit_status);
                None
            }
            EventKind::Dequeue => self.on_dequeue(&event),
        }
    }

    fn on_start(
        &mut self,
        event: &Event,
        user: &str,
        group: &str,
        job_name: &str,
    ) -> Option<LifecycleNotice> {
        let id = &event.job_id.numeric_id;

        if let Some(last_seen) = self.ignored.get_mut(id) {
            *last_seen = event.timestamp;
            return None;
        }

        if let Some(record) = self.jobs.get_mut(id) {
            if record.notified {
                return None;
            }
            record.last_seen = event.timestamp;
            // Duplicate start: idempotent, but array members may register.
            if record.is_array {
                if let Some(index) = &event.job_id.array_index {
                    record.array_members.entry(index.clone()).or_insert(None);
                }
            }
            tracing::debug!(job = %id, "Duplicate start event");
            return None;
        }

        if !self.is_allowed(user, group) {
            tracing::debug!(job = %id, user, group, "Job filtered by allow-lists");
            self.ignored.insert(id.clone(), event.timestamp);
            return None;
        }

        let mut record = JobRecord {
            user: user.to_string(),
            group: group.to_string(),
            job_name: job_name.to_string(),
            start_time: event.timestamp,
            is_array: event.job_id.is_array,
            exit_code: None,
            array_members: BTreeMap::new(),
            notified: false,
            last_seen: event.timestamp,
        };
        if record.is_array {
            if let Some(index) = &event.job_id.array_index {
                record.array_members.insert(index.clone(), None);
            }
        }

        tracing::info!(job = %id, user, job_name, array = record.is_array, "Job started");
        let display_id = event.job_id.display_id();
        self.jobs.insert(id.clone(), record);

        if self.passes_time_filter(event.timestamp) {
            Some(notice::started_notice(user, &display_id, job_name))
        } else {
            None
        }
    }

    fn on_end(&mut self, event: &Event, exit_status: i64) {
        let id = &event.job_id.numeric_id;

        let Some(record) = self.jobs.get_mut(id) else {
            if let Some(last_seen) = self.ignored.get_mut(id) {
                *last_seen = event.timestamp;
            } else {
                tracing::warn!(job = %id, "End event for unknown job, ignored");
            }
            return;
        };

        if record.notified {
            // Late End after completion; nothing left to record.
            return;
        }
        record.last_seen = event.timestamp;

        if record.is_array {
            match &event.job_id.array_index {
                Some(index) => match record.array_members.get_mut(index) {
                    Some(member) => *member = Some(exit_status),
                    None => {
                        tracing::warn!(
                            job = %id,
                            index = %index,
                            "End event for unregistered array member, ignored"
                        );
                    }
                },
                None => {
                    tracing::warn!(job = %id, "End event without array index for array job, ignored");
                }
            }
        } else {
            record.exit_code = Some(exit_status);
        }
    }

    fn on_dequeue(&mut self, event: &Event) -> Option<LifecycleNotice> {
        let id = &event.job_id.numeric_id;
        let notify = self.passes_time_filter(event.timestamp);

        let Some(record) = self.jobs.get_mut(id) else {
            if let Some(last_seen) = self.ignored.get_mut(id) {
                *last_seen = event.timestamp;
            } else {
                tracing::warn!(job = %id, "Dequeue event for unknown job, ignored");
            }
            return None;
        };

        if record.notified {
            return None;
        }
        record.last_seen = event.timestamp;
        record.notified = true;

        let status = final_status(record, event.timestamp);
        tracing::info!(
            job = %id,
            success = status.success,
            fail_count = status.fail_count,
            "Job finished"
        );

        if !notify {
            return None;
        }

        let display_id = if record.is_array {
            format!("{}[]", id)
        } else {
            id.clone()
        };
        Some(notice::finished_notice(
            &record.user,
            &display_id,
            &record.job_name,
            &status,
        ))
    }

    fn is_allowed(&self, user: &str, group: &str) -> bool {
        if let Some(users) = &self.users {
            if !users.contains(user) {
                return false;
            }
        }
        if let Some(groups) = &self.groups {
            if !groups.contains(group) {
                return false;
            }
        }
        true
    }

    fn passes_time_filter(&self, timestamp: NaiveDateTime) -> bool {
        self.ignore_before.map_or(true, |t| timestamp > t)
    }

    /// Drop records and ignored ids untouched for longer than the
    /// retention window, bounding memory in long-running deployments.
    fn evict(&mut self, now: NaiveDateTime) {
        let retention = self.retention;
        let before = self.jobs.len() + self.ignored.len();
        self.jobs
            .retain(|_, record| now - record.last_seen <= retention);
        self.ignored.retain(|_, last_seen| now - *last_seen <= retention);
        let dropped = before - self.jobs.len() - self.ignored.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Evicted stale job records");
        }
    }
}

/// Compute the final status of a running record at its dequeue instant.
///
/// Array members that never reported an End are unknown, not failed. A
/// single shared nonzero exit code among failing members is reported as-is;
/// disagreeing codes report as unknown.
fn final_status(record: &JobRecord, dequeued_at: NaiveDateTime) -> FinalStatus {
    let elapsed = dequeued_at - record.start_time;

    if record.is_array {
        let failing: Vec<i64> = record
            .array_members
            .values()
            .filter_map(|code| code.filter(|&c| c != 0))
            .collect();
        let fail_count = failing.len();
        let success = fail_count == 0;

        let exit_code = if success {
            Some(0)
        } else if failing.iter().all(|&c| c == failing[0]) {
            Some(failing[0])
        } else {
            None
        };

        FinalStatus {
            success,
            fail_count,
            member_count: record.array_members.len(),
            exit_code,
            elapsed,
        }
    } else {
        let success = record.exit_code == Some(0);
        FinalStatus {
            success,
            fail_count: usize::from(!success),
            member_count: 0,
            exit_code: record.exit_code,
            elapsed,
        }
    }
}
