//! The due-order structure for detection schedules.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use driftwatch_common::{DriftConfiguration, ResourceId};

/// Identity of one detection schedule: a configuration of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScheduleKey {
    pub resource_id: ResourceId,
    pub config_name: String,
}

impl ScheduleKey {
    pub fn new(resource_id: ResourceId, config_name: impl Into<String>) -> Self {
        Self {
            resource_id,
            config_name: config_name.into(),
        }
    }
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_id, self.config_name)
    }
}

/// Per-schedule lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    /// Waiting in the due-order for its next due time.
    Scheduled,
    /// A detection run is executing; not in the due-order.
    Running,
    /// A change set is awaiting acknowledgment; detection is suspended and
    /// the entry is not reinserted until the gate releases it.
    Blocked,
}

/// One detection schedule entry.
#[derive(Debug, Clone)]
pub struct DetectionSchedule {
    pub key: ScheduleKey,
    pub config: DriftConfiguration,
    pub next_due: Instant,
    pub last_collection: Option<DateTime<Utc>>,
    /// Monotonic insertion counter, the final deterministic tie-breaker.
    pub schedule_id: u64,
    pub status: ScheduleStatus,
}

/// Heap element; stale copies are skipped when the indexed entry no longer
/// matches the schedule id.
#[derive(Debug, PartialEq, Eq)]
struct DueEntry {
    next_due: Instant,
    resource_id: ResourceId,
    config_name: String,
    schedule_id: u64,
}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Strict, collision-free total order: ties broken by resource id,
        // then name, then insertion counter — never by identity or hash.
        self.next_due
            .cmp(&other.next_due)
            .then_with(|| self.resource_id.cmp(&other.resource_id))
            .then_with(|| self.config_name.cmp(&other.config_name))
            .then_with(|| self.schedule_id.cmp(&other.schedule_id))
    }
}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-priority structure ordering all scheduled detection jobs by due time.
///
/// Entries are indexed by key; the heap holds lazily invalidated copies, so
/// reschedules and removals never have to search it.
pub struct ScheduleQueue {
    entries: HashMap<ScheduleKey, DetectionSchedule>,
    due_order: BinaryHeap<Reverse<DueEntry>>,
    next_schedule_id: u64,
}

impl ScheduleQueue {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            due_order: BinaryHeap::new(),
            next_schedule_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_schedule_id;
        self.next_schedule_id += 1;
        id
    }

    fn push_due(&mut self, key: &ScheduleKey, next_due: Instant, schedule_id: u64) {
        self.due_order.push(Reverse(DueEntry {
            next_due,
            resource_id: key.resource_id,
            config_name: key.config_name.clone(),
            schedule_id,
        }));
    }

    /// Re-key a scheduled entry's heap position to a new due time.
    fn requeue(&mut self, key: &ScheduleKey, next_due: Instant) {
        let id = self.next_id();
        let entry = self.entries.get_mut(key).expect("requeue of unknown key");
        entry.next_due = next_due;
        entry.schedule_id = id;
        self.push_due(key, next_due, id);
    }

    /// Insert or replace a schedule with `next_due = now + interval`.
    ///
    /// Idempotent per configuration identity. A running entry only has its
    /// configuration replaced (the completion reschedules with the new
    /// interval); a blocked entry stays blocked until released. Pass
    /// `blocked` to insert a configuration whose previous change set is
    /// still awaiting acknowledgment.
    pub fn schedule(
        &mut self,
        key: ScheduleKey,
        config: DriftConfiguration,
        blocked: bool,
        now: Instant,
    ) {
        let next_due = now + config.interval;

        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.config = config;
                if entry.status == ScheduleStatus::Scheduled {
                    self.requeue(&key, next_due);
                }
            }
            None => {
                let schedule_id = self.next_id();
                let status = if blocked {
                    ScheduleStatus::Blocked
                } else {
                    ScheduleStatus::Scheduled
                };
                if status == ScheduleStatus::Scheduled {
                    self.push_due(&key, next_due, schedule_id);
                }
                self.entries.insert(
                    key.clone(),
                    DetectionSchedule {
                        key,
                        config,
                        next_due,
                        last_collection: None,
                        schedule_id,
                        status,
                    },
                );
            }
        }
    }

    /// Remove a schedule. An in-flight run completes but does not
    /// reschedule. Returns whether an entry existed.
    pub fn unschedule(&mut self, key: &ScheduleKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Replace a schedule's configuration without resetting its due time,
    /// respecting the wait already elapsed. Returns whether an entry existed.
    pub fn update(&mut self, key: &ScheduleKey, config: DriftConfiguration) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.config = config;
                true
            }
            None => false,
        }
    }

    /// Move a schedule to the front of the due-order, or insert one due now.
    ///
    /// Running and blocked entries are left untouched; returns whether the
    /// request took effect.
    pub fn request_immediate(
        &mut self,
        key: ScheduleKey,
        config: DriftConfiguration,
        now: Instant,
    ) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                if entry.status != ScheduleStatus::Scheduled {
                    return false;
                }
                entry.config = config;
                self.requeue(&key, now);
                true
            }
            None => {
                let schedule_id = self.next_id();
                self.push_due(&key, now, schedule_id);
                self.entries.insert(
                    key.clone(),
                    DetectionSchedule {
                        key,
                        config,
                        next_due: now,
                        last_collection: None,
                        schedule_id,
                        status: ScheduleStatus::Scheduled,
                    },
                );
                true
            }
        }
    }

    fn top_is_stale(&self) -> bool {
        let Some(Reverse(top)) = self.due_order.peek() else {
            return false;
        };
        let key = ScheduleKey::new(top.resource_id, top.config_name.clone());
        !matches!(
            self.entries.get(&key),
            Some(entry)
                if entry.schedule_id == top.schedule_id
                    && entry.status == ScheduleStatus::Scheduled
        )
    }

    fn discard_stale(&mut self) {
        while self.top_is_stale() {
            self.due_order.pop();
        }
    }

    /// Earliest due time among scheduled entries, if any.
    pub fn next_due_time(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.due_order.peek().map(|Reverse(e)| e.next_due)
    }

    /// Dequeue every entry due at `now`, marking each as running.
    ///
    /// A running entry is out of the due-order for the duration of its run,
    /// so a single configuration never has two runs active simultaneously.
    pub fn pop_due(&mut self, now: Instant) -> Vec<DetectionSchedule> {
        let mut due = Vec::new();
        loop {
            self.discard_stale();
            match self.due_order.peek() {
                Some(Reverse(top)) if top.next_due <= now => {
                    let Reverse(top) = self.due_order.pop().expect("peeked entry vanished");
                    let key = ScheduleKey::new(top.resource_id, top.config_name);
                    let entry = self.entries.get_mut(&key).expect("validated entry vanished");
                    entry.status = ScheduleStatus::Running;
                    due.push(entry.clone());
                }
                _ => break,
            }
        }
        due
    }

    /// Record a finished run: blocked entries await the gate, others are
    /// rescheduled one interval out. No-op if the entry was unscheduled
    /// mid-run.
    pub fn complete(&mut self, key: &ScheduleKey, blocked: bool, now: Instant) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.last_collection = Some(Utc::now());
        if blocked {
            entry.status = ScheduleStatus::Blocked;
            return;
        }
        entry.status = ScheduleStatus::Scheduled;
        let next_due = now + entry.config.interval;
        self.requeue(key, next_due);
    }

    /// Release a blocked schedule back into the due-order, one interval out.
    pub fn release(&mut self, key: &ScheduleKey, now: Instant) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.status != ScheduleStatus::Blocked {
            return;
        }
        entry.status = ScheduleStatus::Scheduled;
        let next_due = now + entry.config.interval;
        self.requeue(key, next_due);
    }

    /// Look up a schedule entry by key.
    pub fn get(&self, key: &ScheduleKey) -> Option<&DetectionSchedule> {
        self.entries.get(key)
    }

    /// Current status of a schedule, if present.
    pub fn status(&self, key: &ScheduleKey) -> Option<ScheduleStatus> {
        self.entries.get(key).map(|e| e.status)
    }

    /// Number of schedules (any status).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no schedules exist.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ScheduleQueue {
    fn default() -> Self {
        Self::new()
    }
}
