// Multi-slot batch scheduler
// Persists a sorted set of "HH:MM" slots and keeps exactly one one-shot
// alarm armed at the next slot. A firing is matched back to its slot by
// wall-clock proximity, never by identity: the alarm only says "look at
// the clock and the schedule again". Every firing path re-arms.

use chrono::{DateTime, Timelike, Utc};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::actuator::BatchActuator;
use crate::alarm::{AlarmService, AlarmSpec};
use crate::errors::ScheduleError;
use crate::models::{keys, ScheduleEntry, SlotOptions, SlotRunSummary};
use crate::queue::WorkQueue;
use crate::store::DurableStore;

/// Alarm name owned by this scheduler.
pub const SLOT_ALARM: &str = "slot_trigger";

/// A firing within this many minutes of a slot (circularly, so 23:59
/// matches 00:01) runs with that slot's options.
const MATCH_TOLERANCE_MINUTES: u32 = 2;

/// Alarms are never armed closer than this, so a slot edited to "now"
/// still goes through the alarm service instead of firing inline.
const MIN_ARM_DELAY: Duration = Duration::from_secs(6);

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Items drawn per firing when no quota document is persisted.
const DEFAULT_PROFILES_PER_DAY: u32 = 10;

static TIME_PATTERN: OnceLock<Regex> = OnceLock::new();

fn time_pattern() -> &'static Regex {
    TIME_PATTERN.get_or_init(|| Regex::new(r"^\d{2}:\d{2}$").expect("Invalid regex pattern"))
}

/// Parse a zero-padded "HH:MM" slot time into its minute of day.
pub fn parse_slot_time(time: &str) -> Result<u32, ScheduleError> {
    if !time_pattern().is_match(time) {
        return Err(ScheduleError::InvalidTimeFormat(time.to_string()));
    }
    let (hh, mm) = time.split_at(2);
    let hour: u32 = hh
        .parse()
        .map_err(|_| ScheduleError::InvalidTimeFormat(time.to_string()))?;
    let minute: u32 = mm[1..]
        .parse()
        .map_err(|_| ScheduleError::InvalidTimeFormat(time.to_string()))?;
    if hour > 23 || minute > 59 {
        return Err(ScheduleError::InvalidTimeFormat(time.to_string()));
    }
    Ok(hour * 60 + minute)
}

/// Minutes from `now_minute` forward to the next slot, wrapping to the
/// next day when every slot is already behind. `entries` must be
/// non-empty and sorted by minute of day.
fn minutes_until_next_slot(now_minute: u32, entries: &[ScheduleEntry]) -> u32 {
    entries
        .iter()
        .filter_map(|e| parse_slot_time(&e.time).ok())
        .map(|slot| (slot + MINUTES_PER_DAY - now_minute) % MINUTES_PER_DAY)
        .map(|delta| if delta == 0 { MINUTES_PER_DAY } else { delta })
        .min()
        .unwrap_or(MINUTES_PER_DAY)
}

/// Circular distance in minutes between two minutes of day.
fn circular_distance(a: u32, b: u32) -> u32 {
    let forward = (a + MINUTES_PER_DAY - b) % MINUTES_PER_DAY;
    forward.min(MINUTES_PER_DAY - forward)
}

/// The slot whose time is within the match tolerance of `now_minute`,
/// if any. Distance is circular so a slot at midnight matches firings
/// on both sides of it.
fn matching_entry(now_minute: u32, entries: &[ScheduleEntry]) -> Option<&ScheduleEntry> {
    entries
        .iter()
        .filter_map(|e| parse_slot_time(&e.time).ok().map(|m| (m, e)))
        .filter(|(m, _)| circular_distance(*m, now_minute) <= MATCH_TOLERANCE_MINUTES)
        .min_by_key(|(m, _)| circular_distance(*m, now_minute))
        .map(|(_, e)| e)
}

/// What one slot alarm firing amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotFireOutcome {
    /// A batch ran; its summary was persisted.
    Ran(SlotRunSummary),
    /// No slots remain; the alarm stays disarmed.
    NoEntries,
    /// Scheduler flag is off; re-armed and skipped.
    Disabled,
    /// Nothing queued to process; re-armed and skipped.
    NothingQueued,
    /// Execution layer already busy; re-armed and skipped rather than
    /// queueing a concurrent run.
    Busy,
    /// The batch call itself failed; re-armed.
    BatchFailed,
}

pub struct SlotScheduler {
    store: Arc<dyn DurableStore>,
    alarms: Arc<dyn AlarmService>,
    batch: Arc<dyn BatchActuator>,
    pending: WorkQueue<String>,
}

impl SlotScheduler {
    pub fn new(
        store: Arc<dyn DurableStore>,
        alarms: Arc<dyn AlarmService>,
        batch: Arc<dyn BatchActuator>,
    ) -> Self {
        let pending = WorkQueue::new(Arc::clone(&store), keys::PENDING_PROFILES);
        Self {
            store,
            alarms,
            batch,
            pending,
        }
    }

    pub async fn entries(&self) -> Vec<ScheduleEntry> {
        self.store.get_json(keys::SLOT_SCHEDULE, Vec::new()).await
    }

    async fn persist_entries(&self, entries: &[ScheduleEntry]) -> Result<(), ScheduleError> {
        self.store.set_json(keys::SLOT_SCHEDULE, &entries).await?;
        Ok(())
    }

    /// Add a slot. Rejects malformed times and exact duplicates; the
    /// persisted set stays sorted by minute of day.
    #[instrument(skip(self, options))]
    pub async fn add_entry(&self, time: &str, options: SlotOptions) -> Result<(), ScheduleError> {
        parse_slot_time(time)?;

        let mut entries = self.entries().await;
        if entries.iter().any(|e| e.time == time) {
            return Err(ScheduleError::DuplicateEntry(time.to_string()));
        }

        entries.push(ScheduleEntry {
            time: time.to_string(),
            options,
            created_at: Utc::now(),
        });
        entries.sort_by_key(|e| parse_slot_time(&e.time).unwrap_or(MINUTES_PER_DAY));
        self.persist_entries(&entries).await?;

        info!(time = time, total = entries.len(), "Slot added");
        self.arm_next_fire().await
    }

    /// Remove the slot at the given time. Disarms the alarm when the
    /// last slot goes away.
    #[instrument(skip(self))]
    pub async fn remove_entry(&self, time: &str) -> Result<(), ScheduleError> {
        let mut entries = self.entries().await;
        let before = entries.len();
        entries.retain(|e| e.time != time);
        if entries.len() == before {
            return Err(ScheduleError::EntryNotFound(time.to_string()));
        }
        self.persist_entries(&entries).await?;

        info!(time = time, remaining = entries.len(), "Slot removed");
        if entries.is_empty() {
            self.alarms.clear(SLOT_ALARM).await?;
            Ok(())
        } else {
            self.arm_next_fire().await
        }
    }

    /// Arm one one-shot alarm at the next slot, replacing whatever was
    /// armed before. No-op when the schedule is empty.
    ///
    /// Only the delay is armed; the slot's options are deliberately not
    /// carried with the alarm. The fire handler re-reads the persisted
    /// schedule and resolves options by tolerance match against the
    /// clock, so edits made while the alarm was pending always win.
    #[instrument(skip(self))]
    pub async fn arm_next_fire(&self) -> Result<(), ScheduleError> {
        self.arm_next_fire_at(Utc::now()).await
    }

    async fn arm_next_fire_at(&self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        let entries = self.entries().await;
        if entries.is_empty() {
            self.alarms.clear(SLOT_ALARM).await?;
            return Ok(());
        }

        let config = self
            .store
            .get_json(
                keys::BUSINESS_HOURS,
                crate::models::BusinessHoursConfig::default(),
            )
            .await;
        let tz = crate::hours::configured_timezone(&config);
        let local_now = now.with_timezone(&tz);
        let now_minute = local_now.hour() * 60 + local_now.minute();

        let minutes = minutes_until_next_slot(now_minute, &entries);
        // Align to the slot's :00 seconds, then floor to the minimum.
        let seconds = u64::from(minutes) * 60 - u64::from(local_now.second().min(59));
        let delay = Duration::from_secs(seconds).max(MIN_ARM_DELAY);

        self.alarms
            .create(SLOT_ALARM, AlarmSpec::after(delay))
            .await?;
        info!(delay_secs = delay.as_secs(), "Slot alarm armed");
        Ok(())
    }

    /// Handle one firing of the slot alarm.
    #[instrument(skip(self))]
    pub async fn on_alarm_fired(&self) -> Result<SlotFireOutcome, ScheduleError> {
        self.fire_at(Utc::now()).await
    }

    async fn fire_at(&self, now: DateTime<Utc>) -> Result<SlotFireOutcome, ScheduleError> {
        let entries = self.entries().await;
        if entries.is_empty() {
            self.alarms.clear(SLOT_ALARM).await?;
            info!("Slot alarm fired with no slots left, disarmed");
            return Ok(SlotFireOutcome::NoEntries);
        }

        if !self
            .store
            .get_bool(keys::SLOT_SCHEDULER_ENABLED, false)
            .await
        {
            self.arm_next_fire_at(now).await?;
            return Ok(SlotFireOutcome::Disabled);
        }

        let config = self
            .store
            .get_json(
                keys::BUSINESS_HOURS,
                crate::models::BusinessHoursConfig::default(),
            )
            .await;
        let tz = crate::hours::configured_timezone(&config);
        let local_now = now.with_timezone(&tz);
        let now_minute = local_now.hour() * 60 + local_now.minute();

        // Late delivery past the tolerance falls back to defaults
        // rather than borrowing the wrong slot's options.
        let options = match matching_entry(now_minute, &entries) {
            Some(entry) => entry.options.clone(),
            None => {
                warn!(
                    now_minute = now_minute,
                    "No slot within tolerance of firing, using default options"
                );
                SlotOptions::default()
            }
        };

        if self.pending.is_empty().await {
            info!("Slot fired with nothing queued, skipping");
            self.arm_next_fire_at(now).await?;
            return Ok(SlotFireOutcome::NothingQueued);
        }

        if self.batch.is_busy().await {
            warn!("Execution layer busy, skipping this slot");
            self.arm_next_fire_at(now).await?;
            return Ok(SlotFireOutcome::Busy);
        }

        let quota: u32 = self
            .store
            .get_json(keys::PROFILES_PER_DAY, DEFAULT_PROFILES_PER_DAY)
            .await;
        let items = self.pending.dequeue_up_to(quota as usize).await?;

        let outcome = match self.batch.run_batch(&items, &options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, items = items.len(), "Batch run failed");
                self.arm_next_fire_at(now).await?;
                return Ok(SlotFireOutcome::BatchFailed);
            }
        };

        let summary = SlotRunSummary {
            id: Uuid::new_v4(),
            processed: outcome.processed,
            succeeded: outcome.succeeded,
            failed: outcome.failed,
            ran_at: now,
        };
        self.store.set_json(keys::LAST_SLOT_RUN, &summary).await?;
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Slot batch completed"
        );

        self.arm_next_fire_at(now).await?;
        Ok(SlotFireOutcome::Ran(summary))
    }
}
