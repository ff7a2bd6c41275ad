use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::errors::ScheduleError;

// ============================================================================
// Persisted store keys
// ============================================================================

/// Keys of the persisted documents in the durable store. Every
/// cross-restart piece of state lives under one of these; in-memory
/// counters (run totals, batch countdowns) intentionally do not.
pub mod keys {
    /// Enabled flag for the page engagement mode.
    pub const COMMENT_ENABLED: &str = "comment_enabled";
    /// Enabled flag for the activity-list engagement mode.
    pub const COMMENT_LIST_ENABLED: &str = "comment_list_enabled";
    /// FIFO queue of content URNs (page jobs).
    pub const PENDING_ACTIVITIES: &str = "pending_activities";
    /// FIFO queue of activity-source URLs (list jobs).
    pub const PENDING_ACTIVITY_URLS: &str = "pending_activity_urls";
    /// FIFO queue of profile descriptors for batch imports.
    pub const PENDING_PROFILES: &str = "pending_profiles";
    /// Human-readable message written when a run drains its queue.
    pub const COMPLETION_MESSAGE: &str = "completion_message";
    /// `BusinessHoursConfig` document.
    pub const BUSINESS_HOURS: &str = "business_hours";
    /// `DailyBulkSchedule` document.
    pub const DAILY_BULK_SCHEDULE: &str = "daily_bulk_schedule";
    /// Sorted array of `ScheduleEntry` for the multi-slot trigger.
    pub const SLOT_SCHEDULE: &str = "slot_schedule";
    /// Enabled flag for the multi-slot trigger.
    pub const SLOT_SCHEDULER_ENABLED: &str = "slot_scheduler_enabled";
    /// Per-day item quota for batch imports.
    pub const PROFILES_PER_DAY: &str = "profiles_per_day";
    /// Bulk execution history, keyed by ISO calendar date.
    pub const EXECUTION_HISTORY: &str = "execution_history";
    /// Summary of the most recent slot run.
    pub const LAST_SLOT_RUN: &str = "last_slot_run";
    /// Armed alarms, owned by the alarm service.
    pub const ALARMS: &str = "alarms";
}

// ============================================================================
// Business hours
// ============================================================================

/// Wall-clock execution window. Hours are local to `timezone`,
/// weekdays are numbered 0-6 counted from Sunday.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusinessHoursConfig {
    pub enabled: bool,
    pub start_hour: u32,
    pub end_hour: u32,
    pub work_days: Vec<u32>,
    pub allow_weekends: bool,
    pub timezone: String,
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour: 9,
            end_hour: 17,
            work_days: vec![1, 2, 3, 4, 5],
            allow_weekends: false,
            timezone: "UTC".to_string(),
        }
    }
}

impl BusinessHoursConfig {
    /// Validate the window invariant `start_hour < end_hour` and hour bounds.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.start_hour >= self.end_hour || self.end_hour > 23 {
            return Err(ScheduleError::InvalidWindow {
                start: self.start_hour,
                end: self.end_hour,
            });
        }
        if self.work_days.iter().any(|d| *d > 6) {
            return Err(ScheduleError::CalculationFailed(
                "work_days entries must be in 0..=6".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Engagement actions and humanization delays
// ============================================================================

/// Which engagement actions a run performs against each target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngagementActions {
    pub like: bool,
    pub comment: bool,
    pub share: bool,
    pub follow: bool,
}

impl Default for EngagementActions {
    fn default() -> Self {
        Self {
            like: true,
            comment: true,
            share: false,
            follow: false,
        }
    }
}

/// Randomized delay bounds for the humanization cooldown policy.
/// All ranges are inclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelaySettings {
    /// Per-action pause after every successful unit of work, in seconds.
    pub action_min_secs: u64,
    pub action_max_secs: u64,
    /// Number of successes between long batch pauses.
    pub batch_min_items: u32,
    pub batch_max_items: u32,
    /// Long batch pause, in seconds.
    pub batch_min_secs: u64,
    pub batch_max_secs: u64,
}

impl Default for DelaySettings {
    fn default() -> Self {
        Self {
            action_min_secs: 30,
            action_max_secs: 40,
            batch_min_items: 20,
            batch_max_items: 30,
            batch_min_secs: 120,
            batch_max_secs: 300,
        }
    }
}

impl DelaySettings {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.action_min_secs > self.action_max_secs
            || self.batch_min_items > self.batch_max_items
            || self.batch_min_secs > self.batch_max_secs
        {
            return Err(ScheduleError::CalculationFailed(
                "delay ranges must satisfy min <= max".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Daily bulk schedule
// ============================================================================

/// Target qualification thresholds used by the black-box classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct QualificationRules {
    pub min_likes: u32,
    pub min_comments: u32,
}

/// Configuration for the once-daily bulk engagement run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyBulkSchedule {
    pub enabled: bool,
    pub keywords: Vec<String>,
    pub quota: u32,
    pub qualification: QualificationRules,
    pub actions: EngagementActions,
    pub delay_settings: DelaySettings,
}

impl Default for DailyBulkSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            keywords: Vec::new(),
            quota: 10,
            qualification: QualificationRules::default(),
            actions: EngagementActions::default(),
            delay_settings: DelaySettings::default(),
        }
    }
}

/// Description of one bulk run handed to the execution layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BulkJobRequest {
    pub keywords: Vec<String>,
    pub quota: u32,
    pub qualification: QualificationRules,
    pub actions: EngagementActions,
    pub delay_settings: DelaySettings,
}

impl From<&DailyBulkSchedule> for BulkJobRequest {
    fn from(schedule: &DailyBulkSchedule) -> Self {
        Self {
            keywords: schedule.keywords.clone(),
            quota: schedule.quota,
            qualification: schedule.qualification,
            actions: schedule.actions,
            delay_settings: schedule.delay_settings,
        }
    }
}

/// One bulk dispatch, recorded under its ISO calendar date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BulkRunRecord {
    pub dispatched_at: DateTime<Utc>,
    pub keywords: Vec<String>,
    pub quota: u32,
}

/// Execution history keyed by ISO date ("YYYY-MM-DD"), pruned to 30 days.
pub type ExecutionHistory = BTreeMap<String, BulkRunRecord>;

// ============================================================================
// Multi-slot scheduler
// ============================================================================

/// Per-slot execution options for batch profile imports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotOptions {
    pub send_connections: bool,
    pub extract_contact_info: bool,
    pub posts_per_profile: u32,
    pub random_mode: bool,
    pub actions: EngagementActions,
}

impl Default for SlotOptions {
    fn default() -> Self {
        Self {
            send_connections: false,
            extract_contact_info: false,
            posts_per_profile: 1,
            random_mode: false,
            actions: EngagementActions::default(),
        }
    }
}

/// One entry of the multi-slot scheduler. `time` is an "HH:MM" string;
/// the persisted set holds at most one entry per exact time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub time: String,
    pub options: SlotOptions,
    pub created_at: DateTime<Utc>,
}

/// Outcome counts reported by the batch actuator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// Persisted summary of the most recent slot run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotRunSummary {
    pub id: Uuid,
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub ran_at: DateTime<Utc>,
}

// ============================================================================
// Work items
// ============================================================================

/// One unit of page work handed to the actuator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDescriptor {
    /// Content identifier, e.g. "urn:li:activity:123".
    pub urn: String,
    pub actions: EngagementActions,
}
