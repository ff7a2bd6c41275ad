// Daily bulk scheduler
// Arms one repeating 24h alarm at the next business-hours start and, on
// each firing, re-validates everything before dispatching: the schedule
// document, the entitlement, and the wall-clock window. The alarm is
// only a trigger to recompute; the persisted schedule is the truth.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::actuator::{BulkDispatcher, EntitlementChecker};
use crate::alarm::{AlarmService, AlarmSpec};
use crate::errors::ScheduleError;
use crate::hours;
use crate::models::{keys, BulkJobRequest, BulkRunRecord, DailyBulkSchedule, ExecutionHistory};
use crate::store::DurableStore;

/// Alarm name owned by this scheduler.
pub const DAILY_BULK_ALARM: &str = "daily_bulk";

/// Fired records older than this are pruned from the history document.
const HISTORY_RETENTION_DAYS: i64 = 30;

const REPEAT_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// What one alarm firing amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkFireOutcome {
    /// A bulk job was handed to the execution layer and recorded.
    Dispatched,
    /// Schedule disabled or without keywords; the alarm was disarmed.
    SkippedDisabled,
    /// Entitlement denied or unverifiable. Fail closed: no dispatch.
    SkippedEntitlement,
    /// Fired outside the business-hours window; re-armed at the next
    /// window start instead of dispatching.
    Deferred,
    /// The execution layer rejected the dispatch.
    DispatchFailed,
}

pub struct DailyBulkScheduler {
    store: Arc<dyn DurableStore>,
    alarms: Arc<dyn AlarmService>,
    entitlements: Arc<dyn EntitlementChecker>,
    dispatcher: Arc<dyn BulkDispatcher>,
    /// Entitlement feature name gating bulk dispatch.
    feature: String,
}

impl DailyBulkScheduler {
    pub fn new(
        store: Arc<dyn DurableStore>,
        alarms: Arc<dyn AlarmService>,
        entitlements: Arc<dyn EntitlementChecker>,
        dispatcher: Arc<dyn BulkDispatcher>,
        feature: String,
    ) -> Self {
        Self {
            store,
            alarms,
            entitlements,
            dispatcher,
            feature,
        }
    }

    /// Reconcile the alarm with the persisted schedule: armed as a 24h
    /// repeating alarm at the next window start when the schedule is
    /// actionable, disarmed otherwise. Called on startup and after
    /// every schedule edit.
    #[instrument(skip(self))]
    pub async fn sync_alarm(&self) -> Result<(), ScheduleError> {
        self.sync_alarm_at(Utc::now()).await
    }

    async fn sync_alarm_at(&self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        let schedule: DailyBulkSchedule = self
            .store
            .get_json(keys::DAILY_BULK_SCHEDULE, DailyBulkSchedule::default())
            .await;

        if !schedule.enabled || schedule.keywords.is_empty() {
            let existed = self.alarms.clear(DAILY_BULK_ALARM).await?;
            if existed {
                info!("Daily bulk schedule not actionable, alarm disarmed");
            }
            return Ok(());
        }

        let fire_at = self.next_fire_instant(now).await?;
        self.alarms
            .create(
                DAILY_BULK_ALARM,
                AlarmSpec::at(fire_at).repeating(REPEAT_PERIOD),
            )
            .await?;
        info!(fire_at = %fire_at, "Daily bulk alarm armed");
        Ok(())
    }

    /// Next business-hours start in the configured timezone, mapped
    /// back to UTC for the alarm service.
    async fn next_fire_instant(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let config = self
            .store
            .get_json(
                keys::BUSINESS_HOURS,
                crate::models::BusinessHoursConfig::default(),
            )
            .await;
        let tz = hours::configured_timezone(&config);
        let local_now = now.with_timezone(&tz);
        let next = hours::next_window_start(&local_now, &config)?;
        Ok(next.with_timezone(&Utc))
    }

    /// Handle one firing of the daily bulk alarm.
    #[instrument(skip(self))]
    pub async fn on_alarm_fired(&self) -> Result<BulkFireOutcome, ScheduleError> {
        self.fire_at(Utc::now()).await
    }

    async fn fire_at(&self, now: DateTime<Utc>) -> Result<BulkFireOutcome, ScheduleError> {
        let schedule: DailyBulkSchedule = self
            .store
            .get_json(keys::DAILY_BULK_SCHEDULE, DailyBulkSchedule::default())
            .await;

        // The schedule may have been edited since the alarm was armed.
        if !schedule.enabled || schedule.keywords.is_empty() {
            self.alarms.clear(DAILY_BULK_ALARM).await?;
            info!("Daily bulk alarm fired on a stale schedule, disarmed");
            return Ok(BulkFireOutcome::SkippedDisabled);
        }

        match self.entitlements.has_feature(&self.feature).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(feature = %self.feature, "Bulk entitlement denied, skipping run");
                return Ok(BulkFireOutcome::SkippedEntitlement);
            }
            Err(e) => {
                warn!(feature = %self.feature, error = %e, "Entitlement check failed, failing closed");
                return Ok(BulkFireOutcome::SkippedEntitlement);
            }
        }

        let config = self
            .store
            .get_json(
                keys::BUSINESS_HOURS,
                crate::models::BusinessHoursConfig::default(),
            )
            .await;
        let tz = hours::configured_timezone(&config);
        let local_now = now.with_timezone(&tz);
        if !hours::is_within_window(&local_now, &config) {
            // Alarm drift or an edited window; re-anchor to the next
            // start instead of running outside hours.
            self.sync_alarm_at(now).await?;
            info!("Daily bulk alarm fired outside business hours, deferred");
            return Ok(BulkFireOutcome::Deferred);
        }

        let request = BulkJobRequest::from(&schedule);
        if let Err(e) = self.dispatcher.dispatch(&request).await {
            warn!(error = %e, "Bulk dispatch failed");
            return Ok(BulkFireOutcome::DispatchFailed);
        }

        self.record_run(now, &schedule).await?;
        info!(
            keywords = schedule.keywords.len(),
            quota = schedule.quota,
            "Daily bulk job dispatched"
        );
        Ok(BulkFireOutcome::Dispatched)
    }

    /// Append today's run to the history document and prune entries
    /// older than the retention window.
    async fn record_run(
        &self,
        now: DateTime<Utc>,
        schedule: &DailyBulkSchedule,
    ) -> Result<(), ScheduleError> {
        let mut history: ExecutionHistory = self
            .store
            .get_json(keys::EXECUTION_HISTORY, ExecutionHistory::new())
            .await;

        history.insert(
            now.date_naive().to_string(),
            BulkRunRecord {
                dispatched_at: now,
                keywords: schedule.keywords.clone(),
                quota: schedule.quota,
            },
        );

        let cutoff = now.date_naive() - ChronoDuration::days(HISTORY_RETENTION_DAYS);
        history.retain(|date, _| {
            date.parse::<NaiveDate>()
                .map(|d| d >= cutoff)
                .unwrap_or(false)
        });

        self.store.set_json(keys::EXECUTION_HISTORY, &history).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::TokioAlarmService;
    use crate::errors::ActuationError;
    use crate::models::BusinessHoursConfig;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct StubEntitlements {
        answer: Result<bool, ()>,
    }

    #[async_trait]
    impl EntitlementChecker for StubEntitlements {
        async fn has_feature(&self, _name: &str) -> Result<bool, ActuationError> {
            match self.answer {
                Ok(enabled) => Ok(enabled),
                Err(()) => Err(ActuationError::RequestFailed("unreachable".to_string())),
            }
        }
    }

    struct RecordingDispatcher {
        dispatched: Mutex<Vec<BulkJobRequest>>,
        calls: AtomicUsize,
    }

    impl RecordingDispatcher {
        fn new() -> Self {
            Self {
                dispatched: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BulkDispatcher for RecordingDispatcher {
        async fn dispatch(&self, request: &BulkJobRequest) -> Result<(), ActuationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.dispatched.lock().await.push(request.clone());
            Ok(())
        }
    }

    fn scheduler(
        store: Arc<dyn DurableStore>,
        entitled: Result<bool, ()>,
        dispatcher: Arc<RecordingDispatcher>,
    ) -> DailyBulkScheduler {
        let (alarms, _rx) = TokioAlarmService::new(Arc::clone(&store));
        DailyBulkScheduler::new(
            store,
            Arc::new(alarms),
            Arc::new(StubEntitlements { answer: entitled }),
            dispatcher,
            "bulk_engagement".to_string(),
        )
    }

    async fn seed_schedule(store: &Arc<dyn DurableStore>, schedule: &DailyBulkSchedule) {
        store
            .set_json(keys::DAILY_BULK_SCHEDULE, schedule)
            .await
            .expect("seed schedule");
    }

    fn actionable_schedule() -> DailyBulkSchedule {
        DailyBulkSchedule {
            enabled: true,
            keywords: vec!["rust".to_string(), "tokio".to_string()],
            quota: 15,
            ..Default::default()
        }
    }

    // Monday 2024-06-03 12:00 UTC, inside the default 9-17 window.
    fn monday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).single().expect("date")
    }

    #[tokio::test]
    async fn test_fire_dispatches_and_records_history() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        seed_schedule(&store, &actionable_schedule()).await;
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let scheduler = scheduler(Arc::clone(&store), Ok(true), Arc::clone(&dispatcher));

        let outcome = scheduler.fire_at(monday_noon()).await.expect("fire");
        assert_eq!(outcome, BulkFireOutcome::Dispatched);

        let dispatched = dispatcher.dispatched.lock().await;
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].quota, 15);

        let history: ExecutionHistory = store
            .get_json(keys::EXECUTION_HISTORY, ExecutionHistory::new())
            .await;
        assert!(history.contains_key("2024-06-03"));
    }

    #[tokio::test]
    async fn test_entitlement_denied_fails_closed() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        seed_schedule(&store, &actionable_schedule()).await;
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let scheduler = scheduler(Arc::clone(&store), Ok(false), Arc::clone(&dispatcher));

        let outcome = scheduler.fire_at(monday_noon()).await.expect("fire");
        assert_eq!(outcome, BulkFireOutcome::SkippedEntitlement);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_entitlement_error_fails_closed() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        seed_schedule(&store, &actionable_schedule()).await;
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let scheduler = scheduler(Arc::clone(&store), Err(()), Arc::clone(&dispatcher));

        let outcome = scheduler.fire_at(monday_noon()).await.expect("fire");
        assert_eq!(outcome, BulkFireOutcome::SkippedEntitlement);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fire_outside_window_defers_without_dispatching() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        seed_schedule(&store, &actionable_schedule()).await;
        store
            .set_json(
                keys::BUSINESS_HOURS,
                &BusinessHoursConfig {
                    enabled: true,
                    ..Default::default()
                },
            )
            .await
            .expect("seed hours");
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let scheduler = scheduler(Arc::clone(&store), Ok(true), Arc::clone(&dispatcher));

        // Monday 20:00 UTC, after the 17:00 close.
        let evening = Utc.with_ymd_and_hms(2024, 6, 3, 20, 0, 0).single().expect("date");
        let outcome = scheduler.fire_at(evening).await.expect("fire");
        assert_eq!(outcome, BulkFireOutcome::Deferred);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);

        // Deferral re-armed the alarm at the next window start.
        let alarms: HashMap<String, serde_json::Value> =
            store.get_json(keys::ALARMS, HashMap::new()).await;
        assert!(alarms.contains_key(DAILY_BULK_ALARM));
    }

    #[tokio::test]
    async fn test_stale_schedule_disarms_alarm() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        seed_schedule(
            &store,
            &DailyBulkSchedule {
                enabled: false,
                ..actionable_schedule()
            },
        )
        .await;
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let scheduler = scheduler(Arc::clone(&store), Ok(true), Arc::clone(&dispatcher));

        let outcome = scheduler.fire_at(monday_noon()).await.expect("fire");
        assert_eq!(outcome, BulkFireOutcome::SkippedDisabled);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sync_skips_arming_when_keywords_empty() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        seed_schedule(
            &store,
            &DailyBulkSchedule {
                enabled: true,
                keywords: Vec::new(),
                ..Default::default()
            },
        )
        .await;
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let scheduler = scheduler(Arc::clone(&store), Ok(true), dispatcher);

        scheduler.sync_alarm_at(monday_noon()).await.expect("sync");
        let alarms: HashMap<String, serde_json::Value> =
            store.get_json(keys::ALARMS, HashMap::new()).await;
        assert!(!alarms.contains_key(DAILY_BULK_ALARM));
    }

    #[tokio::test]
    async fn test_sync_arms_repeating_alarm_when_actionable() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        seed_schedule(&store, &actionable_schedule()).await;
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let scheduler = scheduler(Arc::clone(&store), Ok(true), dispatcher);

        scheduler.sync_alarm_at(monday_noon()).await.expect("sync");
        let alarms: HashMap<String, serde_json::Value> =
            store.get_json(keys::ALARMS, HashMap::new()).await;
        let armed = alarms.get(DAILY_BULK_ALARM).expect("armed");
        assert_eq!(
            armed
                .get("period_minutes")
                .and_then(serde_json::Value::as_u64),
            Some(24 * 60)
        );
    }

    #[tokio::test]
    async fn test_history_pruned_to_retention_window() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        seed_schedule(&store, &actionable_schedule()).await;

        let mut history = ExecutionHistory::new();
        history.insert(
            "2024-04-01".to_string(),
            BulkRunRecord {
                dispatched_at: Utc.with_ymd_and_hms(2024, 4, 1, 10, 0, 0).single().expect("date"),
                keywords: vec!["old".to_string()],
                quota: 5,
            },
        );
        history.insert(
            "2024-05-20".to_string(),
            BulkRunRecord {
                dispatched_at: Utc.with_ymd_and_hms(2024, 5, 20, 10, 0, 0).single().expect("date"),
                keywords: vec!["recent".to_string()],
                quota: 5,
            },
        );
        store
            .set_json(keys::EXECUTION_HISTORY, &history)
            .await
            .expect("seed history");

        let dispatcher = Arc::new(RecordingDispatcher::new());
        let scheduler = scheduler(Arc::clone(&store), Ok(true), dispatcher);
        scheduler.fire_at(monday_noon()).await.expect("fire");

        let pruned: ExecutionHistory = store
            .get_json(keys::EXECUTION_HISTORY, ExecutionHistory::new())
            .await;
        // 2024-04-01 is past the 30-day window relative to 2024-06-03.
        assert!(!pruned.contains_key("2024-04-01"));
        assert!(pruned.contains_key("2024-05-20"));
        assert!(pruned.contains_key("2024-06-03"));
    }
}
