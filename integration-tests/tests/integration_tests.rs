// End-to-end tests wiring the runners and schedulers together over an
// in-memory store and scripted collaborators. Time is paused, so the
// randomized cooldowns and poll jitter advance instantly.

use async_trait::async_trait;
use chrono::Utc;
use common::actuator::{
    Actuator, BatchActuator, BulkDispatcher, ContextHandle, ContextProvider, EntitlementChecker,
};
use common::alarm::{AlarmService, TokioAlarmService};
use common::bulk::{BulkFireOutcome, DailyBulkScheduler};
use common::config::RunnerConfig;
use common::cooldown::CooldownPolicy;
use common::errors::ActuationError;
use common::models::{
    keys, BatchOutcome, BulkJobRequest, DailyBulkSchedule, DelaySettings, ExecutionHistory,
    SlotOptions, TaskDescriptor,
};
use common::queue::WorkQueue;
use common::runner::{JobRunner, PAGE_JOB};
use common::slots::{SlotFireOutcome, SlotScheduler};
use common::store::{DurableStore, MemoryStore};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

struct FakeExecutionLayer {
    executed: Mutex<Vec<String>>,
    batches: Mutex<Vec<Vec<String>>>,
    dispatched: Mutex<Vec<BulkJobRequest>>,
    contexts_open: AtomicUsize,
    entitled: AtomicBool,
    busy: AtomicBool,
}

impl FakeExecutionLayer {
    fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            dispatched: Mutex::new(Vec::new()),
            contexts_open: AtomicUsize::new(0),
            entitled: AtomicBool::new(true),
            busy: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ContextProvider for FakeExecutionLayer {
    async fn acquire(&self, url: &str, _foreground: bool) -> Result<ContextHandle, ActuationError> {
        let id = self.contexts_open.fetch_add(1, Ordering::SeqCst);
        Ok(ContextHandle {
            id: id.to_string(),
            url: url.to_string(),
        })
    }

    async fn release(&self, _handle: ContextHandle) {
        self.contexts_open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Actuator for FakeExecutionLayer {
    async fn execute(
        &self,
        task: &TaskDescriptor,
        _context: &ContextHandle,
    ) -> Result<bool, ActuationError> {
        self.executed.lock().await.push(task.urn.clone());
        Ok(true)
    }
}

#[async_trait]
impl EntitlementChecker for FakeExecutionLayer {
    async fn has_feature(&self, _name: &str) -> Result<bool, ActuationError> {
        Ok(self.entitled.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl BulkDispatcher for FakeExecutionLayer {
    async fn dispatch(&self, request: &BulkJobRequest) -> Result<(), ActuationError> {
        self.dispatched.lock().await.push(request.clone());
        Ok(())
    }
}

#[async_trait]
impl BatchActuator for FakeExecutionLayer {
    async fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    async fn run_batch(
        &self,
        items: &[String],
        _options: &SlotOptions,
    ) -> Result<BatchOutcome, ActuationError> {
        self.batches.lock().await.push(items.to_vec());
        Ok(BatchOutcome {
            processed: items.len() as u32,
            succeeded: items.len() as u32,
            failed: 0,
        })
    }
}

fn runner_config() -> RunnerConfig {
    RunnerConfig {
        poll_min_seconds: 20,
        poll_max_seconds: 30,
        target_url_template: "https://www.linkedin.com/feed/update/{urn}/".to_string(),
    }
}

async fn seed_queue(store: &Arc<dyn DurableStore>, key: &'static str, items: &[&str]) {
    let queue: WorkQueue<String> = WorkQueue::new(Arc::clone(store), key);
    for item in items {
        queue.push_back(item.to_string()).await.expect("seed queue");
    }
}

#[tokio::test(start_paused = true)]
async fn test_page_run_drains_queue_and_flips_flags() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let layer = Arc::new(FakeExecutionLayer::new());

    store
        .set_bool(keys::COMMENT_ENABLED, true)
        .await
        .expect("flag");
    store
        .set_bool(keys::COMMENT_LIST_ENABLED, true)
        .await
        .expect("flag");
    seed_queue(
        &store,
        keys::PENDING_ACTIVITIES,
        &["urn:li:activity:1", "urn:li:activity:2", "urn:li:activity:3"],
    )
    .await;

    let runner = JobRunner::new(
        PAGE_JOB,
        Arc::clone(&store),
        Arc::clone(&layer) as Arc<dyn Actuator>,
        Arc::clone(&layer) as Arc<dyn ContextProvider>,
        None,
        CooldownPolicy::from_seed(DelaySettings::default(), 9),
        runner_config(),
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(runner.run(shutdown_rx));

    let mut message = String::new();
    for _ in 0..10_000 {
        message = store.get_string(keys::COMPLETION_MESSAGE, "").await;
        if !message.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    assert_eq!(message, "3 comments done");
    assert!(!store.get_bool(keys::COMMENT_ENABLED, true).await);
    assert!(!store.get_bool(keys::COMMENT_LIST_ENABLED, true).await);
    assert_eq!(
        *layer.executed.lock().await,
        vec!["urn:li:activity:1", "urn:li:activity:2", "urn:li:activity:3"]
    );
    // Every acquired context was released.
    assert_eq!(layer.contexts_open.load(Ordering::SeqCst), 0);

    shutdown_tx.send(()).expect("shutdown");
    handle.await.expect("join");
}

#[tokio::test]
async fn test_bulk_entitlement_denial_blocks_dispatch() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let layer = Arc::new(FakeExecutionLayer::new());
    layer.entitled.store(false, Ordering::SeqCst);

    store
        .set_json(
            keys::DAILY_BULK_SCHEDULE,
            &DailyBulkSchedule {
                enabled: true,
                keywords: vec!["rust".to_string()],
                quota: 20,
                ..Default::default()
            },
        )
        .await
        .expect("seed schedule");

    let (alarms, _rx) = TokioAlarmService::new(Arc::clone(&store));
    let bulk = DailyBulkScheduler::new(
        Arc::clone(&store),
        Arc::new(alarms),
        Arc::clone(&layer) as Arc<dyn EntitlementChecker>,
        Arc::clone(&layer) as Arc<dyn BulkDispatcher>,
        "bulk_engagement".to_string(),
    );

    let outcome = bulk.on_alarm_fired().await.expect("fire");
    assert_eq!(outcome, BulkFireOutcome::SkippedEntitlement);
    assert!(layer.dispatched.lock().await.is_empty());

    let history: ExecutionHistory = store
        .get_json(keys::EXECUTION_HISTORY, ExecutionHistory::new())
        .await;
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_bulk_dispatch_records_today() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let layer = Arc::new(FakeExecutionLayer::new());

    store
        .set_json(
            keys::DAILY_BULK_SCHEDULE,
            &DailyBulkSchedule {
                enabled: true,
                keywords: vec!["rust".to_string(), "async".to_string()],
                quota: 20,
                ..Default::default()
            },
        )
        .await
        .expect("seed schedule");

    let (alarms, _rx) = TokioAlarmService::new(Arc::clone(&store));
    let bulk = DailyBulkScheduler::new(
        Arc::clone(&store),
        Arc::new(alarms),
        Arc::clone(&layer) as Arc<dyn EntitlementChecker>,
        Arc::clone(&layer) as Arc<dyn BulkDispatcher>,
        "bulk_engagement".to_string(),
    );

    // The default business hours config is disabled, so the gate is open.
    let outcome = bulk.on_alarm_fired().await.expect("fire");
    assert_eq!(outcome, BulkFireOutcome::Dispatched);

    let dispatched = layer.dispatched.lock().await;
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].quota, 20);

    let history: ExecutionHistory = store
        .get_json(keys::EXECUTION_HISTORY, ExecutionHistory::new())
        .await;
    assert!(history.contains_key(&Utc::now().date_naive().to_string()));
}

#[tokio::test]
async fn test_slot_fire_slices_quota_and_rearms() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let layer = Arc::new(FakeExecutionLayer::new());

    let (alarms, _rx) = TokioAlarmService::new(Arc::clone(&store));
    let slots = SlotScheduler::new(
        Arc::clone(&store),
        Arc::new(alarms),
        Arc::clone(&layer) as Arc<dyn BatchActuator>,
    );

    // A slot far from now: the firing runs with default options.
    slots
        .add_entry("03:00", SlotOptions::default())
        .await
        .expect("add slot");
    store
        .set_bool(keys::SLOT_SCHEDULER_ENABLED, true)
        .await
        .expect("flag");
    store
        .set_json(keys::PROFILES_PER_DAY, &2u32)
        .await
        .expect("quota");
    seed_queue(
        &store,
        keys::PENDING_PROFILES,
        &["profile-a", "profile-b", "profile-c"],
    )
    .await;

    let outcome = slots.on_alarm_fired().await.expect("fire");
    let summary = match outcome {
        SlotFireOutcome::Ran(summary) => summary,
        other => panic!("expected a run, got {other:?}"),
    };
    assert_eq!(summary.processed, 2);

    let batches = layer.batches.lock().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(
        batches[0],
        vec!["profile-a".to_string(), "profile-b".to_string()]
    );

    // The third item waits for the next slot.
    let queue: WorkQueue<String> = WorkQueue::new(Arc::clone(&store), keys::PENDING_PROFILES);
    assert_eq!(queue.len().await, 1);

    // The alarm is re-armed after the run.
    let alarms_doc: std::collections::HashMap<String, serde_json::Value> =
        store.get_json(keys::ALARMS, std::collections::HashMap::new()).await;
    assert!(alarms_doc.contains_key(common::slots::SLOT_ALARM));
}

#[tokio::test]
async fn test_slot_fire_skips_while_busy() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let layer = Arc::new(FakeExecutionLayer::new());
    layer.busy.store(true, Ordering::SeqCst);

    let (alarms, _rx) = TokioAlarmService::new(Arc::clone(&store));
    let slots = SlotScheduler::new(
        Arc::clone(&store),
        Arc::new(alarms),
        Arc::clone(&layer) as Arc<dyn BatchActuator>,
    );

    slots
        .add_entry("03:00", SlotOptions::default())
        .await
        .expect("add slot");
    store
        .set_bool(keys::SLOT_SCHEDULER_ENABLED, true)
        .await
        .expect("flag");
    seed_queue(&store, keys::PENDING_PROFILES, &["profile-a"]).await;

    let outcome = slots.on_alarm_fired().await.expect("fire");
    assert_eq!(outcome, SlotFireOutcome::Busy);
    assert!(layer.batches.lock().await.is_empty());

    // Nothing was consumed from the queue.
    let queue: WorkQueue<String> = WorkQueue::new(Arc::clone(&store), keys::PENDING_PROFILES);
    assert_eq!(queue.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_alarm_survives_restart_of_service() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());

    // First service instance arms an alarm, then goes away.
    {
        let (alarms, _rx) = TokioAlarmService::new(Arc::clone(&store));
        alarms
            .create(
                "slot_trigger",
                common::alarm::AlarmSpec::after(Duration::from_secs(60)),
            )
            .await
            .expect("arm");
    }

    // A second instance over the same store restores and fires it.
    let (alarms, mut rx) = TokioAlarmService::new(Arc::clone(&store));
    alarms.restore().await.expect("restore");
    assert_eq!(rx.recv().await.expect("fired"), "slot_trigger");
}
