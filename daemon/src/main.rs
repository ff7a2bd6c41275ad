// Daemon binary entry point
// One process owns the durable store, both job runners, the daily bulk
// scheduler, and the slot scheduler. The work queues are single-writer,
// so exactly one daemon instance may run against a given store file.

use common::actuator::{
    Actuator, BatchActuator, BulkDispatcher, ContextProvider, EntitlementChecker, HttpActuator,
    Resolver,
};
use common::alarm::{AlarmService, TokioAlarmService};
use common::bulk::{DailyBulkScheduler, DAILY_BULK_ALARM};
use common::config::Settings;
use common::cooldown::CooldownPolicy;
use common::runner::{JobRunner, LIST_JOB, PAGE_JOB};
use common::slots::{SlotScheduler, SLOT_ALARM};
use common::store::{DurableStore, JsonFileStore};
use common::telemetry;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;
    settings.validate().map_err(|e| anyhow::anyhow!(e))?;

    telemetry::init_logging(&settings.observability.log_level)?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        store_path = %settings.storage.path,
        endpoint = %settings.actuator.endpoint,
        "Starting engagement daemon"
    );

    let store: Arc<dyn DurableStore> = Arc::new(JsonFileStore::open(&settings.storage.path).await?);

    let (alarm_service, mut fired_alarms) = TokioAlarmService::new(Arc::clone(&store));
    let alarm_service = Arc::new(alarm_service);
    alarm_service.restore().await?;
    let alarms: Arc<dyn AlarmService> = Arc::clone(&alarm_service) as Arc<dyn AlarmService>;

    let actuator = Arc::new(HttpActuator::new(&settings.actuator)?);

    let (shutdown_tx, _) = broadcast::channel(1);

    // One runner per queue key; the queues tolerate no second writer.
    let page_runner = JobRunner::new(
        PAGE_JOB,
        Arc::clone(&store),
        Arc::clone(&actuator) as Arc<dyn Actuator>,
        Arc::clone(&actuator) as Arc<dyn ContextProvider>,
        None,
        CooldownPolicy::new(settings.delays),
        settings.runner.clone(),
    );
    let list_runner = JobRunner::new(
        LIST_JOB,
        Arc::clone(&store),
        Arc::clone(&actuator) as Arc<dyn Actuator>,
        Arc::clone(&actuator) as Arc<dyn ContextProvider>,
        Some(Arc::clone(&actuator) as Arc<dyn Resolver>),
        CooldownPolicy::new(settings.delays),
        settings.runner.clone(),
    );

    let page_handle = tokio::spawn(page_runner.run(shutdown_tx.subscribe()));
    let list_handle = tokio::spawn(list_runner.run(shutdown_tx.subscribe()));

    let bulk = DailyBulkScheduler::new(
        Arc::clone(&store),
        Arc::clone(&alarms),
        Arc::clone(&actuator) as Arc<dyn EntitlementChecker>,
        Arc::clone(&actuator) as Arc<dyn BulkDispatcher>,
        settings.actuator.bulk_feature.clone(),
    );
    let slots = SlotScheduler::new(
        Arc::clone(&store),
        Arc::clone(&alarms),
        Arc::clone(&actuator) as Arc<dyn BatchActuator>,
    );

    // Reconcile both schedulers with whatever the store says on boot.
    bulk.sync_alarm().await?;
    slots.arm_next_fire().await?;

    info!("Engagement daemon started");

    // Route fired alarms to their owners until shutdown.
    loop {
        tokio::select! {
            fired = fired_alarms.recv() => {
                match fired.as_deref() {
                    Some(DAILY_BULK_ALARM) => {
                        if let Err(e) = bulk.on_alarm_fired().await {
                            error!(error = %e, "Daily bulk firing failed");
                        }
                    }
                    Some(SLOT_ALARM) => {
                        if let Err(e) = slots.on_alarm_fired().await {
                            error!(error = %e, "Slot firing failed");
                        }
                    }
                    Some(other) => {
                        warn!(alarm = other, "Fired alarm has no owner, ignoring");
                    }
                    None => {
                        // Alarm service dropped its sender; nothing left
                        // to route.
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C signal, initiating graceful shutdown");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(());
    if let Err(e) = page_handle.await {
        error!(error = %e, "Page runner task failed");
    }
    if let Err(e) = list_handle.await {
        error!(error = %e, "List runner task failed");
    }

    info!("Engagement daemon stopped");
    Ok(())
}
