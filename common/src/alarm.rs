// Durable alarm service
// Named timers that survive process restarts: every armed alarm is
// persisted in the store and re-armed by `restore()` on startup. An
// overdue deadline fires immediately, so delivery is at-least-once.
// There is no ordering guarantee between differently named alarms, and
// consumers must treat a firing as a trigger to recompute, never as
// proof of the exact slot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::errors::AlarmError;
use crate::models::keys;
use crate::store::DurableStore;

/// When and how often a named alarm fires. Exactly one of `fire_at` and
/// `delay` must be set.
#[derive(Debug, Clone, Default)]
pub struct AlarmSpec {
    pub fire_at: Option<DateTime<Utc>>,
    pub delay: Option<Duration>,
    pub period: Option<Duration>,
}

impl AlarmSpec {
    pub fn at(fire_at: DateTime<Utc>) -> Self {
        Self {
            fire_at: Some(fire_at),
            ..Default::default()
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn repeating(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }
}

/// Durable alarm primitive. Minute-coarse precision is all callers may
/// assume.
#[async_trait]
pub trait AlarmService: Send + Sync {
    /// Arm (or re-arm) the named alarm. An existing alarm with the same
    /// name is replaced.
    async fn create(&self, name: &str, spec: AlarmSpec) -> Result<(), AlarmError>;

    /// Disarm the named alarm. Returns whether it existed.
    async fn clear(&self, name: &str) -> Result<bool, AlarmError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedAlarm {
    fire_at: DateTime<Utc>,
    period_minutes: Option<u64>,
}

type PersistedAlarms = HashMap<String, PersistedAlarm>;

/// Tokio-backed alarm service. Fired alarm names are delivered over the
/// receiver handed out at construction; the owning process routes them
/// to the schedulers.
pub struct TokioAlarmService {
    store: Arc<dyn DurableStore>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    tx: mpsc::UnboundedSender<String>,
}

impl TokioAlarmService {
    pub fn new(store: Arc<dyn DurableStore>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                tasks: Mutex::new(HashMap::new()),
                tx,
            },
            rx,
        )
    }

    /// Re-arm every persisted alarm after a restart. Deadlines that
    /// passed while the process was down fire immediately.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<(), AlarmError> {
        let persisted: PersistedAlarms = self.store.get_json(keys::ALARMS, HashMap::new()).await;
        info!(count = persisted.len(), "Restoring persisted alarms");
        for (name, alarm) in persisted {
            self.spawn_timer(name, alarm).await;
        }
        Ok(())
    }

    async fn persist(
        store: &Arc<dyn DurableStore>,
        apply: impl FnOnce(&mut PersistedAlarms),
    ) -> Result<(), AlarmError> {
        let mut persisted: PersistedAlarms = store.get_json(keys::ALARMS, HashMap::new()).await;
        apply(&mut persisted);
        store.set_json(keys::ALARMS, &persisted).await?;
        Ok(())
    }

    async fn spawn_timer(&self, name: String, alarm: PersistedAlarm) {
        let store = Arc::clone(&self.store);
        let tx = self.tx.clone();
        let timer_name = name.clone();
        let handle = tokio::spawn(async move {
            run_timer(store, tx, timer_name, alarm).await;
        });

        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.insert(name, handle) {
            previous.abort();
        }
    }
}

/// Timer loop for one named alarm. One-shots fire and forget
/// themselves; periodic alarms persist each next deadline so a restart
/// picks up where the timer left off.
///
/// The persisted-doc update happens strictly before the name is sent:
/// fire handlers commonly re-arm the same name, and both sides
/// read-modify-write the whole alarms document, so a write issued by
/// this timer after the handler's insert would erase the fresh alarm.
async fn run_timer(
    store: Arc<dyn DurableStore>,
    tx: mpsc::UnboundedSender<String>,
    name: String,
    mut alarm: PersistedAlarm,
) {
    loop {
        let wait = (alarm.fire_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        let done = match alarm.period_minutes {
            Some(minutes) => {
                alarm.fire_at = Utc::now() + chrono::Duration::minutes(minutes as i64);
                let next = alarm.clone();
                let update_name = name.clone();
                if let Err(e) = TokioAlarmService::persist(&store, move |persisted| {
                    persisted.insert(update_name, next);
                })
                .await
                {
                    warn!(alarm = %name, error = %e, "Failed to persist next deadline");
                }
                false
            }
            None => {
                let remove_name = name.clone();
                if let Err(e) = TokioAlarmService::persist(&store, move |persisted| {
                    persisted.remove(&remove_name);
                })
                .await
                {
                    warn!(alarm = %name, error = %e, "Failed to drop fired alarm");
                }
                true
            }
        };

        debug!(alarm = %name, "Alarm fired");
        if tx.send(name.clone()).is_err() {
            // Receiver gone: the process is shutting down.
            return;
        }
        if done {
            return;
        }
    }
}

#[async_trait]
impl AlarmService for TokioAlarmService {
    #[instrument(skip(self, spec))]
    async fn create(&self, name: &str, spec: AlarmSpec) -> Result<(), AlarmError> {
        let fire_at = match (spec.fire_at, spec.delay) {
            (Some(at), None) => at,
            (None, Some(delay)) => {
                Utc::now()
                    + chrono::Duration::from_std(delay).map_err(|e| AlarmError::InvalidSpec {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })?
            }
            _ => {
                return Err(AlarmError::InvalidSpec {
                    name: name.to_string(),
                    reason: "exactly one of fire_at and delay must be set".to_string(),
                })
            }
        };

        let alarm = PersistedAlarm {
            fire_at,
            period_minutes: spec.period.map(|p| (p.as_secs() / 60).max(1)),
        };

        let persist_name = name.to_string();
        let persist_alarm = alarm.clone();
        Self::persist(&self.store, move |persisted| {
            persisted.insert(persist_name, persist_alarm);
        })
        .await?;

        self.spawn_timer(name.to_string(), alarm).await;

        info!(alarm = name, fire_at = %fire_at, "Alarm armed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear(&self, name: &str) -> Result<bool, AlarmError> {
        let mut existed = false;
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(handle) = tasks.remove(name) {
                handle.abort();
                existed = true;
            }
        }

        let persisted: PersistedAlarms = self.store.get_json(keys::ALARMS, HashMap::new()).await;
        if persisted.contains_key(name) {
            existed = true;
            let remove_name = name.to_string();
            Self::persist(&self.store, move |persisted| {
                persisted.remove(&remove_name);
            })
            .await?;
        }

        debug!(alarm = name, existed = existed, "Alarm cleared");
        Ok(existed)
    }
}
