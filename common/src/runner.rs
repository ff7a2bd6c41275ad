// Job runner
// One long-lived polling loop per job kind. The runner owns its queue
// key exclusively: the pop-and-persist dequeue is only race-free with a
// single writer, so whoever starts runners must start at most one per
// queue. Completion counters live in process memory only and reset on
// restart by design.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::actuator::{Actuator, ContextProvider, Resolver};
use crate::config::RunnerConfig;
use crate::cooldown::CooldownPolicy;
use crate::hours;
use crate::models::{keys, EngagementActions, TaskDescriptor};
use crate::queue::WorkQueue;
use crate::store::DurableStore;
use crate::telemetry;

/// Static description of one job kind. The list job differs from the
/// page job only by its queue key and the extra resolve step; both
/// share the actuation and completion logic through one runner.
#[derive(Debug, Clone, Copy)]
pub struct JobSpec {
    /// Short name used in logs and metrics, e.g. "comment".
    pub job_kind: &'static str,
    /// Queue this runner exclusively owns.
    pub queue_key: &'static str,
    /// Persisted flag checked once per poll cycle; when off, the runner
    /// stops producing new actuation but keeps polling.
    pub governing_flag: &'static str,
    /// Both mode flags flipped off when the queue drains.
    pub completion_flags: [&'static str; 2],
    /// Noun used in the completion message ("N comments done").
    pub completion_noun: &'static str,
    /// Whether dequeued items are activity-source URLs that must first
    /// be resolved to a content identifier.
    pub resolves_source: bool,
}

/// Spec for the page engagement job: items are content URNs.
pub const PAGE_JOB: JobSpec = JobSpec {
    job_kind: "comment",
    queue_key: keys::PENDING_ACTIVITIES,
    governing_flag: keys::COMMENT_ENABLED,
    completion_flags: [keys::COMMENT_ENABLED, keys::COMMENT_LIST_ENABLED],
    completion_noun: "comments",
    resolves_source: false,
};

/// Spec for the list engagement job: items are activity-source URLs.
pub const LIST_JOB: JobSpec = JobSpec {
    job_kind: "comment_list",
    queue_key: keys::PENDING_ACTIVITY_URLS,
    governing_flag: keys::COMMENT_LIST_ENABLED,
    completion_flags: [keys::COMMENT_ENABLED, keys::COMMENT_LIST_ENABLED],
    completion_noun: "comments",
    resolves_source: true,
};

/// What became of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    /// Nothing queued; not an error.
    Empty,
    /// Actuation reported success.
    Success,
    /// Actuation failed or errored; the item is consumed, not retried.
    Failure,
    /// Resolution miss; the item is consumed without actuation.
    Dropped,
}

/// Single long-lived polling loop for one job kind.
pub struct JobRunner {
    spec: JobSpec,
    store: Arc<dyn DurableStore>,
    queue: WorkQueue<String>,
    actuator: Arc<dyn Actuator>,
    contexts: Arc<dyn ContextProvider>,
    resolver: Option<Arc<dyn Resolver>>,
    cooldown: CooldownPolicy,
    config: RunnerConfig,
    rng: StdRng,
    total_completed_in_run: u64,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spec: JobSpec,
        store: Arc<dyn DurableStore>,
        actuator: Arc<dyn Actuator>,
        contexts: Arc<dyn ContextProvider>,
        resolver: Option<Arc<dyn Resolver>>,
        cooldown: CooldownPolicy,
        config: RunnerConfig,
    ) -> Self {
        let queue = WorkQueue::new(Arc::clone(&store), spec.queue_key);
        Self {
            spec,
            store,
            queue,
            actuator,
            contexts,
            resolver,
            cooldown,
            config,
            rng: StdRng::from_entropy(),
            total_completed_in_run: 0,
        }
    }

    /// Items completed since the last queue drain.
    pub fn total_completed_in_run(&self) -> u64 {
        self.total_completed_in_run
    }

    fn poll_delay(&mut self) -> Duration {
        Duration::from_secs(
            self.rng
                .gen_range(self.config.poll_min_seconds..=self.config.poll_max_seconds),
        )
    }

    fn target_url(&self, urn: &str) -> String {
        self.config.target_url_template.replace("{urn}", urn)
    }

    /// Run until the shutdown signal. There is no terminal state while
    /// the process lives; a cleared governing flag only pauses
    /// dequeuing.
    #[instrument(skip_all, fields(job_kind = self.spec.job_kind, queue = self.spec.queue_key))]
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Job runner started");

        loop {
            let delay = self.poll_delay();
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping job runner");
                    break;
                }
            }

            // Gate every cycle to business hours; outside the window
            // the wait re-validates on every wake. Shutdown cuts the
            // wait short rather than holding the task until the window
            // opens.
            tokio::select! {
                gate = hours::wait_until_window(&self.store) => {
                    if let Err(e) = gate {
                        warn!(error = %e, "Business hours gate failed, retrying next poll");
                        continue;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping job runner");
                    break;
                }
            }

            if !self.store.get_bool(self.spec.governing_flag, false).await {
                debug!("Job disabled, skipping poll cycle");
                continue;
            }

            let outcome = self.process_next().await;
            match outcome {
                ItemOutcome::Empty => {}
                ItemOutcome::Success => {
                    self.total_completed_in_run += 1;
                    telemetry::record_engagement_success(self.spec.job_kind);
                    self.cooldown.after_success().await;
                    self.check_drained().await;
                }
                ItemOutcome::Failure => {
                    // No cooldown and no drain bookkeeping: the failed
                    // item is consumed and the loop moves on to the
                    // next poll interval.
                    telemetry::record_engagement_failure(self.spec.job_kind, "actuation");
                }
                ItemOutcome::Dropped => {
                    telemetry::record_engagement_dropped(self.spec.job_kind);
                    self.check_drained().await;
                }
            }
        }
    }

    /// Dequeue and process at most one item. Every error is contained
    /// here; nothing propagates out of the loop iteration.
    async fn process_next(&mut self) -> ItemOutcome {
        let item = match self.queue.dequeue_head().await {
            Ok(Some(item)) => item,
            Ok(None) => return ItemOutcome::Empty,
            Err(e) => {
                error!(error = %e, "Dequeue failed");
                return ItemOutcome::Empty;
            }
        };

        let urn = if self.spec.resolves_source {
            match self.resolve_item(&item).await {
                Ok(Some(urn)) => urn,
                Ok(None) => {
                    info!(source_url = %item, "No content resolved, dropping item");
                    return ItemOutcome::Dropped;
                }
                Err(e) => {
                    error!(source_url = %item, error = %e, "Resolution failed");
                    return ItemOutcome::Failure;
                }
            }
        } else {
            item
        };

        match self.actuate(&urn).await {
            Ok(true) => {
                info!(urn = %urn, "Engagement succeeded");
                ItemOutcome::Success
            }
            Ok(false) => {
                warn!(urn = %urn, "Actuator reported failure");
                ItemOutcome::Failure
            }
            Err(e) => {
                error!(urn = %urn, error = %e, "Actuation errored");
                ItemOutcome::Failure
            }
        }
    }

    /// Resolve an activity-source URL to its first content identifier
    /// inside a scoped context.
    async fn resolve_item(
        &self,
        source_url: &str,
    ) -> Result<Option<String>, crate::errors::ActuationError> {
        let resolver = self.resolver.as_ref().ok_or_else(|| {
            crate::errors::ActuationError::RequestFailed(
                "job resolves source URLs but no resolver was provided".to_string(),
            )
        })?;

        let context = self.contexts.acquire(source_url, false).await?;
        let resolved = resolver.resolve_first_item(source_url, &context).await;
        self.contexts.release(context).await;
        resolved
    }

    /// Acquire a context for the target page, execute, and release the
    /// context on every exit path.
    async fn actuate(&self, urn: &str) -> Result<bool, crate::errors::ActuationError> {
        let url = self.target_url(urn);
        let context = self.contexts.acquire(&url, false).await?;

        let task = TaskDescriptor {
            urn: urn.to_string(),
            actions: EngagementActions::default(),
        };
        let result = self.actuator.execute(&task, &context).await;
        // Release before surfacing the result: the context must never
        // outlive the iteration that acquired it.
        self.contexts.release(context).await;
        result
    }

    /// Run-complete bookkeeping once the queue drains: flip both mode
    /// flags off, leave a human-readable message, reset the counter.
    async fn check_drained(&mut self) {
        if !self.queue.is_empty().await {
            return;
        }

        let message = format!(
            "{} {} done",
            self.total_completed_in_run, self.spec.completion_noun
        );
        info!(
            completed = self.total_completed_in_run,
            message = %message,
            "Queue drained, run complete"
        );

        for flag in self.spec.completion_flags {
            if let Err(e) = self.store.set_bool(flag, false).await {
                error!(flag = flag, error = %e, "Failed to clear mode flag");
            }
        }
        if let Err(e) = self
            .store
            .set_string(keys::COMPLETION_MESSAGE, &message)
            .await
        {
            error!(error = %e, "Failed to write completion message");
        }

        self.total_completed_in_run = 0;
    }
}
