// Humanization cooldown policy
// Two independent uniform draws: a short pause after every successful
// unit of work, and an occasional long pause after a randomized
// run-length of successes. Fixed delays are trivially fingerprinted;
// the layered jitter approximates human work/break cycles.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::models::DelaySettings;
use crate::telemetry;

/// Randomized cooldown policy applied by the job runner after each
/// successful actuation. The batch countdown lives in process memory
/// only: a fresh run should not inherit a stale countdown.
pub struct CooldownPolicy {
    settings: DelaySettings,
    rng: StdRng,
    items_until_batch: u32,
}

impl CooldownPolicy {
    /// Create a policy seeded from OS entropy.
    pub fn new(settings: DelaySettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    /// Create a policy with a fixed seed. Tests use this to make the
    /// draw sequence deterministic.
    pub fn from_seed(settings: DelaySettings, seed: u64) -> Self {
        Self::with_rng(settings, StdRng::seed_from_u64(seed))
    }

    fn with_rng(settings: DelaySettings, mut rng: StdRng) -> Self {
        let items_until_batch = draw_batch_countdown(&settings, &mut rng);
        Self {
            settings,
            rng,
            items_until_batch,
        }
    }

    /// Successes remaining before the next long batch pause.
    pub fn items_until_batch(&self) -> u32 {
        self.items_until_batch
    }

    /// Draw the per-action pause.
    pub fn draw_action_delay(&mut self) -> Duration {
        Duration::from_secs(
            self.rng
                .gen_range(self.settings.action_min_secs..=self.settings.action_max_secs),
        )
    }

    /// Draw the long batch pause.
    pub fn draw_batch_delay(&mut self) -> Duration {
        Duration::from_secs(
            self.rng
                .gen_range(self.settings.batch_min_secs..=self.settings.batch_max_secs),
        )
    }

    /// Await the pauses owed after a successful unit of work. Never
    /// fails and is never skipped: the per-action pause always applies,
    /// and the long pause fires when the countdown reaches zero, after
    /// which a fresh countdown is drawn.
    pub async fn after_success(&mut self) {
        let action_delay = self.draw_action_delay();
        debug!(delay_secs = action_delay.as_secs(), "Per-action cooldown");
        telemetry::record_cooldown("per_action", action_delay.as_secs_f64());
        sleep(action_delay).await;

        self.items_until_batch = self.items_until_batch.saturating_sub(1);
        if self.items_until_batch == 0 {
            let batch_delay = self.draw_batch_delay();
            debug!(delay_secs = batch_delay.as_secs(), "Batch cooldown");
            telemetry::record_cooldown("batch", batch_delay.as_secs_f64());
            sleep(batch_delay).await;
            self.items_until_batch = draw_batch_countdown(&self.settings, &mut self.rng);
        }
    }
}

fn draw_batch_countdown(settings: &DelaySettings, rng: &mut StdRng) -> u32 {
    rng.gen_range(settings.batch_min_items..=settings.batch_max_items)
}
