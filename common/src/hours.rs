// Wall-clock gate (business hours)
// Pure window math over chrono plus a re-validating wait loop. The gate
// never runs a task outside the window: every wake re-checks, because
// alarm delivery and process suspension can overshoot the computed
// delay.

use chrono::{DateTime, Datelike, Days, LocalResult, NaiveDate, TimeZone, Timelike};
use chrono_tz::Tz;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::ScheduleError;
use crate::models::{keys, BusinessHoursConfig};
use crate::store::DurableStore;

/// Upper bound on the day walk in `next_window_start`. Two weeks covers
/// every weekday/weekend combination; exceeding it means the config
/// permits no day at all.
const MAX_DAY_WALK: u32 = 14;

/// How a gated task ended up running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    RanNow,
    /// Ran after the given number of deferrals to a later window start.
    Deferred(u32),
}

fn day_allowed(weekday: u32, config: &BusinessHoursConfig) -> bool {
    config.work_days.contains(&weekday) || config.allow_weekends
}

/// Whether `now` falls inside the allowed execution window. A disabled
/// gate is always open.
pub fn is_within_window<T: Datelike + Timelike>(now: &T, config: &BusinessHoursConfig) -> bool {
    if !config.enabled {
        return true;
    }
    if !day_allowed(now.weekday().num_days_from_sunday(), config) {
        return false;
    }
    config.start_hour <= now.hour() && now.hour() < config.end_hour
}

fn resolve_local<Z: TimeZone>(tz: &Z, date: NaiveDate, hour: u32) -> Option<DateTime<Z>> {
    let naive = date.and_hms_opt(hour, 0, 0)?;
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        // DST fold: take the earlier instant.
        LocalResult::Ambiguous(earlier, _) => Some(earlier),
        // DST gap swallowed the start hour entirely.
        LocalResult::None => None,
    }
}

/// First instant strictly after `now` that lands exactly on
/// `start_hour:00:00` of a permitted day. Exact to the minute: this
/// value seeds alarm scheduling.
pub fn next_window_start<Z: TimeZone>(
    now: &DateTime<Z>,
    config: &BusinessHoursConfig,
) -> Result<DateTime<Z>, ScheduleError> {
    config.validate()?;

    let tz = now.timezone();
    let mut date = now.date_naive();

    // Today is out when it is a disallowed day or the window already
    // closed; a start hour that is not in the future is out too.
    let today_over = !day_allowed(now.weekday().num_days_from_sunday(), config)
        || now.hour() >= config.end_hour;
    if today_over {
        date = advance_one_day(date)?;
    }

    for _ in 0..MAX_DAY_WALK {
        if day_allowed(date.weekday().num_days_from_sunday(), config) {
            if let Some(candidate) = resolve_local(&tz, date, config.start_hour) {
                if candidate > *now {
                    return Ok(candidate);
                }
            }
        }
        date = advance_one_day(date)?;
    }

    Err(ScheduleError::CalculationFailed(
        "no permitted day within the next two weeks".to_string(),
    ))
}

fn advance_one_day(date: NaiveDate) -> Result<NaiveDate, ScheduleError> {
    date.checked_add_days(Days::new(1))
        .ok_or_else(|| ScheduleError::CalculationFailed("date overflow".to_string()))
}

/// Parse the configured IANA timezone, falling back to UTC.
pub fn configured_timezone(config: &BusinessHoursConfig) -> Tz {
    match config.timezone.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = %config.timezone, "Unknown timezone, falling back to UTC");
            chrono_tz::UTC
        }
    }
}

/// Block until the business-hours window is open, reloading the
/// persisted config and re-validating after every wake. An explicit
/// loop rather than recursion; unbounded by design, cancelled with the
/// owning task.
pub async fn wait_until_window(store: &Arc<dyn DurableStore>) -> Result<u32, ScheduleError> {
    let mut deferrals = 0u32;

    loop {
        let config: BusinessHoursConfig = store
            .get_json(keys::BUSINESS_HOURS, BusinessHoursConfig::default())
            .await;
        let tz = configured_timezone(&config);
        let now = chrono::Utc::now().with_timezone(&tz);

        if is_within_window(&now, &config) {
            return Ok(deferrals);
        }

        let next = next_window_start(&now, &config)?;
        let delay = (next.clone() - now)
            .to_std()
            .unwrap_or(Duration::from_secs(60));
        deferrals += 1;
        warn!(
            next_window = %next,
            delay_secs = delay.as_secs(),
            deferrals = deferrals,
            "Outside business hours, deferring"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Run `task` inside the business-hours window: immediately when open,
/// otherwise after waiting (and re-validating) for the next start.
pub async fn run_gated<F, Fut, T>(
    store: &Arc<dyn DurableStore>,
    task: F,
) -> Result<(GateOutcome, T), ScheduleError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let deferrals = wait_until_window(store).await?;
    let outcome = if deferrals == 0 {
        debug!("Gate open, running now");
        GateOutcome::RanNow
    } else {
        GateOutcome::Deferred(deferrals)
    };
    Ok((outcome, task().await))
}
