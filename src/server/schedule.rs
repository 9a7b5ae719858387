//! Incremental schedule shifting
//!
//! Without `--wait` the refresh is left to the server's own schedule named
//! after the datasource, moved to the next quarter-hour slot at least
//! fifteen minutes ahead.

use super::ServerApi;
use crate::error::Result;
use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use tracing::{error, info};

const SLOT_SECONDS: u32 = 15 * 60;
const DAY_SECONDS: u32 = 24 * 60 * 60;

/// First quarter-hour boundary at or after `now + 15 minutes`.
pub fn next_schedule_slot(now: NaiveDateTime) -> NaiveTime {
    let earliest = (now + Duration::minutes(15)).time();
    let mut seconds = earliest.num_seconds_from_midnight();
    if earliest.nanosecond() > 0 {
        seconds += 1;
    }
    let slot = seconds.div_ceil(SLOT_SECONDS) * SLOT_SECONDS % DAY_SECONDS;
    NaiveTime::from_num_seconds_from_midnight_opt(slot, 0).unwrap_or(NaiveTime::MIN)
}

/// Move the schedule named `datasource` to the next slot.
///
/// Returns the new start time, or `None` when no such schedule exists.
pub async fn update_incremental_schedule(
    api: &dyn ServerApi,
    datasource: &str,
    now: NaiveDateTime,
) -> Result<Option<NaiveTime>> {
    let schedules = api.schedules().await?;
    let Some(schedule) = schedules.into_iter().find(|s| s.name == datasource) else {
        error!("no incremental schedule named '{}' on the server", datasource);
        return Ok(None);
    };

    let start = next_schedule_slot(now);
    api.update_schedule_start(&schedule, start).await?;
    info!(schedule = %schedule.name, start = %start, "incremental schedule moved");
    Ok(Some(start))
}
