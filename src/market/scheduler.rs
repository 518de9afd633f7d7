//! The long-lived task that advances the market once per UTC day.
//!
//! Two states, forever: wait for the next market day, run the tick. The
//! wake time is recomputed from the store on every pass, and the tick
//! itself re-checks the stamp inside its transaction, so a day is never
//! applied twice even with a second process pointed at the same store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::market::tick;
use crate::store::game::Game;

/// Pause before re-trying after a failed pass.
const RETRY_DELAY: Duration = Duration::from_secs(60);

/// When the next tick should run: immediately if no tick has completed
/// today (UTC), otherwise at the next UTC midnight.
pub(crate) fn next_wake(last_tick: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    let last = Utc
        .timestamp_opt(last_tick, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    if last.date_naive() < now.date_naive() {
        return now;
    }
    match now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        Some(midnight) => Utc.from_utc_datetime(&midnight),
        None => now, // end of representable time; not a practical concern
    }
}

pub(crate) fn spawn(game: Arc<Game>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("market scheduler started");
        loop {
            let now = Utc::now();
            let last = match game.last_tick() {
                Ok(last) => last,
                Err(e) => {
                    error!(error = %e, "could not read last tick");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            let wake = next_wake(last, now);
            let wait = (wake - now).to_std().unwrap_or_default();
            if !wait.is_zero() {
                info!(seconds = wait.as_secs(), "sleeping until next market day");
                tokio::time::sleep(wait).await;
            }

            let worker = Arc::clone(&game);
            match tokio::task::spawn_blocking(move || tick::run(&worker, Utc::now())).await {
                Ok(Ok(_ran)) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "market tick failed");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(error = %e, "market tick panicked");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_wakes_immediately_when_day_is_unticked() {
        let now = at(2026, 3, 2, 9);
        assert_eq!(next_wake(at(2026, 3, 1, 23).timestamp(), now), now);
    }

    #[test]
    fn test_wakes_immediately_on_fresh_store_stamp() {
        let now = at(2026, 3, 2, 9);
        assert_eq!(next_wake(0, now), now);
    }

    #[test]
    fn test_sleeps_to_midnight_when_day_is_ticked() {
        let now = at(2026, 3, 2, 9);
        let wake = next_wake(at(2026, 3, 2, 1).timestamp(), now);
        assert_eq!(wake, at(2026, 3, 3, 0));
    }

    #[test]
    fn test_month_end_rolls_into_next_month() {
        let now = at(2026, 3, 31, 12);
        let wake = next_wake(now.timestamp(), now);
        assert_eq!(wake, at(2026, 4, 1, 0));
    }
}
