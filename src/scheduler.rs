//! Daily reset scheduling
//!
//! Each daily instance runs one scheduler task: an explicit deferred action
//! that sleeps until the next configured wall-clock boundary, emits a single
//! `ResetDue` event, then re-arms for the following boundary. Sleeping happens
//! in bounded slices with the wall clock rechecked after every slice, so a
//! process that was suspended across the boundary fires one catch-up reset
//! immediately on resume instead of skipping it. The deadline is recomputed
//! from the wall clock after every fire, so a missed boundary can never fire
//! twice.

use crate::coordinator::Event;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

/// Longest single sleep before the wall clock is rechecked
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(60);

/// When a derived sensor starts a new period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "at")]
pub enum ResetPolicy {
    /// Reset once per day at this local time-of-day (plus manual triggers)
    DailyAt(NaiveTime),
    /// Reset only on an explicit external trigger
    ManualOnly,
}

impl ResetPolicy {
    pub fn daily_time(&self) -> Option<NaiveTime> {
        match self {
            ResetPolicy::DailyAt(t) => Some(*t),
            ResetPolicy::ManualOnly => None,
        }
    }
}

/// Next local instant >= `after` whose time-of-day is `at`.
///
/// If `at` has already passed today (or lands exactly on `after`), the
/// boundary is tomorrow. A time-of-day swallowed by a spring-forward gap
/// resolves to the first valid instant after the gap; a time-of-day repeated
/// by a fall-back resolves to the earlier occurrence.
pub fn next_boundary(after: DateTime<Local>, at: NaiveTime) -> DateTime<Local> {
    let today = after.date_naive().and_time(at);
    let naive = if today > after.naive_local() {
        today
    } else {
        (after.date_naive() + ChronoDuration::days(1)).and_time(at)
    };
    resolve_local(naive)
}

fn resolve_local(naive: NaiveDateTime) -> DateTime<Local> {
    let mut candidate = naive;
    for _ in 0..6 {
        match Local.from_local_datetime(&candidate) {
            chrono::LocalResult::Single(dt) => return dt,
            chrono::LocalResult::Ambiguous(earliest, _) => return earliest,
            chrono::LocalResult::None => {
                // inside a DST gap, walk forward to the first valid instant
                candidate += ChronoDuration::minutes(30);
            }
        }
    }
    Local.from_utc_datetime(&naive)
}

/// Scheduler task for one `DailyAt` instance.
///
/// Runs until the shutdown signal flips or the event channel closes. Once
/// shutdown is observed no further `ResetDue` is sent.
pub async fn reset_scheduler_task(
    name: String,
    at: NaiveTime,
    tx: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let deadline = next_boundary(Local::now(), at);
        log::debug!("[{}] next reset armed for {}", name, deadline);

        loop {
            let now = Local::now();
            if now >= deadline {
                break;
            }
            let remaining = (deadline - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(MAX_SLEEP_SLICE);
            tokio::select! {
                _ = sleep(remaining) => {}
                _ = shutdown.changed() => {
                    log::debug!("[{}] reset scheduler cancelled", name);
                    return;
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }

        let fired_at = chrono::Utc::now().timestamp();
        if tx.send(Event::ResetDue { at: fired_at }).await.is_err() {
            log::debug!("[{}] event channel closed, stopping scheduler", name);
            break;
        }
        log::info!("[{}] daily reset fired ({})", name, deadline);
    }
}
