use std::future::Future;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Timelike, Utc, Weekday};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{now_unix_ms, ChartInterval};

// Regular US cash session expressed in UTC minutes-into-day.
const SESSION_OPEN_MINUTES: u32 = 13 * 60 + 30;
const SESSION_CLOSE_MINUTES: u32 = 20 * 60;

const OFF_HOURS_POLL: Duration = Duration::from_secs(5 * 60);
const COARSE_POLL: Duration = Duration::from_secs(10 * 60);
const PAUSED_RECHECK: Duration = Duration::from_secs(15 * 60);

pub fn is_weekend(now_ms: i64) -> bool {
    match Utc.timestamp_millis_opt(now_ms).single() {
        Some(now) => matches!(now.weekday(), Weekday::Sat | Weekday::Sun),
        None => false,
    }
}

pub fn is_active_session(now_ms: i64) -> bool {
    let Some(now) = Utc.timestamp_millis_opt(now_ms).single() else {
        return false;
    };
    if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let minutes = now.hour() * 60 + now.minute();
    (SESSION_OPEN_MINUTES..SESSION_CLOSE_MINUTES).contains(&minutes)
}

fn active_session_poll(interval: ChartInterval) -> Duration {
    match interval {
        ChartInterval::M1 => Duration::from_secs(5),
        ChartInterval::M5 => Duration::from_secs(15),
        ChartInterval::M15 => Duration::from_secs(30),
        ChartInterval::H1 => Duration::from_secs(60),
        ChartInterval::H4 => Duration::from_secs(120),
        ChartInterval::D1 | ChartInterval::W1 => COARSE_POLL,
    }
}

/// Poll delay for the next refresh, derived from the chart interval and the
/// clock. `None` pauses polling entirely (intraday charts on weekends).
pub fn poll_interval(interval: ChartInterval, now_ms: i64) -> Option<Duration> {
    if !interval.is_intraday() {
        return Some(COARSE_POLL);
    }
    if is_weekend(now_ms) {
        return None;
    }
    if is_active_session(now_ms) {
        Some(active_session_poll(interval))
    } else {
        Some(OFF_HOURS_POLL)
    }
}

pub struct PollHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl PollHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

/// Spawns the polling loop for one selection. The delay is recomputed before
/// every nap, and the callback runs to completion before the next nap starts,
/// so a slow refresh skips ticks instead of queueing them.
pub fn start_polling<F, Fut>(
    interval: ChartInterval,
    parent: &CancellationToken,
    mut tick: F,
) -> PollHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let cancel = parent.child_token();
    let loop_cancel = cancel.clone();

    let join = tokio::spawn(async move {
        loop {
            let delay = match poll_interval(interval, now_unix_ms()) {
                Some(delay) => delay,
                None => {
                    debug!(
                        interval = interval.as_str(),
                        "polling paused outside trading days"
                    );
                    PAUSED_RECHECK
                }
            };
            tokio::select! {
                _ = loop_cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if poll_interval(interval, now_unix_ms()).is_none() {
                continue;
            }
            tick().await;
        }
        debug!(interval = interval.as_str(), "polling loop stopped");
    });

    PollHandle { cancel, join }
}
