//! Daemon mode: re-run a job every day at a fixed local time.

use anyhow::{Context, anyhow};
use chrono::{DateTime, NaiveTime, TimeZone};
use tokio_util::sync::CancellationToken;

/// Time of day, `HH:MM`, at which the daemon starts a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Daily {
    at: NaiveTime,
}

impl Default for Daily {
    /// Midnight.
    fn default() -> Self {
        Self {
            at: NaiveTime::default(),
        }
    }
}

impl std::str::FromStr for Daily {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let at = NaiveTime::parse_from_str(value.trim(), "%H:%M")
            .with_context(|| format!("invalid daily time {value:?}, expected HH:MM"))?;
        Ok(Self { at })
    }
}

impl std::fmt::Display for Daily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.at.format("%H:%M"))
    }
}

impl Daily {
    /// First slot strictly after `now`.
    ///
    /// A slot that falls into a DST gap moves to the next day.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> anyhow::Result<DateTime<Tz>> {
        let timezone = now.timezone();
        let mut date = now.date_naive();
        // two days always contain a valid slot, three covers a gap on the second one
        for _ in 0..3 {
            if let Some(slot) = timezone
                .from_local_datetime(&date.and_time(self.at))
                .earliest()
                && slot > *now
            {
                return Ok(slot);
            }
            date = date
                .succ_opt()
                .ok_or_else(|| anyhow!("no date after {date}"))?;
        }
        Err(anyhow!("no valid {} slot after {:?}", self, now.naive_local()))
    }

    /// Time left until the next slot.
    pub fn delay_from<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> anyhow::Result<std::time::Duration> {
        let next = self.next_after(now)?;
        (next - now.clone())
            .to_std()
            .context("next run is in the past")
    }
}

/// Runs `job` now (unless `wait_first`) and then at every `schedule` slot until `cancel` fires.
///
/// A failed run is logged and the daemon waits for the next slot. Returns the summaries of all
/// successful runs added together.
pub async fn run_daily<F, Fut, Summary>(
    schedule: Daily,
    wait_first: bool,
    cancel: CancellationToken,
    mut job: F,
) -> anyhow::Result<Summary>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
    Summary: Default + std::ops::Add<Output = Summary>,
{
    let mut total = Summary::default();
    let mut wait = wait_first;
    let mut runs = 0usize;
    loop {
        if wait {
            let delay = schedule.delay_from(&chrono::Local::now())?;
            tracing::info!(
                "next run at {} (in {})",
                schedule,
                humanize(delay)
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        wait = true;
        if cancel.is_cancelled() {
            break;
        }
        runs += 1;
        tracing::info!("daemon run #{} started", runs);
        match job().await {
            Ok(summary) => {
                tracing::info!("daemon run #{} finished", runs);
                total = total + summary;
            }
            Err(error) => tracing::error!("daemon run #{} failed: {:#}", runs, &error),
        }
    }
    tracing::info!("daemon stopped after {} runs", runs);
    Ok(total)
}

fn humanize(delay: std::time::Duration) -> String {
    let minutes = delay.as_secs() / 60;
    format!("{}h{:02}m", minutes / 60, minutes % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn utc(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parse_and_display() {
        let daily: Daily = "07:05".parse().unwrap();
        assert_eq!(daily.to_string(), "07:05");
        assert_eq!(Daily::default().to_string(), "00:00");
        assert!("25:00".parse::<Daily>().is_err());
        assert!("noon".parse::<Daily>().is_err());
    }

    #[test]
    fn next_slot_later_today() {
        let daily: Daily = "12:30".parse().unwrap();
        assert_eq!(
            daily.next_after(&utc("2026-10-17T10:00:00Z")).unwrap(),
            utc("2026-10-17T12:30:00Z")
        );
    }

    #[test]
    fn next_slot_tomorrow() {
        let daily = Daily::default();
        assert_eq!(
            daily.next_after(&utc("2026-10-17T10:00:00Z")).unwrap(),
            utc("2026-10-18T00:00:00Z")
        );
    }

    #[test]
    fn slot_equal_to_now_moves_a_day() {
        let daily: Daily = "10:00".parse().unwrap();
        let now = utc("2026-12-31T10:00:00Z");
        assert_eq!(daily.next_after(&now).unwrap(), utc("2027-01-01T10:00:00Z"));
        assert_eq!(
            daily.delay_from(&now).unwrap(),
            std::time::Duration::from_secs(24 * 3600)
        );
    }

    #[test]
    fn humanized_delays() {
        assert_eq!(humanize(std::time::Duration::from_secs(3 * 3600 + 7 * 60 + 5)), "3h07m");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_runs_do_not_stop_the_daemon() {
        let cancel = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let total = run_daily(Daily::default(), false, cancel.clone(), || {
            let runs = runs.clone();
            let cancel = cancel.clone();
            async move {
                match runs.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(anyhow!("first run fails")),
                    1 => Ok(2usize),
                    _ => {
                        cancel.cancel();
                        Ok(5usize)
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(total, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_waiting() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runs = AtomicUsize::new(0);
        let total = run_daily(Daily::default(), true, cancel, || {
            runs.fetch_add(1, Ordering::SeqCst);
            async { Ok(1usize) }
        })
        .await
        .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(total, 0);
    }
}
