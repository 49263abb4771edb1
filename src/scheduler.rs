use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, Timelike};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::db;

/// Sessions this many calendar days out are treated as imminent and bulk
/// promoted, regardless of exact start time. Deliberately coarser than the
/// per-row resolver; display always recomputes from the raw time fields.
pub const PROMOTION_HORIZON_DAYS: i64 = 3;

const TICK: Duration = Duration::from_secs(60);
const STOP_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionOutcome {
    pub promoted: usize,
    pub demoted: usize,
}

/// Near-term status promotion. Runs every minute.
///
/// Rows dated in `[today, today + horizon)` become `happening`; rows at or
/// beyond the horizon fall back to `has_not_happened`. Both predicates
/// exclude rows already in the target state (and terminal `end`/`cancelled`
/// rows), so a rerun with unchanged data writes nothing.
pub fn run_promotion_job(conn: &Connection, today: NaiveDate) -> anyhow::Result<PromotionOutcome> {
    let horizon = today + ChronoDuration::days(PROMOTION_HORIZON_DAYS);
    let today_s = today.format("%Y-%m-%d").to_string();
    let horizon_s = horizon.format("%Y-%m-%d").to_string();

    let promoted = conn.execute(
        "UPDATE class_sessions
         SET status = 'happening'
         WHERE session_date >= ? AND session_date < ?
           AND status IN ('scheduled', 'has_not_happened')",
        (&today_s, &horizon_s),
    )?;
    let demoted = conn.execute(
        "UPDATE class_sessions
         SET status = 'has_not_happened'
         WHERE session_date >= ?
           AND status NOT IN ('end', 'cancelled', 'has_not_happened')",
        [&horizon_s],
    )?;

    Ok(PromotionOutcome { promoted, demoted })
}

/// End-of-day archival. Runs once daily at 23:59 local.
///
/// Any session whose calendar date has fully passed and never reached a
/// terminal state is archived to `end`. Cancelled rows are left alone.
pub fn run_archival_job(conn: &Connection, today: NaiveDate) -> anyhow::Result<usize> {
    let today_s = today.format("%Y-%m-%d").to_string();
    let archived = conn.execute(
        "UPDATE class_sessions
         SET status = 'end'
         WHERE session_date < ?
           AND status IN ('happening', 'has_not_happened')",
        [&today_s],
    )?;
    Ok(archived)
}

/// Handle to a running scheduler thread. Dropping it without calling
/// `stop` leaves the thread running until the process exits.
pub struct Scheduler {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns the background thread for a workspace. The thread opens its
    /// own connection to the workspace database; errors per tick are logged
    /// and swallowed, the next tick is the retry.
    pub fn spawn(workspace: &Path) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let path: PathBuf = workspace.to_path_buf();
        let join = thread::spawn(move || run_loop(&path, &flag));
        Self {
            stop,
            join: Some(join),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_loop(workspace: &Path, stop: &AtomicBool) {
    log::info!("scheduler started for {}", workspace.display());
    let mut last_archival: Option<NaiveDate> = None;
    let mut prev_tick: NaiveDate = Local::now().date_naive();

    loop {
        if stop.load(Ordering::Relaxed) {
            log::info!("scheduler stopped for {}", workspace.display());
            return;
        }

        let now = Local::now().naive_local();
        let today = now.date();

        match db::open_db(workspace) {
            Ok(conn) => {
                if let Err(e) = run_promotion_job(&conn, today) {
                    log::warn!("promotion job failed, retrying next tick: {e:#}");
                }
                if is_archival_due(now, prev_tick, last_archival) {
                    match run_archival_job(&conn, today) {
                        Ok(archived) => {
                            last_archival = Some(today);
                            log::info!("archived {archived} past sessions");
                        }
                        Err(e) => {
                            log::warn!("archival job failed, retrying next tick: {e:#}");
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("scheduler could not open workspace db: {e:#}");
            }
        }
        prev_tick = today;

        // Sleep in short slices so stop requests are honored promptly.
        let mut slept = Duration::ZERO;
        while slept < TICK {
            if stop.load(Ordering::Relaxed) {
                log::info!("scheduler stopped for {}", workspace.display());
                return;
            }
            thread::sleep(STOP_POLL);
            slept += STOP_POLL;
        }
    }
}

fn is_archival_due(now: NaiveDateTime, prev_tick: NaiveDate, last: Option<NaiveDate>) -> bool {
    let today = now.date();
    if last == Some(today) {
        return false;
    }
    // Scheduled for 23:59; a tick landing anywhere in the final minute runs it.
    if now.time().hour() == 23 && now.time().minute() >= 59 {
        return true;
    }
    // Ticks are a minute apart plus job time, so one can straddle midnight
    // and skip the 23:59 window entirely. If the date rolled over and the
    // previous day never ran, catch up on this tick: with the new today the
    // job archives at least the rows the missed run would have.
    prev_tick < today && last != Some(prev_tick)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    fn at(date: NaiveDate, h: u32, m: u32, s: u32) -> NaiveDateTime {
        date.and_hms_opt(h, m, s).expect("valid datetime")
    }

    #[test]
    fn archival_fires_only_in_final_minute_and_once_per_day() {
        let today = d(2025, 1, 10);
        assert!(!is_archival_due(at(today, 23, 58, 0), today, None));
        assert!(is_archival_due(at(today, 23, 59, 0), today, None));
        assert!(is_archival_due(at(today, 23, 59, 30), today, Some(d(2025, 1, 9))));
        assert!(!is_archival_due(at(today, 23, 59, 0), today, Some(today)));
    }

    #[test]
    fn missed_final_minute_catches_up_after_midnight() {
        let yesterday = d(2025, 1, 10);
        let today = d(2025, 1, 11);
        // A tick straddled midnight: the previous evaluation was before
        // 23:59 and the next lands just after 00:00.
        assert!(is_archival_due(at(today, 0, 0, 0), yesterday, None));
        assert!(is_archival_due(
            at(today, 0, 0, 0),
            yesterday,
            Some(d(2025, 1, 9))
        ));
    }

    #[test]
    fn successful_run_is_not_repeated_at_midnight() {
        let yesterday = d(2025, 1, 10);
        let today = d(2025, 1, 11);
        // Yesterday's 23:59 run happened; the rollover tick stays quiet.
        assert!(!is_archival_due(
            at(today, 0, 0, 0),
            yesterday,
            Some(yesterday)
        ));
        // And within a single day a pre-23:59 tick never fires.
        assert!(!is_archival_due(at(today, 12, 0, 0), today, Some(yesterday)));
    }
}
