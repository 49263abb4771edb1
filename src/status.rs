use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Purely time-derived position of a session's window relative to a clock
/// reading. Never persisted as-is; project through `to_persisted` or
/// `to_display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeStatus {
    Scheduled,
    Happening,
    Completed,
}

/// Vocabulary of the `class_sessions.status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistedStatus {
    Scheduled,
    HasNotHappened,
    Happening,
    End,
    Cancelled,
}

/// Vocabulary the UI sees. Overlaps with `PersistedStatus` but is not the
/// same enum: `completed`/`incomplete` only exist at read time, `end` and
/// `has_not_happened` only in the column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    Scheduled,
    Happening,
    Completed,
    Incomplete,
    Cancelled,
}

/// Out-of-band signal that outranks time-derived state: an admin cancelled
/// the session, or its window passed with attendance never taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideStatus {
    Cancelled,
    NoAttendance,
}

impl PersistedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PersistedStatus::Scheduled => "scheduled",
            PersistedStatus::HasNotHappened => "has_not_happened",
            PersistedStatus::Happening => "happening",
            PersistedStatus::End => "end",
            PersistedStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(PersistedStatus::Scheduled),
            "has_not_happened" => Some(PersistedStatus::HasNotHappened),
            "happening" => Some(PersistedStatus::Happening),
            "end" => Some(PersistedStatus::End),
            "cancelled" => Some(PersistedStatus::Cancelled),
            _ => None,
        }
    }
}

impl DisplayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DisplayStatus::Scheduled => "scheduled",
            DisplayStatus::Happening => "happening",
            DisplayStatus::Completed => "completed",
            DisplayStatus::Incomplete => "incomplete",
            DisplayStatus::Cancelled => "cancelled",
        }
    }
}

impl TimeStatus {
    pub fn to_display(self) -> DisplayStatus {
        match self {
            TimeStatus::Scheduled => DisplayStatus::Scheduled,
            TimeStatus::Happening => DisplayStatus::Happening,
            TimeStatus::Completed => DisplayStatus::Completed,
        }
    }

    pub fn to_persisted(self) -> PersistedStatus {
        match self {
            TimeStatus::Scheduled => PersistedStatus::Scheduled,
            TimeStatus::Happening => PersistedStatus::Happening,
            TimeStatus::Completed => PersistedStatus::End,
        }
    }
}

/// `HH:MM` on the given day, seconds zeroed. None when either part is not
/// numeric or out of range.
fn at_time(date: NaiveDate, hhmm: &str) -> Option<NaiveDateTime> {
    let (h, m) = hhmm.trim().split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    Some(date.and_time(time))
}

/// Where `now` falls relative to the session's window on `session_date`.
/// Window start is inclusive and so is the end: at exactly `end_time` the
/// session is still Happening.
///
/// Malformed time strings are the caller's problem; each comparison simply
/// resolves false when its operand did not parse, so a bad field degrades
/// toward Completed rather than erroring.
pub fn calculate_time_status(
    session_date: NaiveDate,
    start_time: &str,
    end_time: &str,
    now: NaiveDateTime,
) -> TimeStatus {
    let start = at_time(session_date, start_time);
    let end = at_time(session_date, end_time);
    match (start, end) {
        (Some(s), _) if now < s => TimeStatus::Scheduled,
        (Some(s), Some(e)) if s <= now && now <= e => TimeStatus::Happening,
        _ => TimeStatus::Completed,
    }
}

/// Read-time projection of a session's lifecycle state. No side effects;
/// safe to call per row on every query.
///
/// Precedence: an override of Cancelled wins outright, a persisted Cancelled
/// is sticky, and NoAttendance only matters once the window has passed.
pub fn resolve_display_status(
    persisted: PersistedStatus,
    override_status: Option<OverrideStatus>,
    session_date: NaiveDate,
    start_time: &str,
    end_time: &str,
    now: NaiveDateTime,
) -> DisplayStatus {
    if override_status == Some(OverrideStatus::Cancelled) {
        return DisplayStatus::Cancelled;
    }
    if persisted == PersistedStatus::Cancelled {
        return DisplayStatus::Cancelled;
    }
    let calculated = calculate_time_status(session_date, start_time, end_time, now);
    if calculated == TimeStatus::Completed
        && override_status == Some(OverrideStatus::NoAttendance)
    {
        return DisplayStatus::Incomplete;
    }
    calculated.to_display()
}

/// Whether the scheduler would have to rewrite this row to catch the column
/// up with the clock. Cancelled rows are never stale; `scheduled` and
/// `has_not_happened` both count as correct persistence of an upcoming
/// session.
pub fn needs_persisted_update(persisted: PersistedStatus, time_status: TimeStatus) -> bool {
    if persisted == PersistedStatus::Cancelled {
        return false;
    }
    match (time_status, persisted) {
        (TimeStatus::Scheduled, PersistedStatus::Scheduled)
        | (TimeStatus::Scheduled, PersistedStatus::HasNotHappened)
        | (TimeStatus::Happening, PersistedStatus::Happening)
        | (TimeStatus::Completed, PersistedStatus::End) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        date(y, m, d)
            .and_hms_opt(h, min, s)
            .expect("valid datetime")
    }

    #[test]
    fn window_boundaries_are_inclusive() {
        let day = date(2025, 3, 14);
        let status = |now| calculate_time_status(day, "14:00", "16:00", now);

        assert_eq!(status(at(2025, 3, 14, 13, 59, 59)), TimeStatus::Scheduled);
        assert_eq!(status(at(2025, 3, 14, 14, 0, 0)), TimeStatus::Happening);
        assert_eq!(status(at(2025, 3, 14, 16, 0, 0)), TimeStatus::Happening);
        assert_eq!(status(at(2025, 3, 14, 16, 0, 1)), TimeStatus::Completed);
    }

    #[test]
    fn other_days_resolve_by_date() {
        let day = date(2025, 3, 14);
        assert_eq!(
            calculate_time_status(day, "14:00", "16:00", at(2025, 3, 13, 18, 0, 0)),
            TimeStatus::Scheduled
        );
        assert_eq!(
            calculate_time_status(day, "14:00", "16:00", at(2025, 3, 15, 9, 0, 0)),
            TimeStatus::Completed
        );
    }

    #[test]
    fn malformed_times_degrade_to_completed() {
        let day = date(2025, 3, 14);
        let noon = at(2025, 3, 14, 12, 0, 0);
        assert_eq!(
            calculate_time_status(day, "xx:yy", "16:00", noon),
            TimeStatus::Completed
        );
        assert_eq!(
            calculate_time_status(day, "14:00", "", noon),
            TimeStatus::Completed
        );
        // A valid future start still wins even when the end is garbage.
        assert_eq!(
            calculate_time_status(day, "14:00", "junk", at(2025, 3, 14, 10, 0, 0)),
            TimeStatus::Scheduled
        );
    }

    #[test]
    fn cancelled_is_sticky_for_any_date() {
        let far_future = date(2099, 1, 1);
        let far_past = date(2000, 1, 1);
        let now = at(2025, 3, 14, 12, 0, 0);
        for day in [far_future, far_past] {
            assert_eq!(
                resolve_display_status(
                    PersistedStatus::Cancelled,
                    None,
                    day,
                    "14:00",
                    "16:00",
                    now
                ),
                DisplayStatus::Cancelled
            );
        }
    }

    #[test]
    fn cancel_override_beats_future_scheduled() {
        let status = resolve_display_status(
            PersistedStatus::Scheduled,
            Some(OverrideStatus::Cancelled),
            date(2099, 1, 1),
            "14:00",
            "16:00",
            at(2025, 3, 14, 12, 0, 0),
        );
        assert_eq!(status, DisplayStatus::Cancelled);
    }

    #[test]
    fn ended_without_attendance_is_incomplete() {
        let day = date(2025, 3, 14);
        let after = at(2025, 3, 14, 17, 0, 0);
        assert_eq!(
            resolve_display_status(
                PersistedStatus::End,
                Some(OverrideStatus::NoAttendance),
                day,
                "14:00",
                "16:00",
                after
            ),
            DisplayStatus::Incomplete
        );
        assert_eq!(
            resolve_display_status(PersistedStatus::End, None, day, "14:00", "16:00", after),
            DisplayStatus::Completed
        );
    }

    #[test]
    fn no_attendance_is_ignored_before_the_window_ends() {
        let day = date(2025, 3, 14);
        assert_eq!(
            resolve_display_status(
                PersistedStatus::Happening,
                Some(OverrideStatus::NoAttendance),
                day,
                "14:00",
                "16:00",
                at(2025, 3, 14, 15, 0, 0)
            ),
            DisplayStatus::Happening
        );
    }

    #[test]
    fn staleness_accepts_both_upcoming_spellings() {
        assert!(!needs_persisted_update(
            PersistedStatus::Scheduled,
            TimeStatus::Scheduled
        ));
        assert!(!needs_persisted_update(
            PersistedStatus::HasNotHappened,
            TimeStatus::Scheduled
        ));
        assert!(needs_persisted_update(
            PersistedStatus::HasNotHappened,
            TimeStatus::Happening
        ));
        assert!(needs_persisted_update(
            PersistedStatus::Happening,
            TimeStatus::Completed
        ));
        assert!(!needs_persisted_update(
            PersistedStatus::Cancelled,
            TimeStatus::Completed
        ));
    }

    #[test]
    fn status_strings_roundtrip() {
        for s in [
            PersistedStatus::Scheduled,
            PersistedStatus::HasNotHappened,
            PersistedStatus::Happening,
            PersistedStatus::End,
            PersistedStatus::Cancelled,
        ] {
            assert_eq!(PersistedStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(PersistedStatus::parse("completed"), None);
    }
}
