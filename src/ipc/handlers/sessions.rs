use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::status::{self, OverrideStatus, PersistedStatus};
use chrono::{Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details: None,
    }
}

fn db_err(code: &'static str, e: impl std::fmt::Display) -> HandlerErr {
    HandlerErr {
        code,
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn parse_session_date(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| bad_params("sessionDate must be YYYY-MM-DD"))
}

fn validate_hhmm(raw: &str, key: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    let valid = matches!(t.split_once(':'), Some((h, m))
        if h.parse::<u32>().map(|v| v < 24).unwrap_or(false)
            && m.parse::<u32>().map(|v| v < 60).unwrap_or(false));
    if !valid {
        return Err(bad_params(format!("{} must be HH:MM", key)));
    }
    Ok(t.to_string())
}

#[derive(Debug, Clone)]
struct SessionRow {
    id: String,
    class_id: String,
    session_date: String,
    start_time: String,
    end_time: String,
    status: String,
    note: Option<String>,
}

fn load_session(conn: &Connection, session_id: &str) -> Result<SessionRow, HandlerErr> {
    conn.query_row(
        "SELECT id, class_id, session_date, start_time, end_time, status, note
         FROM class_sessions
         WHERE id = ?",
        [session_id],
        |r| {
            Ok(SessionRow {
                id: r.get(0)?,
                class_id: r.get(1)?,
                session_date: r.get(2)?,
                start_time: r.get(3)?,
                end_time: r.get(4)?,
                status: r.get(5)?,
                note: r.get(6)?,
            })
        },
    )
    .optional()
    .map_err(|e| db_err("db_query_failed", e))?
    .ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "session not found".to_string(),
        details: None,
    })
}

struct ResolvedStatus {
    display: &'static str,
    /// Whether the persisted column lags the clock and the next scheduler
    /// pass would rewrite it.
    stale: bool,
}

/// The read-time projection: persisted status plus the out-of-band override,
/// resolved against the wall clock. A session with no attendance on file
/// carries the no-attendance override (only relevant once its window has
/// passed); admin cancellation lives directly in the status column.
fn resolve_row(row: &SessionRow, attended: bool) -> ResolvedStatus {
    let override_status = if attended {
        None
    } else {
        Some(OverrideStatus::NoAttendance)
    };

    let persisted =
        PersistedStatus::parse(&row.status).unwrap_or(PersistedStatus::HasNotHappened);
    // Lenient on purpose: an unparseable date can only have happened in the
    // past, which the resolver's malformed-input fallback already covers.
    let session_date = NaiveDate::parse_from_str(&row.session_date, "%Y-%m-%d")
        .unwrap_or(NaiveDate::MIN);
    let now = Local::now().naive_local();

    let display = status::resolve_display_status(
        persisted,
        override_status,
        session_date,
        &row.start_time,
        &row.end_time,
        now,
    )
    .as_str();
    let time_status =
        status::calculate_time_status(session_date, &row.start_time, &row.end_time, now);
    ResolvedStatus {
        display,
        stale: status::needs_persisted_update(persisted, time_status),
    }
}

fn sessions_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let input = params
        .get("input")
        .and_then(|v| v.as_object())
        .ok_or_else(|| bad_params("missing input"))?;
    let input = serde_json::Value::Object(input.clone());

    let session_date = parse_session_date(&get_required_str(&input, "sessionDate")?)?;
    let start_time = validate_hhmm(&get_required_str(&input, "startTime")?, "startTime")?;
    let end_time = validate_hhmm(&get_required_str(&input, "endTime")?, "endTime")?;
    let note = input
        .get("note")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let class_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    if class_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let session_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO class_sessions(id, class_id, session_date, start_time, end_time, status, note)
         VALUES(?, ?, ?, ?, ?, 'has_not_happened', ?)",
        (
            &session_id,
            &class_id,
            session_date.format("%Y-%m-%d").to_string(),
            &start_time,
            &end_time,
            &note,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "class_sessions" })),
    })?;

    Ok(json!({ "sessionId": session_id }))
}

fn sessions_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let from = params
        .get("from")
        .and_then(|v| v.as_str())
        .map(parse_session_date)
        .transpose()?;
    let to = params
        .get("to")
        .and_then(|v| v.as_str())
        .map(parse_session_date)
        .transpose()?;

    let mut sql = String::from(
        "SELECT id, class_id, session_date, start_time, end_time, status, note,
                EXISTS(SELECT 1 FROM session_attendance sa
                       WHERE sa.session_id = class_sessions.id) AS attended
         FROM class_sessions
         WHERE class_id = ?",
    );
    let mut args: Vec<String> = vec![class_id];
    if let Some(from) = from {
        sql.push_str(" AND session_date >= ?");
        args.push(from.format("%Y-%m-%d").to_string());
    }
    if let Some(to) = to {
        sql.push_str(" AND session_date <= ?");
        args.push(to.format("%Y-%m-%d").to_string());
    }
    sql.push_str(" ORDER BY session_date, start_time");

    let mut stmt = conn.prepare(&sql).map_err(|e| db_err("db_query_failed", e))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            let row = SessionRow {
                id: r.get(0)?,
                class_id: r.get(1)?,
                session_date: r.get(2)?,
                start_time: r.get(3)?,
                end_time: r.get(4)?,
                status: r.get(5)?,
                note: r.get(6)?,
            };
            let attended: bool = r.get(7)?;
            Ok((row, attended))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    let mut sessions = Vec::with_capacity(rows.len());
    for (row, attended) in &rows {
        let resolved = resolve_row(row, *attended);
        sessions.push(json!({
            "id": row.id,
            "classId": row.class_id,
            "sessionDate": row.session_date,
            "startTime": row.start_time,
            "endTime": row.end_time,
            "status": row.status,
            "displayStatus": resolved.display,
            "stale": resolved.stale,
            "note": row.note
        }));
    }

    Ok(json!({ "sessions": sessions }))
}

fn sessions_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| bad_params("missing patch"))?;

    let existing = load_session(conn, &session_id)?;

    let session_date = match patch.get("sessionDate").and_then(|v| v.as_str()) {
        Some(raw) => parse_session_date(raw)?.format("%Y-%m-%d").to_string(),
        None => existing.session_date,
    };
    let start_time = match patch.get("startTime").and_then(|v| v.as_str()) {
        Some(raw) => validate_hhmm(raw, "startTime")?,
        None => existing.start_time,
    };
    let end_time = match patch.get("endTime").and_then(|v| v.as_str()) {
        Some(raw) => validate_hhmm(raw, "endTime")?,
        None => existing.end_time,
    };
    let note = match patch.get("note") {
        Some(v) if v.is_null() => None,
        Some(v) => Some(
            v.as_str()
                .ok_or_else(|| bad_params("note must be string or null"))?
                .to_string(),
        ),
        None => existing.note,
    };

    conn.execute(
        "UPDATE class_sessions
         SET session_date = ?, start_time = ?, end_time = ?, note = ?
         WHERE id = ?",
        (&session_date, &start_time, &end_time, &note, &session_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "class_sessions" })),
    })?;

    Ok(json!({ "ok": true }))
}

fn sessions_cancel(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let _ = load_session(conn, &session_id)?;

    // Terminal: once cancelled, neither the scheduler nor the resolver will
    // move this row again.
    conn.execute(
        "UPDATE class_sessions SET status = 'cancelled' WHERE id = ?",
        [&session_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "class_sessions" })),
    })?;

    Ok(json!({ "ok": true }))
}

fn sessions_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let _ = load_session(conn, &session_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    tx.execute(
        "DELETE FROM session_attendance WHERE session_id = ?",
        [&session_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_delete_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "session_attendance" })),
    })?;
    tx.execute("DELETE FROM class_sessions WHERE id = ?", [&session_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "class_sessions" })),
        })?;
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    Ok(json!({ "ok": true }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.create" => Some(with_conn(state, req, sessions_create)),
        "sessions.list" => Some(with_conn(state, req, sessions_list)),
        "sessions.update" => Some(with_conn(state, req, sessions_update)),
        "sessions.cancel" => Some(with_conn(state, req, sessions_cancel)),
        "sessions.delete" => Some(with_conn(state, req, sessions_delete)),
        _ => None,
    }
}
