use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

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

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn session_class(conn: &Connection, session_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT class_id FROM class_sessions WHERE id = ?",
        [session_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?
    .ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "session not found".to_string(),
        details: None,
    })
}

fn attendance_session_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let class_id = session_class(conn, &session_id)?;

    let mut codes: HashMap<String, String> = HashMap::new();
    let mut stmt = conn
        .prepare("SELECT student_id, code FROM session_attendance WHERE session_id = ?")
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&session_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    for (student_id, code) in rows {
        codes.insert(student_id, code);
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, active, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let roster = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let active: i64 = r.get(3)?;
            let sort_order: i64 = r.get(4)?;
            Ok(json!({
                "studentId": id.clone(),
                "displayName": format!("{}, {}", last, first),
                "active": active != 0,
                "sortOrder": sort_order,
                "code": codes.get(&id)
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({
        "sessionId": session_id,
        "classId": class_id,
        "rows": roster,
        "recorded": !codes.is_empty()
    }))
}

fn attendance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let class_id = session_class(conn, &session_id)?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing entries".to_string(),
            details: None,
        });
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let mut recorded = 0usize;
    for entry in entries {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            continue;
        };
        let code = entry
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("present")
            .trim()
            .to_string();
        if code.is_empty() {
            continue;
        }

        // Only roster members of the session's class can be stamped.
        let member = tx
            .query_row(
                "SELECT 1 FROM students WHERE class_id = ? AND id = ?",
                (&class_id, &student_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?
            .is_some();
        if !member {
            continue;
        }

        tx.execute(
            "INSERT INTO session_attendance(session_id, student_id, code)
             VALUES(?, ?, ?)
             ON CONFLICT(session_id, student_id) DO UPDATE SET
               code = excluded.code",
            (&session_id, &student_id, &code),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "session_attendance" })),
        })?;
        recorded += 1;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "recorded": recorded }))
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
        "attendance.sessionOpen" => Some(with_conn(state, req, attendance_session_open)),
        "attendance.record" => Some(with_conn(state, req, attendance_record)),
        _ => None,
    }
}
