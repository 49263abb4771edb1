use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::scheduler;
use chrono::{Local, NaiveDate};
use serde_json::json;

/// The bulk jobs normally run on the background thread's clock; these
/// methods run them on demand, with an optional explicit `today` so admin
/// tooling can replay or verify a day deterministically.
fn parse_today(params: &serde_json::Value) -> Result<NaiveDate, &'static str> {
    match params.get("today").and_then(|v| v.as_str()) {
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map_err(|_| "today must be YYYY-MM-DD"),
        None => Ok(Local::now().date_naive()),
    }
}

fn handle_run_promotion(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let today = match parse_today(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    match scheduler::run_promotion_job(conn, today) {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "today": today.format("%Y-%m-%d").to_string(),
                "promoted": outcome.promoted,
                "demoted": outcome.demoted
            }),
        ),
        Err(e) => err(&req.id, "db_update_failed", format!("{e:#}"), None),
    }
}

fn handle_run_archival(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let today = match parse_today(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    match scheduler::run_archival_job(conn, today) {
        Ok(archived) => ok(
            &req.id,
            json!({
                "today": today.format("%Y-%m-%d").to_string(),
                "archived": archived
            }),
        ),
        Err(e) => err(&req.id, "db_update_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scheduler.runPromotion" => Some(handle_run_promotion(state, req)),
        "scheduler.runArchival" => Some(handle_run_archival(state, req)),
        _ => None,
    }
}
