use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_centerd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn centerd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn find_session<'a>(listed: &'a serde_json::Value, session_id: &str) -> serde_json::Value {
    listed["sessions"]
        .as_array()
        .expect("sessions")
        .iter()
        .find(|s| s["id"].as_str() == Some(session_id))
        .cloned()
        .expect("session row")
}

#[test]
fn ended_session_is_incomplete_until_attendance_is_recorded() {
    let workspace = temp_dir("centerd-attendance-override");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Piano Beginners" }),
    );
    let class_id = created["classId"].as_str().expect("classId").to_string();

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.add",
        json!({ "classId": class_id, "lastName": "Nguyen", "firstName": "Minh" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();

    // A session whose window has long passed.
    let session = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "sessions.create",
        json!({
            "classId": class_id,
            "input": { "sessionDate": "2020-01-06", "startTime": "14:00", "endTime": "16:00" }
        }),
    );
    let session_id = session["sessionId"].as_str().expect("sessionId").to_string();

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sessions.list",
        json!({ "classId": class_id }),
    );
    let row = find_session(&listed, &session_id);
    assert_eq!(row["displayStatus"].as_str(), Some("incomplete"));
    // Persisted column still says has_not_happened; the scheduler owes it
    // an archival pass.
    assert_eq!(row["stale"].as_bool(), Some(true));

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.sessionOpen",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(opened["recorded"].as_bool(), Some(false));
    assert_eq!(opened["rows"].as_array().expect("rows").len(), 1);

    let recorded = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.record",
        json!({
            "sessionId": session_id,
            "entries": [
                { "studentId": student_id, "code": "present" },
                { "studentId": "not-on-roster", "code": "present" }
            ]
        }),
    );
    assert_eq!(recorded["recorded"].as_u64(), Some(1));

    // Attendance on file clears the no-attendance override.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "sessions.list",
        json!({ "classId": class_id }),
    );
    let row = find_session(&listed, &session_id);
    assert_eq!(row["displayStatus"].as_str(), Some("completed"));

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.sessionOpen",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(opened["recorded"].as_bool(), Some(true));
    let rows = opened["rows"].as_array().expect("rows");
    assert_eq!(rows[0]["code"].as_str(), Some("present"));

    // Re-recording upserts rather than duplicating.
    let recorded = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.record",
        json!({
            "sessionId": session_id,
            "entries": [{ "studentId": student_id, "code": "late" }]
        }),
    );
    assert_eq!(recorded["recorded"].as_u64(), Some(1));
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.sessionOpen",
        json!({ "sessionId": session_id }),
    );
    let rows = opened["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["code"].as_str(), Some("late"));

    let _ = child.kill();
}

#[test]
fn cancelled_past_session_stays_cancelled() {
    let workspace = temp_dir("centerd-attendance-cancelled");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Guitar" }),
    );
    let class_id = created["classId"].as_str().expect("classId").to_string();

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "sessions.create",
        json!({
            "classId": class_id,
            "input": { "sessionDate": "2020-01-06", "startTime": "14:00", "endTime": "16:00" }
        }),
    );
    let session_id = session["sessionId"].as_str().expect("sessionId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "sessions.cancel",
        json!({ "sessionId": session_id }),
    );

    // Cancelled outranks the no-attendance override for an ended session.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sessions.list",
        json!({ "classId": class_id }),
    );
    let row = find_session(&listed, &session_id);
    assert_eq!(row["displayStatus"].as_str(), Some("cancelled"));

    let _ = child.kill();
}
