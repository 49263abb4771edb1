use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

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

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    payload: serde_json::Value,
) -> serde_json::Value {
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

#[test]
fn health_unknown_method_and_no_workspace_errors() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(
        &mut stdin,
        &mut reader,
        json!({ "id": "1", "method": "health", "params": {} }),
    );
    assert_eq!(health["ok"].as_bool(), Some(true));
    assert!(health["result"]["version"].is_string());
    assert!(health["result"]["workspacePath"].is_null());

    let unknown = request(
        &mut stdin,
        &mut reader,
        json!({ "id": "2", "method": "does.notExist", "params": {} }),
    );
    assert_eq!(unknown["ok"].as_bool(), Some(false));
    assert_eq!(unknown["error"]["code"].as_str(), Some("not_implemented"));

    // Domain methods refuse to run before a workspace is selected.
    let no_ws = request(
        &mut stdin,
        &mut reader,
        json!({ "id": "3", "method": "sessions.list", "params": { "classId": "c1" } }),
    );
    assert_eq!(no_ws["ok"].as_bool(), Some(false));
    assert_eq!(no_ws["error"]["code"].as_str(), Some("no_workspace"));

    let _ = child.kill();
}
