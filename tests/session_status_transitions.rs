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
    let exe = env!("CARGO_BIN_EXE_custodyd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn custodyd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

struct Harness {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    workspace: PathBuf,
    next_id: u64,
}

impl Harness {
    fn new(prefix: &str) -> Harness {
        let workspace = temp_dir(prefix);
        let (child, stdin, reader) = spawn_sidecar();
        let mut h = Harness {
            child,
            stdin,
            reader,
            workspace,
            next_id: 1,
        };
        let ws = h.workspace.to_string_lossy().to_string();
        h.ok("workspace.select", json!({ "path": ws }));
        h
    }

    fn raw(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = format!("r{}", self.next_id);
        self.next_id += 1;
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.raw(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().expect("result present")
    }

    fn err_code(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.raw(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .expect("error code")
            .to_string()
    }

    fn user(&mut self, name: &str, role: &str) -> String {
        let result = self.ok(
            "users.create",
            json!({
                "name": name,
                "email": format!("{}@status.test", name.to_ascii_lowercase().replace(' ', ".")),
                "role": role
            }),
        );
        result
            .get("userId")
            .and_then(|v| v.as_str())
            .expect("userId")
            .to_string()
    }

    fn session(&mut self, actor_id: &str) -> String {
        let result = self.ok(
            "sessions.create",
            json!({
                "actorId": actor_id,
                "courseCode": "BIO112",
                "courseName": "Cell Biology",
                "examDate": "2025-05-20"
            }),
        );
        result
            .get("sessionId")
            .and_then(|v| v.as_str())
            .expect("sessionId")
            .to_string()
    }

    fn status_of(&mut self, session_id: &str) -> String {
        let result = self.ok("sessions.get", json!({ "sessionId": session_id }));
        result
            .get("session")
            .and_then(|s| s.get("status"))
            .and_then(|v| v.as_str())
            .expect("status")
            .to_string()
    }

    fn finish(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(self.workspace);
    }
}

#[test]
fn forward_moves_and_skips_are_allowed() {
    let mut h = Harness::new("status-forward");
    let lecturer = h.user("Lecturer", "lecturer");
    let session_id = h.session(&lecturer);
    assert_eq!(h.status_of(&session_id), "not_started");

    h.ok(
        "sessions.updateStatus",
        json!({ "actorId": lecturer, "sessionId": session_id, "status": "in_progress" }),
    );
    // Skipping intermediate stages is a forward move.
    h.ok(
        "sessions.updateStatus",
        json!({ "actorId": lecturer, "sessionId": session_id, "status": "under_grading" }),
    );
    assert_eq!(h.status_of(&session_id), "under_grading");

    h.finish();
}

#[test]
fn backward_moves_need_an_admin() {
    let mut h = Harness::new("status-backward");
    let lecturer = h.user("Lecturer", "lecturer");
    let admin = h.user("Admin", "admin");
    let session_id = h.session(&lecturer);

    h.ok(
        "sessions.updateStatus",
        json!({ "actorId": lecturer, "sessionId": session_id, "status": "graded" }),
    );

    let code = h.err_code(
        "sessions.updateStatus",
        json!({ "actorId": lecturer, "sessionId": session_id, "status": "submitted" }),
    );
    assert_eq!(code, "invalid_transition");
    assert_eq!(h.status_of(&session_id), "graded");

    // Admins can walk a clerical error back.
    h.ok(
        "sessions.updateStatus",
        json!({ "actorId": admin, "sessionId": session_id, "status": "submitted" }),
    );
    assert_eq!(h.status_of(&session_id), "submitted");

    h.finish();
}

#[test]
fn status_updates_are_validated_and_gated() {
    let mut h = Harness::new("status-gate");
    let lecturer = h.user("Lecturer", "lecturer");
    let invigilator = h.user("Invigilator", "invigilator");
    let session_id = h.session(&lecturer);

    let code = h.err_code(
        "sessions.updateStatus",
        json!({ "actorId": lecturer, "sessionId": session_id, "status": "mislaid" }),
    );
    assert_eq!(code, "bad_params");

    let code = h.err_code(
        "sessions.updateStatus",
        json!({ "actorId": invigilator, "sessionId": session_id, "status": "in_progress" }),
    );
    assert_eq!(code, "forbidden");

    let code = h.err_code(
        "sessions.updateStatus",
        json!({ "actorId": lecturer, "sessionId": "missing", "status": "in_progress" }),
    );
    assert_eq!(code, "not_found");

    h.finish();
}

#[test]
fn status_change_lands_in_the_event_outbox() {
    let mut h = Harness::new("status-events");
    let lecturer = h.user("Lecturer", "lecturer");
    let session_id = h.session(&lecturer);

    h.ok(
        "sessions.updateStatus",
        json!({ "actorId": lecturer, "sessionId": session_id, "status": "submitted" }),
    );

    let polled = h.ok("events.poll", json!({ "afterSeq": 0 }));
    let events = polled
        .get("events")
        .and_then(|v| v.as_array())
        .expect("events")
        .clone();
    let status_event = events
        .iter()
        .find(|e| e.get("kind").and_then(|v| v.as_str()) == Some("batch:status_updated"))
        .expect("batch:status_updated event");
    assert_eq!(
        status_event
            .get("payload")
            .and_then(|p| p.get("status"))
            .and_then(|v| v.as_str()),
        Some("submitted")
    );

    // The cursor excludes everything already seen.
    let last_seq = polled.get("lastSeq").and_then(|v| v.as_i64()).expect("lastSeq");
    let again = h.ok("events.poll", json!({ "afterSeq": last_seq }));
    assert!(again
        .get("events")
        .and_then(|v| v.as_array())
        .expect("events")
        .is_empty());

    h.finish();
}

#[test]
fn delete_refuses_sessions_with_history() {
    let mut h = Harness::new("status-delete-guard");
    let lecturer = h.user("Lecturer", "lecturer");
    let officer = h.user("Officer", "faculty_officer");
    let session_id = h.session(&lecturer);

    h.ok(
        "transfers.request",
        json!({
            "actorId": lecturer,
            "sessionId": session_id,
            "toHandlerId": officer,
            "examsExpected": 12
        }),
    );

    let code = h.err_code(
        "sessions.delete",
        json!({ "actorId": lecturer, "sessionId": session_id }),
    );
    assert_eq!(code, "has_dependents");

    // An untouched session deletes cleanly.
    let fresh = h.session(&lecturer);
    h.ok(
        "sessions.delete",
        json!({ "actorId": lecturer, "sessionId": fresh }),
    );
    let code = h.err_code("sessions.get", json!({ "sessionId": fresh }));
    assert_eq!(code, "not_found");

    h.finish();
}
