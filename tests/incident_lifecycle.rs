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

    fn str_of(result: &serde_json::Value, key: &str) -> String {
        result
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| panic!("missing {}", key))
            .to_string()
    }

    fn finish(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(self.workspace);
    }
}

#[test]
fn incident_status_set_is_flat() {
    let mut h = Harness::new("incident-flat");
    let reporter = h.ok(
        "users.create",
        json!({
            "name": "Reporter",
            "email": "reporter@incident.test",
            "role": "invigilator"
        }),
    );
    let reporter_id = Harness::str_of(&reporter, "userId");

    let incident = h.ok(
        "incidents.create",
        json!({
            "actorId": reporter_id,
            "title": "Phone found under desk",
            "description": "Candidate in seat 14 had a phone taped under the desk.",
            "category": "malpractice",
            "severity": "high"
        }),
    );
    let incident_id = Harness::str_of(&incident, "incidentId");
    assert_eq!(incident.get("status").and_then(|v| v.as_str()), Some("reported"));

    // Any status is reachable from any other, including backwards.
    for status in ["closed", "investigating", "escalated", "resolved", "reported"] {
        let result = h.ok(
            "incidents.updateStatus",
            json!({
                "actorId": reporter_id,
                "incidentId": incident_id,
                "status": status
            }),
        );
        assert_eq!(result.get("status").and_then(|v| v.as_str()), Some(status));
    }

    let code = h.err_code(
        "incidents.updateStatus",
        json!({
            "actorId": reporter_id,
            "incidentId": incident_id,
            "status": "shredded"
        }),
    );
    assert_eq!(code, "bad_params");

    h.finish();
}

#[test]
fn incident_detail_carries_comments_and_timeline() {
    let mut h = Harness::new("incident-detail");
    let reporter = h.ok(
        "users.create",
        json!({
            "name": "Detail Reporter",
            "email": "detail.reporter@incident.test",
            "role": "faculty_officer"
        }),
    );
    let reporter_id = Harness::str_of(&reporter, "userId");

    let incident = h.ok(
        "incidents.create",
        json!({
            "actorId": reporter_id,
            "title": "Projector failure",
            "description": "Hall projector died mid-briefing.",
            "category": "equipment",
            "severity": "low"
        }),
    );
    let incident_id = Harness::str_of(&incident, "incidentId");

    h.ok(
        "incidents.commentAdd",
        json!({
            "actorId": reporter_id,
            "incidentId": incident_id,
            "body": "Facilities notified."
        }),
    );
    h.ok(
        "incidents.updateStatus",
        json!({
            "actorId": reporter_id,
            "incidentId": incident_id,
            "status": "investigating"
        }),
    );

    let detail = h.ok("incidents.get", json!({ "incidentId": incident_id }));
    let comments = detail
        .get("comments")
        .and_then(|v| v.as_array())
        .expect("comments");
    assert_eq!(comments.len(), 1);
    assert_eq!(
        comments[0].get("body").and_then(|v| v.as_str()),
        Some("Facilities notified.")
    );
    assert_eq!(
        comments[0].get("authorName").and_then(|v| v.as_str()),
        Some("Detail Reporter")
    );

    let timeline = detail
        .get("timeline")
        .and_then(|v| v.as_array())
        .expect("timeline");
    let actions: Vec<&str> = timeline
        .iter()
        .filter_map(|e| e.get("action").and_then(|v| v.as_str()))
        .collect();
    assert!(actions.contains(&"incidents.create"));
    assert!(actions.contains(&"incidents.commentAdd"));
    assert!(actions.contains(&"incidents.updateStatus"));

    h.finish();
}

#[test]
fn incident_filters_and_validation() {
    let mut h = Harness::new("incident-filters");
    let reporter = h.ok(
        "users.create",
        json!({
            "name": "Filter Reporter",
            "email": "filter.reporter@incident.test",
            "role": "lecturer"
        }),
    );
    let reporter_id = Harness::str_of(&reporter, "userId");

    for (title, severity) in [("Late start", "low"), ("Collapsed candidate", "critical")] {
        h.ok(
            "incidents.create",
            json!({
                "actorId": reporter_id,
                "title": title,
                "description": "details",
                "category": "health",
                "severity": severity
            }),
        );
    }

    let critical = h.ok("incidents.list", json!({ "severity": "critical" }));
    let incidents = critical
        .get("incidents")
        .and_then(|v| v.as_array())
        .expect("incidents");
    assert_eq!(incidents.len(), 1);
    assert_eq!(
        incidents[0].get("title").and_then(|v| v.as_str()),
        Some("Collapsed candidate")
    );

    let code = h.err_code(
        "incidents.create",
        json!({
            "actorId": reporter_id,
            "title": "Bad category",
            "description": "x",
            "category": "weather",
            "severity": "low"
        }),
    );
    assert_eq!(code, "bad_params");

    let code = h.err_code(
        "incidents.create",
        json!({
            "actorId": "ghost",
            "title": "No reporter",
            "description": "x",
            "category": "other",
            "severity": "low"
        }),
    );
    assert_eq!(code, "not_found");

    h.finish();
}
