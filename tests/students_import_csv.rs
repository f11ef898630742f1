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

    fn err(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.raw(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value.get("error").cloned().expect("error present")
    }

    fn finish(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(self.workspace);
    }
}

const ROSTER: &str = "index_number,first_name,last_name,program,level,email\n\
UG1001,Ama,Mensah,BSc Computer Science,300,ama@uni.test\n\
UG1002,Kofi,Owusu,BSc Computer Science,300,\n\
UG1003,Esi,\"Boateng, Jr\",BSc Mathematics,200,\n";

#[test]
fn roster_import_inserts_then_upserts() {
    let mut h = Harness::new("students-import");

    let first = h.ok("students.importCsv", json!({ "csv": ROSTER }));
    assert_eq!(first.get("inserted").and_then(|v| v.as_i64()), Some(3));
    assert_eq!(first.get("updated").and_then(|v| v.as_i64()), Some(0));

    // Re-importing the same index numbers updates in place.
    let second = h.ok(
        "students.importCsv",
        json!({
            "csv": "index_number,first_name,last_name,program,level\nUG1001,Ama,Mensah,BSc Information Systems,400\n"
        }),
    );
    assert_eq!(second.get("inserted").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(second.get("updated").and_then(|v| v.as_i64()), Some(1));

    let listed = h.ok("students.list", json!({ "search": "UG1001" }));
    let students = listed
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .clone();
    assert_eq!(students.len(), 1);
    assert_eq!(
        students[0].get("program").and_then(|v| v.as_str()),
        Some("BSc Information Systems")
    );
    assert_eq!(students[0].get("level").and_then(|v| v.as_i64()), Some(400));

    // Quoted surname survived the round trip.
    let listed = h.ok("students.list", json!({ "search": "Boateng" }));
    let students = listed
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .clone();
    assert_eq!(
        students[0].get("lastName").and_then(|v| v.as_str()),
        Some("Boateng, Jr")
    );

    h.finish();
}

#[test]
fn missing_field_cites_row_and_field() {
    let mut h = Harness::new("students-import-missing");

    let error = h.err(
        "students.importCsv",
        json!({
            "csv": "index_number,first_name,last_name,program,level\nUG1001,Ama,Mensah,BSc CS,300\nUG1002,Kofi,,BSc CS,300\n"
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));
    let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("");
    assert!(message.contains("row 3"), "message was: {}", message);
    assert!(message.contains("lastName"), "message was: {}", message);
    assert_eq!(
        error
            .get("details")
            .and_then(|d| d.get("row"))
            .and_then(|v| v.as_i64()),
        Some(3)
    );

    // Nothing from the rejected file may land.
    let listed = h.ok("students.list", json!({}));
    assert!(listed
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .is_empty());

    h.finish();
}

#[test]
fn level_must_parse_as_integer() {
    let mut h = Harness::new("students-import-level");
    let error = h.err(
        "students.importCsv",
        json!({
            "csv": "index_number,first_name,last_name,program,level\nUG1001,Ama,Mensah,BSc CS,L300\n"
        }),
    );
    let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("");
    assert!(message.contains("row 2"), "message was: {}", message);
    assert!(message.contains("integer"), "message was: {}", message);
    assert_eq!(
        error
            .get("details")
            .and_then(|d| d.get("field"))
            .and_then(|v| v.as_str()),
        Some("level")
    );
    h.finish();
}

#[test]
fn duplicate_index_number_rejected_on_create() {
    let mut h = Harness::new("students-duplicate");
    h.ok(
        "students.create",
        json!({
            "indexNumber": "UG2001",
            "firstName": "Yaw",
            "lastName": "Darko",
            "program": "BSc Physics",
            "level": 100
        }),
    );
    let error = h.err(
        "students.create",
        json!({
            "indexNumber": "UG2001",
            "firstName": "Other",
            "lastName": "Person",
            "program": "BSc Physics",
            "level": 100
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("duplicate"));
    h.finish();
}

#[test]
fn export_writes_quoted_csv() {
    let mut h = Harness::new("students-export");
    h.ok("students.importCsv", json!({ "csv": ROSTER }));

    let out_path = h.workspace.join("roster-out.csv");
    let result = h.ok(
        "students.exportCsv",
        json!({ "outPath": out_path.to_string_lossy() }),
    );
    assert_eq!(result.get("rows").and_then(|v| v.as_i64()), Some(3));

    let text = std::fs::read_to_string(&out_path).expect("read export");
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("index_number,first_name,last_name,program,level,email")
    );
    assert!(text.contains("\"Boateng, Jr\""));
    assert!(text.contains("UG1002"));

    h.finish();
}

#[test]
fn referenced_student_deactivates_instead_of_deleting() {
    let mut h = Harness::new("students-soft-delete");
    h.ok("students.importCsv", json!({ "csv": ROSTER }));

    let listed = h.ok("students.list", json!({ "search": "UG1001" }));
    let student_id = listed
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|s| s.get("id"))
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string();

    let lecturer = h.ok(
        "users.create",
        json!({
            "name": "Roster Lecturer",
            "email": "roster.lecturer@students.test",
            "role": "lecturer"
        }),
    );
    let lecturer_id = lecturer
        .get("userId")
        .and_then(|v| v.as_str())
        .expect("userId")
        .to_string();
    let session = h.ok(
        "sessions.create",
        json!({
            "actorId": lecturer_id,
            "courseCode": "CSC101",
            "courseName": "Intro",
            "examDate": "2025-05-02"
        }),
    );
    let session_id = session
        .get("sessionId")
        .and_then(|v| v.as_str())
        .expect("sessionId")
        .to_string();
    h.ok(
        "sessions.expectedImportCsv",
        json!({ "sessionId": session_id, "csv": "index_number\nUG1001\n" }),
    );

    let deleted = h.ok("students.delete", json!({ "studentId": student_id }));
    assert_eq!(deleted.get("deactivated").and_then(|v| v.as_bool()), Some(true));

    let listed = h.ok("students.list", json!({ "search": "UG1001" }));
    let students = listed
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .clone();
    assert_eq!(students[0].get("active").and_then(|v| v.as_bool()), Some(false));

    // Unreferenced students go away entirely.
    let listed = h.ok("students.list", json!({ "search": "UG1002" }));
    let other_id = listed
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|s| s.get("id"))
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string();
    let deleted = h.ok("students.delete", json!({ "studentId": other_id }));
    assert_eq!(deleted.get("deactivated").and_then(|v| v.as_bool()), Some(false));
    let listed = h.ok("students.list", json!({ "search": "UG1002" }));
    assert!(listed
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students")
        .is_empty());

    h.finish();
}
