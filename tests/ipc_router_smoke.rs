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

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn result_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get("result")
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing result.{}", key))
        .to_string()
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("custody-router-smoke");
    let bundle_out = workspace.join("smoke-backup.custodybackup.zip");
    let csv_out = workspace.join("smoke-transfers.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let lecturer = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({
            "name": "Smoke Lecturer",
            "email": "lecturer@smoke.test",
            "role": "lecturer"
        }),
    );
    let lecturer_id = result_str(&lecturer, "userId");
    let invigilator = request(
        &mut stdin,
        &mut reader,
        "4",
        "users.create",
        json!({
            "name": "Smoke Invigilator",
            "email": "invigilator@smoke.test",
            "role": "invigilator"
        }),
    );
    let invigilator_id = result_str(&invigilator, "userId");
    let _ = request(&mut stdin, &mut reader, "5", "users.list", json!({}));

    let student = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({
            "indexNumber": "UG9001",
            "firstName": "Smoke",
            "lastName": "Student",
            "program": "BSc Smoke Testing",
            "level": 300
        }),
    );
    let _student_id = result_str(&student, "studentId");
    let _ = request(&mut stdin, &mut reader, "7", "students.list", json!({}));

    let session = request(
        &mut stdin,
        &mut reader,
        "8",
        "sessions.create",
        json!({
            "actorId": lecturer_id,
            "courseCode": "SMK101",
            "courseName": "Smoke Testing",
            "examDate": "2025-05-10",
            "venue": "Main Hall"
        }),
    );
    let session_id = result_str(&session, "sessionId");
    let _ = request(&mut stdin, &mut reader, "9", "sessions.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "sessions.get",
        json!({ "sessionId": session_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "sessions.qrPayload",
        json!({ "sessionId": session_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "sessions.expectedImportCsv",
        json!({ "sessionId": session_id, "csv": "index_number\nUG9001\n" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "sessions.expectedList",
        json!({ "sessionId": session_id }),
    );
    let expected_csv_out = workspace.join("smoke-expected.csv");
    let _ = request(
        &mut stdin,
        &mut reader,
        "13b",
        "sessions.expectedExportCsv",
        json!({
            "sessionId": session_id,
            "outPath": expected_csv_out.to_string_lossy()
        }),
    );

    let transfer = request(
        &mut stdin,
        &mut reader,
        "14",
        "transfers.request",
        json!({
            "actorId": lecturer_id,
            "sessionId": session_id,
            "toHandlerId": invigilator_id,
            "examsExpected": 1
        }),
    );
    let transfer_id = result_str(&transfer, "transferId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "transfers.confirm",
        json!({
            "actorId": invigilator_id,
            "transferId": transfer_id,
            "receivedCount": 1
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "transfers.history",
        json!({ "sessionId": session_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "custody.overview",
        json!({ "handlerId": invigilator_id }),
    );

    let incident = request(
        &mut stdin,
        &mut reader,
        "18",
        "incidents.create",
        json!({
            "actorId": invigilator_id,
            "title": "Smoke incident",
            "description": "router smoke",
            "category": "other",
            "severity": "low",
            "sessionId": session_id
        }),
    );
    let incident_id = result_str(&incident, "incidentId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "incidents.get",
        json!({ "incidentId": incident_id }),
    );

    let att = request(
        &mut stdin,
        &mut reader,
        "20",
        "attendance.start",
        json!({ "actorId": invigilator_id, "sessionId": session_id }),
    );
    let att_id = result_str(&att, "attendanceSessionId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "attendance.record",
        json!({
            "attendanceSessionId": att_id,
            "indexNumber": "UG9001",
            "method": "manual"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "attendance.list",
        json!({ "attendanceSessionId": att_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "attendance.end",
        json!({ "attendanceSessionId": att_id }),
    );

    let _ = request(&mut stdin, &mut reader, "24", "audit.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "analytics.overview",
        json!({}),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "26",
        "analytics.handlerPerformance",
        json!({}),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "27",
        "events.poll",
        json!({ "afterSeq": 0 }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "28",
        "exchange.exportTransfersCsv",
        json!({ "sessionId": session_id, "outPath": csv_out.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "29",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "30",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
