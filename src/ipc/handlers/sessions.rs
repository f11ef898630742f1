use crate::audit;
use crate::custody::{self, SessionStatus};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::users::fetch_role;
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
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

fn db_err(e: impl std::fmt::Display) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
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

fn require_role(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(String, custody::Role), HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let role = fetch_role(conn, &actor_id).map_err(db_err)?;
    match role {
        Some(r) => Ok((actor_id, r)),
        None => Err(HandlerErr {
            code: "not_found",
            message: "actor not found or inactive".to_string(),
            details: None,
        }),
    }
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

fn qr_prefix(conn: &Connection) -> String {
    crate::db::settings_get_json(conn, "qr.prefix")
        .ok()
        .flatten()
        .and_then(|v| v.get("prefix").and_then(|p| p.as_str()).map(String::from))
        .unwrap_or_else(|| "B".to_string())
}

/// Batch tokens look like B-2025-001, unique per workspace. The sequence
/// restarts per exam year; collisions advance until a free slot is found.
fn next_batch_qr_code(conn: &Connection, exam_year: i32) -> Result<String, HandlerErr> {
    let prefix = qr_prefix(conn);
    let like = format!("{}-{}-%", prefix, exam_year);
    let existing: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM exam_sessions WHERE batch_qr_code LIKE ?",
            [&like],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    let mut seq = existing + 1;
    loop {
        let candidate = format!("{}-{}-{:03}", prefix, exam_year, seq);
        let taken: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM exam_sessions WHERE batch_qr_code = ?",
                [&candidate],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if taken.is_none() {
            return Ok(candidate);
        }
        seq += 1;
    }
}

/// Short signature binding a token to its session, so scanned tokens from a
/// foreign workspace are rejected without a table lookup on every frame.
pub fn qr_signature(token: &str, session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(b"|");
    hasher.update(session_id.as_bytes());
    let digest = hasher.finalize();
    format!("{:x}", digest)[..12].to_string()
}

fn session_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let batch_qr_code: String = r.get(1)?;
    let course_code: String = r.get(2)?;
    let course_name: String = r.get(3)?;
    let venue: Option<String> = r.get(4)?;
    let exam_date: String = r.get(5)?;
    let status: String = r.get(6)?;
    let department: Option<String> = r.get(7)?;
    let faculty: Option<String> = r.get(8)?;
    let lecturer_id: Option<String> = r.get(9)?;
    let expected: i64 = r.get(10)?;
    let attended: i64 = r.get(11)?;
    let created_at: String = r.get(12)?;
    let updated_at: Option<String> = r.get(13)?;
    Ok(json!({
        "id": id,
        "batchQrCode": batch_qr_code,
        "courseCode": course_code,
        "courseName": course_name,
        "venue": venue,
        "examDate": exam_date,
        "status": status,
        "department": department,
        "faculty": faculty,
        "lecturerId": lecturer_id,
        "expectedStudents": expected,
        "attendedStudents": attended,
        "createdAt": created_at,
        "updatedAt": updated_at
    }))
}

const SESSION_COLUMNS: &str = "id, batch_qr_code, course_code, course_name, venue, exam_date,
     status, department, faculty, lecturer_id, expected_students, attended_students,
     created_at, updated_at";

fn sessions_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let status = params
        .get("status")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(s) = status.as_deref() {
        if SessionStatus::parse(s).is_none() {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("unknown status: {}", s),
                details: None,
            });
        }
    }
    let lecturer = params
        .get("lecturerId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut sql = format!("SELECT {} FROM exam_sessions", SESSION_COLUMNS);
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<String> = Vec::new();
    if let Some(s) = status {
        clauses.push("status = ?");
        args.push(s);
    }
    if let Some(l) = lecturer {
        clauses.push("lecturer_id = ?");
        args.push(l);
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY exam_date DESC, course_code");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), session_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "sessions": rows }))
}

fn sessions_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (actor_id, role) = require_role(conn, params)?;
    if !role.can_manage_sessions() {
        return Err(HandlerErr {
            code: "forbidden",
            message: "role may not create exam sessions".to_string(),
            details: None,
        });
    }

    let course_code = get_required_str(params, "courseCode")?;
    let course_name = get_required_str(params, "courseName")?;
    let exam_date = get_required_str(params, "examDate")?;
    let parsed_date = NaiveDate::parse_from_str(&exam_date, "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "examDate must be YYYY-MM-DD".to_string(),
        details: None,
    })?;
    let venue = params.get("venue").and_then(|v| v.as_str());
    let department = params.get("department").and_then(|v| v.as_str());
    let faculty = params.get("faculty").and_then(|v| v.as_str());
    let lecturer_id = params.get("lecturerId").and_then(|v| v.as_str());
    let expected = params
        .get("expectedStudents")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if expected < 0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "expectedStudents must not be negative".to_string(),
            details: None,
        });
    }

    if let Some(l) = lecturer_id {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM users WHERE id = ?", [l], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(HandlerErr {
                code: "not_found",
                message: "lecturer not found".to_string(),
                details: None,
            });
        }
    }

    let session_id = Uuid::new_v4().to_string();
    let batch_qr_code = next_batch_qr_code(conn, parsed_date.year())?;
    conn.execute(
        "INSERT INTO exam_sessions(
            id, batch_qr_code, course_code, course_name, venue, exam_date, status,
            department, faculty, lecturer_id, expected_students, attended_students, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        rusqlite::params![
            &session_id,
            &batch_qr_code,
            course_code.trim(),
            course_name.trim(),
            venue,
            &exam_date,
            SessionStatus::NotStarted.as_str(),
            department,
            faculty,
            lecturer_id,
            expected,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "exam_sessions" })),
    })?;

    let _ = audit::record(
        conn,
        Some(&actor_id),
        "sessions.create",
        "exam_session",
        Some(&session_id),
        Some(json!({ "batchQrCode": batch_qr_code, "courseCode": course_code.trim() })),
    );

    Ok(json!({ "sessionId": session_id, "batchQrCode": batch_qr_code }))
}

fn sessions_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let sql = format!(
        "SELECT {} FROM exam_sessions WHERE id = ?",
        SESSION_COLUMNS
    );
    let session = conn
        .query_row(&sql, [&session_id], session_row_json)
        .optional()
        .map_err(db_err)?;
    let Some(mut session) = session else {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam session not found".to_string(),
            details: None,
        });
    };

    let transfers = super::transfers::load_session_facts(conn, &session_id).map_err(db_err)?;
    session["currentCustodianId"] = match custody::current_custodian(&transfers) {
        Some(h) => json!(h),
        None => serde_json::Value::Null,
    };
    Ok(json!({ "session": session }))
}

fn sessions_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (actor_id, role) = require_role(conn, params)?;
    if !role.can_manage_sessions() {
        return Err(HandlerErr {
            code: "forbidden",
            message: "role may not edit exam sessions".to_string(),
            details: None,
        });
    }
    let session_id = get_required_str(params, "sessionId")?;
    let patch = params.get("patch").ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "missing patch".to_string(),
        details: None,
    })?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM exam_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam session not found".to_string(),
            details: None,
        });
    }

    let columns = [
        ("courseCode", "course_code"),
        ("courseName", "course_name"),
        ("venue", "venue"),
        ("department", "department"),
        ("faculty", "faculty"),
    ];
    for (key, column) in columns {
        if let Some(v) = patch.get(key).and_then(|v| v.as_str()) {
            let sql = format!(
                "UPDATE exam_sessions SET {} = ?, updated_at = ? WHERE id = ?",
                column
            );
            conn.execute(&sql, (v.trim(), Utc::now().to_rfc3339(), &session_id))
                .map_err(|e| HandlerErr {
                    code: "db_update_failed",
                    message: e.to_string(),
                    details: None,
                })?;
        }
    }
    if let Some(date) = patch.get("examDate").and_then(|v| v.as_str()) {
        if NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "examDate must be YYYY-MM-DD".to_string(),
                details: None,
            });
        }
        conn.execute(
            "UPDATE exam_sessions SET exam_date = ?, updated_at = ? WHERE id = ?",
            (date, Utc::now().to_rfc3339(), &session_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    if let Some(expected) = patch.get("expectedStudents").and_then(|v| v.as_i64()) {
        if expected < 0 {
            return Err(HandlerErr {
                code: "bad_params",
                message: "expectedStudents must not be negative".to_string(),
                details: None,
            });
        }
        conn.execute(
            "UPDATE exam_sessions SET expected_students = ?, updated_at = ? WHERE id = ?",
            (expected, Utc::now().to_rfc3339(), &session_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    if let Some(lecturer) = patch.get("lecturerId").and_then(|v| v.as_str()) {
        let known: Option<i64> = conn
            .query_row("SELECT 1 FROM users WHERE id = ?", [lecturer], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        if known.is_none() {
            return Err(HandlerErr {
                code: "not_found",
                message: "lecturer not found".to_string(),
                details: None,
            });
        }
        conn.execute(
            "UPDATE exam_sessions SET lecturer_id = ?, updated_at = ? WHERE id = ?",
            (lecturer, Utc::now().to_rfc3339(), &session_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }

    let _ = audit::record(
        conn,
        Some(&actor_id),
        "sessions.update",
        "exam_session",
        Some(&session_id),
        Some(patch.clone()),
    );

    Ok(json!({ "ok": true }))
}

fn sessions_update_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let (actor_id, role) = require_role(conn, params)?;
    if !role.can_manage_sessions() {
        return Err(HandlerErr {
            code: "forbidden",
            message: "role may not change batch status".to_string(),
            details: None,
        });
    }
    let session_id = get_required_str(params, "sessionId")?;
    let status_raw = get_required_str(params, "status")?;
    let Some(to) = SessionStatus::parse(&status_raw) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("unknown status: {}", status_raw),
            details: None,
        });
    };

    let current_raw: Option<String> = conn
        .query_row(
            "SELECT status FROM exam_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(current_raw) = current_raw else {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam session not found".to_string(),
            details: None,
        });
    };
    let from = SessionStatus::parse(&current_raw).unwrap_or(SessionStatus::NotStarted);

    if !custody::session_transition_allowed(from, to, role) {
        return Err(HandlerErr {
            code: "invalid_transition",
            message: format!(
                "cannot move batch from {} back to {}",
                from.as_str(),
                to.as_str()
            ),
            details: Some(json!({ "from": from.as_str(), "to": to.as_str() })),
        });
    }
    let backward = to.rank() < from.rank();

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "UPDATE exam_sessions SET status = ?, updated_at = ? WHERE id = ?",
        (to.as_str(), Utc::now().to_rfc3339(), &session_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "exam_sessions" })),
    })?;
    audit::record(
        &tx,
        Some(&actor_id),
        "sessions.updateStatus",
        "exam_session",
        Some(&session_id),
        Some(json!({
            "from": from.as_str(),
            "to": to.as_str(),
            "adminOverride": backward
        })),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "audit_log" })),
    })?;
    audit::emit_event(
        &tx,
        "batch:status_updated",
        json!({ "sessionId": session_id, "status": to.as_str() }),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "events" })),
    })?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "sessionId": session_id, "status": to.as_str() }))
}

fn sessions_qr_payload(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let token: Option<String> = conn
        .query_row(
            "SELECT batch_qr_code FROM exam_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(token) = token else {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam session not found".to_string(),
            details: None,
        });
    };
    let signature = qr_signature(&token, &session_id);
    Ok(json!({
        "sessionId": session_id,
        "token": token,
        "signature": signature,
        "payload": format!("{}.{}", token, signature)
    }))
}

fn sessions_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (actor_id, role) = require_role(conn, params)?;
    if !role.can_manage_sessions() {
        return Err(HandlerErr {
            code: "forbidden",
            message: "role may not delete exam sessions".to_string(),
            details: None,
        });
    }
    let session_id = get_required_str(params, "sessionId")?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM exam_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam session not found".to_string(),
            details: None,
        });
    }

    // The dependents check runs inside the delete transaction so a record
    // landing between check and delete cannot slip through.
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let attendance_count: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM attendance_records ar
             JOIN attendance_sessions s ON s.id = ar.attendance_session_id
             WHERE s.exam_session_id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    let transfer_count: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM batch_transfers WHERE exam_session_id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    let incident_count: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM incidents WHERE exam_session_id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    if attendance_count > 0 || transfer_count > 0 || incident_count > 0 {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "has_dependents",
            message: "session has attendance, transfer, or incident records".to_string(),
            details: Some(json!({
                "attendanceRecords": attendance_count,
                "transfers": transfer_count,
                "incidents": incident_count
            })),
        });
    }

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    for (sql, table) in [
        (
            "DELETE FROM attendance_links
             WHERE attendance_session_id IN (
               SELECT id FROM attendance_sessions WHERE exam_session_id = ?
             )",
            "attendance_links",
        ),
        (
            "DELETE FROM attendance_sessions WHERE exam_session_id = ?",
            "attendance_sessions",
        ),
        (
            "DELETE FROM session_expected_students WHERE session_id = ?",
            "session_expected_students",
        ),
        ("DELETE FROM exam_sessions WHERE id = ?", "exam_sessions"),
    ] {
        if let Err(e) = tx.execute(sql, [&session_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_delete_failed",
                message: e.to_string(),
                details: Some(json!({ "table": table })),
            });
        }
    }

    audit::record(
        &tx,
        Some(&actor_id),
        "sessions.delete",
        "exam_session",
        Some(&session_id),
        None,
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "audit_log" })),
    })?;

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
}

/// Expected-roster CSV: single index_number column, header required.
/// Unknown index numbers are reported, not imported.
fn sessions_expected_import_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let text = get_required_str(params, "csv")?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM exam_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam session not found".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut added = 0usize;
    let mut warnings: Vec<serde_json::Value> = Vec::new();
    for (line_no, raw_line) in text.lines().enumerate() {
        if line_no == 0 {
            continue;
        }
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let fields = parse_csv_record(line);
        let index_number = fields[0].trim().to_string();
        if index_number.is_empty() {
            warnings.push(json!({
                "line": line_no + 1,
                "code": "missing_index_number",
                "message": "index_number is empty"
            }));
            continue;
        }
        let student_id: Option<String> = tx
            .query_row(
                "SELECT id FROM students WHERE index_number = ?",
                [&index_number],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(student_id) = student_id else {
            warnings.push(json!({
                "line": line_no + 1,
                "code": "unknown_student",
                "message": format!("no student with index number {}", index_number)
            }));
            continue;
        };
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO session_expected_students(session_id, student_id)
                 VALUES(?, ?)",
                (&session_id, &student_id),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "session_expected_students" })),
            })?;
        added += inserted;
    }

    let total: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM session_expected_students WHERE session_id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    tx.execute(
        "UPDATE exam_sessions SET expected_students = ?, updated_at = ? WHERE id = ?",
        (total, Utc::now().to_rfc3339(), &session_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "exam_sessions" })),
    })?;

    audit::record(
        &tx,
        params.get("actorId").and_then(|v| v.as_str()),
        "sessions.expectedImportCsv",
        "exam_session",
        Some(&session_id),
        Some(json!({ "added": added, "expectedStudents": total })),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "audit_log" })),
    })?;

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "added": added,
        "expectedStudents": total,
        "warnings": warnings
    }))
}

fn sessions_expected_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.index_number, s.last_name, s.first_name, s.program, s.level
             FROM session_expected_students e
             JOIN students s ON s.id = e.student_id
             WHERE e.session_id = ?
             ORDER BY s.index_number",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([&session_id], |r| {
            let id: String = r.get(0)?;
            let index_number: String = r.get(1)?;
            let last_name: String = r.get(2)?;
            let first_name: String = r.get(3)?;
            let program: String = r.get(4)?;
            let level: i64 = r.get(5)?;
            Ok(json!({
                "studentId": id,
                "indexNumber": index_number,
                "lastName": last_name,
                "firstName": first_name,
                "program": program,
                "level": level
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "students": rows }))
}

fn sessions_expected_export_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let out_path = get_required_str(params, "outPath")?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM exam_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam session not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT s.index_number
             FROM session_expected_students e
             JOIN students s ON s.id = e.student_id
             WHERE e.session_id = ?
             ORDER BY s.index_number",
        )
        .map_err(db_err)?;
    let index_numbers = stmt
        .query_map([&session_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut csv = String::from("index_number\r\n");
    for index_number in &index_numbers {
        csv.push_str(index_number);
        csv.push_str("\r\n");
    }
    std::fs::write(&out_path, csv).map_err(|e| HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: Some(json!({ "outPath": out_path })),
    })?;

    Ok(json!({ "outPath": out_path, "rows": index_numbers.len() }))
}

fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
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
        "sessions.list" => Some(with_db(state, req, sessions_list)),
        "sessions.create" => Some(with_db(state, req, sessions_create)),
        "sessions.get" => Some(with_db(state, req, sessions_get)),
        "sessions.update" => Some(with_db(state, req, sessions_update)),
        "sessions.updateStatus" => Some(with_db(state, req, sessions_update_status)),
        "sessions.qrPayload" => Some(with_db(state, req, sessions_qr_payload)),
        "sessions.delete" => Some(with_db(state, req, sessions_delete)),
        "sessions.expectedImportCsv" => Some(with_db(state, req, sessions_expected_import_csv)),
        "sessions.expectedList" => Some(with_db(state, req, sessions_expected_list)),
        "sessions.expectedExportCsv" => Some(with_db(state, req, sessions_expected_export_csv)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_signature_is_stable_and_session_bound() {
        let a = qr_signature("B-2025-001", "s1");
        assert_eq!(a.len(), 12);
        assert_eq!(a, qr_signature("B-2025-001", "s1"));
        assert_ne!(a, qr_signature("B-2025-001", "s2"));
        assert_ne!(a, qr_signature("B-2025-002", "s1"));
    }
}
