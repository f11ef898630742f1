use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, Utc};
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

#[derive(Debug, Clone)]
struct AttSession {
    id: String,
    exam_session_id: String,
    status: String,
}

fn load_att_session(conn: &Connection, id: &str) -> Result<AttSession, HandlerErr> {
    conn.query_row(
        "SELECT id, exam_session_id, status FROM attendance_sessions WHERE id = ?",
        [id],
        |r| {
            Ok(AttSession {
                id: r.get(0)?,
                exam_session_id: r.get(1)?,
                status: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "attendance session not found".to_string(),
        details: None,
    })
}

/// Recount confirmed attendance into the exam session's attended counter.
fn refresh_attended_count(conn: &Connection, exam_session_id: &str) -> Result<i64, HandlerErr> {
    let attended: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT ar.student_id)
             FROM attendance_records ar
             JOIN attendance_sessions s ON s.id = ar.attendance_session_id
             WHERE s.exam_session_id = ? AND ar.confirmed = 1",
            [exam_session_id],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    conn.execute(
        "UPDATE exam_sessions SET attended_students = ?, updated_at = ? WHERE id = ?",
        (attended, Utc::now().to_rfc3339(), exam_session_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "exam_sessions" })),
    })?;
    Ok(attended)
}

fn attendance_start(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let exam_session_id = get_required_str(params, "sessionId")?;

    let exam_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM exam_sessions WHERE id = ?",
            [&exam_session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if exam_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam session not found".to_string(),
            details: None,
        });
    }
    let actor_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&actor_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if actor_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "actor not found".to_string(),
            details: None,
        });
    }

    let open: Option<String> = conn
        .query_row(
            "SELECT id FROM attendance_sessions
             WHERE exam_session_id = ? AND status IN ('in_progress', 'paused')",
            [&exam_session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if let Some(open_id) = open {
        return Err(HandlerErr {
            code: "conflict",
            message: "an attendance session is already open for this exam".to_string(),
            details: Some(json!({ "attendanceSessionId": open_id })),
        });
    }

    let att_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance_sessions(id, exam_session_id, status, started_by, started_at)
         VALUES(?, ?, 'in_progress', ?, ?)",
        (
            &att_id,
            &exam_session_id,
            &actor_id,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_sessions" })),
    })?;

    let _ = audit::record(
        conn,
        Some(&actor_id),
        "attendance.start",
        "attendance_session",
        Some(&att_id),
        Some(json!({ "examSessionId": exam_session_id })),
    );

    Ok(json!({ "attendanceSessionId": att_id, "status": "in_progress" }))
}

fn set_att_status(
    conn: &Connection,
    params: &serde_json::Value,
    from: &[&str],
    to: &str,
    action: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let att_id = get_required_str(params, "attendanceSessionId")?;
    let att = load_att_session(conn, &att_id)?;
    if !from.contains(&att.status.as_str()) {
        let verb = action.rsplit('.').next().unwrap_or(action);
        return Err(HandlerErr {
            code: "invalid_transition",
            message: format!("cannot {} a session that is {}", verb, att.status),
            details: Some(json!({ "status": att.status })),
        });
    }

    if to == "ended" {
        conn.execute(
            "UPDATE attendance_sessions SET status = 'ended', ended_at = ? WHERE id = ?",
            (Utc::now().to_rfc3339(), &att_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_sessions" })),
        })?;
        refresh_attended_count(conn, &att.exam_session_id)?;
        let _ = audit::emit_event(
            conn,
            "attendance:sessionEnded",
            json!({
                "attendanceSessionId": att_id,
                "examSessionId": att.exam_session_id
            }),
        );
    } else {
        conn.execute(
            "UPDATE attendance_sessions SET status = ? WHERE id = ?",
            (to, &att_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_sessions" })),
        })?;
    }

    let _ = audit::record(
        conn,
        params.get("actorId").and_then(|v| v.as_str()),
        action,
        "attendance_session",
        Some(&att_id),
        Some(json!({ "to": to })),
    );

    Ok(json!({ "attendanceSessionId": att_id, "status": to }))
}

fn resolve_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<String, HandlerErr> {
    if let Some(sid) = params.get("studentId").and_then(|v| v.as_str()) {
        let known: Option<i64> = conn
            .query_row("SELECT 1 FROM students WHERE id = ?", [sid], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        if known.is_none() {
            return Err(HandlerErr {
                code: "not_found",
                message: "student not found".to_string(),
                details: None,
            });
        }
        return Ok(sid.to_string());
    }
    if let Some(idx) = params.get("indexNumber").and_then(|v| v.as_str()) {
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM students WHERE index_number = ?",
                [idx.trim()],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        return found.ok_or_else(|| HandlerErr {
            code: "not_found",
            message: format!("no student with index number {}", idx.trim()),
            details: None,
        });
    }
    Err(HandlerErr {
        code: "bad_params",
        message: "provide studentId or indexNumber".to_string(),
        details: None,
    })
}

fn insert_record(
    conn: &Connection,
    att: &AttSession,
    student_id: &str,
    method: &str,
    allow_walk_in: bool,
) -> Result<serde_json::Value, HandlerErr> {
    if att.status != "in_progress" {
        return Err(HandlerErr {
            code: "invalid_transition",
            message: format!("attendance session is {}, not recording", att.status),
            details: None,
        });
    }

    let expected_total: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM session_expected_students WHERE session_id = ?",
            [&att.exam_session_id],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    if expected_total > 0 && !allow_walk_in {
        let on_list: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM session_expected_students WHERE session_id = ? AND student_id = ?",
                (&att.exam_session_id, student_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if on_list.is_none() {
            return Err(HandlerErr {
                code: "not_expected",
                message: "student is not on the expected list for this exam".to_string(),
                details: Some(json!({ "studentId": student_id })),
            });
        }
    }

    let dup: Option<String> = conn
        .query_row(
            "SELECT id FROM attendance_records
             WHERE attendance_session_id = ? AND student_id = ?",
            (&att.id, student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if let Some(existing) = dup {
        return Err(HandlerErr {
            code: "duplicate",
            message: "student already recorded in this session".to_string(),
            details: Some(json!({ "recordId": existing })),
        });
    }

    let record_id = Uuid::new_v4().to_string();
    let recorded_at = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO attendance_records(
            id, attendance_session_id, student_id, method, confirmed, recorded_at)
         VALUES(?, ?, ?, ?, 0, ?)",
        (&record_id, &att.id, student_id, method, &recorded_at),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_records" })),
    })?;

    let _ = audit::emit_event(
        conn,
        "attendance:recorded",
        json!({
            "attendanceSessionId": att.id,
            "examSessionId": att.exam_session_id,
            "studentId": student_id,
            "method": method
        }),
    );

    Ok(json!({ "recordId": record_id, "recordedAt": recorded_at }))
}

fn attendance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let att_id = get_required_str(params, "attendanceSessionId")?;
    let method = params
        .get("method")
        .and_then(|v| v.as_str())
        .unwrap_or("manual");
    if method != "manual" && method != "qr" {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("unknown method: {}", method),
            details: None,
        });
    }
    let allow_walk_in = params
        .get("allowWalkIn")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let att = load_att_session(conn, &att_id)?;
    let student_id = resolve_student(conn, params)?;
    let result = insert_record(conn, &att, &student_id, method, allow_walk_in)?;

    let _ = audit::record(
        conn,
        params.get("actorId").and_then(|v| v.as_str()),
        "attendance.record",
        "attendance_session",
        Some(&att_id),
        Some(json!({ "studentId": student_id, "method": method })),
    );

    Ok(result)
}

fn attendance_bulk_confirm(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let att_id = get_required_str(params, "attendanceSessionId")?;
    let Some(record_ids) = params.get("recordIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing recordIds".to_string(),
            details: None,
        });
    };
    let record_ids: Vec<String> = record_ids
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();

    let att = load_att_session(conn, &att_id)?;

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let mut confirmed = 0usize;
    for record_id in &record_ids {
        let changed = tx
            .execute(
                "UPDATE attendance_records SET confirmed = 1
                 WHERE id = ? AND attendance_session_id = ?",
                (record_id, &att_id),
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "attendance_records" })),
            })?;
        confirmed += changed;
    }
    audit::record(
        &tx,
        params.get("actorId").and_then(|v| v.as_str()),
        "attendance.bulkConfirm",
        "attendance_session",
        Some(&att_id),
        Some(json!({ "requested": record_ids.len(), "confirmed": confirmed })),
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

    let attended = refresh_attended_count(conn, &att.exam_session_id)?;

    Ok(json!({ "confirmed": confirmed, "attendedStudents": attended }))
}

fn attendance_link_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let att_id = get_required_str(params, "attendanceSessionId")?;
    let expires_at = get_required_str(params, "expiresAt")?;
    if DateTime::parse_from_rfc3339(&expires_at).is_err() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "expiresAt must be an RFC3339 timestamp".to_string(),
            details: None,
        });
    }

    let att = load_att_session(conn, &att_id)?;
    if att.status == "ended" {
        return Err(HandlerErr {
            code: "invalid_transition",
            message: "cannot create a link for an ended session".to_string(),
            details: None,
        });
    }

    let link_id = Uuid::new_v4().to_string();
    let token = Uuid::new_v4().simple().to_string();
    conn.execute(
        "INSERT INTO attendance_links(
            id, attendance_session_id, token, expires_at, revoked, created_at)
         VALUES(?, ?, ?, ?, 0, ?)",
        (
            &link_id,
            &att_id,
            &token,
            &expires_at,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_links" })),
    })?;

    let _ = audit::record(
        conn,
        params.get("actorId").and_then(|v| v.as_str()),
        "attendance.linkCreate",
        "attendance_session",
        Some(&att_id),
        Some(json!({ "linkId": link_id, "expiresAt": expires_at })),
    );

    Ok(json!({ "linkId": link_id, "token": token, "expiresAt": expires_at }))
}

fn attendance_link_revoke(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let link_id = get_required_str(params, "linkId")?;
    let changed = conn
        .execute(
            "UPDATE attendance_links SET revoked = 1 WHERE id = ?",
            [&link_id],
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_links" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "link not found".to_string(),
            details: None,
        });
    }

    let _ = audit::record(
        conn,
        params.get("actorId").and_then(|v| v.as_str()),
        "attendance.linkRevoke",
        "attendance_link",
        Some(&link_id),
        None,
    );

    Ok(json!({ "ok": true }))
}

fn attendance_link_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let token = get_required_str(params, "token")?;

    let link: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT id, expires_at, revoked FROM attendance_links WHERE token = ?",
            [&token],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((link_id, expires_at, revoked)) = link else {
        return Err(HandlerErr {
            code: "link_invalid",
            message: "unknown link token".to_string(),
            details: None,
        });
    };
    if revoked != 0 {
        return Err(HandlerErr {
            code: "link_invalid",
            message: "link has been revoked".to_string(),
            details: None,
        });
    }
    let expired = DateTime::parse_from_rfc3339(&expires_at)
        .map(|t| t.with_timezone(&Utc) < Utc::now())
        .unwrap_or(true);
    if expired {
        return Err(HandlerErr {
            code: "link_invalid",
            message: "link has expired".to_string(),
            details: Some(json!({ "expiresAt": expires_at })),
        });
    }

    let att_id: String = conn
        .query_row(
            "SELECT attendance_session_id FROM attendance_links WHERE id = ?",
            [&link_id],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    let att = load_att_session(conn, &att_id)?;
    let student_id = resolve_student(conn, params)?;

    // Self-recorded links never bypass the expected list.
    insert_record(conn, &att, &student_id, "link", false)
}

fn attendance_sessions_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_session_id = get_required_str(params, "sessionId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, status, started_by, started_at, ended_at
             FROM attendance_sessions
             WHERE exam_session_id = ?
             ORDER BY started_at DESC",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([&exam_session_id], |r| {
            let id: String = r.get(0)?;
            let status: String = r.get(1)?;
            let started_by: String = r.get(2)?;
            let started_at: String = r.get(3)?;
            let ended_at: Option<String> = r.get(4)?;
            Ok(json!({
                "id": id,
                "status": status,
                "startedBy": started_by,
                "startedAt": started_at,
                "endedAt": ended_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "attendanceSessions": rows }))
}

fn attendance_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let att_id = get_required_str(params, "attendanceSessionId")?;
    load_att_session(conn, &att_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT ar.id, ar.student_id, s.index_number, s.last_name, s.first_name,
                    ar.method, ar.confirmed, ar.recorded_at
             FROM attendance_records ar
             JOIN students s ON s.id = ar.student_id
             WHERE ar.attendance_session_id = ?
             ORDER BY ar.recorded_at, ar.id",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([&att_id], |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let index_number: String = r.get(2)?;
            let last_name: String = r.get(3)?;
            let first_name: String = r.get(4)?;
            let method: String = r.get(5)?;
            let confirmed: i64 = r.get(6)?;
            let recorded_at: String = r.get(7)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "indexNumber": index_number,
                "lastName": last_name,
                "firstName": first_name,
                "method": method,
                "confirmed": confirmed != 0,
                "recordedAt": recorded_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "records": rows }))
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
        "attendance.start" => Some(with_db(state, req, attendance_start)),
        "attendance.pause" => Some(with_db(state, req, |c, p| {
            set_att_status(c, p, &["in_progress"], "paused", "attendance.pause")
        })),
        "attendance.resume" => Some(with_db(state, req, |c, p| {
            set_att_status(c, p, &["paused"], "in_progress", "attendance.resume")
        })),
        "attendance.end" => Some(with_db(state, req, |c, p| {
            set_att_status(c, p, &["in_progress", "paused"], "ended", "attendance.end")
        })),
        "attendance.record" => Some(with_db(state, req, attendance_record)),
        "attendance.bulkConfirm" => Some(with_db(state, req, attendance_bulk_confirm)),
        "attendance.linkCreate" => Some(with_db(state, req, attendance_link_create)),
        "attendance.linkRevoke" => Some(with_db(state, req, attendance_link_revoke)),
        "attendance.linkRecord" => Some(with_db(state, req, attendance_link_record)),
        "attendance.sessions" => Some(with_db(state, req, attendance_sessions_list)),
        "attendance.list" => Some(with_db(state, req, attendance_list)),
        _ => None,
    }
}
