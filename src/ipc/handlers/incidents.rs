use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

// Incident workflow is deliberately flat: any status may be set from any
// other, matching how investigations actually get reshuffled.
const STATUSES: [&str; 5] = [
    "reported",
    "investigating",
    "resolved",
    "escalated",
    "closed",
];
const SEVERITIES: [&str; 4] = ["low", "medium", "high", "critical"];
const CATEGORIES: [&str; 4] = ["malpractice", "equipment", "health", "other"];

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

fn check_member(value: &str, allowed: &[&str], what: &str) -> Result<(), HandlerErr> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(HandlerErr {
            code: "bad_params",
            message: format!("unknown {}: {}", what, value),
            details: Some(json!({ "allowed": allowed })),
        })
    }
}

fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    conn.query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(db_err)
}

fn incident_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let title: String = r.get(1)?;
    let description: String = r.get(2)?;
    let category: String = r.get(3)?;
    let severity: String = r.get(4)?;
    let status: String = r.get(5)?;
    let exam_session_id: Option<String> = r.get(6)?;
    let student_id: Option<String> = r.get(7)?;
    let reported_by: String = r.get(8)?;
    let created_at: String = r.get(9)?;
    let updated_at: Option<String> = r.get(10)?;
    Ok(json!({
        "id": id,
        "title": title,
        "description": description,
        "category": category,
        "severity": severity,
        "status": status,
        "examSessionId": exam_session_id,
        "studentId": student_id,
        "reportedBy": reported_by,
        "createdAt": created_at,
        "updatedAt": updated_at
    }))
}

const INCIDENT_COLUMNS: &str = "id, title, description, category, severity, status,
     exam_session_id, student_id, reported_by, created_at, updated_at";

fn incidents_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let title = get_required_str(params, "title")?;
    let description = get_required_str(params, "description")?;
    let category = get_required_str(params, "category")?;
    let severity = get_required_str(params, "severity")?;
    check_member(&category, &CATEGORIES, "category")?;
    check_member(&severity, &SEVERITIES, "severity")?;
    if title.trim().is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "title must not be empty".to_string(),
            details: None,
        });
    }

    if !row_exists(conn, "users", &actor_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "actor not found".to_string(),
            details: None,
        });
    }
    let session_id = params.get("sessionId").and_then(|v| v.as_str());
    if let Some(sid) = session_id {
        if !row_exists(conn, "exam_sessions", sid)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "exam session not found".to_string(),
                details: None,
            });
        }
    }
    let student_id = params.get("studentId").and_then(|v| v.as_str());
    if let Some(stid) = student_id {
        if !row_exists(conn, "students", stid)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "student not found".to_string(),
                details: None,
            });
        }
    }

    let incident_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO incidents(
            id, title, description, category, severity, status,
            exam_session_id, student_id, reported_by, created_at)
         VALUES(?, ?, ?, ?, ?, 'reported', ?, ?, ?, ?)",
        rusqlite::params![
            &incident_id,
            title.trim(),
            description.trim(),
            &category,
            &severity,
            session_id,
            student_id,
            &actor_id,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "incidents" })),
    })?;

    let _ = audit::record(
        conn,
        Some(&actor_id),
        "incidents.create",
        "incident",
        Some(&incident_id),
        Some(json!({ "category": category, "severity": severity })),
    );

    Ok(json!({ "incidentId": incident_id, "status": "reported" }))
}

fn incidents_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = format!("SELECT {} FROM incidents", INCIDENT_COLUMNS);
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<String> = Vec::new();

    if let Some(status) = params.get("status").and_then(|v| v.as_str()) {
        check_member(status, &STATUSES, "status")?;
        clauses.push("status = ?");
        args.push(status.to_string());
    }
    if let Some(severity) = params.get("severity").and_then(|v| v.as_str()) {
        check_member(severity, &SEVERITIES, "severity")?;
        clauses.push("severity = ?");
        args.push(severity.to_string());
    }
    if let Some(sid) = params.get("sessionId").and_then(|v| v.as_str()) {
        clauses.push("exam_session_id = ?");
        args.push(sid.to_string());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, id DESC");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), incident_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "incidents": rows }))
}

fn incidents_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let incident_id = get_required_str(params, "incidentId")?;
    let sql = format!("SELECT {} FROM incidents WHERE id = ?", INCIDENT_COLUMNS);
    let incident = conn
        .query_row(&sql, [&incident_id], incident_row_json)
        .optional()
        .map_err(db_err)?;
    let Some(incident) = incident else {
        return Err(HandlerErr {
            code: "not_found",
            message: "incident not found".to_string(),
            details: None,
        });
    };

    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.author_id, u.name, c.body, c.created_at
             FROM incident_comments c
             JOIN users u ON u.id = c.author_id
             WHERE c.incident_id = ?
             ORDER BY c.created_at, c.id",
        )
        .map_err(db_err)?;
    let comments = stmt
        .query_map([&incident_id], |r| {
            let id: String = r.get(0)?;
            let author_id: String = r.get(1)?;
            let author_name: String = r.get(2)?;
            let body: String = r.get(3)?;
            let created_at: String = r.get(4)?;
            Ok(json!({
                "id": id,
                "authorId": author_id,
                "authorName": author_name,
                "body": body,
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    // Timeline comes straight from the audit trail for this incident.
    let mut stmt = conn
        .prepare(
            "SELECT action, actor_id, details, created_at
             FROM audit_log
             WHERE entity_type = 'incident' AND entity_id = ?
             ORDER BY created_at, id",
        )
        .map_err(db_err)?;
    let timeline = stmt
        .query_map([&incident_id], |r| {
            let action: String = r.get(0)?;
            let actor_id: Option<String> = r.get(1)?;
            let details: Option<String> = r.get(2)?;
            let created_at: String = r.get(3)?;
            Ok(json!({
                "action": action,
                "actorId": actor_id,
                "details": details
                    .and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok()),
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    Ok(json!({
        "incident": incident,
        "comments": comments,
        "timeline": timeline
    }))
}

fn incidents_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let incident_id = get_required_str(params, "incidentId")?;
    let patch = params.get("patch").ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "missing patch".to_string(),
        details: None,
    })?;

    if !row_exists(conn, "incidents", &incident_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "incident not found".to_string(),
            details: None,
        });
    }

    if let Some(title) = patch.get("title").and_then(|v| v.as_str()) {
        if title.trim().is_empty() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "title must not be empty".to_string(),
                details: None,
            });
        }
        conn.execute(
            "UPDATE incidents SET title = ?, updated_at = ? WHERE id = ?",
            (title.trim(), Utc::now().to_rfc3339(), &incident_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    if let Some(description) = patch.get("description").and_then(|v| v.as_str()) {
        conn.execute(
            "UPDATE incidents SET description = ?, updated_at = ? WHERE id = ?",
            (description.trim(), Utc::now().to_rfc3339(), &incident_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    if let Some(severity) = patch.get("severity").and_then(|v| v.as_str()) {
        check_member(severity, &SEVERITIES, "severity")?;
        conn.execute(
            "UPDATE incidents SET severity = ?, updated_at = ? WHERE id = ?",
            (severity, Utc::now().to_rfc3339(), &incident_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    if let Some(category) = patch.get("category").and_then(|v| v.as_str()) {
        check_member(category, &CATEGORIES, "category")?;
        conn.execute(
            "UPDATE incidents SET category = ?, updated_at = ? WHERE id = ?",
            (category, Utc::now().to_rfc3339(), &incident_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }

    let _ = audit::record(
        conn,
        params.get("actorId").and_then(|v| v.as_str()),
        "incidents.update",
        "incident",
        Some(&incident_id),
        Some(patch.clone()),
    );

    Ok(json!({ "ok": true }))
}

fn incidents_update_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let incident_id = get_required_str(params, "incidentId")?;
    let status = get_required_str(params, "status")?;
    check_member(&status, &STATUSES, "status")?;

    let previous: Option<String> = conn
        .query_row(
            "SELECT status FROM incidents WHERE id = ?",
            [&incident_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(previous) = previous else {
        return Err(HandlerErr {
            code: "not_found",
            message: "incident not found".to_string(),
            details: None,
        });
    };

    conn.execute(
        "UPDATE incidents SET status = ?, updated_at = ? WHERE id = ?",
        (&status, Utc::now().to_rfc3339(), &incident_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "incidents" })),
    })?;

    let _ = audit::record(
        conn,
        Some(&actor_id),
        "incidents.updateStatus",
        "incident",
        Some(&incident_id),
        Some(json!({ "from": previous, "to": status })),
    );

    Ok(json!({ "incidentId": incident_id, "status": status }))
}

fn incidents_comment_add(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let incident_id = get_required_str(params, "incidentId")?;
    let body = get_required_str(params, "body")?;
    if body.trim().is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "body must not be empty".to_string(),
            details: None,
        });
    }

    if !row_exists(conn, "incidents", &incident_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "incident not found".to_string(),
            details: None,
        });
    }
    if !row_exists(conn, "users", &actor_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "actor not found".to_string(),
            details: None,
        });
    }

    let comment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO incident_comments(id, incident_id, author_id, body, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &comment_id,
            &incident_id,
            &actor_id,
            body.trim(),
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "incident_comments" })),
    })?;

    let _ = audit::record(
        conn,
        Some(&actor_id),
        "incidents.commentAdd",
        "incident",
        Some(&incident_id),
        Some(json!({ "commentId": comment_id })),
    );

    Ok(json!({ "commentId": comment_id }))
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
        "incidents.create" => Some(with_db(state, req, incidents_create)),
        "incidents.list" => Some(with_db(state, req, incidents_list)),
        "incidents.get" => Some(with_db(state, req, incidents_get)),
        "incidents.update" => Some(with_db(state, req, incidents_update)),
        "incidents.updateStatus" => Some(with_db(state, req, incidents_update_status)),
        "incidents.commentAdd" => Some(with_db(state, req, incidents_comment_add)),
        _ => None,
    }
}
