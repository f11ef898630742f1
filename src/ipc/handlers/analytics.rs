use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::DateTime;
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

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

fn count(conn: &Connection, sql: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [], |r| r.get(0)).map_err(db_err)
}

fn analytics_overview(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let students = count(conn, "SELECT COUNT(*) FROM students WHERE active = 1")?;
    let users = count(conn, "SELECT COUNT(*) FROM users WHERE active = 1")?;
    let sessions = count(conn, "SELECT COUNT(*) FROM exam_sessions")?;
    let pending_transfers = count(
        conn,
        "SELECT COUNT(*) FROM batch_transfers WHERE status = 'pending'",
    )?;
    let open_discrepancies = count(
        conn,
        "SELECT COUNT(*) FROM batch_transfers WHERE status = 'discrepancy_reported'",
    )?;
    let open_incidents = count(
        conn,
        "SELECT COUNT(*) FROM incidents WHERE status NOT IN ('resolved', 'closed')",
    )?;

    let mut by_status: HashMap<String, i64> = HashMap::new();
    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM exam_sessions GROUP BY status")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    for (status, n) in rows {
        by_status.insert(status, n);
    }

    Ok(json!({
        "students": students,
        "users": users,
        "examSessions": sessions,
        "sessionsByStatus": by_status,
        "pendingTransfers": pending_transfers,
        "openDiscrepancies": open_discrepancies,
        "openIncidents": open_incidents
    }))
}

fn latency_seconds(requested_at: &str, confirmed_at: &str) -> Option<f64> {
    let requested = DateTime::parse_from_rfc3339(requested_at).ok()?;
    let confirmed = DateTime::parse_from_rfc3339(confirmed_at).ok()?;
    let delta = confirmed.signed_duration_since(requested);
    Some(delta.num_milliseconds() as f64 / 1000.0)
}

/// Per receiving handler: volume, discrepancy count, and how quickly they
/// confirm handoffs.
fn analytics_handler_performance(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    struct Acc {
        name: String,
        role: String,
        confirmed: i64,
        discrepancies: i64,
        latency_sum: f64,
        latency_n: i64,
    }

    let mut stmt = conn
        .prepare(
            "SELECT t.to_handler_id, u.name, u.role, t.status, t.requested_at, t.confirmed_at
             FROM batch_transfers t
             JOIN users u ON u.id = t.to_handler_id
             WHERE t.status IN ('confirmed', 'discrepancy_reported', 'resolved')",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut by_handler: HashMap<String, Acc> = HashMap::new();
    for (handler_id, name, role, status, requested_at, confirmed_at) in rows {
        let acc = by_handler.entry(handler_id).or_insert(Acc {
            name,
            role,
            confirmed: 0,
            discrepancies: 0,
            latency_sum: 0.0,
            latency_n: 0,
        });
        acc.confirmed += 1;
        if status != "confirmed" {
            acc.discrepancies += 1;
        }
        if let Some(confirmed_at) = confirmed_at.as_deref() {
            if let Some(secs) = latency_seconds(&requested_at, confirmed_at) {
                acc.latency_sum += secs;
                acc.latency_n += 1;
            }
        }
    }

    let mut handlers: Vec<serde_json::Value> = by_handler
        .into_iter()
        .map(|(handler_id, acc)| {
            let mean_latency = if acc.latency_n > 0 {
                Some(acc.latency_sum / acc.latency_n as f64)
            } else {
                None
            };
            json!({
                "handlerId": handler_id,
                "name": acc.name,
                "role": acc.role,
                "transfersConfirmed": acc.confirmed,
                "discrepancies": acc.discrepancies,
                "meanConfirmLatencySeconds": mean_latency
            })
        })
        .collect();
    handlers.sort_by(|a, b| {
        let ka = a.get("transfersConfirmed").and_then(|v| v.as_i64());
        let kb = b.get("transfersConfirmed").and_then(|v| v.as_i64());
        kb.cmp(&ka)
    });

    Ok(json!({ "handlers": handlers }))
}

fn analytics_discrepancies(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.exam_session_id, es.batch_qr_code, es.course_code,
                    t.from_handler_id, t.to_handler_id,
                    t.exams_expected, t.exams_received, t.status,
                    t.discrepancy_note, t.resolution_note, t.confirmed_at
             FROM batch_transfers t
             JOIN exam_sessions es ON es.id = t.exam_session_id
             WHERE t.status IN ('discrepancy_reported', 'resolved')
             ORDER BY t.confirmed_at DESC",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            let expected: i64 = r.get(6)?;
            let received: Option<i64> = r.get(7)?;
            let id: String = r.get(0)?;
            let session_id: String = r.get(1)?;
            let batch_qr_code: String = r.get(2)?;
            let course_code: String = r.get(3)?;
            let from_handler: String = r.get(4)?;
            let to_handler: String = r.get(5)?;
            let status: String = r.get(8)?;
            let discrepancy_note: Option<String> = r.get(9)?;
            let resolution_note: Option<String> = r.get(10)?;
            let confirmed_at: Option<String> = r.get(11)?;
            Ok(json!({
                "transferId": id,
                "sessionId": session_id,
                "batchQrCode": batch_qr_code,
                "courseCode": course_code,
                "fromHandlerId": from_handler,
                "toHandlerId": to_handler,
                "examsExpected": expected,
                "examsReceived": received,
                "missing": received.map(|rcv| expected - rcv),
                "status": status,
                "discrepancyNote": discrepancy_note,
                "resolutionNote": resolution_note,
                "confirmedAt": confirmed_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "discrepancies": rows }))
}

fn analytics_exam_stats(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT es.id, es.batch_qr_code, es.course_code, es.status,
                    es.expected_students, es.attended_students,
                    (SELECT COUNT(*) FROM incidents i WHERE i.exam_session_id = es.id),
                    (SELECT COUNT(*) FROM batch_transfers t WHERE t.exam_session_id = es.id)
             FROM exam_sessions es
             ORDER BY es.exam_date DESC, es.course_code",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let batch_qr_code: String = r.get(1)?;
            let course_code: String = r.get(2)?;
            let status: String = r.get(3)?;
            let expected: i64 = r.get(4)?;
            let attended: i64 = r.get(5)?;
            let incidents: i64 = r.get(6)?;
            let transfers: i64 = r.get(7)?;
            let rate = if expected > 0 {
                Some(attended as f64 / expected as f64)
            } else {
                None
            };
            Ok(json!({
                "sessionId": id,
                "batchQrCode": batch_qr_code,
                "courseCode": course_code,
                "status": status,
                "expectedStudents": expected,
                "attendedStudents": attended,
                "attendanceRate": rate,
                "incidents": incidents,
                "transfers": transfers
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "sessions": rows }))
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
        "analytics.overview" => Some(with_db(state, req, analytics_overview)),
        "analytics.handlerPerformance" => {
            Some(with_db(state, req, analytics_handler_performance))
        }
        "analytics.discrepancies" => Some(with_db(state, req, analytics_discrepancies)),
        "analytics.examStats" => Some(with_db(state, req, analytics_exam_stats)),
        _ => None,
    }
}
