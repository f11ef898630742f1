use crate::audit;
use crate::custody::{self, TransferFacts, TransferStatus};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::users::fetch_role;
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
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
struct TransferRow {
    id: String,
    exam_session_id: String,
    from_handler_id: String,
    to_handler_id: String,
    exams_expected: i64,
    exams_received: Option<i64>,
    status: String,
    location: Option<String>,
    requested_at: String,
    confirmed_at: Option<String>,
    discrepancy_note: Option<String>,
    resolution_note: Option<String>,
}

impl TransferRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "examSessionId": self.exam_session_id,
            "fromHandlerId": self.from_handler_id,
            "toHandlerId": self.to_handler_id,
            "examsExpected": self.exams_expected,
            "examsReceived": self.exams_received,
            "status": self.status,
            "location": self.location,
            "requestedAt": self.requested_at,
            "confirmedAt": self.confirmed_at,
            "discrepancyNote": self.discrepancy_note,
            "resolutionNote": self.resolution_note
        })
    }
}

const TRANSFER_COLUMNS: &str = "id, exam_session_id, from_handler_id, to_handler_id,
     exams_expected, exams_received, status, location, requested_at, confirmed_at,
     discrepancy_note, resolution_note";

fn transfer_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TransferRow> {
    Ok(TransferRow {
        id: r.get(0)?,
        exam_session_id: r.get(1)?,
        from_handler_id: r.get(2)?,
        to_handler_id: r.get(3)?,
        exams_expected: r.get(4)?,
        exams_received: r.get(5)?,
        status: r.get(6)?,
        location: r.get(7)?,
        requested_at: r.get(8)?,
        confirmed_at: r.get(9)?,
        discrepancy_note: r.get(10)?,
        resolution_note: r.get(11)?,
    })
}

fn load_transfer(conn: &Connection, transfer_id: &str) -> Result<TransferRow, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM batch_transfers WHERE id = ?",
        TRANSFER_COLUMNS
    );
    conn.query_row(&sql, [transfer_id], transfer_from_row)
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: "transfer not found".to_string(),
            details: None,
        })
}

/// The minimal per-transfer facts the pure custody derivation consumes.
pub fn load_session_facts(
    conn: &Connection,
    session_id: &str,
) -> rusqlite::Result<Vec<TransferFacts>> {
    let mut stmt = conn.prepare(
        "SELECT id, exam_session_id, from_handler_id, to_handler_id, status, requested_at
         FROM batch_transfers WHERE exam_session_id = ?",
    )?;
    let rows = stmt.query_map([session_id], facts_from_row)?;
    rows.collect()
}

fn load_handler_facts(conn: &Connection, handler_id: &str) -> rusqlite::Result<Vec<TransferFacts>> {
    let mut stmt = conn.prepare(
        "SELECT id, exam_session_id, from_handler_id, to_handler_id, status, requested_at
         FROM batch_transfers WHERE from_handler_id = ?1 OR to_handler_id = ?1",
    )?;
    let rows = stmt.query_map([handler_id], facts_from_row)?;
    rows.collect()
}

fn facts_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TransferFacts> {
    let status_raw: String = r.get(4)?;
    Ok(TransferFacts {
        id: r.get(0)?,
        session_id: r.get(1)?,
        from_handler_id: r.get(2)?,
        to_handler_id: r.get(3)?,
        status: TransferStatus::parse(&status_raw).unwrap_or(TransferStatus::Cancelled),
        requested_at: r.get(5)?,
    })
}

fn require_handler(conn: &Connection, user_id: &str) -> Result<custody::Role, HandlerErr> {
    let role = fetch_role(conn, user_id).map_err(db_err)?;
    let Some(role) = role else {
        return Err(HandlerErr {
            code: "not_found",
            message: "handler not found or inactive".to_string(),
            details: Some(json!({ "userId": user_id })),
        });
    };
    if !role.can_hold_custody() && !role.is_admin() {
        return Err(HandlerErr {
            code: "forbidden",
            message: "role may not hold script custody".to_string(),
            details: Some(json!({ "role": role.as_str() })),
        });
    }
    Ok(role)
}

fn transfers_request(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let session_id = get_required_str(params, "sessionId")?;
    let to_handler_id = get_required_str(params, "toHandlerId")?;
    let exams_expected = params
        .get("examsExpected")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing examsExpected".to_string(),
            details: None,
        })?;
    if exams_expected <= 0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "examsExpected must be positive".to_string(),
            details: None,
        });
    }
    if actor_id == to_handler_id {
        return Err(HandlerErr {
            code: "bad_params",
            message: "cannot transfer a batch to yourself".to_string(),
            details: None,
        });
    }
    let location = params
        .get("location")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    require_handler(conn, &actor_id)?;
    require_handler(conn, &to_handler_id)?;

    let session_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM exam_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if session_exists.is_none() {
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

    // One open handoff per batch. Concurrent senders hit this, not the
    // receiver's inbox.
    let open_pending: Option<String> = tx
        .query_row(
            "SELECT id FROM batch_transfers WHERE exam_session_id = ? AND status = 'pending'",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if let Some(pending_id) = open_pending {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "conflict",
            message: "a pending transfer already exists for this session".to_string(),
            details: Some(json!({ "pendingTransferId": pending_id })),
        });
    }

    let transfer_id = Uuid::new_v4().to_string();
    let requested_at = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO batch_transfers(
            id, exam_session_id, from_handler_id, to_handler_id,
            exams_expected, status, location, requested_at)
         VALUES(?, ?, ?, ?, ?, 'pending', ?, ?)",
        rusqlite::params![
            &transfer_id,
            &session_id,
            &actor_id,
            &to_handler_id,
            exams_expected,
            &location,
            &requested_at,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "batch_transfers" })),
    })?;

    audit::record(
        &tx,
        Some(&actor_id),
        "transfers.request",
        "batch_transfer",
        Some(&transfer_id),
        Some(json!({
            "sessionId": session_id,
            "toHandlerId": to_handler_id,
            "examsExpected": exams_expected
        })),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "audit_log" })),
    })?;
    audit::emit_event(
        &tx,
        "transfer:requested",
        json!({ "transferId": transfer_id, "sessionId": session_id }),
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

    Ok(json!({ "transferId": transfer_id, "requestedAt": requested_at }))
}

fn transfers_confirm(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let transfer_id = get_required_str(params, "transferId")?;
    let received = params
        .get("receivedCount")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "missing receivedCount".to_string(),
            details: None,
        })?;
    if received < 0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "receivedCount must not be negative".to_string(),
            details: None,
        });
    }
    let discrepancy_note = params
        .get("discrepancyNote")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let transfer = load_transfer(conn, &transfer_id)?;

    // Double-confirms from stale devices return the stored record untouched;
    // examsReceived and confirmedAt never move after the first confirm.
    if transfer.status != TransferStatus::Pending.as_str() {
        return Ok(json!({
            "transfer": transfer.to_json(),
            "alreadyFinal": true
        }));
    }

    if transfer.to_handler_id != actor_id {
        return Err(HandlerErr {
            code: "forbidden",
            message: "only the receiving handler may confirm".to_string(),
            details: Some(json!({ "toHandlerId": transfer.to_handler_id })),
        });
    }

    let outcome = custody::confirm_outcome(transfer.exams_expected, received);
    if outcome == TransferStatus::DiscrepancyReported && discrepancy_note.is_none() {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!(
                "received {} of {} expected; discrepancyNote is required",
                received, transfer.exams_expected
            ),
            details: Some(json!({
                "examsExpected": transfer.exams_expected,
                "receivedCount": received
            })),
        });
    }

    let confirmed_at = Utc::now().to_rfc3339();
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    let changed = tx
        .execute(
            "UPDATE batch_transfers
             SET exams_received = ?, status = ?, confirmed_at = ?, discrepancy_note = ?
             WHERE id = ? AND status = 'pending'",
            rusqlite::params![
                received,
                outcome.as_str(),
                &confirmed_at,
                &discrepancy_note,
                &transfer_id,
            ],
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "batch_transfers" })),
        })?;
    if changed == 0 {
        // Lost a race with another confirm; surface the stored row.
        let _ = tx.rollback();
        let current = load_transfer(conn, &transfer_id)?;
        return Ok(json!({ "transfer": current.to_json(), "alreadyFinal": true }));
    }

    audit::record(
        &tx,
        Some(&actor_id),
        "transfers.confirm",
        "batch_transfer",
        Some(&transfer_id),
        Some(json!({
            "outcome": outcome.as_str(),
            "examsExpected": transfer.exams_expected,
            "receivedCount": received
        })),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "audit_log" })),
    })?;
    let event_kind = match outcome {
        TransferStatus::DiscrepancyReported => "transfer:discrepancy",
        _ => "transfer:confirmed",
    };
    audit::emit_event(
        &tx,
        event_kind,
        json!({
            "transferId": transfer_id,
            "sessionId": transfer.exam_session_id,
            "toHandlerId": transfer.to_handler_id
        }),
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

    let updated = load_transfer(conn, &transfer_id)?;
    Ok(json!({ "transfer": updated.to_json(), "alreadyFinal": false }))
}

fn transfers_resolve(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let transfer_id = get_required_str(params, "transferId")?;
    let resolution_note = get_required_str(params, "resolutionNote")?;
    if resolution_note.trim().is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "resolutionNote must not be empty".to_string(),
            details: None,
        });
    }

    let role = fetch_role(conn, &actor_id).map_err(db_err)?;
    let Some(role) = role else {
        return Err(HandlerErr {
            code: "not_found",
            message: "actor not found or inactive".to_string(),
            details: None,
        });
    };
    if !role.can_resolve_discrepancies() {
        return Err(HandlerErr {
            code: "forbidden",
            message: "role may not resolve discrepancies".to_string(),
            details: Some(json!({ "role": role.as_str() })),
        });
    }

    let transfer = load_transfer(conn, &transfer_id)?;
    if transfer.status != TransferStatus::DiscrepancyReported.as_str() {
        return Err(HandlerErr {
            code: "invalid_transition",
            message: "transfer has no open discrepancy".to_string(),
            details: Some(json!({ "status": transfer.status })),
        });
    }

    conn.execute(
        "UPDATE batch_transfers SET status = 'resolved', resolution_note = ? WHERE id = ?",
        (resolution_note.trim(), &transfer_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "batch_transfers" })),
    })?;

    let _ = audit::record(
        conn,
        Some(&actor_id),
        "transfers.resolve",
        "batch_transfer",
        Some(&transfer_id),
        Some(json!({ "sessionId": transfer.exam_session_id })),
    );

    let updated = load_transfer(conn, &transfer_id)?;
    Ok(json!({ "transfer": updated.to_json() }))
}

fn transfers_cancel(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor_id = get_required_str(params, "actorId")?;
    let transfer_id = get_required_str(params, "transferId")?;

    let role = fetch_role(conn, &actor_id).map_err(db_err)?;
    let Some(role) = role else {
        return Err(HandlerErr {
            code: "not_found",
            message: "actor not found or inactive".to_string(),
            details: None,
        });
    };

    let transfer = load_transfer(conn, &transfer_id)?;
    if transfer.status != TransferStatus::Pending.as_str() {
        return Err(HandlerErr {
            code: "not_pending",
            message: "only pending transfers can be cancelled".to_string(),
            details: Some(json!({ "status": transfer.status })),
        });
    }
    if transfer.from_handler_id != actor_id && !role.is_admin() {
        return Err(HandlerErr {
            code: "forbidden",
            message: "only the sender or an admin may cancel".to_string(),
            details: None,
        });
    }

    let changed = conn
        .execute(
            "UPDATE batch_transfers SET status = 'cancelled' WHERE id = ? AND status = 'pending'",
            [&transfer_id],
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "batch_transfers" })),
        })?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_pending",
            message: "transfer settled before the cancel landed".to_string(),
            details: None,
        });
    }

    let _ = audit::record(
        conn,
        Some(&actor_id),
        "transfers.cancel",
        "batch_transfer",
        Some(&transfer_id),
        Some(json!({ "sessionId": transfer.exam_session_id })),
    );

    Ok(json!({ "ok": true }))
}

fn transfers_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = params.get("sessionId").and_then(|v| v.as_str());
    let handler_id = params.get("handlerId").and_then(|v| v.as_str());

    let sql_base = format!("SELECT {} FROM batch_transfers", TRANSFER_COLUMNS);
    let rows = match (session_id, handler_id) {
        (Some(sid), _) => {
            let sql = format!(
                "{} WHERE exam_session_id = ? ORDER BY requested_at DESC, id DESC",
                sql_base
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            stmt.query_map([sid], transfer_from_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(db_err)?
        }
        (None, Some(hid)) => {
            let sql = format!(
                "{} WHERE from_handler_id = ?1 OR to_handler_id = ?1
                 ORDER BY requested_at DESC, id DESC",
                sql_base
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            stmt.query_map([hid], transfer_from_row)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(db_err)?
        }
        (None, None) => {
            return Err(HandlerErr {
                code: "bad_params",
                message: "provide sessionId or handlerId".to_string(),
                details: None,
            });
        }
    };

    Ok(json!({
        "transfers": rows.iter().map(TransferRow::to_json).collect::<Vec<_>>()
    }))
}

/// Full chain for one batch plus the derived current custodian.
fn transfers_history(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;

    let session_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM exam_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if session_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam session not found".to_string(),
            details: None,
        });
    }

    let sql = format!(
        "SELECT {} FROM batch_transfers WHERE exam_session_id = ?
         ORDER BY requested_at DESC, id DESC",
        TRANSFER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map([&session_id], transfer_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let facts = load_session_facts(conn, &session_id).map_err(db_err)?;
    let custodian = custody::current_custodian(&facts).map(|s| s.to_string());

    Ok(json!({
        "sessionId": session_id,
        "currentCustodianId": custodian,
        "transfers": rows.iter().map(TransferRow::to_json).collect::<Vec<_>>()
    }))
}

/// Per-handler dashboard: one entry per session the handler has touched,
/// classified from the latest transfer.
fn custody_overview(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let handler_id = get_required_str(params, "handlerId")?;
    let facts = load_handler_facts(conn, &handler_id).map_err(db_err)?;
    let views = custody::derive_overview(&handler_id, &facts);

    let mut batches: Vec<serde_json::Value> = Vec::with_capacity(views.len());
    let mut stmt = conn
        .prepare(
            "SELECT batch_qr_code, course_code, course_name, status
             FROM exam_sessions WHERE id = ?",
        )
        .map_err(db_err)?;
    for view in &views {
        let session: Option<(String, String, String, String)> = stmt
            .query_row([view.session_id.as_str()], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })
            .optional()
            .map_err(db_err)?;
        let Some((batch_qr_code, course_code, course_name, status)) = session else {
            continue;
        };
        batches.push(json!({
            "sessionId": view.session_id,
            "batchQrCode": batch_qr_code,
            "courseCode": course_code,
            "courseName": course_name,
            "sessionStatus": status,
            "custodyState": view.state.as_str(),
            "pendingTransferCount": view.pending_transfer_count,
            "latestTransferId": view.latest_transfer_id
        }));
    }

    Ok(json!({ "handlerId": handler_id, "batches": batches }))
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
        "transfers.request" => Some(with_db(state, req, transfers_request)),
        "transfers.confirm" => Some(with_db(state, req, transfers_confirm)),
        "transfers.resolve" => Some(with_db(state, req, transfers_resolve)),
        "transfers.cancel" => Some(with_db(state, req, transfers_cancel)),
        "transfers.list" => Some(with_db(state, req, transfers_list)),
        "transfers.history" => Some(with_db(state, req, transfers_history)),
        "custody.overview" => Some(with_db(state, req, custody_overview)),
        _ => None,
    }
}
