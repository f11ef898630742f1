use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn bundle_error_code(message: &str) -> &'static str {
    if message.contains("digest mismatch") {
        "bundle_digest_mismatch"
    } else if message.contains("unsupported bundle format") {
        "bundle_format_unsupported"
    } else {
        "io_failed"
    }
}

fn handle_backup_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256
        }),
    )
}

fn handle_backup_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }
    if let Err(e) = std::fs::create_dir_all(&workspace_path) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": workspace_path.to_string_lossy() })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            let message = e.to_string();
            let code = bundle_error_code(&message);
            // The old database file is untouched on failure; reopen it.
            if let Ok(conn) = db::open_db(&workspace_path) {
                state.db = Some(conn);
            }
            return err(
                &req.id,
                code,
                message,
                Some(json!({ "path": src.to_string_lossy() })),
            );
        }
    };

    match db::open_db(&workspace_path) {
        Ok(conn) => {
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": import.bundle_format_detected
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", e.to_string(), None),
    }
}

/// Chain-of-custody export for one batch: every transfer, oldest first, in
/// a shape auditors can file.
fn handle_exchange_export_transfers_csv(
    state: &mut AppState,
    req: &Request,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match req.params.get("sessionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing sessionId", None),
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT es.batch_qr_code, es.course_code,
                uf.name, ut.name,
                t.exams_expected, t.exams_received, t.status,
                t.requested_at, t.confirmed_at,
                t.discrepancy_note, t.resolution_note
         FROM batch_transfers t
         JOIN exam_sessions es ON es.id = t.exam_session_id
         JOIN users uf ON uf.id = t.from_handler_id
         JOIN users ut ON ut.id = t.to_handler_id
         WHERE t.exam_session_id = ?
         ORDER BY t.requested_at, t.id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&session_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, Option<i64>>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, Option<String>>(8)?,
                r.get::<_, Option<String>>(9)?,
                r.get::<_, Option<String>>(10)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut csv = String::from(
        "batch_qr_code,course_code,from_handler,to_handler,exams_expected,exams_received,status,requested_at,confirmed_at,discrepancy_note,resolution_note\r\n",
    );
    let count = rows.len();
    for (
        batch_qr_code,
        course_code,
        from_name,
        to_name,
        expected,
        received,
        status,
        requested_at,
        confirmed_at,
        discrepancy_note,
        resolution_note,
    ) in rows
    {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{}\r\n",
            csv_quote(&batch_qr_code),
            csv_quote(&course_code),
            csv_quote(&from_name),
            csv_quote(&to_name),
            expected,
            received.map(|v| v.to_string()).unwrap_or_default(),
            csv_quote(&status),
            csv_quote(&requested_at),
            csv_quote(confirmed_at.as_deref().unwrap_or("")),
            csv_quote(discrepancy_note.as_deref().unwrap_or("")),
            csv_quote(resolution_note.as_deref().unwrap_or(""))
        ));
    }

    if let Err(e) = std::fs::write(&out_path, csv) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "outPath": out_path })),
        );
    }

    ok(&req.id, json!({ "outPath": out_path, "rows": count }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import_workspace_bundle(state, req)),
        "exchange.exportTransfersCsv" => Some(handle_exchange_export_transfers_csv(state, req)),
        _ => None,
    }
}
