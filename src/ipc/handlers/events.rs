use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

/// Cursor-based outbox poll. Clients pass the last seq they have seen and
/// refetch whatever the returned events invalidate.
fn handle_events_poll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let after_seq = req
        .params
        .get("afterSeq")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(100)
        .clamp(1, 500);

    let mut stmt = match conn.prepare(
        "SELECT seq, kind, payload, created_at FROM events
         WHERE seq > ? ORDER BY seq LIMIT ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([after_seq, limit], |r| {
            let seq: i64 = r.get(0)?;
            let kind: String = r.get(1)?;
            let payload: String = r.get(2)?;
            let created_at: String = r.get(3)?;
            Ok(json!({
                "seq": seq,
                "kind": kind,
                "payload": serde_json::from_str::<serde_json::Value>(&payload)
                    .unwrap_or(serde_json::Value::Null),
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(events) => {
            let last_seq = events
                .last()
                .and_then(|e| e.get("seq"))
                .and_then(|v| v.as_i64())
                .unwrap_or(after_seq);
            ok(&req.id, json!({ "events": events, "lastSeq": last_seq }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "events.poll" => Some(handle_events_poll(state, req)),
        _ => None,
    }
}
