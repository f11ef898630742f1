use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_audit_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let params = &req.params;

    let mut sql = String::from(
        "SELECT id, actor_id, action, entity_type, entity_id, details, created_at
         FROM audit_log",
    );
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<String> = Vec::new();

    if let Some(actor) = params.get("actorId").and_then(|v| v.as_str()) {
        clauses.push("actor_id = ?".to_string());
        args.push(actor.to_string());
    }
    if let Some(prefix) = params.get("actionPrefix").and_then(|v| v.as_str()) {
        clauses.push("action LIKE ?".to_string());
        args.push(format!("{}%", prefix));
    }
    if let Some(entity_type) = params.get("entityType").and_then(|v| v.as_str()) {
        clauses.push("entity_type = ?".to_string());
        args.push(entity_type.to_string());
    }
    if let Some(entity_id) = params.get("entityId").and_then(|v| v.as_str()) {
        clauses.push("entity_id = ?".to_string());
        args.push(entity_id.to_string());
    }
    if let Some(since) = params.get("since").and_then(|v| v.as_str()) {
        clauses.push("created_at >= ?".to_string());
        args.push(since.to_string());
    }
    if let Some(until) = params.get("until").and_then(|v| v.as_str()) {
        clauses.push("created_at <= ?".to_string());
        args.push(until.to_string());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    let limit = params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(200)
        .clamp(1, 1000);
    sql.push_str(&format!(
        " ORDER BY created_at DESC, id DESC LIMIT {}",
        limit
    ));

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            let id: String = r.get(0)?;
            let actor_id: Option<String> = r.get(1)?;
            let action: String = r.get(2)?;
            let entity_type: String = r.get(3)?;
            let entity_id: Option<String> = r.get(4)?;
            let details: Option<String> = r.get(5)?;
            let created_at: String = r.get(6)?;
            Ok(json!({
                "id": id,
                "actorId": actor_id,
                "action": action,
                "entityType": entity_type,
                "entityId": entity_id,
                "details": details
                    .and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok()),
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(entries) => ok(&req.id, json!({ "entries": entries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_audit_list(state, req)),
        _ => None,
    }
}
