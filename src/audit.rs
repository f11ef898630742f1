use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

/// Append one audit row. Callers inside a transaction pass the transaction
/// connection so the row commits or rolls back with the mutation it records.
pub fn record(
    conn: &Connection,
    actor_id: Option<&str>,
    action: &str,
    entity_type: &str,
    entity_id: Option<&str>,
    details: Option<serde_json::Value>,
) -> anyhow::Result<()> {
    let details_text = match details {
        Some(v) => Some(serde_json::to_string(&v)?),
        None => None,
    };
    conn.execute(
        "INSERT INTO audit_log(id, actor_id, action, entity_type, entity_id, details, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            actor_id,
            action,
            entity_type,
            entity_id,
            details_text,
            Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(())
}

/// Append to the pollable event outbox. Clients consume these with
/// events.poll instead of a push socket.
pub fn emit_event(conn: &Connection, kind: &str, payload: serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO events(kind, payload, created_at) VALUES(?, ?, ?)",
        (
            kind,
            serde_json::to_string(&payload)?,
            Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(())
}
