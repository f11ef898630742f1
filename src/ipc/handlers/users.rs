use crate::audit;
use crate::custody::Role;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn fetch_role(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<Role>> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM users WHERE id = ? AND active = 1",
            [user_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(role.as_deref().and_then(Role::parse))
}

fn user_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = r.get(0)?;
    let name: String = r.get(1)?;
    let email: String = r.get(2)?;
    let role: String = r.get(3)?;
    let department: Option<String> = r.get(4)?;
    let active: i64 = r.get(5)?;
    let created_at: String = r.get(6)?;
    Ok(json!({
        "id": id,
        "name": name,
        "email": email,
        "role": role,
        "department": department,
        "active": active != 0,
        "createdAt": created_at
    }))
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "users": [] }));
    };

    let role_filter = req
        .params
        .get("role")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(r) = role_filter.as_deref() {
        if Role::parse(r).is_none() {
            return err(&req.id, "bad_params", format!("unknown role: {}", r), None);
        }
    }

    let result = match role_filter {
        Some(r) => {
            let mut stmt = match conn.prepare(
                "SELECT id, name, email, role, department, active, created_at
                 FROM users WHERE role = ? ORDER BY name",
            ) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            stmt.query_map([&r], user_row_json)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        }
        None => {
            let mut stmt = match conn.prepare(
                "SELECT id, name, email, role, department, active, created_at
                 FROM users ORDER BY name",
            ) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            stmt.query_map([], user_row_json)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        }
    };

    match result {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let email = match req.params.get("email").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_ascii_lowercase(),
        _ => return err(&req.id, "bad_params", "missing email", None),
    };
    let role_raw = match req.params.get("role").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing role", None),
    };
    let Some(role) = Role::parse(&role_raw) else {
        return err(
            &req.id,
            "bad_params",
            format!("unknown role: {}", role_raw),
            None,
        );
    };
    let department = req
        .params
        .get("department")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    let taken: Option<i64> = match conn
        .query_row("SELECT 1 FROM users WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(
            &req.id,
            "duplicate",
            "a user with this email already exists",
            None,
        );
    }

    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, name, email, role, department, active, created_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (
            &user_id,
            &name,
            &email,
            role.as_str(),
            &department,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    // Audit is best-effort once the row is committed.
    let _ = audit::record(
        conn,
        req.params.get("actorId").and_then(|v| v.as_str()),
        "users.create",
        "user",
        Some(&user_id),
        Some(json!({ "email": email, "role": role.as_str() })),
    );

    ok(
        &req.id,
        json!({ "userId": user_id, "name": name, "role": role.as_str() }),
    )
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let Some(patch) = req.params.get("patch") else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "user not found", None);
    }

    if let Some(name) = patch.get("name").and_then(|v| v.as_str()) {
        if name.trim().is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE users SET name = ? WHERE id = ?",
            (name.trim(), &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(role_raw) = patch.get("role").and_then(|v| v.as_str()) {
        let Some(role) = Role::parse(role_raw) else {
            return err(
                &req.id,
                "bad_params",
                format!("unknown role: {}", role_raw),
                None,
            );
        };
        if let Err(e) = conn.execute(
            "UPDATE users SET role = ? WHERE id = ?",
            (role.as_str(), &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(department) = patch.get("department").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE users SET department = ? WHERE id = ?",
            (department.trim(), &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(active) = patch.get("active").and_then(|v| v.as_bool()) {
        if let Err(e) = conn.execute(
            "UPDATE users SET active = ? WHERE id = ?",
            (active as i64, &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    let _ = audit::record(
        conn,
        req.params.get("actorId").and_then(|v| v.as_str()),
        "users.update",
        "user",
        Some(&user_id),
        Some(patch.clone()),
    );

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(handle_users_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        _ => None,
    }
}
