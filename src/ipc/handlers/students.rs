use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug)]
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

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
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

#[derive(Clone, Debug)]
struct ParsedStudentRow {
    row_no: usize,
    index_number: String,
    first_name: String,
    last_name: String,
    program: String,
    level: i64,
    email: Option<String>,
}

/// Roster CSV columns: index_number, first_name, last_name, program, level,
/// email (optional). A header line is required and skipped.
fn parse_roster_rows(text: &str) -> Result<Vec<ParsedStudentRow>, HandlerErr> {
    const FIELDS: [&str; 5] = [
        "indexNumber",
        "firstName",
        "lastName",
        "program",
        "level",
    ];
    let mut rows = Vec::new();
    for (line_no, raw_line) in text.lines().enumerate() {
        if line_no == 0 {
            continue;
        }
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let row_no = line_no + 1;
        let fields = parse_csv_record(line);
        for (i, field_name) in FIELDS.iter().enumerate() {
            if fields.get(i).map(|f| f.trim().is_empty()).unwrap_or(true) {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("row {}: missing {}", row_no, field_name),
                    details: Some(json!({ "row": row_no, "field": field_name })),
                });
            }
        }
        let level = match fields[4].trim().parse::<i64>() {
            Ok(v) => v,
            Err(_) => {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("row {}: level must be an integer", row_no),
                    details: Some(json!({ "row": row_no, "field": "level" })),
                });
            }
        };
        let email = fields
            .get(5)
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(|f| f.to_ascii_lowercase());
        rows.push(ParsedStudentRow {
            row_no,
            index_number: fields[0].trim().to_string(),
            first_name: fields[1].trim().to_string(),
            last_name: fields[2].trim().to_string(),
            program: fields[3].trim().to_string(),
            level,
            email,
        });
    }
    Ok(rows)
}

fn student_referenced(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    let referenced: Option<i64> = conn
        .query_row(
            "SELECT 1 WHERE EXISTS(
                 SELECT 1 FROM attendance_records WHERE student_id = ?1
             ) OR EXISTS(
                 SELECT 1 FROM session_expected_students WHERE student_id = ?1
             ) OR EXISTS(
                 SELECT 1 FROM incidents WHERE student_id = ?1
             )",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    Ok(referenced.is_some())
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let search = params
        .get("search")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut sql = String::from(
        "SELECT id, index_number, last_name, first_name, program, level, email, active
         FROM students",
    );
    let mut args: Vec<String> = Vec::new();
    if let Some(q) = search {
        sql.push_str(
            " WHERE index_number LIKE ?1 OR last_name LIKE ?1 OR first_name LIKE ?1",
        );
        args.push(format!("%{}%", q));
    }
    sql.push_str(" ORDER BY last_name, first_name");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            let id: String = r.get(0)?;
            let index_number: String = r.get(1)?;
            let last_name: String = r.get(2)?;
            let first_name: String = r.get(3)?;
            let program: String = r.get(4)?;
            let level: i64 = r.get(5)?;
            let email: Option<String> = r.get(6)?;
            let active: i64 = r.get(7)?;
            Ok(json!({
                "id": id,
                "indexNumber": index_number,
                "lastName": last_name,
                "firstName": first_name,
                "program": program,
                "level": level,
                "email": email,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    Ok(json!({ "students": rows }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let index_number = get_required_str(params, "indexNumber")?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let program = get_required_str(params, "program")?;
    let level = params
        .get("level")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "level must be an integer".to_string(),
            details: None,
        })?;
    let email = params
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_ascii_lowercase());

    let taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE index_number = ?",
            [index_number.trim()],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if taken.is_some() {
        return Err(HandlerErr {
            code: "duplicate",
            message: "a student with this index number already exists".to_string(),
            details: None,
        });
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, index_number, last_name, first_name, program, level, email, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &student_id,
            index_number.trim(),
            last_name.trim(),
            first_name.trim(),
            program.trim(),
            level,
            &email,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    let _ = audit::record(
        conn,
        params.get("actorId").and_then(|v| v.as_str()),
        "students.create",
        "student",
        Some(&student_id),
        Some(json!({ "indexNumber": index_number.trim() })),
    );

    Ok(json!({ "studentId": student_id }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let patch = params.get("patch").ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "missing patch".to_string(),
        details: None,
    })?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let columns = [
        ("firstName", "first_name"),
        ("lastName", "last_name"),
        ("program", "program"),
        ("email", "email"),
    ];
    for (key, column) in columns {
        if let Some(v) = patch.get(key).and_then(|v| v.as_str()) {
            let sql = format!("UPDATE students SET {} = ?, updated_at = ? WHERE id = ?", column);
            conn.execute(&sql, (v.trim(), Utc::now().to_rfc3339(), &student_id))
                .map_err(|e| HandlerErr {
                    code: "db_update_failed",
                    message: e.to_string(),
                    details: None,
                })?;
        }
    }
    if let Some(level) = patch.get("level").and_then(|v| v.as_i64()) {
        conn.execute(
            "UPDATE students SET level = ?, updated_at = ? WHERE id = ?",
            (level, Utc::now().to_rfc3339(), &student_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    }
    if let Some(active) = patch.get("active").and_then(|v| v.as_bool()) {
        conn.execute(
            "UPDATE students SET active = ?, updated_at = ? WHERE id = ?",
            (active as i64, Utc::now().to_rfc3339(), &student_id),
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
        "students.update",
        "student",
        Some(&student_id),
        Some(patch.clone()),
    );

    Ok(json!({ "ok": true }))
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    // Referenced students deactivate instead of disappearing from history.
    let soft = student_referenced(conn, &student_id)?;
    if soft {
        conn.execute(
            "UPDATE students SET active = 0, updated_at = ? WHERE id = ?",
            (Utc::now().to_rfc3339(), &student_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    } else {
        conn.execute("DELETE FROM students WHERE id = ?", [&student_id])
            .map_err(|e| HandlerErr {
                code: "db_delete_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "students" })),
            })?;
    }

    let _ = audit::record(
        conn,
        params.get("actorId").and_then(|v| v.as_str()),
        "students.delete",
        "student",
        Some(&student_id),
        Some(json!({ "deactivated": soft })),
    );

    Ok(json!({ "deactivated": soft }))
}

fn students_import_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let text = get_required_str(params, "csv")?;
    let rows = parse_roster_rows(&text)?;

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut inserted = 0usize;
    let mut updated = 0usize;
    for row in &rows {
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM students WHERE index_number = ?",
                [&row.index_number],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match existing {
            Some(student_id) => {
                tx.execute(
                    "UPDATE students
                     SET last_name = ?, first_name = ?, program = ?, level = ?, email = ?, updated_at = ?
                     WHERE id = ?",
                    (
                        &row.last_name,
                        &row.first_name,
                        &row.program,
                        row.level,
                        &row.email,
                        Utc::now().to_rfc3339(),
                        &student_id,
                    ),
                )
                .map_err(|e| HandlerErr {
                    code: "db_update_failed",
                    message: format!("row {}: {}", row.row_no, e),
                    details: None,
                })?;
                updated += 1;
            }
            None => {
                tx.execute(
                    "INSERT INTO students(id, index_number, last_name, first_name, program, level, email, active, created_at)
                     VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &row.index_number,
                        &row.last_name,
                        &row.first_name,
                        &row.program,
                        row.level,
                        &row.email,
                        Utc::now().to_rfc3339(),
                    ),
                )
                .map_err(|e| HandlerErr {
                    code: "db_insert_failed",
                    message: format!("row {}: {}", row.row_no, e),
                    details: None,
                })?;
                inserted += 1;
            }
        }
    }

    audit::record(
        &tx,
        params.get("actorId").and_then(|v| v.as_str()),
        "students.importCsv",
        "student",
        None,
        Some(json!({ "inserted": inserted, "updated": updated })),
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

    Ok(json!({ "inserted": inserted, "updated": updated, "total": rows.len() }))
}

fn students_export_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let out_path = get_required_str(params, "outPath")?;

    let mut stmt = conn
        .prepare(
            "SELECT index_number, first_name, last_name, program, level, email
             FROM students ORDER BY index_number",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, Option<String>>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut csv = String::from("index_number,first_name,last_name,program,level,email\r\n");
    let count = rows.len();
    for (index_number, first_name, last_name, program, level, email) in rows {
        csv.push_str(&format!(
            "{},{},{},{},{},{}\r\n",
            csv_quote(&index_number),
            csv_quote(&first_name),
            csv_quote(&last_name),
            csv_quote(&program),
            level,
            csv_quote(email.as_deref().unwrap_or(""))
        ));
    }

    std::fs::write(&out_path, csv).map_err(|e| HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: Some(json!({ "outPath": out_path })),
    })?;

    Ok(json!({ "outPath": out_path, "rows": count }))
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
        "students.list" => Some(with_db(state, req, students_list)),
        "students.create" => Some(with_db(state, req, students_create)),
        "students.update" => Some(with_db(state, req, students_update)),
        "students.delete" => Some(with_db(state, req, students_delete)),
        "students.importCsv" => Some(with_db(state, req, students_import_csv)),
        "students.exportCsv" => Some(with_db(state, req, students_export_csv)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_fields_round_trip() {
        let fields = parse_csv_record("\"Doe, Jr\",John,\"He said \"\"hi\"\"\"");
        assert_eq!(fields, vec!["Doe, Jr", "John", "He said \"hi\""]);
        assert_eq!(csv_quote("Doe, Jr"), "\"Doe, Jr\"");
        assert_eq!(csv_quote("plain"), "plain");
    }

    #[test]
    fn roster_rows_cite_row_and_field() {
        let text = "index_number,first_name,last_name,program,level\nUG1001,Ama,Mensah,BSc CS,300\nUG1002,,Owusu,BSc CS,200\n";
        let e = parse_roster_rows(text).err().expect("second row invalid");
        assert_eq!(e.code, "bad_params");
        assert!(e.message.contains("row 3"));
        assert!(e.message.contains("firstName"));
    }

    #[test]
    fn roster_level_must_be_integer() {
        let text = "index_number,first_name,last_name,program,level\nUG1001,Ama,Mensah,BSc CS,L300\n";
        let e = parse_roster_rows(text).err().expect("level invalid");
        assert!(e.message.contains("row 2"));
        assert!(e.message.contains("level"));
    }

    #[test]
    fn roster_skips_blank_lines_and_header() {
        let text = "index_number,first_name,last_name,program,level,email\n\nUG1001,Ama,Mensah,\"BSc, CS\",300,ama@uni.edu\n";
        let rows = parse_roster_rows(text).expect("valid roster");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_no, 3);
        assert_eq!(rows[0].program, "BSc, CS");
        assert_eq!(rows[0].email.as_deref(), Some("ama@uni.edu"));
    }
}
