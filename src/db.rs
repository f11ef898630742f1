use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("custody.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL,
            department TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            index_number TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            program TEXT NOT NULL,
            level INTEGER NOT NULL,
            email TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    ensure_students_email(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_program ON students(program, level)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_sessions(
            id TEXT PRIMARY KEY,
            batch_qr_code TEXT NOT NULL UNIQUE,
            course_code TEXT NOT NULL,
            course_name TEXT NOT NULL,
            venue TEXT,
            exam_date TEXT NOT NULL,
            status TEXT NOT NULL,
            department TEXT,
            faculty TEXT,
            lecturer_id TEXT,
            expected_students INTEGER NOT NULL DEFAULT 0,
            attended_students INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(lecturer_id) REFERENCES users(id)
        )",
        [],
    )?;
    ensure_exam_sessions_faculty(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_sessions_status ON exam_sessions(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_sessions_lecturer ON exam_sessions(lecturer_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_expected_students(
            session_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(session_id, student_id),
            FOREIGN KEY(session_id) REFERENCES exam_sessions(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expected_students_student
         ON session_expected_students(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batch_transfers(
            id TEXT PRIMARY KEY,
            exam_session_id TEXT NOT NULL,
            from_handler_id TEXT NOT NULL,
            to_handler_id TEXT NOT NULL,
            exams_expected INTEGER NOT NULL,
            exams_received INTEGER,
            status TEXT NOT NULL,
            location TEXT,
            requested_at TEXT NOT NULL,
            confirmed_at TEXT,
            discrepancy_note TEXT,
            resolution_note TEXT,
            FOREIGN KEY(exam_session_id) REFERENCES exam_sessions(id),
            FOREIGN KEY(from_handler_id) REFERENCES users(id),
            FOREIGN KEY(to_handler_id) REFERENCES users(id)
        )",
        [],
    )?;
    ensure_batch_transfers_resolution_note(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batch_transfers_session ON batch_transfers(exam_session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batch_transfers_to ON batch_transfers(to_handler_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batch_transfers_from ON batch_transfers(from_handler_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS incidents(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            category TEXT NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL,
            exam_session_id TEXT,
            student_id TEXT,
            reported_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(exam_session_id) REFERENCES exam_sessions(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(reported_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_incidents_session ON incidents(exam_session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents(status, severity)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS incident_comments(
            id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL,
            author_id TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(incident_id) REFERENCES incidents(id),
            FOREIGN KEY(author_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_incident_comments_incident
         ON incident_comments(incident_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_sessions(
            id TEXT PRIMARY KEY,
            exam_session_id TEXT NOT NULL,
            status TEXT NOT NULL,
            started_by TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            FOREIGN KEY(exam_session_id) REFERENCES exam_sessions(id),
            FOREIGN KEY(started_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_sessions_exam
         ON attendance_sessions(exam_session_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            attendance_session_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            method TEXT NOT NULL,
            confirmed INTEGER NOT NULL DEFAULT 0,
            recorded_at TEXT NOT NULL,
            UNIQUE(attendance_session_id, student_id),
            FOREIGN KEY(attendance_session_id) REFERENCES attendance_sessions(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student
         ON attendance_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_links(
            id TEXT PRIMARY KEY,
            attendance_session_id TEXT NOT NULL,
            token TEXT NOT NULL UNIQUE,
            expires_at TEXT NOT NULL,
            revoked INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(attendance_session_id) REFERENCES attendance_sessions(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            id TEXT PRIMARY KEY,
            actor_id TEXT,
            action TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            details TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_entity ON audit_log(entity_type, entity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_created ON audit_log(created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events(
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_email(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces predate the email column. Add without backfill.
    if table_has_column(conn, "students", "email")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN email TEXT", [])?;
    Ok(())
}

fn ensure_exam_sessions_faculty(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "exam_sessions", "faculty")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE exam_sessions ADD COLUMN faculty TEXT", [])?;
    Ok(())
}

fn ensure_batch_transfers_resolution_note(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "batch_transfers", "resolution_note")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE batch_transfers ADD COLUMN resolution_note TEXT",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}
