use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("notas.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            dni TEXT NOT NULL UNIQUE,
            email TEXT,
            phone TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            dni TEXT NOT NULL UNIQUE,
            email TEXT,
            phone TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            year INTEGER NOT NULL,
            cycle TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'activo',
            teacher_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_teacher ON courses(teacher_id)",
        [],
    )?;

    // Existing workspaces may predate the status column. Add with the default.
    ensure_courses_status(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            course_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            enrolled_at TEXT NOT NULL,
            PRIMARY KEY(course_id, student_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_records(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            evaluacion1 REAL,
            evaluacion2 REAL,
            evaluacion3 REAL,
            evaluacion4 REAL,
            evaluacion5 REAL,
            evaluacion6 REAL,
            evaluacion7 REAL,
            evaluacion8 REAL,
            practica1 REAL,
            practica2 REAL,
            practica3 REAL,
            practica4 REAL,
            parcial1 REAL,
            parcial2 REAL,
            evaluation_date TEXT,
            updated_at TEXT,
            UNIQUE(course_id, student_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_grade_records_audit_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_course ON grade_records(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_student ON grade_records(student_id)",
        [],
    )?;

    ensure_people_contact_columns(&conn)?;

    Ok(conn)
}

fn ensure_courses_status(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "courses", "status")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE courses ADD COLUMN status TEXT NOT NULL DEFAULT 'activo'",
        [],
    )?;
    Ok(())
}

fn ensure_grade_records_audit_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "grade_records", "evaluation_date")? {
        conn.execute("ALTER TABLE grade_records ADD COLUMN evaluation_date TEXT", [])?;
    }
    if !table_has_column(conn, "grade_records", "updated_at")? {
        conn.execute("ALTER TABLE grade_records ADD COLUMN updated_at TEXT", [])?;
    }
    Ok(())
}

fn ensure_people_contact_columns(conn: &Connection) -> anyhow::Result<()> {
    for table in ["teachers", "students"] {
        if !table_has_column(conn, table, "email")? {
            conn.execute(&format!("ALTER TABLE {} ADD COLUMN email TEXT", table), [])?;
        }
        if !table_has_column(conn, table, "phone")? {
            conn.execute(&format!("ALTER TABLE {} ADD COLUMN phone TEXT", table), [])?;
        }
    }
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
