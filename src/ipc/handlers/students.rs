use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{now_ts, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

struct StudentRow {
    id: String,
    first_name: String,
    last_name: String,
    dni: String,
    email: Option<String>,
    phone: Option<String>,
    active: bool,
}

impl StudentRow {
    fn from_row(row: &Row) -> rusqlite::Result<StudentRow> {
        Ok(StudentRow {
            id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            dni: row.get(3)?,
            email: row.get(4)?,
            phone: row.get(5)?,
            active: row.get(6)?,
        })
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "firstName": self.first_name,
            "lastName": self.last_name,
            "dni": self.dni,
            "email": self.email,
            "phone": self.phone,
            "active": self.active,
        })
    }
}

fn fetch_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<StudentRow>> {
    conn.query_row(
        "SELECT id, first_name, last_name, dni, email, phone, active
         FROM students WHERE id = ?",
        [student_id],
        StudentRow::from_row,
    )
    .optional()
}

fn dni_taken(conn: &Connection, dni: &str, exclude_id: Option<&str>) -> rusqlite::Result<bool> {
    let hit: Option<i64> = match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM students WHERE dni = ? AND id != ?",
                (dni, id),
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row("SELECT 1 FROM students WHERE dni = ?", [dni], |r| r.get(0))
            .optional()?,
    };
    Ok(hit.is_some())
}

fn merge_opt_text(req: &Request, key: &str, current: &mut Option<String>) {
    if let Some(v) = req.params.get(key) {
        *current = v
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if req
        .params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        clauses.push("s.active = 1");
    }
    if let Some(search) = req.params.get("search").and_then(|v| v.as_str()) {
        let term = search.trim();
        if !term.is_empty() {
            clauses.push("(s.last_name LIKE ? OR s.first_name LIKE ? OR s.dni LIKE ?)");
            let pattern = format!("%{}%", term);
            binds.push(Value::Text(pattern.clone()));
            binds.push(Value::Text(pattern.clone()));
            binds.push(Value::Text(pattern));
        }
    }

    let mut sql = String::from(
        "SELECT s.id, s.first_name, s.last_name, s.dni, s.email, s.phone, s.active,
           (SELECT COUNT(*) FROM enrollments e WHERE e.student_id = s.id) AS enrollment_count
         FROM students s",
    );
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY s.last_name, s.first_name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            let student = StudentRow::from_row(row)?;
            let enrollment_count: i64 = row.get(7)?;
            let mut v = student.to_json();
            v["enrollmentCount"] = json!(enrollment_count);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let dni = match required_str(req, "dni") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match dni_taken(conn, &dni, None) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                "a student with this dni already exists",
                Some(json!({ "dni": dni })),
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut email = None;
    let mut phone = None;
    merge_opt_text(req, "email", &mut email);
    merge_opt_text(req, "phone", &mut phone);

    let student = StudentRow {
        id: Uuid::new_v4().to_string(),
        first_name,
        last_name,
        dni,
        email,
        phone,
        active: true,
    };

    if let Err(e) = conn.execute(
        "INSERT INTO students(id, first_name, last_name, dni, email, phone, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student.id,
            &student.first_name,
            &student.last_name,
            &student.dni,
            &student.email,
            &student.phone,
            student.active,
            now_ts(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "student": student.to_json() }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut student = match fetch_student(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Some(v) = req.params.get("firstName").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "firstName must not be empty", None);
        }
        student.first_name = v.to_string();
    }
    if let Some(v) = req.params.get("lastName").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "lastName must not be empty", None);
        }
        student.last_name = v.to_string();
    }
    if let Some(v) = req.params.get("dni").and_then(|v| v.as_str()) {
        let v = v.trim();
        if v.is_empty() {
            return err(&req.id, "bad_params", "dni must not be empty", None);
        }
        match dni_taken(conn, v, Some(&student_id)) {
            Ok(true) => {
                return err(
                    &req.id,
                    "conflict",
                    "a student with this dni already exists",
                    Some(json!({ "dni": v })),
                )
            }
            Ok(false) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        student.dni = v.to_string();
    }
    merge_opt_text(req, "email", &mut student.email);
    merge_opt_text(req, "phone", &mut student.phone);
    if let Some(v) = req.params.get("active").and_then(|v| v.as_bool()) {
        student.active = v;
    }

    if let Err(e) = conn.execute(
        "UPDATE students
         SET first_name = ?, last_name = ?, dni = ?, email = ?, phone = ?, active = ?
         WHERE id = ?",
        (
            &student.first_name,
            &student.last_name,
            &student.dni,
            &student.email,
            &student.phone,
            student.active,
            &student_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "student": student.to_json() }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match fetch_student(conn, &student_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM grade_records WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grade_records" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM enrollments WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    // Open gradebooks may still show this student; reopening refreshes them.
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
